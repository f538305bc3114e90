//! Error types for agora-store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Entity refused at the admission gate. Logged and skipped, never
    /// surfaced to a remote peer.
    #[error("Admission refused: {0}")]
    Admission(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// SQLite reported BUSY or LOCKED.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Local state can no longer be trusted. The process should stop serving.
    #[error("Fatal storage condition: {0}")]
    Fatal(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Fatal(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StorageError::Busy(e.to_string())
            }
            other => StorageError::Database(other),
        }
    }
}
