//! SQLite repository layer
//!
//! Free functions over `rusqlite::Connection`, grouped by the table family
//! they touch. Nothing here knows about batches, retries or the runtime
//! context; the engines in `services` compose these inside transactions.
//!
//! ## Tables
//!
//! - `boards`, `threads`, `posts`, `votes`, `public_keys`, `truststates` -
//!   provable entities keyed by fingerprint
//! - `board_owners` - moderation grants keyed by (board, key)
//! - `addresses` - peer locations keyed by (location, sublocation, port)
//! - `subprotocols`, `address_subprotocols` - advertised extensions and the
//!   junction linking them to addresses
//! - `nodes` - per-remote sync bookkeeping, never transmitted

pub mod addresses;
pub mod board_owners;
pub mod cascade;
pub mod counts;
pub mod models;
pub mod nodes;
pub mod provables;
pub mod query;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StorageError;

/// How long SQLite itself waits on a locked database before reporting BUSY
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database holding every entity kind
pub struct EngineDb {
    conn: Mutex<Connection>,
}

impl EngineDb {
    /// Open or create the database under `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, StorageError> {
        let db_path = storage_dir.join("agora.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| StorageError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Row counts per table
    pub fn stats(&self) -> Result<counts::DatabaseCounts, StorageError> {
        self.with_conn(counts::database_counts)
    }
}

pub use models::{
    AddressRow, AddressSubprotocolRow, BoardOwnerRow, BoardRow, KeyRow, NodeRow, PostRow,
    ProvableRow, StorageRecord, SubprotocolRow, ThreadRow, TruststateRow, VoteRow,
};
pub use query::{QueryShape, ReadOptions};
