//! Engine layer for agora-store
//!
//! The engines own the transaction boundaries and the runtime rules: the
//! upsert gate, the touch cascade, busy retries, time-window sanitisation
//! and embed resolution. The repository layer below them stays free of any
//! notion of batches or callers.
//!
//! ## Architecture
//!
//! ```text
//! Serving layer / sync scheduler / local app
//!     ↓
//! Engines (write_engine, read_engine)
//!     ↓
//! Conversion + admission (convert.rs, validation.rs)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod read_engine;
pub mod write_engine;

// Re-exports
pub use read_engine::{Embed, ReadEngine};
pub use write_engine::{InsertMetrics, WriteEngine};

use std::sync::Arc;

use crate::config::Config;
use crate::context::EngineContext;
use crate::db::EngineDb;
use crate::error::StorageError;

/// Engine container
///
/// Both engines share one database handle and one context. Clone the `Arc`s
/// to hand them to workers.
pub struct Engine {
    pub db: Arc<EngineDb>,
    pub ctx: Arc<EngineContext>,
    pub writer: Arc<WriteEngine>,
    pub reader: Arc<ReadEngine>,
}

impl Engine {
    /// Wire both engines over an existing database and context
    pub fn new(db: Arc<EngineDb>, ctx: Arc<EngineContext>) -> Self {
        Self {
            writer: Arc::new(WriteEngine::new(db.clone(), ctx.clone())),
            reader: Arc::new(ReadEngine::new(db.clone(), ctx.clone())),
            db,
            ctx,
        }
    }

    /// Open the on-disk database named by `config` on the wall clock
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let db = Arc::new(EngineDb::open(&config.storage_dir)?);
        Ok(Self::new(db, Arc::new(EngineContext::from_config(config))))
    }

    /// In-memory database with a caller-built context (for testing)
    pub fn in_memory(ctx: EngineContext) -> Result<Self, StorageError> {
        let db = Arc::new(EngineDb::open_in_memory()?);
        Ok(Self::new(db, Arc::new(ctx)))
    }
}
