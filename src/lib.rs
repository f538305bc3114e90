//! Agora Store - persistence engine for a peer-to-peer discussion node
//!
//! Stores the signed, content-addressed entities a node exchanges with its
//! peers (boards, threads, posts, votes, keys, truststates) plus the peer
//! address book, and serves them back through a small set of prepared reads.
//!
//! ## Write path
//!
//! ```text
//! Entity (verified upstream)
//!     → to_storage        convert.rs
//!     → admission checks  validation.rs
//!     → upsert gate       db/provables.rs
//!     → touch cascade     db/cascade.rs
//!     → commit            services/write_engine.rs
//! ```
//!
//! Every object in a batch is judged on its own: a bad one is logged and
//! dropped, the rest commit together in one transaction.
//!
//! ## Read path
//!
//! Reads are classified into a [`db::QueryShape`] before any SQL is built.
//! Unknown shapes are request errors. Embeds expand one hop, keys last.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/agora-store/
//! ├── agora.db        # SQLite (WAL)
//! └── config.toml     # Configuration
//! ```

pub mod config;
pub mod context;
pub mod convert;
pub mod db;
pub mod entities;
pub mod error;
pub mod services;
pub mod validation;

// Re-exports
pub use config::Config;
pub use context::{Clock, EngineContext, FixedClock, SystemClock};
pub use db::addresses::{AddressSearch, AddressTimeColumn};
pub use db::{EngineDb, ReadOptions};
pub use entities::{
    Address, Board, BoardOwner, Entity, EntityKind, Fingerprint, Key, Post, Response,
    Subprotocol, Thread, Timestamp, Truststate, Vote,
};
pub use error::StorageError;
pub use services::{Embed, Engine, InsertMetrics, ReadEngine, WriteEngine};
