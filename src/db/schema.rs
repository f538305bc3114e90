//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StorageError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(PROVABLES_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create entity tables: {}", e)))?;

    conn.execute_batch(SUBSTORES_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create sub-store tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    // v1 is the first released layout
    if from_version < 1 {
        create_tables(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Provable entity tables. Every one is keyed by fingerprint and carries the
/// creation group, the update group and the two engine-local timestamps.
const PROVABLES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS boards (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    owner_public_key TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    language TEXT NOT NULL DEFAULT '',
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT '',
    encr_content TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS threads (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    board TEXT NOT NULL,
    name TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    link TEXT NOT NULL DEFAULT '',
    owner TEXT NOT NULL,
    owner_public_key TEXT NOT NULL,
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT '',
    encr_content TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS posts (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    board TEXT NOT NULL,
    thread TEXT NOT NULL,
    parent TEXT NOT NULL,
    body TEXT NOT NULL,
    owner TEXT NOT NULL,
    owner_public_key TEXT NOT NULL,
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT '',
    encr_content TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS votes (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    board TEXT NOT NULL,
    thread TEXT NOT NULL,
    target TEXT NOT NULL,
    owner TEXT NOT NULL,
    owner_public_key TEXT NOT NULL,
    type_class INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL,
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT '',
    encr_content TEXT NOT NULL DEFAULT ''
);

-- Keys are their own owners, so there is no owner column
CREATE TABLE IF NOT EXISTS public_keys (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    type TEXT NOT NULL,
    public_key TEXT NOT NULL,
    expiry INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL DEFAULT '',
    info TEXT NOT NULL DEFAULT '',
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS truststates (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    target TEXT NOT NULL,
    owner TEXT NOT NULL,
    owner_public_key TEXT NOT NULL,
    type_class INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL,
    domain TEXT NOT NULL DEFAULT '',
    expiry INTEGER NOT NULL DEFAULT 0,
    creation INTEGER NOT NULL,
    proof_of_work TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    last_update INTEGER NOT NULL DEFAULT 0,
    update_proof_of_work TEXT NOT NULL DEFAULT '',
    update_signature TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    last_referenced INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    realm_id TEXT NOT NULL DEFAULT '',
    encr_content TEXT NOT NULL DEFAULT ''
);
"#;

/// Board owners, peer addresses with their subprotocols, node bookkeeping
const SUBSTORES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS board_owners (
    board_fingerprint TEXT NOT NULL,
    key_fingerprint TEXT NOT NULL,
    expiry INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL,
    PRIMARY KEY (board_fingerprint, key_fingerprint)
);

CREATE TABLE IF NOT EXISTS addresses (
    location TEXT NOT NULL,
    sublocation TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL,
    location_type INTEGER NOT NULL DEFAULT 0,
    address_type INTEGER NOT NULL DEFAULT 0,
    last_successful_ping INTEGER NOT NULL DEFAULT 0,
    last_successful_sync INTEGER NOT NULL DEFAULT 0,
    protocol_version_major INTEGER NOT NULL DEFAULT 0,
    protocol_version_minor INTEGER NOT NULL DEFAULT 0,
    client_version_major INTEGER NOT NULL DEFAULT 0,
    client_version_minor INTEGER NOT NULL DEFAULT 0,
    client_version_patch INTEGER NOT NULL DEFAULT 0,
    client_name TEXT NOT NULL DEFAULT '',
    local_arrival INTEGER NOT NULL,
    entity_version INTEGER NOT NULL,
    realm_id TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (location, sublocation, port)
);

CREATE TABLE IF NOT EXISTS subprotocols (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    version_major INTEGER NOT NULL,
    version_minor INTEGER NOT NULL DEFAULT 0,
    supported_entities TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS address_subprotocols (
    address_location TEXT NOT NULL,
    address_sublocation TEXT NOT NULL,
    address_port INTEGER NOT NULL,
    subprotocol_fingerprint TEXT NOT NULL,
    PRIMARY KEY (address_location, address_sublocation, address_port, subprotocol_fingerprint)
);

CREATE TABLE IF NOT EXISTS nodes (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    boards_last_checkin INTEGER NOT NULL DEFAULT 0,
    threads_last_checkin INTEGER NOT NULL DEFAULT 0,
    posts_last_checkin INTEGER NOT NULL DEFAULT 0,
    votes_last_checkin INTEGER NOT NULL DEFAULT 0,
    keys_last_checkin INTEGER NOT NULL DEFAULT 0,
    truststates_last_checkin INTEGER NOT NULL DEFAULT 0,
    addresses_last_checkin INTEGER NOT NULL DEFAULT 0
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_boards_owner ON boards(owner);
CREATE INDEX IF NOT EXISTS idx_boards_last_referenced ON boards(last_referenced);
CREATE INDEX IF NOT EXISTS idx_boards_name ON boards(name);

CREATE INDEX IF NOT EXISTS idx_threads_board ON threads(board);
CREATE INDEX IF NOT EXISTS idx_threads_owner ON threads(owner);
CREATE INDEX IF NOT EXISTS idx_threads_last_referenced ON threads(last_referenced);

CREATE INDEX IF NOT EXISTS idx_posts_thread ON posts(thread);
CREATE INDEX IF NOT EXISTS idx_posts_board ON posts(board);
CREATE INDEX IF NOT EXISTS idx_posts_parent ON posts(parent);
CREATE INDEX IF NOT EXISTS idx_posts_owner ON posts(owner);
CREATE INDEX IF NOT EXISTS idx_posts_last_referenced ON posts(last_referenced);

CREATE INDEX IF NOT EXISTS idx_votes_target ON votes(target);
CREATE INDEX IF NOT EXISTS idx_votes_owner ON votes(owner);
CREATE INDEX IF NOT EXISTS idx_votes_last_referenced ON votes(last_referenced);

CREATE INDEX IF NOT EXISTS idx_keys_last_referenced ON public_keys(last_referenced);
CREATE INDEX IF NOT EXISTS idx_keys_name ON public_keys(name);

CREATE INDEX IF NOT EXISTS idx_truststates_target ON truststates(target);
CREATE INDEX IF NOT EXISTS idx_truststates_owner ON truststates(owner);
CREATE INDEX IF NOT EXISTS idx_truststates_last_referenced ON truststates(last_referenced);

CREATE INDEX IF NOT EXISTS idx_board_owners_key ON board_owners(key_fingerprint);
CREATE INDEX IF NOT EXISTS idx_addresses_last_successful_ping ON addresses(last_successful_ping);
CREATE INDEX IF NOT EXISTS idx_addresses_local_arrival ON addresses(local_arrival);
"#;
