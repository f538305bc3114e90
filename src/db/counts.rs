//! Count helpers for serving-layer size decisions

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::entities::EntityKind;
use crate::error::StorageError;

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseCounts {
    pub boards: u64,
    pub threads: u64,
    pub posts: u64,
    pub votes: u64,
    pub keys: u64,
    pub truststates: u64,
    pub addresses: u64,
    pub board_owners: u64,
    pub subprotocols: u64,
    pub nodes: u64,
}

fn count(conn: &Connection, table: &str) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(n as u64)
}

pub fn database_counts(conn: &Connection) -> Result<DatabaseCounts, StorageError> {
    Ok(DatabaseCounts {
        boards: count(conn, EntityKind::Boards.table())?,
        threads: count(conn, EntityKind::Threads.table())?,
        posts: count(conn, EntityKind::Posts.table())?,
        votes: count(conn, EntityKind::Votes.table())?,
        keys: count(conn, EntityKind::Keys.table())?,
        truststates: count(conn, EntityKind::Truststates.table())?,
        addresses: count(conn, EntityKind::Addresses.table())?,
        board_owners: count(conn, "board_owners")?,
        subprotocols: count(conn, "subprotocols")?,
        nodes: count(conn, "nodes")?,
    })
}

pub fn board_thread_count(conn: &Connection, board: &str) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(1) FROM threads WHERE board = ?",
        params![board],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub fn thread_post_count(conn: &Connection, thread: &str) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(1) FROM posts WHERE thread = ?",
        params![thread],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}
