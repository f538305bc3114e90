//! Remote node bookkeeping

use rusqlite::{params, Connection, OptionalExtension};

use super::models::NodeRow;
use crate::error::StorageError;

/// Insert or replace a node record
pub fn replace_node(conn: &Connection, node: &NodeRow) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (
            fingerprint, boards_last_checkin, threads_last_checkin, posts_last_checkin,
            votes_last_checkin, keys_last_checkin, truststates_last_checkin, addresses_last_checkin
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            node.fingerprint,
            node.boards_last_checkin,
            node.threads_last_checkin,
            node.posts_last_checkin,
            node.votes_last_checkin,
            node.keys_last_checkin,
            node.truststates_last_checkin,
            node.addresses_last_checkin,
        ],
    )?;
    Ok(())
}

pub fn get_node(conn: &Connection, fingerprint: &str) -> Result<Option<NodeRow>, StorageError> {
    let node = conn
        .query_row(
            "SELECT * FROM nodes WHERE fingerprint = ?",
            params![fingerprint],
            |row| NodeRow::from_row(row),
        )
        .optional()?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    #[test]
    fn test_replace_and_get() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut node = NodeRow {
            fingerprint: "remote".into(),
            boards_last_checkin: 10,
            ..Default::default()
        };
        replace_node(&conn, &node).unwrap();
        node.boards_last_checkin = 20;
        node.posts_last_checkin = 5;
        replace_node(&conn, &node).unwrap();

        assert_eq!(get_node(&conn, "remote").unwrap(), Some(node));
        assert_eq!(get_node(&conn, "other").unwrap(), None);
    }
}
