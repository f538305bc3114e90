//! Board ownership grants
//!
//! The owner set has no timestamp of its own. It is replaced wholesale,
//! as a diff against what is stored, whenever the parent board passes the
//! upsert gate.

use std::collections::HashMap;

use rusqlite::{params, Connection};

use super::models::BoardOwnerRow;
use crate::error::StorageError;

/// Changes needed to turn the stored owner set into the incoming one
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnerDiff {
    pub insert: Vec<BoardOwnerRow>,
    pub update: Vec<BoardOwnerRow>,
    pub delete: Vec<BoardOwnerRow>,
}

impl OwnerDiff {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff keyed by key fingerprint. An incoming grant whose level or expiry
/// differs from the stored one is an update.
pub fn reconcile(stored: &[BoardOwnerRow], incoming: &[BoardOwnerRow]) -> OwnerDiff {
    let stored_by_key: HashMap<&str, &BoardOwnerRow> = stored
        .iter()
        .map(|o| (o.key_fingerprint.as_str(), o))
        .collect();
    let incoming_by_key: HashMap<&str, &BoardOwnerRow> = incoming
        .iter()
        .map(|o| (o.key_fingerprint.as_str(), o))
        .collect();

    let mut diff = OwnerDiff::default();

    for owner in incoming {
        match stored_by_key.get(owner.key_fingerprint.as_str()) {
            None => diff.insert.push(owner.clone()),
            Some(existing) if existing.level != owner.level || existing.expiry != owner.expiry => {
                diff.update.push(owner.clone())
            }
            Some(_) => {}
        }
    }

    for owner in stored {
        if !incoming_by_key.contains_key(owner.key_fingerprint.as_str()) {
            diff.delete.push(owner.clone());
        }
    }

    diff
}

/// Bring `board_fingerprint`'s stored owners in line with `incoming`
pub fn replace_board_owners(
    conn: &Connection,
    board_fingerprint: &str,
    incoming: &[BoardOwnerRow],
) -> Result<OwnerDiff, StorageError> {
    let stored = read_board_owners(conn, board_fingerprint, None)?;
    let diff = reconcile(&stored, incoming);

    for owner in &diff.insert {
        conn.execute(
            "INSERT INTO board_owners (board_fingerprint, key_fingerprint, expiry, level)
             VALUES (?, ?, ?, ?)",
            params![board_fingerprint, owner.key_fingerprint, owner.expiry, owner.level],
        )?;
    }

    for owner in &diff.update {
        conn.execute(
            "UPDATE board_owners SET expiry = ?, level = ?
             WHERE board_fingerprint = ? AND key_fingerprint = ?",
            params![owner.expiry, owner.level, board_fingerprint, owner.key_fingerprint],
        )?;
    }

    for owner in &diff.delete {
        conn.execute(
            "DELETE FROM board_owners WHERE board_fingerprint = ? AND key_fingerprint = ?",
            params![board_fingerprint, owner.key_fingerprint],
        )?;
    }

    Ok(diff)
}

/// Owners of a board, optionally narrowed to one key
pub fn read_board_owners(
    conn: &Connection,
    board_fingerprint: &str,
    key_fingerprint: Option<&str>,
) -> Result<Vec<BoardOwnerRow>, StorageError> {
    let owners = match key_fingerprint {
        Some(key) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM board_owners WHERE board_fingerprint = ? AND key_fingerprint = ?",
            )?;
            let rows = stmt
                .query_map(params![board_fingerprint, key], |row| BoardOwnerRow::from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM board_owners WHERE board_fingerprint = ? ORDER BY key_fingerprint",
            )?;
            let rows = stmt
                .query_map(params![board_fingerprint], |row| BoardOwnerRow::from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn owner(key: &str, level: u8) -> BoardOwnerRow {
        BoardOwnerRow {
            board_fingerprint: "b1".into(),
            key_fingerprint: key.into(),
            level,
            ..Default::default()
        }
    }

    fn keys(rows: &[BoardOwnerRow]) -> Vec<&str> {
        let mut k: Vec<&str> = rows.iter().map(|o| o.key_fingerprint.as_str()).collect();
        k.sort();
        k
    }

    #[test]
    fn test_reconcile_diff() {
        let stored = vec![owner("A", 1), owner("B", 1), owner("C", 1)];
        let incoming = vec![owner("A", 1), owner("B", 2), owner("D", 1)];

        let diff = reconcile(&stored, &incoming);
        assert_eq!(keys(&diff.insert), vec!["D"]);
        assert_eq!(keys(&diff.update), vec!["B"]);
        assert_eq!(keys(&diff.delete), vec!["C"]);

        assert!(reconcile(&incoming, &incoming).is_empty());
    }

    #[test]
    fn test_replace_board_owners() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        replace_board_owners(&conn, "b1", &[owner("A", 1), owner("B", 1), owner("C", 1)]).unwrap();
        replace_board_owners(&conn, "b1", &[owner("A", 1), owner("B", 3), owner("D", 1)]).unwrap();

        let stored = read_board_owners(&conn, "b1", None).unwrap();
        assert_eq!(keys(&stored), vec!["A", "B", "D"]);

        let b = read_board_owners(&conn, "b1", Some("B")).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].level, 3);

        assert!(read_board_owners(&conn, "other", None).unwrap().is_empty());
    }
}
