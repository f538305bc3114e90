//! Timestamp-gated upsert for provable rows
//!
//! The gate is a pure function over the stored (creation, last_update) pair so
//! it can be tested without SQLite. The write engine evaluates it first, runs
//! the touch cascade only when it passes, then applies the decision here.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::models::ProvableRow;
use crate::entities::{Fingerprint, Timestamp};
use crate::error::StorageError;

/// Timestamps already on disk for one fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredStamp {
    pub creation: Timestamp,
    pub last_update: Timestamp,
}

/// Outcome of the conflict-resolution rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    Insert,
    Update,
    Skip,
}

impl UpsertDecision {
    pub fn is_write(&self) -> bool {
        !matches!(self, UpsertDecision::Skip)
    }
}

/// Decide what an incoming row does to the stored one.
///
/// A new fingerprint is inserted unless it claims an update that predates its
/// own creation. An existing fingerprint is updated only by a strictly newer
/// update timestamp, compared against the stored update or, when the stored
/// row was never amended, its creation. Everything else is a silent skip.
pub fn upsert_gate(
    stored: Option<StoredStamp>,
    creation: Timestamp,
    last_update: Timestamp,
) -> UpsertDecision {
    match stored {
        None => {
            if last_update == 0 || last_update > creation {
                UpsertDecision::Insert
            } else {
                UpsertDecision::Skip
            }
        }
        Some(s) => {
            if last_update > s.last_update && last_update > s.creation {
                UpsertDecision::Update
            } else {
                UpsertDecision::Skip
            }
        }
    }
}

pub fn stored_stamp<R: ProvableRow>(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<StoredStamp>, StorageError> {
    let sql = format!(
        "SELECT creation, last_update FROM {} WHERE fingerprint = ?",
        R::KIND.table()
    );
    let stamp = conn
        .query_row(&sql, params![fingerprint], |row| {
            Ok(StoredStamp {
                creation: row.get(0)?,
                last_update: row.get(1)?,
            })
        })
        .optional()?;
    Ok(stamp)
}

/// Evaluate the gate for `row` against what is stored
pub fn decide<R: ProvableRow>(conn: &Connection, row: &R) -> Result<UpsertDecision, StorageError> {
    let stored = stored_stamp::<R>(conn, row.fingerprint())?;
    Ok(upsert_gate(
        stored,
        row.provable().creation,
        row.update().last_update,
    ))
}

/// Apply a decision already made by [`decide`]
pub fn apply<R: ProvableRow>(
    conn: &Connection,
    row: &R,
    decision: UpsertDecision,
) -> Result<(), StorageError> {
    match decision {
        UpsertDecision::Insert => insert_row(conn, row),
        UpsertDecision::Update => update_row(conn, row),
        UpsertDecision::Skip => Ok(()),
    }
}

fn insert_row<R: ProvableRow>(conn: &Connection, row: &R) -> Result<(), StorageError> {
    let bindings = row.bindings();
    let columns: Vec<&str> = bindings.iter().map(|(c, _)| *c).collect();
    let placeholders: Vec<&str> = bindings.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        R::KIND.table(),
        columns.join(", "),
        placeholders.join(", ")
    );

    debug!(kind = %R::KIND, fingerprint = %row.fingerprint(), "Inserting row");
    conn.execute(&sql, params_from_iter(bindings.into_iter().map(|(_, v)| v)))?;
    Ok(())
}

/// Rewrite the mutable columns, the update group and `last_referenced`.
/// Creation-group columns and `local_arrival` stay as first stored.
fn update_row<R: ProvableRow>(conn: &Connection, row: &R) -> Result<(), StorageError> {
    let updatable: Vec<(&'static str, Value)> = row
        .bindings()
        .into_iter()
        .filter(|(column, _)| {
            R::MUTABLE_COLUMNS.contains(column)
                || matches!(
                    *column,
                    "last_update" | "update_proof_of_work" | "update_signature" | "last_referenced"
                )
        })
        .collect();

    let assignments: Vec<String> = updatable.iter().map(|(c, _)| format!("{} = ?", c)).collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE fingerprint = ?",
        R::KIND.table(),
        assignments.join(", ")
    );

    let mut values: Vec<Value> = updatable.into_iter().map(|(_, v)| v).collect();
    values.push(Value::from(row.fingerprint().to_string()));

    debug!(kind = %R::KIND, fingerprint = %row.fingerprint(), "Updating row");
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Run a prepared SELECT and map every row to `R`
pub fn query_rows<R: ProvableRow>(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<R>, StorageError> {
    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| R::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fetch rows by fingerprint, ignoring the ones not stored
pub fn get_by_fingerprints<R: ProvableRow>(
    conn: &Connection,
    fingerprints: &[Fingerprint],
) -> Result<Vec<R>, StorageError> {
    if fingerprints.is_empty() {
        return Ok(vec![]);
    }
    let placeholders: Vec<&str> = fingerprints.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT * FROM {} WHERE fingerprint IN ({})",
        R::KIND.table(),
        placeholders.join(", ")
    );
    query_rows(conn, &sql, fingerprints.iter().cloned().map(Value::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::KeyRow;
    use crate::db::schema::init_schema;
    use crate::entities::{ProvableFields, UpdateFields};

    fn stamp(creation: Timestamp, last_update: Timestamp) -> Option<StoredStamp> {
        Some(StoredStamp {
            creation,
            last_update,
        })
    }

    #[test]
    fn test_gate_on_new_rows() {
        assert_eq!(upsert_gate(None, 100, 0), UpsertDecision::Insert);
        assert_eq!(upsert_gate(None, 100, 150), UpsertDecision::Insert);
        assert_eq!(upsert_gate(None, 100, 100), UpsertDecision::Skip);
        assert_eq!(upsert_gate(None, 100, 50), UpsertDecision::Skip);
    }

    #[test]
    fn test_gate_around_creation() {
        let t0 = 1_000;
        assert_eq!(upsert_gate(stamp(t0, 0), t0, t0 - 1), UpsertDecision::Skip);
        assert_eq!(upsert_gate(stamp(t0, 0), t0, t0), UpsertDecision::Skip);
        assert_eq!(upsert_gate(stamp(t0, 0), t0, t0 + 1), UpsertDecision::Update);
    }

    #[test]
    fn test_gate_against_prior_update() {
        assert_eq!(upsert_gate(stamp(10, 50), 10, 50), UpsertDecision::Skip);
        assert_eq!(upsert_gate(stamp(10, 50), 10, 40), UpsertDecision::Skip);
        assert_eq!(upsert_gate(stamp(10, 50), 10, 51), UpsertDecision::Update);
        // Re-delivery of the unamended original
        assert_eq!(upsert_gate(stamp(10, 50), 10, 0), UpsertDecision::Skip);
    }

    fn key(fp: &str, creation: Timestamp, last_update: Timestamp, name: &str) -> KeyRow {
        KeyRow {
            provable: ProvableFields {
                fingerprint: fp.to_string(),
                creation,
                proof_of_work: "pow".into(),
                signature: "sig".into(),
            },
            update: UpdateFields {
                last_update,
                ..Default::default()
            },
            key_type: "ed25519".into(),
            public_key: format!("pk-{}", fp),
            name: name.into(),
            local_arrival: 500,
            last_referenced: 500,
            entity_version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_update_keeps_creation_group() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let original = key("k1", 100, 0, "alice");
        let d = decide(&conn, &original).unwrap();
        assert_eq!(d, UpsertDecision::Insert);
        apply(&conn, &original, d).unwrap();

        let mut amended = key("k1", 100, 200, "alice2");
        amended.provable.signature = "forged".into();
        amended.local_arrival = 900;
        amended.last_referenced = 900;
        let d = decide(&conn, &amended).unwrap();
        assert_eq!(d, UpsertDecision::Update);
        apply(&conn, &amended, d).unwrap();

        let stored: Vec<KeyRow> = get_by_fingerprints(&conn, &["k1".to_string()]).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "alice2");
        assert_eq!(stored[0].provable.signature, "sig");
        assert_eq!(stored[0].local_arrival, 500);
        assert_eq!(stored[0].last_referenced, 900);
        assert_eq!(stored[0].update.last_update, 200);

        // Same update again is a skip
        assert_eq!(decide(&conn, &amended).unwrap(), UpsertDecision::Skip);
    }
}
