//! Peer address sub-store
//!
//! Two write paths. Addresses relayed by third parties go in through
//! [`insert_untrusted`], stripped to their identity and never overwriting a
//! row already known. Addresses this node connected to itself go through
//! [`upsert_trusted`], which may carry the full record and its subprotocols.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{AddressRow, AddressSubprotocolRow, SubprotocolRow};
use crate::entities::Timestamp;
use crate::error::StorageError;

/// Address types served in a container response
pub const ADDRESS_TYPE_LIVE: u8 = 2;
pub const ADDRESS_TYPE_BOOTSTRAPPER: u8 = 3;
pub const ADDRESS_TYPE_STATIC: u8 = 255;

const INSERT_ADDRESS: &str = "INSERT OR IGNORE INTO addresses (
    location, sublocation, port, location_type, address_type,
    last_successful_ping, last_successful_sync,
    protocol_version_major, protocol_version_minor,
    client_version_major, client_version_minor, client_version_patch, client_name,
    local_arrival, entity_version, realm_id
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn address_values(a: &AddressRow) -> Vec<Value> {
    vec![
        Value::from(a.location.clone()),
        Value::from(a.sublocation.clone()),
        Value::from(a.port),
        Value::from(a.location_type),
        Value::from(a.address_type),
        Value::from(a.last_successful_ping),
        Value::from(a.last_successful_sync),
        Value::from(a.protocol_version_major),
        Value::from(a.protocol_version_minor),
        Value::from(a.client_version_major),
        Value::from(a.client_version_minor),
        Value::from(a.client_version_patch),
        Value::from(a.client_name.clone()),
        Value::from(a.local_arrival),
        Value::from(a.entity_version),
        Value::from(a.realm_id.clone()),
    ]
}

// =============================================================================
// Writes
// =============================================================================

/// Insert third-party addresses, stripped, then prune the table back to
/// `max_table_size`. Returns the number of rows actually added.
pub fn insert_untrusted(
    conn: &Connection,
    addresses: &[AddressRow],
    max_table_size: u32,
) -> Result<usize, StorageError> {
    let mut added = 0;
    for address in addresses {
        let mut stripped = address.clone();
        stripped.strip_untrusted();
        added += conn.execute(INSERT_ADDRESS, params_from_iter(address_values(&stripped)))?;
    }
    let pruned = prune_addresses(conn, max_table_size)?;
    debug!(added, pruned, "Stored untrusted addresses");
    Ok(added)
}

/// Keep the `max_table_size` most recently reachable addresses
pub fn prune_addresses(conn: &Connection, max_table_size: u32) -> Result<usize, StorageError> {
    let pruned = conn.execute(
        "DELETE FROM addresses WHERE (location, sublocation, port) NOT IN (
            SELECT location, sublocation, port FROM addresses
            ORDER BY last_successful_ping DESC, last_successful_sync DESC
            LIMIT ?
        )",
        params![max_table_size],
    )?;
    if pruned > 0 {
        conn.execute(
            "DELETE FROM address_subprotocols WHERE NOT EXISTS (
                SELECT 1 FROM addresses a
                WHERE a.location = address_location
                  AND a.sublocation = address_sublocation
                  AND a.port = address_port
            )",
            [],
        )?;
    }
    Ok(pruned)
}

/// Write a first-party address. Ping and sync timestamps only move forward;
/// the row is rewritten only when something besides local arrival changed.
/// Returns whether the address row was written.
pub fn upsert_trusted(
    conn: &Connection,
    address: &AddressRow,
    subprotocols: &[SubprotocolRow],
    junctions: &[AddressSubprotocolRow],
) -> Result<bool, StorageError> {
    let existing = get_address(conn, &address.location, &address.sublocation, address.port)?;

    let mut merged = address.clone();
    let written = match existing {
        Some(stored) => {
            merged.last_successful_ping = merged.last_successful_ping.max(stored.last_successful_ping);
            merged.last_successful_sync = merged.last_successful_sync.max(stored.last_successful_sync);
            merged.local_arrival = stored.local_arrival;
            if merged.same_content(&stored) {
                false
            } else {
                let sql = INSERT_ADDRESS.replacen("INSERT OR IGNORE", "INSERT OR REPLACE", 1);
                conn.execute(&sql, params_from_iter(address_values(&merged)))?;
                true
            }
        }
        None => {
            conn.execute(INSERT_ADDRESS, params_from_iter(address_values(&merged)))?;
            true
        }
    };

    for sp in subprotocols {
        conn.execute(
            "INSERT OR REPLACE INTO subprotocols
             (fingerprint, name, version_major, version_minor, supported_entities)
             VALUES (?, ?, ?, ?, ?)",
            params![sp.fingerprint, sp.name, sp.version_major, sp.version_minor, sp.supported_entities],
        )?;
    }
    for j in junctions {
        conn.execute(
            "INSERT OR IGNORE INTO address_subprotocols
             (address_location, address_sublocation, address_port, subprotocol_fingerprint)
             VALUES (?, ?, ?, ?)",
            params![j.address_location, j.address_sublocation, j.address_port, j.subprotocol_fingerprint],
        )?;
    }

    Ok(written)
}

// =============================================================================
// Reads
// =============================================================================

pub fn get_address(
    conn: &Connection,
    location: &str,
    sublocation: &str,
    port: u16,
) -> Result<Option<AddressRow>, StorageError> {
    let row = conn
        .query_row(
            "SELECT * FROM addresses WHERE location = ? AND sublocation = ? AND port = ?",
            params![location, sublocation, port],
            |row| AddressRow::from_row(row),
        )
        .optional()?;
    Ok(row)
}

/// Subprotocols linked to an address. A junction row pointing at a missing
/// subprotocol means the store is damaged and is reported as fatal.
pub fn read_subprotocols(
    conn: &Connection,
    location: &str,
    sublocation: &str,
    port: u16,
) -> Result<Vec<SubprotocolRow>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT subprotocol_fingerprint FROM address_subprotocols
         WHERE address_location = ? AND address_sublocation = ? AND address_port = ?
         ORDER BY subprotocol_fingerprint",
    )?;
    let fingerprints: Vec<String> = stmt
        .query_map(params![location, sublocation, port], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut subprotocols = Vec::with_capacity(fingerprints.len());
    for fp in fingerprints {
        let sp = conn
            .query_row(
                "SELECT * FROM subprotocols WHERE fingerprint = ?",
                params![fp],
                |row| SubprotocolRow::from_row(row),
            )
            .optional()?;
        match sp {
            Some(sp) => subprotocols.push(sp),
            None => {
                return Err(StorageError::Fatal(format!(
                    "Address {}/{}:{} links subprotocol {} which is not stored",
                    location, sublocation, port, fp
                )))
            }
        }
    }
    Ok(subprotocols)
}

/// Timestamp column used by [`AddressSearch::TimeRange`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressTimeColumn {
    LocalArrival,
    LastSuccessfulPing,
    LastSuccessfulSync,
}

impl AddressTimeColumn {
    fn column(&self) -> &'static str {
        match self {
            Self::LocalArrival => "local_arrival",
            Self::LastSuccessfulPing => "last_successful_ping",
            Self::LastSuccessfulSync => "last_successful_sync",
        }
    }
}

/// Supported address lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "search", rename_all = "snake_case")]
pub enum AddressSearch {
    /// One address by identity
    Basic {
        location: String,
        sublocation: String,
        port: u16,
    },
    /// Newest arrivals of one address type. `max` 0 means no limit.
    Limit {
        max: i64,
        offset: i64,
        address_type: u8,
    },
    /// Strictly inside (begin, end) on one column. `end` 0 means now.
    TimeRange {
        column: AddressTimeColumn,
        begin: Timestamp,
        end: Timestamp,
    },
    /// Mix served to peers: 80% live, 10% bootstrappers, 10% static
    ContainerGenerate {
        begin: Timestamp,
        end: Timestamp,
        limit: i64,
    },
    /// Everything, most recently synced first unless `descending` is false
    All { descending: bool },
}

/// Run an address search. `max_table_size` caps [`AddressSearch::All`].
pub fn search(
    conn: &Connection,
    search: &AddressSearch,
    now: Timestamp,
    max_table_size: u32,
) -> Result<Vec<AddressRow>, StorageError> {
    match search {
        AddressSearch::Basic {
            location,
            sublocation,
            port,
        } => {
            if location.is_empty() || *port == 0 {
                return Err(StorageError::InvalidRequest(
                    "Basic address search needs a location and a port".into(),
                ));
            }
            Ok(get_address(conn, location, sublocation, *port)?.into_iter().collect())
        }
        AddressSearch::Limit {
            max,
            offset,
            address_type,
        } => {
            if *max < 0 || *offset < 0 {
                return Err(StorageError::InvalidRequest(format!(
                    "Negative address pagination (max {}, offset {})",
                    max, offset
                )));
            }
            // SQLite reads LIMIT -1 as unbounded
            let limit = if *max == 0 { -1 } else { *max };
            select(
                conn,
                "SELECT * FROM addresses WHERE address_type = ?
                 ORDER BY local_arrival DESC LIMIT ? OFFSET ?",
                vec![Value::from(*address_type), Value::from(limit), Value::from(*offset)],
            )
        }
        AddressSearch::TimeRange { column, begin, end } => {
            let end = if *end == 0 { now } else { *end };
            let col = column.column();
            let sql = format!(
                "SELECT * FROM addresses WHERE {col} > ? AND {col} < ? ORDER BY {col} DESC",
                col = col
            );
            select(conn, &sql, vec![Value::from(*begin), Value::from(end)])
        }
        AddressSearch::ContainerGenerate { begin, end, limit } => {
            if *limit < 0 {
                return Err(StorageError::InvalidRequest(format!(
                    "Negative address limit {}",
                    limit
                )));
            }
            let tenth = limit / 10;
            let mut all = container_slice(conn, *begin, *end, ADDRESS_TYPE_LIVE, tenth * 8)?;
            all.extend(container_slice(conn, *begin, *end, ADDRESS_TYPE_BOOTSTRAPPER, tenth)?);
            all.extend(container_slice(conn, *begin, *end, ADDRESS_TYPE_STATIC, tenth)?);
            Ok(all)
        }
        AddressSearch::All { descending } => {
            let dir = if *descending { "DESC" } else { "ASC" };
            let sql = format!(
                "SELECT * FROM addresses ORDER BY last_successful_sync {dir},
                 last_successful_ping {dir}, local_arrival {dir} LIMIT ?",
                dir = dir
            );
            select(conn, &sql, vec![Value::from(max_table_size)])
        }
    }
}

fn container_slice(
    conn: &Connection,
    begin: Timestamp,
    end: Timestamp,
    address_type: u8,
    limit: i64,
) -> Result<Vec<AddressRow>, StorageError> {
    select(
        conn,
        "SELECT * FROM addresses
         WHERE last_successful_ping > ? AND last_successful_ping < ? AND address_type = ?
         ORDER BY last_successful_sync DESC, last_successful_ping DESC LIMIT ?",
        vec![
            Value::from(begin),
            Value::from(end),
            Value::from(address_type),
            Value::from(limit),
        ],
    )
}

fn select(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<AddressRow>, StorageError> {
    debug!("Executing query: {}", sql);
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| AddressRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
