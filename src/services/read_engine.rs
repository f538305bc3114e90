//! Read engine
//!
//! `read` is the general entry point used by the serving layer: it checks
//! the request, sanitises the time window, runs one prepared query for the
//! primary kind and then resolves embeds. Keys are always resolved last so
//! every provable in the response travels with its owner's public key.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::convert::{
    address_to_external, board_to_external, key_to_external, post_to_external,
    thread_to_external, truststate_to_external, vote_to_external,
};
use crate::db::addresses::{self, AddressSearch};
use crate::db::counts::{self, DatabaseCounts};
use crate::db::models::*;
use crate::db::provables::{get_by_fingerprints, query_rows};
use crate::db::query::{self, ReadOptions};
use crate::db::{board_owners, nodes, EngineDb};
use crate::entities::{
    Address, Board, EntityKind, Fingerprint, Key, Post, Response, Thread, Timestamp, Truststate,
    Vote,
};
use crate::error::StorageError;

// =============================================================================
// Request checks
// =============================================================================

/// One-hop expansions a read may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Embed {
    Threads,
    Posts,
    Votes,
    Keys,
}

impl std::str::FromStr for Embed {
    type Err = StorageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threads" => Ok(Self::Threads),
            "posts" => Ok(Self::Posts),
            "votes" => Ok(Self::Votes),
            "keys" => Ok(Self::Keys),
            other => Err(StorageError::InvalidRequest(format!("Unknown embed '{}'", other))),
        }
    }
}

pub fn parse_embeds(names: &[String]) -> Result<HashSet<Embed>, StorageError> {
    names.iter().map(|n| n.parse()).collect()
}

/// An unprivileged read asks for fingerprints or a time window, not both.
/// Asking for neither means the default window.
pub fn enforce_read_validity(
    fingerprints: &[Fingerprint],
    begin: Timestamp,
    end: Timestamp,
    privileged: bool,
) -> Result<(), StorageError> {
    if privileged {
        return Ok(());
    }
    let has_range = begin != 0 || end != 0;
    if has_range && !fingerprints.is_empty() {
        return Err(StorageError::InvalidRequest(format!(
            "Read asks for {} fingerprint(s) and a time range ({}, {}); only one is allowed",
            fingerprints.len(),
            begin,
            end
        )));
    }
    Ok(())
}

/// Clamp a requested window to what the caller may see.
///
/// Privileged callers get anything stored up to `now`, flipped if inverted.
/// Everyone else is kept at or after the last published cache, and never
/// further back than the network head when no cache exists.
pub fn sanitise_time_range(
    begin: Timestamp,
    end: Timestamp,
    now: Timestamp,
    last_cache_generation: Timestamp,
    network_head_start: Timestamp,
    privileged: bool,
) -> Result<(Timestamp, Timestamp), StorageError> {
    let mut begin = begin;
    let mut end = end;

    if privileged {
        if begin > now {
            begin = now;
        }
        if end == 0 || end > now {
            end = now;
        }
        if begin > end {
            std::mem::swap(&mut begin, &mut end);
        }
        return Ok((begin, end));
    }

    if end == 0 || end > now {
        end = now;
    }
    if begin > end {
        return Err(StorageError::InvalidRequest(format!(
            "Time range begins after it ends ({} > {})",
            begin, end
        )));
    }
    if begin < last_cache_generation {
        begin = last_cache_generation;
        end = now;
    }
    if begin == 0 {
        begin = network_head_start;
    }
    if begin > now {
        return Err(StorageError::InvalidRequest(format!(
            "Time range begins in the future ({} > {})",
            begin, now
        )));
    }
    if begin > end {
        end = now;
    }
    Ok((begin, end))
}

// =============================================================================
// Row helpers
// =============================================================================

fn planned_rows<R: ProvableRow>(
    conn: &Connection,
    fingerprints: &[Fingerprint],
    begin: Timestamp,
    end: Timestamp,
    opts: &ReadOptions,
) -> Result<Vec<R>, StorageError> {
    let plan = query::plan(R::KIND, fingerprints, begin, end, opts)?;
    debug!(kind = %R::KIND, shape = %plan.shape, "Running read");
    query_rows(conn, &plan.sql, plan.values)
}

/// Rows of `R` whose `column` matches any of `values`
fn rows_where_in<R: ProvableRow>(
    conn: &Connection,
    column: &str,
    values: &[Fingerprint],
) -> Result<Vec<R>, StorageError> {
    if values.is_empty() {
        return Ok(vec![]);
    }
    let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT DISTINCT * FROM {} WHERE {} IN ({})",
        R::KIND.table(),
        column,
        placeholders.join(", ")
    );
    query_rows(conn, &sql, values.iter().cloned().map(Value::from).collect())
}

/// Convert boards, skipping ones that fail to convert unless the failure
/// means the store itself is damaged
fn boards_to_external(conn: &Connection, rows: Vec<BoardRow>) -> Result<Vec<Board>, StorageError> {
    let mut boards = Vec::with_capacity(rows.len());
    for row in rows {
        let fingerprint = row.provable.fingerprint.clone();
        match board_to_external(conn, row) {
            Ok(board) => boards.push(board),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(fingerprint = %fingerprint, error = %e, "Skipping unreadable board"),
        }
    }
    Ok(boards)
}

fn fingerprints_of<'a, I>(items: I) -> Vec<Fingerprint>
where
    I: IntoIterator<Item = &'a String>,
{
    items.into_iter().cloned().collect()
}

/// Owner keys of every board, thread, post and truststate in `response`,
/// plus board owner grants. Votes carry no key embed.
fn owner_fingerprints(response: &Response) -> Vec<Fingerprint> {
    let mut seen = HashSet::new();
    let mut owners = Vec::new();
    let mut push = |fp: &String| {
        if !fp.is_empty() && seen.insert(fp.clone()) {
            owners.push(fp.clone());
        }
    };

    for board in &response.boards {
        push(&board.owner);
        for grant in &board.board_owners {
            push(&grant.key_fingerprint);
        }
    }
    response.threads.iter().for_each(|t| push(&t.owner));
    response.posts.iter().for_each(|p| push(&p.owner));
    response.truststates.iter().for_each(|ts| push(&ts.owner));
    owners
}

// =============================================================================
// Engine
// =============================================================================

/// Read engine over the shared database
pub struct ReadEngine {
    db: Arc<EngineDb>,
    ctx: Arc<EngineContext>,
}

impl ReadEngine {
    pub fn new(db: Arc<EngineDb>, ctx: Arc<EngineContext>) -> Self {
        Self { db, ctx }
    }

    /// General read with filters and embeds.
    ///
    /// `privileged` marks the local application or an internal caller: it
    /// may combine fingerprints with a window and read behind the cache
    /// boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        kind: EntityKind,
        fingerprints: &[Fingerprint],
        embeds: &[String],
        begin: Timestamp,
        end: Timestamp,
        privileged: bool,
        opts: &ReadOptions,
    ) -> Result<Response, StorageError> {
        if self.ctx.shutdown_initiated() {
            return Ok(Response::default());
        }
        let embeds = parse_embeds(embeds)?;

        enforce_read_validity(fingerprints, begin, end, privileged)?;
        let (begin, end) = sanitise_time_range(
            begin,
            end,
            self.ctx.now(),
            self.ctx.last_cache_generation(),
            self.ctx.network_head_start(),
            privileged,
        )?;

        let mut response = Response::default();
        match kind {
            EntityKind::Boards => {
                response.boards = self.read_boards(fingerprints, begin, end, opts)?
            }
            EntityKind::Threads => {
                response.threads = self.read_threads(fingerprints, begin, end, opts)?
            }
            EntityKind::Posts => response.posts = self.read_posts(fingerprints, begin, end, opts)?,
            EntityKind::Votes => response.votes = self.read_votes(fingerprints, begin, end, opts)?,
            EntityKind::Keys => response.keys = self.read_keys(fingerprints, begin, end, opts)?,
            EntityKind::Truststates => {
                response.truststates = self.read_truststates(fingerprints, begin, end, opts)?
            }
            EntityKind::Addresses => {
                return Err(StorageError::InvalidRequest(
                    "Addresses are read through read_addresses".into(),
                ))
            }
        }

        if !embeds.is_empty() {
            self.resolve_embeds(kind, &embeds, &mut response)?;
        }
        Ok(response)
    }

    fn resolve_embeds(
        &self,
        kind: EntityKind,
        embeds: &HashSet<Embed>,
        response: &mut Response,
    ) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            if embeds.contains(&Embed::Threads) && kind == EntityKind::Boards {
                let boards = fingerprints_of(response.boards.iter().map(|b| &b.provable.fingerprint));
                let rows: Vec<ThreadRow> = rows_where_in(conn, "board", &boards)?;
                response.threads = rows.into_iter().map(thread_to_external).collect();
            }
            if embeds.contains(&Embed::Posts) && kind == EntityKind::Threads {
                let threads =
                    fingerprints_of(response.threads.iter().map(|t| &t.provable.fingerprint));
                let rows: Vec<PostRow> = rows_where_in(conn, "thread", &threads)?;
                response.posts = rows.into_iter().map(post_to_external).collect();
            }
            if embeds.contains(&Embed::Votes) && kind == EntityKind::Posts {
                let posts = fingerprints_of(response.posts.iter().map(|p| &p.provable.fingerprint));
                let rows: Vec<VoteRow> = rows_where_in(conn, "target", &posts)?;
                response.votes = rows.into_iter().map(vote_to_external).collect();
            }

            // Keys last: they cover the primary result and the embeds above
            if embeds.contains(&Embed::Keys) {
                let owners = owner_fingerprints(response);
                let rows: Vec<KeyRow> = get_by_fingerprints(conn, &owners)?;
                let mut present: HashSet<Fingerprint> = response
                    .keys
                    .iter()
                    .map(|k| k.provable.fingerprint.clone())
                    .collect();
                for row in rows {
                    if present.insert(row.provable.fingerprint.clone()) {
                        response.keys.push(key_to_external(row));
                    }
                }
            }
            Ok(())
        })
    }

    // =========================================================================
    // Narrow readers
    // =========================================================================
    //
    // These take an already sanitised window and run exactly one query.

    pub fn read_boards(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Board>, StorageError> {
        self.db.with_conn(|conn| {
            let rows = planned_rows::<BoardRow>(conn, fingerprints, begin, end, opts)?;
            boards_to_external(conn, rows)
        })
    }

    pub fn read_threads(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Thread>, StorageError> {
        let rows = self
            .db
            .with_conn(|conn| planned_rows::<ThreadRow>(conn, fingerprints, begin, end, opts))?;
        Ok(rows.into_iter().map(thread_to_external).collect())
    }

    pub fn read_posts(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Post>, StorageError> {
        let rows = self
            .db
            .with_conn(|conn| planned_rows::<PostRow>(conn, fingerprints, begin, end, opts))?;
        Ok(rows.into_iter().map(post_to_external).collect())
    }

    pub fn read_votes(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Vote>, StorageError> {
        let rows = self
            .db
            .with_conn(|conn| planned_rows::<VoteRow>(conn, fingerprints, begin, end, opts))?;
        Ok(rows.into_iter().map(vote_to_external).collect())
    }

    pub fn read_keys(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Key>, StorageError> {
        let rows = self
            .db
            .with_conn(|conn| planned_rows::<KeyRow>(conn, fingerprints, begin, end, opts))?;
        Ok(rows.into_iter().map(key_to_external).collect())
    }

    pub fn read_truststates(
        &self,
        fingerprints: &[Fingerprint],
        begin: Timestamp,
        end: Timestamp,
        opts: &ReadOptions,
    ) -> Result<Vec<Truststate>, StorageError> {
        let rows = self
            .db
            .with_conn(|conn| planned_rows::<TruststateRow>(conn, fingerprints, begin, end, opts))?;
        Ok(rows.into_iter().map(truststate_to_external).collect())
    }

    // =========================================================================
    // Addresses and sub-stores
    // =========================================================================

    /// Run an address search. Addresses that fail to convert are skipped
    /// unless the failure is fatal.
    pub fn read_addresses(&self, search: &AddressSearch) -> Result<Vec<Address>, StorageError> {
        if self.ctx.shutdown_initiated() {
            return Ok(vec![]);
        }
        let now = self.ctx.now();
        let max = self.ctx.max_address_table_size;

        self.db.with_conn(|conn| {
            let rows = addresses::search(conn, search, now, max)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let id = format!("{}/{}:{}", row.location, row.sublocation, row.port);
                match address_to_external(conn, row) {
                    Ok(address) => out.push(address),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(address = %id, error = %e, "Skipping unreadable address"),
                }
            }
            Ok(out)
        })
    }

    pub fn read_board_owners(
        &self,
        board: &str,
        key: Option<&str>,
    ) -> Result<Vec<BoardOwnerRow>, StorageError> {
        if self.ctx.shutdown_initiated() {
            return Ok(vec![]);
        }
        self.db
            .with_conn(|conn| board_owners::read_board_owners(conn, board, key))
    }

    pub fn read_subprotocols(
        &self,
        location: &str,
        sublocation: &str,
        port: u16,
    ) -> Result<Vec<SubprotocolRow>, StorageError> {
        if self.ctx.shutdown_initiated() {
            return Ok(vec![]);
        }
        self.db
            .with_conn(|conn| addresses::read_subprotocols(conn, location, sublocation, port))
    }

    /// Sync bookkeeping for a remote node
    pub fn read_node(&self, fingerprint: &str) -> Result<NodeRow, StorageError> {
        self.db
            .with_conn(|conn| nodes::get_node(conn, fingerprint))?
            .ok_or_else(|| StorageError::NotFound(format!("Node {}", fingerprint)))
    }

    // =========================================================================
    // Counts
    // =========================================================================

    pub fn board_thread_count(&self, board: &str) -> Result<u64, StorageError> {
        self.db.with_conn(|conn| counts::board_thread_count(conn, board))
    }

    pub fn thread_post_count(&self, thread: &str) -> Result<u64, StorageError> {
        self.db.with_conn(|conn| counts::thread_post_count(conn, thread))
    }

    pub fn database_counts(&self) -> Result<DatabaseCounts, StorageError> {
        self.db.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = 1_000_000;
    const HEAD: Timestamp = NOW - 14 * 86_400;

    fn unprivileged(begin: Timestamp, end: Timestamp, cache: Timestamp) -> Result<(i64, i64), StorageError> {
        sanitise_time_range(begin, end, NOW, cache, HEAD, false)
    }

    #[test]
    fn test_read_validity() {
        let fps = vec!["b1".to_string()];
        assert!(enforce_read_validity(&fps, 0, 0, false).is_ok());
        assert!(enforce_read_validity(&[], 10, 20, false).is_ok());
        assert!(enforce_read_validity(&[], 0, 0, false).is_ok());
        assert!(enforce_read_validity(&fps, 10, 0, false).is_err());
        assert!(enforce_read_validity(&fps, 10, 20, true).is_ok());
    }

    #[test]
    fn test_unprivileged_window() {
        // Empty window falls back to the network head
        assert_eq!(unprivileged(0, 0, 0).unwrap(), (HEAD, NOW));
        // End in the future is pulled back
        assert_eq!(unprivileged(NOW - 10, NOW + 500, 0).unwrap(), (NOW - 10, NOW));
        // Begin behind the cache boundary moves to it
        assert_eq!(unprivileged(5, 10, NOW - 100).unwrap(), (NOW - 100, NOW));
        // Inverted range is the caller's mistake
        assert!(unprivileged(NOW - 5, NOW - 10, 0).is_err());
    }

    #[test]
    fn test_privileged_window() {
        let s = |b, e| sanitise_time_range(b, e, NOW, NOW - 100, HEAD, true).unwrap();
        assert_eq!(s(0, 0), (0, NOW));
        assert_eq!(s(NOW - 10, NOW - 20), (NOW - 20, NOW - 10));
        assert_eq!(s(NOW + 50, 0), (NOW, NOW));
    }

    #[test]
    fn test_embed_names() {
        let parsed = parse_embeds(&["threads".into(), "keys".into(), "keys".into()]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&Embed::Keys));
        assert!(parse_embeds(&["comments".into()]).is_err());
    }

    #[test]
    fn test_owner_fingerprints_cover_grants() {
        let mut response = Response::default();
        response.boards.push(Board {
            owner: "k1".into(),
            board_owners: vec![crate::entities::BoardOwner {
                key_fingerprint: "k3".into(),
                level: 1,
                ..Default::default()
            }],
            ..Default::default()
        });
        response.threads.push(Thread {
            owner: "k2".into(),
            ..Default::default()
        });
        response.votes.push(Vote {
            owner: "k9".into(),
            ..Default::default()
        });
        response.posts.push(Post {
            owner: "k1".into(),
            ..Default::default()
        });
        assert_eq!(owner_fingerprints(&response), vec!["k1", "k3", "k2"]);
    }
}
