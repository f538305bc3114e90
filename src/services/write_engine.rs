//! Write engine - the single admission path into local state
//!
//! A batch is converted, checked and bucketed by kind, then committed in one
//! transaction. Per row the order is fixed: evaluate the upsert gate, run the
//! touch cascade if the gate passed, then write the row itself. A bad object
//! is dropped with a log line; it never fails the batch.

use std::sync::Arc;
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::convert::to_storage;
use crate::db::cascade::{self, SqlReferences};
use crate::db::models::*;
use crate::db::provables::{self, UpsertDecision};
use crate::db::{addresses, board_owners, nodes, EngineDb};
use crate::entities::{Address, Entity, EntityKind, Fingerprint, Timestamp};
use crate::error::StorageError;
use crate::validation::{
    enforce_identity_fields, enforce_required_fields, enforce_trusted_address_fields,
};

// =============================================================================
// Metrics
// =============================================================================

/// What one or more batch inserts did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertMetrics {
    pub boards_received: usize,
    pub threads_received: usize,
    pub posts_received: usize,
    pub votes_received: usize,
    pub keys_received: usize,
    pub truststates_received: usize,
    pub addresses_received: usize,

    /// Commit time, recorded per kind only when the batch held one kind
    pub boards_commit_secs: f64,
    pub threads_commit_secs: f64,
    pub posts_commit_secs: f64,
    pub votes_commit_secs: f64,
    pub keys_commit_secs: f64,
    pub truststates_commit_secs: f64,
    pub addresses_commit_secs: f64,
    /// Commit time of batches holding several kinds
    pub multiple_kind_commit_secs: f64,
    pub time_elapsed_seconds: f64,

    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub dropped: usize,
}

fn round_tenth(secs: f64) -> f64 {
    (secs * 10.0).round() / 10.0
}

impl InsertMetrics {
    fn received_mut(&mut self, kind: EntityKind) -> &mut usize {
        match kind {
            EntityKind::Boards => &mut self.boards_received,
            EntityKind::Threads => &mut self.threads_received,
            EntityKind::Posts => &mut self.posts_received,
            EntityKind::Votes => &mut self.votes_received,
            EntityKind::Keys => &mut self.keys_received,
            EntityKind::Truststates => &mut self.truststates_received,
            EntityKind::Addresses => &mut self.addresses_received,
        }
    }

    fn record_commit(&mut self, kinds: &[EntityKind], secs: f64) {
        let secs = round_tenth(secs);
        match kinds {
            [] => {}
            [kind] => {
                let slot = match kind {
                    EntityKind::Boards => &mut self.boards_commit_secs,
                    EntityKind::Threads => &mut self.threads_commit_secs,
                    EntityKind::Posts => &mut self.posts_commit_secs,
                    EntityKind::Votes => &mut self.votes_commit_secs,
                    EntityKind::Keys => &mut self.keys_commit_secs,
                    EntityKind::Truststates => &mut self.truststates_commit_secs,
                    EntityKind::Addresses => &mut self.addresses_commit_secs,
                };
                *slot = secs;
            }
            _ => self.multiple_kind_commit_secs = secs,
        }
    }

    pub fn received(&self) -> usize {
        self.boards_received
            + self.threads_received
            + self.posts_received
            + self.votes_received
            + self.keys_received
            + self.truststates_received
            + self.addresses_received
    }

    /// Fold another run into this one. Counts add up; timings accumulate.
    pub fn add(&mut self, other: &InsertMetrics) {
        self.boards_received += other.boards_received;
        self.threads_received += other.threads_received;
        self.posts_received += other.posts_received;
        self.votes_received += other.votes_received;
        self.keys_received += other.keys_received;
        self.truststates_received += other.truststates_received;
        self.addresses_received += other.addresses_received;

        self.boards_commit_secs += other.boards_commit_secs;
        self.threads_commit_secs += other.threads_commit_secs;
        self.posts_commit_secs += other.posts_commit_secs;
        self.votes_commit_secs += other.votes_commit_secs;
        self.keys_commit_secs += other.keys_commit_secs;
        self.truststates_commit_secs += other.truststates_commit_secs;
        self.addresses_commit_secs += other.addresses_commit_secs;
        self.multiple_kind_commit_secs += other.multiple_kind_commit_secs;
        self.time_elapsed_seconds += other.time_elapsed_seconds;

        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

// =============================================================================
// Batch bucketing
// =============================================================================

/// Admitted records of one batch, bucketed by kind
#[derive(Debug, Default)]
struct Batch {
    keys: Vec<KeyRow>,
    boards: Vec<(BoardRow, Vec<BoardOwnerRow>)>,
    threads: Vec<ThreadRow>,
    posts: Vec<PostRow>,
    votes: Vec<VoteRow>,
    truststates: Vec<TruststateRow>,
    addresses: Vec<AddressRow>,
}

impl Batch {
    fn push(&mut self, record: StorageRecord) {
        match record {
            StorageRecord::Key(r) => self.keys.push(r),
            StorageRecord::Board { board, owners } => self.boards.push((board, owners)),
            StorageRecord::Thread(r) => self.threads.push(r),
            StorageRecord::Post(r) => self.posts.push(r),
            StorageRecord::Vote(r) => self.votes.push(r),
            StorageRecord::Truststate(r) => self.truststates.push(r),
            // Third-party subprotocol claims are never stored
            StorageRecord::Address { address, .. } => self.addresses.push(address),
        }
    }

    /// Kinds present, in commit order
    fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds = Vec::new();
        let present = [
            (EntityKind::Keys, !self.keys.is_empty()),
            (EntityKind::Boards, !self.boards.is_empty()),
            (EntityKind::Threads, !self.threads.is_empty()),
            (EntityKind::Posts, !self.posts.is_empty()),
            (EntityKind::Votes, !self.votes.is_empty()),
            (EntityKind::Truststates, !self.truststates.is_empty()),
            (EntityKind::Addresses, !self.addresses.is_empty()),
        ];
        for (kind, has) in present {
            if has {
                kinds.push(kind);
            }
        }
        kinds
    }
}

#[derive(Debug, Default)]
struct Tally {
    inserted: usize,
    updated: usize,
    skipped: usize,
}

impl Tally {
    fn record(&mut self, decision: UpsertDecision) {
        match decision {
            UpsertDecision::Insert => self.inserted += 1,
            UpsertDecision::Update => self.updated += 1,
            UpsertDecision::Skip => self.skipped += 1,
        }
    }
}

fn text_binding(bindings: &[Binding], column: &str) -> Option<String> {
    bindings
        .iter()
        .find(|(c, _)| *c == column)
        .and_then(|(_, v)| match v {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        })
}

/// Gate, cascade, write. Nothing is touched when the gate says skip.
fn write_provable<R: ProvableRow>(
    conn: &Connection,
    row: &R,
    owner_keys: &[Fingerprint],
    now: Timestamp,
) -> Result<UpsertDecision, StorageError> {
    let decision = provables::decide(conn, row)?;
    if decision.is_write() {
        let bindings = row.bindings();
        let start = cascade::initial_targets(R::KIND, |c| text_binding(&bindings, c), owner_keys);
        let touches = cascade::walk(&SqlReferences::new(conn), start)?;
        cascade::apply_touches(conn, &touches, now)?;
        provables::apply(conn, row, decision)?;
    } else {
        debug!(kind = %R::KIND, fingerprint = %row.fingerprint(), "Stale or duplicate row skipped");
    }
    Ok(decision)
}

fn commit_batch(
    conn: &mut Connection,
    batch: &Batch,
    now: Timestamp,
    max_address_table_size: u32,
) -> Result<Tally, StorageError> {
    let tx = conn.transaction()?;
    let mut tally = Tally::default();

    for key in &batch.keys {
        tally.record(write_provable(&tx, key, &[], now)?);
    }
    for (board, owners) in &batch.boards {
        let owner_keys: Vec<Fingerprint> =
            owners.iter().map(|o| o.key_fingerprint.clone()).collect();
        let decision = write_provable(&tx, board, &owner_keys, now)?;
        // The owner set rides on the board's own gate
        if decision.is_write() {
            board_owners::replace_board_owners(&tx, &board.provable.fingerprint, owners)?;
        }
        tally.record(decision);
    }
    for thread in &batch.threads {
        tally.record(write_provable(&tx, thread, &[], now)?);
    }
    for post in &batch.posts {
        tally.record(write_provable(&tx, post, &[], now)?);
    }
    for vote in &batch.votes {
        tally.record(write_provable(&tx, vote, &[], now)?);
    }
    for truststate in &batch.truststates {
        tally.record(write_provable(&tx, truststate, &[], now)?);
    }
    if !batch.addresses.is_empty() {
        let added = addresses::insert_untrusted(&tx, &batch.addresses, max_address_table_size)?;
        tally.inserted += added;
        tally.skipped += batch.addresses.len() - added;
    }

    tx.commit()?;
    Ok(tally)
}

// =============================================================================
// Engine
// =============================================================================

/// Write engine over the shared database
pub struct WriteEngine {
    db: Arc<EngineDb>,
    ctx: Arc<EngineContext>,
}

impl WriteEngine {
    pub fn new(db: Arc<EngineDb>, ctx: Arc<EngineContext>) -> Self {
        Self { db, ctx }
    }

    /// Run `op`, retrying once after the configured backoff if SQLite
    /// reports the database busy. A second busy result is fatal.
    fn with_busy_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match op() {
            Err(e) if e.is_busy() => {
                warn!(
                    operation = what,
                    backoff_ms = self.ctx.lock_retry_backoff.as_millis() as u64,
                    "Database locked, nothing was committed; retrying once"
                );
                std::thread::sleep(self.ctx.lock_retry_backoff);
                match op() {
                    Err(e) if e.is_busy() => {
                        error!(operation = what, error = %e, "Database still locked after retry");
                        Err(StorageError::Fatal(format!(
                            "{} failed twice on a locked database: {}",
                            what, e
                        )))
                    }
                    Ok(v) => {
                        info!(operation = what, "Retry after lock succeeded");
                        Ok(v)
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    // =========================================================================
    // Batch insert
    // =========================================================================

    /// Admit a batch of externally supplied entities
    pub fn batch_insert(&self, entities: Vec<Entity>) -> Result<InsertMetrics, StorageError> {
        let mut metrics = InsertMetrics::default();
        if self.ctx.shutdown_initiated() {
            return Ok(metrics);
        }

        let started = Instant::now();
        // One instant for every row written or touched by this batch
        let now = self.ctx.now();
        let mut batch = Batch::default();

        for entity in entities {
            let kind = entity.kind();
            *metrics.received_mut(kind) += 1;

            match self.admit(entity, now) {
                Ok(record) => batch.push(record),
                Err(e) => {
                    debug!(kind = %kind, reason = %e, "Dropped object from batch");
                    metrics.dropped += 1;
                }
            }
        }

        let kinds = batch.kinds();
        if kinds.is_empty() {
            metrics.time_elapsed_seconds = started.elapsed().as_secs_f64();
            return Ok(metrics);
        }

        let commit_started = Instant::now();
        let max_addresses = self.ctx.max_address_table_size;
        let tally = self.with_busy_retry("batch insert", || {
            self.db
                .with_conn_mut(|conn| commit_batch(conn, &batch, now, max_addresses))
        })?;
        metrics.record_commit(&kinds, commit_started.elapsed().as_secs_f64());

        metrics.inserted = tally.inserted;
        metrics.updated = tally.updated;
        metrics.skipped = tally.skipped;
        metrics.time_elapsed_seconds = started.elapsed().as_secs_f64();

        info!(
            received = metrics.received(),
            inserted = metrics.inserted,
            updated = metrics.updated,
            skipped = metrics.skipped,
            dropped = metrics.dropped,
            elapsed = metrics.time_elapsed_seconds,
            "Batch insert complete"
        );
        Ok(metrics)
    }

    fn admit(&self, entity: Entity, now: Timestamp) -> Result<StorageRecord, StorageError> {
        let record = to_storage(entity, now)?;
        enforce_identity_fields(&record, &self.ctx)?;
        enforce_required_fields(&record, &self.ctx)?;
        Ok(record)
    }

    // =========================================================================
    // Trusted addresses
    // =========================================================================

    /// Store addresses this node connected to itself. Each address is checked
    /// on its own; the ones that fail are reported and the rest are written.
    pub fn insert_or_update_addresses(&self, addresses: Vec<Address>) -> Vec<StorageError> {
        let mut errors = Vec::new();
        if self.ctx.shutdown_initiated() {
            return errors;
        }

        let now = self.ctx.now();
        let mut packs = Vec::new();
        for address in addresses {
            match self.admit_trusted(address, now) {
                Ok(pack) => packs.push(pack),
                Err(e) => {
                    warn!(reason = %e, "Trusted address refused");
                    errors.push(e);
                }
            }
        }
        if packs.is_empty() {
            return errors;
        }

        let result = self.with_busy_retry("trusted address upsert", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                for (address, subprotocols, junctions) in &packs {
                    if addresses::upsert_trusted(&tx, address, subprotocols, junctions)? {
                        written += 1;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
        });

        match result {
            Ok(written) => debug!(written, total = packs.len(), "Trusted addresses stored"),
            Err(e) => errors.push(e),
        }
        errors
    }

    fn admit_trusted(
        &self,
        address: Address,
        now: Timestamp,
    ) -> Result<(AddressRow, Vec<SubprotocolRow>, Vec<AddressSubprotocolRow>), StorageError> {
        match self.admit(Entity::Address(address), now)? {
            StorageRecord::Address {
                address,
                subprotocols,
                junctions,
            } => {
                enforce_trusted_address_fields(&address, &subprotocols)?;
                Ok((address, subprotocols, junctions))
            }
            other => Err(StorageError::Internal(format!(
                "Address conversion produced a {} record",
                other.kind()
            ))),
        }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Record sync bookkeeping for a remote node. The local node id is refused.
    pub fn insert_node(&self, node: &NodeRow) -> Result<(), StorageError> {
        if self.ctx.shutdown_initiated() {
            return Ok(());
        }
        if node.fingerprint == self.ctx.node_id {
            return Err(StorageError::InvalidRequest(format!(
                "Node record {} uses the local node id",
                node.fingerprint
            )));
        }
        self.with_busy_retry("node insert", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                nodes::replace_node(&tx, node)?;
                tx.commit()?;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::FixedClock;
    use crate::db::provables::get_by_fingerprints;
    use crate::entities::{Key, ProvableFields};
    use std::time::Duration;

    fn engine() -> (WriteEngine, Arc<EngineDb>) {
        let config = Config {
            node_id: "local".into(),
            ..Config::default()
        };
        let mut ctx = EngineContext::with_clock(&config, FixedClock::new(1_000));
        ctx.lock_retry_backoff = Duration::from_millis(1);
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        (WriteEngine::new(db.clone(), Arc::new(ctx)), db)
    }

    fn key(fp: &str) -> Entity {
        Entity::Key(Key {
            provable: ProvableFields {
                fingerprint: fp.into(),
                creation: 100,
                proof_of_work: "pow".into(),
                signature: "sig".into(),
            },
            key_type: "ed25519".into(),
            public_key: format!("pk-{}", fp),
            entity_version: 1,
            verified: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_batch_counts() {
        let (writer, db) = engine();
        let mut unverified = key("k3");
        if let Entity::Key(k) = &mut unverified {
            k.verified = false;
        }

        let metrics = writer
            .batch_insert(vec![key("k1"), key("k2"), key("k1"), unverified])
            .unwrap();
        assert_eq!(metrics.keys_received, 4);
        assert_eq!(metrics.inserted, 2);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.dropped, 1);

        let stored: Vec<KeyRow> = db
            .with_conn(|c| get_by_fingerprints(c, &["k1".to_string(), "k3".to_string()]))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].local_arrival, 1_000);
    }

    #[test]
    fn test_metrics_add() {
        let mut a = InsertMetrics {
            posts_received: 2,
            inserted: 1,
            ..Default::default()
        };
        let b = InsertMetrics {
            posts_received: 3,
            dropped: 4,
            ..Default::default()
        };
        a.add(&b);
        assert_eq!(a.posts_received, 5);
        assert_eq!(a.inserted, 1);
        assert_eq!(a.dropped, 4);
        assert_eq!(a.received(), 5);
    }

    #[test]
    fn test_shutdown_skips_writes() {
        let (writer, db) = engine();
        writer.ctx.begin_shutdown();
        let metrics = writer.batch_insert(vec![key("k1")]).unwrap();
        assert_eq!(metrics, InsertMetrics::default());
        assert_eq!(db.stats().unwrap().keys, 0);
    }

    #[test]
    fn test_busy_retry_then_fatal() {
        let (writer, _db) = engine();

        let mut calls = 0;
        let ok = writer.with_busy_retry("test", || {
            calls += 1;
            if calls == 1 {
                Err(StorageError::Busy("locked".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(ok.unwrap(), 7);

        let always_busy: Result<(), _> =
            writer.with_busy_retry("test", || Err(StorageError::Busy("locked".into())));
        assert!(always_busy.unwrap_err().is_fatal());

        let mut other_calls = 0;
        let other: Result<(), _> = writer.with_busy_retry("test", || {
            other_calls += 1;
            Err(StorageError::InvalidRequest("nope".into()))
        });
        assert!(matches!(other, Err(StorageError::InvalidRequest(_))));
        assert_eq!(other_calls, 1);
    }

    #[test]
    fn test_local_node_id_is_refused() {
        let (writer, db) = engine();
        let local = NodeRow {
            fingerprint: "local".into(),
            ..Default::default()
        };
        assert!(writer.insert_node(&local).is_err());

        let remote = NodeRow {
            fingerprint: "remote".into(),
            keys_last_checkin: 50,
            ..Default::default()
        };
        writer.insert_node(&remote).unwrap();
        let stored = db.with_conn(|c| nodes::get_node(c, "remote")).unwrap();
        assert_eq!(stored, Some(remote));
    }
}
