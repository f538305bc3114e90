//! Referential touch cascade
//!
//! When a row is inserted or updated, every stored row it references, and
//! everything those reference in turn, gets `last_referenced` bumped to the
//! batch instant. The graph is described by [`REFERENCE_EDGES`] and walked
//! breadth-first over a [`ReferenceLookup`], so the walk itself never needs
//! SQLite.

use std::collections::{HashSet, VecDeque};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::entities::{EntityKind, Fingerprint, Timestamp};
use crate::error::StorageError;

/// Hard ceiling on rows touched by one write
pub const MAX_CASCADE_TOUCHES: usize = 10_000;

/// One outgoing reference: `from.column` holds a fingerprint of `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceEdge {
    pub from: EntityKind,
    pub column: &'static str,
    pub to: EntityKind,
}

const fn edge(from: EntityKind, column: &'static str, to: EntityKind) -> ReferenceEdge {
    ReferenceEdge { from, column, to }
}

/// Adjacency table. Board-owner keys are the one reference that lives in a
/// side table and are handled by [`ReferenceLookup::board_owner_keys`].
pub const REFERENCE_EDGES: &[ReferenceEdge] = &[
    edge(EntityKind::Posts, "parent", EntityKind::Posts),
    edge(EntityKind::Posts, "thread", EntityKind::Threads),
    edge(EntityKind::Posts, "board", EntityKind::Boards),
    edge(EntityKind::Posts, "owner", EntityKind::Keys),
    edge(EntityKind::Threads, "board", EntityKind::Boards),
    edge(EntityKind::Threads, "owner", EntityKind::Keys),
    edge(EntityKind::Boards, "owner", EntityKind::Keys),
    edge(EntityKind::Votes, "owner", EntityKind::Keys),
    edge(EntityKind::Truststates, "target", EntityKind::Keys),
    edge(EntityKind::Truststates, "owner", EntityKind::Keys),
];

pub fn edges_from(kind: EntityKind) -> impl Iterator<Item = &'static ReferenceEdge> {
    REFERENCE_EDGES.iter().filter(move |e| e.from == kind)
}

/// A row to be touched
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Touch {
    pub kind: EntityKind,
    pub fingerprint: Fingerprint,
}

impl Touch {
    pub fn new(kind: EntityKind, fingerprint: impl Into<Fingerprint>) -> Self {
        Self {
            kind,
            fingerprint: fingerprint.into(),
        }
    }
}

/// Read access to stored references
pub trait ReferenceLookup {
    fn exists(&self, kind: EntityKind, fingerprint: &str) -> Result<bool, StorageError>;

    /// Value of a reference column on a stored row, `None` if the row is absent
    fn column(
        &self,
        kind: EntityKind,
        fingerprint: &str,
        column: &str,
    ) -> Result<Option<String>, StorageError>;

    fn board_owner_keys(&self, board: &str) -> Result<Vec<Fingerprint>, StorageError>;
}

/// First hop of the walk, taken from the incoming row itself because it may
/// not be stored yet. `value_of` returns the incoming row's reference columns.
pub fn initial_targets<F>(kind: EntityKind, value_of: F, owner_keys: &[Fingerprint]) -> Vec<Touch>
where
    F: Fn(&str) -> Option<String>,
{
    let mut targets: Vec<Touch> = edges_from(kind)
        .filter_map(|e| value_of(e.column).map(|v| Touch::new(e.to, v)))
        .filter(|t| !t.fingerprint.is_empty())
        .collect();

    if kind == EntityKind::Boards {
        targets.extend(
            owner_keys
                .iter()
                .filter(|k| !k.is_empty())
                .map(|k| Touch::new(EntityKind::Keys, k.clone())),
        );
    }
    targets
}

/// Breadth-first walk from `start`. Returns every stored row reached, each
/// once. Rows not stored locally end that branch without error.
pub fn walk<L: ReferenceLookup + ?Sized>(
    lookup: &L,
    start: Vec<Touch>,
) -> Result<Vec<Touch>, StorageError> {
    let mut queue: VecDeque<Touch> = start.into();
    let mut visited: HashSet<Touch> = HashSet::new();
    let mut touched = Vec::new();

    while let Some(node) = queue.pop_front() {
        if touched.len() >= MAX_CASCADE_TOUCHES {
            warn!(limit = MAX_CASCADE_TOUCHES, "Touch cascade truncated");
            break;
        }
        if !visited.insert(node.clone()) {
            continue;
        }
        if !lookup.exists(node.kind, &node.fingerprint)? {
            continue;
        }

        for e in edges_from(node.kind) {
            if let Some(next) = lookup.column(node.kind, &node.fingerprint, e.column)? {
                if !next.is_empty() {
                    queue.push_back(Touch::new(e.to, next));
                }
            }
        }
        if node.kind == EntityKind::Boards {
            for key in lookup.board_owner_keys(&node.fingerprint)? {
                queue.push_back(Touch::new(EntityKind::Keys, key));
            }
        }

        touched.push(node);
    }

    Ok(touched)
}

/// Stamp every touched row with `now`
pub fn apply_touches(
    conn: &Connection,
    touches: &[Touch],
    now: Timestamp,
) -> Result<(), StorageError> {
    for t in touches {
        let sql = format!(
            "UPDATE {} SET last_referenced = ? WHERE fingerprint = ?",
            t.kind.table()
        );
        conn.execute(&sql, params![now, t.fingerprint])?;
    }
    if !touches.is_empty() {
        debug!(count = touches.len(), "Applied touch cascade");
    }
    Ok(())
}

/// [`ReferenceLookup`] over the live tables
pub struct SqlReferences<'a> {
    conn: &'a Connection,
}

impl<'a> SqlReferences<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ReferenceLookup for SqlReferences<'_> {
    fn exists(&self, kind: EntityKind, fingerprint: &str) -> Result<bool, StorageError> {
        let sql = format!("SELECT 1 FROM {} WHERE fingerprint = ?", kind.table());
        let found: Option<i64> = self
            .conn
            .query_row(&sql, params![fingerprint], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn column(
        &self,
        kind: EntityKind,
        fingerprint: &str,
        column: &str,
    ) -> Result<Option<String>, StorageError> {
        let sql = format!("SELECT {} FROM {} WHERE fingerprint = ?", column, kind.table());
        let value = self
            .conn
            .query_row(&sql, params![fingerprint], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn board_owner_keys(&self, board: &str) -> Result<Vec<Fingerprint>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key_fingerprint FROM board_owners WHERE board_fingerprint = ?")?;
        let keys = stmt
            .query_map(params![board], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeStore {
        rows: HashMap<(EntityKind, String), HashMap<&'static str, String>>,
        owners: HashMap<String, Vec<String>>,
    }

    impl FakeStore {
        fn add(&mut self, kind: EntityKind, fp: &str, cols: &[(&'static str, &str)]) {
            let cols = cols.iter().map(|(c, v)| (*c, v.to_string())).collect();
            self.rows.insert((kind, fp.to_string()), cols);
        }
    }

    impl ReferenceLookup for FakeStore {
        fn exists(&self, kind: EntityKind, fingerprint: &str) -> Result<bool, StorageError> {
            Ok(self.rows.contains_key(&(kind, fingerprint.to_string())))
        }

        fn column(
            &self,
            kind: EntityKind,
            fingerprint: &str,
            column: &str,
        ) -> Result<Option<String>, StorageError> {
            Ok(self
                .rows
                .get(&(kind, fingerprint.to_string()))
                .and_then(|cols| cols.get(column).cloned()))
        }

        fn board_owner_keys(&self, board: &str) -> Result<Vec<Fingerprint>, StorageError> {
            Ok(self.owners.get(board).cloned().unwrap_or_default())
        }
    }

    fn sorted(touches: Vec<Touch>) -> Vec<(EntityKind, String)> {
        let mut v: Vec<_> = touches.into_iter().map(|t| (t.kind, t.fingerprint)).collect();
        v.sort();
        v
    }

    fn chain() -> FakeStore {
        let mut store = FakeStore::default();
        store.add(EntityKind::Keys, "k1", &[]);
        store.add(EntityKind::Keys, "k2", &[]);
        store.add(EntityKind::Keys, "k3", &[]);
        store.add(EntityKind::Boards, "b1", &[("owner", "k1")]);
        store.owners.insert("b1".into(), vec!["k3".into()]);
        store.add(EntityKind::Threads, "t1", &[("board", "b1"), ("owner", "k2")]);
        store.add(
            EntityKind::Posts,
            "p1",
            &[("board", "b1"), ("thread", "t1"), ("parent", "t1"), ("owner", "k2")],
        );
        store
    }

    #[test]
    fn test_reply_chain_reaches_everything() {
        let store = chain();
        let incoming = |c: &str| match c {
            "board" => Some("b1".to_string()),
            "thread" => Some("t1".to_string()),
            "parent" => Some("p1".to_string()),
            "owner" => Some("k9".to_string()),
            _ => None,
        };
        let start = initial_targets(EntityKind::Posts, incoming, &[]);
        let touched = sorted(walk(&store, start).unwrap());

        assert_eq!(
            touched,
            vec![
                (EntityKind::Boards, "b1".to_string()),
                (EntityKind::Threads, "t1".to_string()),
                (EntityKind::Posts, "p1".to_string()),
                (EntityKind::Keys, "k1".to_string()),
                (EntityKind::Keys, "k2".to_string()),
                (EntityKind::Keys, "k3".to_string()),
            ]
        );
    }

    #[test]
    fn test_votes_touch_only_their_owner() {
        let store = chain();
        let incoming = |c: &str| match c {
            "owner" => Some("k1".to_string()),
            "target" => Some("p1".to_string()),
            "thread" => Some("t1".to_string()),
            _ => None,
        };
        let start = initial_targets(EntityKind::Votes, incoming, &[]);
        assert_eq!(start, vec![Touch::new(EntityKind::Keys, "k1")]);
        assert_eq!(walk(&store, start).unwrap().len(), 1);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut store = FakeStore::default();
        store.add(EntityKind::Posts, "a", &[("parent", "b")]);
        store.add(EntityKind::Posts, "b", &[("parent", "a")]);

        let start = vec![Touch::new(EntityKind::Posts, "a")];
        assert_eq!(walk(&store, start).unwrap().len(), 2);
    }

    #[test]
    fn test_board_start_includes_incoming_owner_keys() {
        let start = initial_targets(
            EntityKind::Boards,
            |c| (c == "owner").then(|| "k1".to_string()),
            &["k3".to_string(), String::new()],
        );
        assert_eq!(
            start,
            vec![Touch::new(EntityKind::Keys, "k1"), Touch::new(EntityKind::Keys, "k3")]
        );
    }
}
