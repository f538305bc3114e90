//! Query-shape classification
//!
//! A read's optional filters reduce to one [`QueryShape`]. Each entity kind
//! accepts a fixed list of shapes; anything else is refused before any SQL
//! is built. The canonical tag (`(fp)(ts)`, `(ownr)(lim-offs)`, ...) is the
//! shape's `Display` form and is what appears in logs and errors.

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::entities::{EntityKind, Fingerprint, Timestamp};
use crate::error::StorageError;

/// Optional filters accepted by `read`. Which ones apply depends on the kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Exact name match (boards, keys). Overrides every other filter.
    pub name: Option<String>,
    /// Parent board (threads, posts, votes)
    pub board: Option<Fingerprint>,
    /// Parent thread (posts, votes)
    pub thread: Option<Fingerprint>,
    /// Parent post (posts)
    pub parent: Option<Fingerprint>,
    /// Target entity (votes, truststates)
    pub target: Option<Fingerprint>,
    /// Trust domain (truststates)
    pub domain: Option<Fingerprint>,
    pub type_class: Option<i32>,
    #[serde(rename = "type")]
    pub type_: Option<i32>,
    /// Votes on the thread itself, not on its posts
    pub no_descendants: bool,
    /// Owner key. Overrides every filter except pagination.
    pub owner: Option<Fingerprint>,
    pub limit: i64,
    pub offset: i64,
}

/// One component of a filtered shape, in canonical tag order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Filter {
    Fingerprints,
    TimeRange,
    TypeClass,
    Type,
    ParentBoard,
    ParentThread,
    ParentPost,
    Target,
    Domain,
    NoDescendants,
    /// Limit/offset without an owner. Never supported; kept so the refusal
    /// names the offending shape.
    Paged,
}

impl Filter {
    fn tag(&self) -> &'static str {
        match self {
            Filter::Fingerprints => "(fp)",
            Filter::TimeRange => "(ts)",
            Filter::TypeClass => "(tc)",
            Filter::Type => "(ty)",
            Filter::ParentBoard => "(pbfp)",
            Filter::ParentThread => "(ptfp)",
            Filter::ParentPost => "(ppfp)",
            Filter::Target => "(tafp)",
            Filter::Domain => "(dofp)",
            Filter::NoDescendants => "(nodesc)",
            Filter::Paged => "(lim-offs)",
        }
    }
}

/// Classified read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    Name,
    Owner,
    OwnerPaged,
    Filtered(Vec<Filter>),
}

impl std::fmt::Display for QueryShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryShape::Name => write!(f, "(name)"),
            QueryShape::Owner => write!(f, "(ownr)"),
            QueryShape::OwnerPaged => write!(f, "(ownr)(lim-offs)"),
            QueryShape::Filtered(filters) if filters.is_empty() => write!(f, "(none)"),
            QueryShape::Filtered(filters) => {
                for filter in filters {
                    write!(f, "{}", filter.tag())?;
                }
                Ok(())
            }
        }
    }
}

fn non_empty(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.is_empty())
}

/// Reduce the supplied filters to a shape. Name wins over everything, owner
/// over everything but pagination.
pub fn classify(
    fingerprints: &[Fingerprint],
    begin: Timestamp,
    end: Timestamp,
    opts: &ReadOptions,
) -> QueryShape {
    if non_empty(&opts.name) {
        return QueryShape::Name;
    }

    let paged = opts.limit > 0 || opts.offset > 0;
    if non_empty(&opts.owner) {
        return if paged {
            QueryShape::OwnerPaged
        } else {
            QueryShape::Owner
        };
    }

    let mut filters = Vec::new();
    if !fingerprints.is_empty() {
        filters.push(Filter::Fingerprints);
    }
    if begin > 0 || end > 0 {
        filters.push(Filter::TimeRange);
    }
    if opts.type_class.is_some() {
        filters.push(Filter::TypeClass);
    }
    if opts.type_.is_some() {
        filters.push(Filter::Type);
    }
    if non_empty(&opts.board) {
        filters.push(Filter::ParentBoard);
    }
    if non_empty(&opts.thread) {
        filters.push(Filter::ParentThread);
    }
    if non_empty(&opts.parent) {
        filters.push(Filter::ParentPost);
    }
    if non_empty(&opts.target) {
        filters.push(Filter::Target);
    }
    if non_empty(&opts.domain) {
        filters.push(Filter::Domain);
    }
    if opts.no_descendants {
        filters.push(Filter::NoDescendants);
    }
    if paged {
        filters.push(Filter::Paged);
    }
    QueryShape::Filtered(filters)
}

// =============================================================================
// Support table
// =============================================================================

use Filter::{
    Domain as Do, Fingerprints as Fp, NoDescendants as Nd, ParentBoard as Pb,
    ParentPost as Pp, ParentThread as Pt, Target as Ta, TimeRange as Ts, Type as Ty,
    TypeClass as Tc,
};

const COMMON: &[&[Filter]] = &[&[Fp], &[Fp, Ts], &[Ts]];

const THREADS: &[&[Filter]] = &[&[Ts, Pb]];

const POSTS: &[&[Filter]] = &[&[Ts, Pb], &[Ts, Pt], &[Ts, Pp]];

const VOTES: &[&[Filter]] = &[
    &[Ts, Tc],
    &[Ts, Tc, Ty],
    &[Tc, Ty],
    &[Ts, Tc, Pb],
    &[Ts, Tc, Pt],
    &[Ts, Tc, Ta],
    &[Ts, Tc, Pb, Nd],
];

const TRUSTSTATES: &[&[Filter]] = &[
    &[Ts, Tc],
    &[Ts, Tc, Ty],
    &[Tc, Ty],
    &[Tc, Ta],
    &[Ts, Tc, Ta],
    &[Ts, Tc, Do],
    &[Tc, Ta, Do],
    &[Ts, Tc, Ta, Do],
];

/// Whether `kind` has a prepared query for `shape`
pub fn supports(kind: EntityKind, shape: &QueryShape) -> bool {
    match shape {
        QueryShape::Name => matches!(kind, EntityKind::Boards | EntityKind::Keys),
        QueryShape::Owner | QueryShape::OwnerPaged => kind.is_provable(),
        QueryShape::Filtered(filters) => {
            let extra: &[&[Filter]] = match kind {
                EntityKind::Boards | EntityKind::Keys => &[],
                EntityKind::Threads => THREADS,
                EntityKind::Posts => POSTS,
                EntityKind::Votes => VOTES,
                EntityKind::Truststates => TRUSTSTATES,
                EntityKind::Addresses => return false,
            };
            COMMON
                .iter()
                .chain(extra.iter())
                .any(|allowed| *allowed == filters.as_slice())
        }
    }
}

// =============================================================================
// SQL
// =============================================================================

/// A SELECT ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub shape: QueryShape,
    pub sql: String,
    pub values: Vec<Value>,
}

/// Classify, check support and build the SELECT for one kind
pub fn plan(
    kind: EntityKind,
    fingerprints: &[Fingerprint],
    begin: Timestamp,
    end: Timestamp,
    opts: &ReadOptions,
) -> Result<QueryPlan, StorageError> {
    if opts.limit < 0 || opts.offset < 0 {
        return Err(StorageError::InvalidRequest(format!(
            "Negative pagination (limit {}, offset {})",
            opts.limit, opts.offset
        )));
    }

    let shape = classify(fingerprints, begin, end, opts);
    if !supports(kind, &shape) {
        return Err(StorageError::InvalidRequest(format!(
            "Unsupported query shape {} for {}",
            shape, kind
        )));
    }

    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut suffix = String::new();

    let text = |v: &Option<String>| Value::from(v.clone().unwrap_or_default());

    match &shape {
        QueryShape::Name => {
            conditions.push("name = ?".into());
            values.push(text(&opts.name));
        }
        QueryShape::Owner | QueryShape::OwnerPaged => {
            // A key owns itself
            let column = if kind == EntityKind::Keys { "fingerprint" } else { "owner" };
            conditions.push(format!("{} = ?", column));
            values.push(text(&opts.owner));
            suffix.push_str(" ORDER BY last_referenced DESC");
            if shape == QueryShape::OwnerPaged {
                suffix.push_str(" LIMIT ? OFFSET ?");
            }
        }
        QueryShape::Filtered(filters) => {
            for filter in filters {
                match filter {
                    Filter::Fingerprints => {
                        let placeholders: Vec<&str> = fingerprints.iter().map(|_| "?").collect();
                        conditions.push(format!("fingerprint IN ({})", placeholders.join(", ")));
                        values.extend(fingerprints.iter().cloned().map(Value::from));
                    }
                    Filter::TimeRange => {
                        conditions.push("last_referenced >= ? AND last_referenced <= ?".into());
                        values.push(Value::from(begin));
                        values.push(Value::from(end));
                    }
                    Filter::TypeClass => {
                        conditions.push("type_class = ?".into());
                        values.push(Value::from(opts.type_class.unwrap_or_default()));
                    }
                    Filter::Type => {
                        conditions.push("type = ?".into());
                        values.push(Value::from(opts.type_.unwrap_or_default()));
                    }
                    Filter::ParentBoard => {
                        conditions.push("board = ?".into());
                        values.push(text(&opts.board));
                    }
                    Filter::ParentThread => {
                        conditions.push("thread = ?".into());
                        values.push(text(&opts.thread));
                    }
                    Filter::ParentPost => {
                        conditions.push("parent = ?".into());
                        values.push(text(&opts.parent));
                    }
                    Filter::Target => {
                        conditions.push("target = ?".into());
                        values.push(text(&opts.target));
                    }
                    Filter::Domain => {
                        conditions.push("domain = ?".into());
                        values.push(text(&opts.domain));
                    }
                    Filter::NoDescendants => conditions.push("target = thread".into()),
                    Filter::Paged => {}
                }
            }
            if filters.as_slice() == [Filter::TimeRange] {
                suffix.push_str(" ORDER BY last_referenced DESC");
            }
        }
    }

    let mut sql = format!("SELECT * FROM {}", kind.table());
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&suffix);

    if shape == QueryShape::OwnerPaged {
        values.push(Value::from(opts.limit));
        values.push(Value::from(opts.offset));
    }

    Ok(QueryPlan { shape, sql, values })
}
