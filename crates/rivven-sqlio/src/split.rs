//! Splits: independently executable, restart-safe pieces of a query
//!
//! The [`Splitter`] turns a [`QueryDescriptor`] and its [`RangeEstimate`]
//! into disjoint splits that together cover the result set exactly once.
//! Splits live in an append-only [`SplitArena`] and are never mutated;
//! re-splitting retires the parent and appends children covering exactly
//! the parent's unconsumed remainder.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::dialect::{strip_statement, SqlDialect};
use crate::error::{Error, Result};
use crate::estimator::RangeEstimate;
use crate::query::{BoundStrategy, QueryDescriptor};
use crate::types::Value;

/// Derived-table alias used by split queries
pub const SPLIT_ALIAS: &str = "sqlio_split";

/// Split identifier: query id plus a per-query ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SplitId {
    query: Uuid,
    ordinal: u64,
}

impl SplitId {
    /// Create a split id
    pub fn new(query: Uuid, ordinal: u64) -> Self {
        Self { query, ordinal }
    }

    /// Owning query id
    pub fn query(&self) -> Uuid {
        self.query
    }

    /// Ordinal within the query's arena
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.query, self.ordinal)
    }
}

impl FromStr for SplitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (query, ordinal) = s
            .split_once('/')
            .ok_or_else(|| Error::serialization(format!("invalid split id '{}'", s)))?;
        let query = Uuid::parse_str(query)
            .map_err(|e| Error::serialization(format!("invalid split id '{}': {}", s, e)))?;
        let ordinal = ordinal
            .parse()
            .map_err(|e| Error::serialization(format!("invalid split id '{}': {}", s, e)))?;
        Ok(Self { query, ordinal })
    }
}

impl Serialize for SplitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SplitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Partition key kinds that map onto an integer domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Integer column, raw values
    Integer,
    /// DATE column, days since the Unix epoch
    Date,
    /// TIMESTAMP column, microseconds since the Unix epoch
    Timestamp,
    /// TIMESTAMPTZ column, microseconds since the Unix epoch
    TimestampTz,
}

fn unix_epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

impl KeyKind {
    /// Key kind of a sample value, `None` for keys without an integer domain
    pub fn of_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
                Some(Self::Integer)
            }
            Value::Date(_) => Some(Self::Date),
            Value::DateTime(_) => Some(Self::Timestamp),
            Value::DateTimeTz(_) => Some(Self::TimestampTz),
            _ => None,
        }
    }

    /// Map a key value into the integer domain
    pub fn to_domain(&self, value: &Value) -> Option<i64> {
        match (self, value) {
            (Self::Integer, Value::Int8(n)) => Some(i64::from(*n)),
            (Self::Integer, Value::Int16(n)) => Some(i64::from(*n)),
            (Self::Integer, Value::Int32(n)) => Some(i64::from(*n)),
            (Self::Integer, Value::Int64(n)) => Some(*n),
            (Self::Date, Value::Date(d)) => Some((*d - unix_epoch_date()).num_days()),
            (Self::Timestamp, Value::DateTime(ts)) => Some(ts.and_utc().timestamp_micros()),
            (Self::TimestampTz, Value::DateTimeTz(ts)) => Some(ts.timestamp_micros()),
            _ => None,
        }
    }

    /// Map a domain value back to a query parameter, `None` when the value
    /// falls outside the representable range of the kind
    pub fn to_value(&self, domain: i64) -> Option<Value> {
        match self {
            Self::Integer => Some(Value::Int64(domain)),
            Self::Date => unix_epoch_date()
                .checked_add_signed(chrono::Duration::try_days(domain)?)
                .map(Value::Date),
            Self::Timestamp => DateTime::<Utc>::from_timestamp_micros(domain)
                .map(|ts| Value::DateTime(ts.naive_utc())),
            Self::TimestampTz => {
                DateTime::<Utc>::from_timestamp_micros(domain).map(Value::DateTimeTz)
            }
        }
    }
}

/// Portion of the base result set a split covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitBounds {
    /// Rows with `lower <= key < upper` in the key's integer domain.
    /// `upper == i64::MAX` is unbounded. The first and last ranges of a plan
    /// with explicit bounds are open towards the outside so that keys beyond
    /// the bounds are still read.
    KeyRange {
        /// Partition column
        column: String,
        /// Key domain
        kind: KeyKind,
        /// Inclusive lower bound
        lower: i64,
        /// Exclusive upper bound
        upper: i64,
        /// Also covers every key below `lower`
        #[serde(default)]
        open_lower: bool,
        /// Also covers every key at or above `upper`
        #[serde(default)]
        open_upper: bool,
        /// Rows with key `lower` already read by the split this one was
        /// re-split from
        #[serde(default)]
        skip_at_lower: u64,
    },
    /// `limit` rows starting at `offset` in `order_by` order; `None` reads
    /// to the end
    OffsetWindow {
        /// ORDER BY list
        order_by: String,
        /// First row offset
        offset: u64,
        /// Row limit
        limit: Option<u64>,
    },
    /// Rows whose partition key is NULL
    NullKeys {
        /// Partition column
        column: String,
    },
    /// The whole base query
    Whole,
}

/// An immutable, independently executable piece of a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    id: SplitId,
    parent: Option<SplitId>,
    bounds: SplitBounds,
    size_estimate: Option<u64>,
    subdividable: bool,
}

impl Split {
    /// Split id
    pub fn id(&self) -> SplitId {
        self.id
    }

    /// Ordinal within the query
    pub fn ordinal(&self) -> u64 {
        self.id.ordinal
    }

    /// Parent split, for children of a re-split
    pub fn parent(&self) -> Option<SplitId> {
        self.parent
    }

    /// Covered rows
    pub fn bounds(&self) -> &SplitBounds {
        &self.bounds
    }

    /// Estimated row count
    pub fn size_estimate(&self) -> Option<u64> {
        self.size_estimate
    }

    /// Whether the split may be re-split
    pub fn is_subdividable(&self) -> bool {
        self.subdividable
    }

    /// Render the bounded sub-query for this split, resumed after
    /// `checkpoint` when given.
    pub fn to_query(
        &self,
        dialect: &dyn SqlDialect,
        base_sql: &str,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(String, Vec<Value>)> {
        let mut params = Vec::new();
        let sql = self.render(dialect, base_sql, checkpoint, &mut |value| {
            params.push(value);
            Ok(dialect.placeholder(params.len()))
        })?;
        Ok((sql, params))
    }

    /// Render the sub-query as a standalone statement with bound values
    /// inlined as literals
    pub fn to_literal_query(&self, dialect: &dyn SqlDialect, base_sql: &str) -> Result<String> {
        self.render(dialect, base_sql, None, &mut |value| dialect.literal(&value))
    }

    fn render(
        &self,
        dialect: &dyn SqlDialect,
        base_sql: &str,
        checkpoint: Option<&Checkpoint>,
        bind: &mut dyn FnMut(Value) -> Result<String>,
    ) -> Result<String> {
        if let Some(cp) = checkpoint {
            if cp.split_id != self.id {
                return Err(Error::split(format!(
                    "checkpoint for split {} does not belong to split {}",
                    cp.split_id, self.id
                )));
            }
        }

        let from = dialect.wrap_subquery(base_sql, SPLIT_ALIAS);
        let sql = match &self.bounds {
            SplitBounds::KeyRange {
                column,
                kind,
                lower,
                upper,
                open_lower,
                open_upper,
                ..
            } => {
                let col = dialect.quote_identifier(column);
                // Resume at the last key itself; the reader skips the rows
                // of that key it already emitted.
                let start = match checkpoint.and_then(|cp| cp.last_key) {
                    Some(last) => Some(last),
                    None if *open_lower => None,
                    None => Some(*lower),
                };

                let mut predicates = Vec::with_capacity(2);
                if let Some(start) = start {
                    match kind.to_value(start) {
                        Some(value) => predicates.push(format!("{} >= {}", col, bind(value)?)),
                        // Outside the key domain: nothing to read.
                        None => predicates.push("1 = 0".to_string()),
                    }
                }
                if !*open_upper && *upper != i64::MAX {
                    if let Some(value) = kind.to_value(*upper) {
                        predicates.push(format!("{} < {}", col, bind(value)?));
                    }
                }

                if predicates.is_empty() {
                    format!("SELECT * FROM {} ORDER BY {} ASC", from, col)
                } else {
                    format!(
                        "SELECT * FROM {} WHERE {} ORDER BY {} ASC",
                        from,
                        predicates.join(" AND "),
                        col
                    )
                }
            }
            SplitBounds::NullKeys { column } => format!(
                "SELECT * FROM {} WHERE {} IS NULL",
                from,
                dialect.quote_identifier(column)
            ),
            SplitBounds::OffsetWindow {
                order_by,
                offset,
                limit,
            } => {
                let skipped = checkpoint.map_or(0, |cp| cp.rows_emitted);
                let offset = offset + skipped;
                let limit = limit.map(|l| l.saturating_sub(skipped));
                format!(
                    "SELECT * FROM {} ORDER BY {}{}",
                    from,
                    render_order_by(dialect, order_by),
                    dialect.limit_offset_sql(limit, Some(offset))
                )
            }
            SplitBounds::Whole => strip_statement(base_sql).to_string(),
        };
        Ok(sql)
    }
}

/// Quote each column of a validated ORDER BY list
pub fn render_order_by(dialect: &dyn SqlDialect, order_by: &str) -> String {
    order_by
        .split(',')
        .map(|term| {
            let mut parts = term.split_whitespace();
            let column = parts.next().unwrap_or_default();
            match parts.next() {
                Some(dir) => format!(
                    "{} {}",
                    dialect.quote_identifier(column),
                    dir.to_ascii_uppercase()
                ),
                None => dialect.quote_identifier(column),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lifecycle of a split inside its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitState {
    /// Planned, not yet read
    Pending,
    /// Being read
    Active,
    /// Fully read
    Completed,
    /// Retired by a re-split; its children cover the remainder
    Replaced,
    /// Failed permanently
    Failed,
}

impl SplitState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Replaced | Self::Failed)
    }
}

/// Append-only store of a query's splits; ordinals are arena indices
#[derive(Debug)]
pub struct SplitArena {
    query: Uuid,
    entries: Vec<(Arc<Split>, SplitState)>,
}

impl SplitArena {
    /// Empty arena for `query`
    pub fn new(query: Uuid) -> Self {
        Self {
            query,
            entries: Vec::new(),
        }
    }

    /// Query id
    pub fn query(&self) -> Uuid {
        self.query
    }

    /// Ordinal the next split will receive
    pub fn next_ordinal(&self) -> u64 {
        self.entries.len() as u64
    }

    fn alloc(
        &mut self,
        parent: Option<SplitId>,
        bounds: SplitBounds,
        size_estimate: Option<u64>,
        subdividable: bool,
    ) -> Arc<Split> {
        let split = Arc::new(Split {
            id: SplitId::new(self.query, self.next_ordinal()),
            parent,
            bounds,
            size_estimate,
            subdividable,
        });
        self.entries.push((Arc::clone(&split), SplitState::Pending));
        split
    }

    fn index(&self, id: SplitId) -> Result<usize> {
        if id.query != self.query || id.ordinal >= self.next_ordinal() {
            return Err(Error::split(format!("unknown split {}", id)));
        }
        Ok(id.ordinal as usize)
    }

    /// Look up a split
    pub fn get(&self, id: SplitId) -> Result<Arc<Split>> {
        let idx = self.index(id)?;
        Ok(Arc::clone(&self.entries[idx].0))
    }

    /// Current state of a split
    pub fn state(&self, id: SplitId) -> Result<SplitState> {
        let idx = self.index(id)?;
        Ok(self.entries[idx].1)
    }

    /// Move a split to a new state; terminal states are final
    pub fn set_state(&mut self, id: SplitId, state: SplitState) -> Result<()> {
        let idx = self.index(id)?;
        let current = self.entries[idx].1;
        if current.is_terminal() && current != state {
            return Err(Error::split(format!(
                "split {} is already {:?}",
                id, current
            )));
        }
        self.entries[idx].1 = state;
        Ok(())
    }

    /// All splits in ordinal order
    pub fn splits(&self) -> impl Iterator<Item = (&Arc<Split>, SplitState)> {
        self.entries.iter().map(|(s, st)| (s, *st))
    }

    /// Splits that still cover rows (everything not replaced)
    pub fn live(&self) -> Vec<Arc<Split>> {
        self.entries
            .iter()
            .filter(|(_, st)| *st != SplitState::Replaced)
            .map(|(s, _)| Arc::clone(s))
            .collect()
    }

    /// Number of splits ever allocated
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no split was allocated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a / b + u64::from(a % b != 0)
    }
}

/// Plans splits and re-splits remainders
#[derive(Debug, Clone)]
pub struct Splitter {
    target_split_size: u64,
}

impl Splitter {
    /// Splitter aiming at `target_split_size` rows per split
    pub fn new(target_split_size: u64) -> Self {
        Self {
            target_split_size: target_split_size.max(1),
        }
    }

    /// Target rows per split
    pub fn target_split_size(&self) -> u64 {
        self.target_split_size
    }

    /// Plan the initial splits of `query` into `arena`
    pub fn plan(
        &self,
        arena: &mut SplitArena,
        query: &QueryDescriptor,
        estimate: &RangeEstimate,
    ) -> Result<Vec<Arc<Split>>> {
        if !arena.is_empty() {
            return Err(Error::split(format!(
                "query {} already has a plan",
                arena.query()
            )));
        }

        let splits = match estimate.row_count {
            Some(0) => vec![arena.alloc(None, SplitBounds::Whole, Some(0), false)],
            None => vec![arena.alloc(None, SplitBounds::Whole, None, false)],
            Some(rows) => self.plan_rows(arena, query, estimate, rows),
        };

        info!(
            query_id = %arena.query(),
            splits = splits.len(),
            row_count = ?estimate.row_count,
            "Planned query splits"
        );
        Ok(splits)
    }

    fn desired_count(&self, query: &QueryDescriptor, rows: u64) -> u64 {
        query
            .num_partitions()
            .map(u64::from)
            .unwrap_or_else(|| div_ceil(rows, self.target_split_size))
            .max(1)
    }

    fn plan_rows(
        &self,
        arena: &mut SplitArena,
        query: &QueryDescriptor,
        estimate: &RangeEstimate,
        rows: u64,
    ) -> Vec<Arc<Split>> {
        if let Some(key) = &estimate.key {
            if let (Some(kind), Some(min), Some(max)) = (key.kind, key.min, key.max) {
                let non_null = rows.saturating_sub(key.null_count);
                let lower = min;
                let upper = max.saturating_add(1);
                let n = self.desired_count(query, non_null);

                let cuts = match query.strategy() {
                    BoundStrategy::Percentile if !estimate.boundaries.is_empty() => {
                        percentile_cuts(lower, upper, &estimate.boundaries, n)
                    }
                    _ => equal_width_cuts(lower, upper, n),
                };

                // Explicit bounds only place the cuts.
                let open = query.bounds().is_some();
                let mut splits = Vec::with_capacity(cuts.len() + 1);
                let total_width = width(lower, upper);
                let ranges = cuts.len().saturating_sub(1) as u64;
                let mut assigned = 0u64;
                for (i, pair) in cuts.windows(2).enumerate() {
                    let (lo, hi) = (pair[0], pair[1]);
                    let size = if i as u64 + 1 == ranges {
                        non_null - assigned
                    } else if matches!(query.strategy(), BoundStrategy::Percentile)
                        && !estimate.boundaries.is_empty()
                    {
                        non_null / ranges
                    } else {
                        proportional(non_null, width(lo, hi), total_width)
                    };
                    assigned += size;
                    splits.push(arena.alloc(
                        None,
                        SplitBounds::KeyRange {
                            column: key.column.clone(),
                            kind,
                            lower: lo,
                            upper: hi,
                            open_lower: open && i == 0,
                            open_upper: open && i as u64 + 1 == ranges,
                            skip_at_lower: 0,
                        },
                        Some(size),
                        width(lo, hi) > 1,
                    ));
                }
                if key.null_count > 0 {
                    splits.push(arena.alloc(
                        None,
                        SplitBounds::NullKeys {
                            column: key.column.clone(),
                        },
                        Some(key.null_count),
                        false,
                    ));
                }
                return splits;
            }

            if key.kind.is_none() && key.min.is_none() && key.null_count >= rows {
                // Every key is NULL.
                return vec![arena.alloc(
                    None,
                    SplitBounds::NullKeys {
                        column: key.column.clone(),
                    },
                    Some(rows),
                    false,
                )];
            }

            return self.plan_windows(arena, query, key.column.clone(), rows);
        }

        match query.order_by() {
            Some(order_by) => self.plan_windows(arena, query, order_by.to_string(), rows),
            None => vec![arena.alloc(None, SplitBounds::Whole, Some(rows), false)],
        }
    }

    fn plan_windows(
        &self,
        arena: &mut SplitArena,
        query: &QueryDescriptor,
        order_by: String,
        rows: u64,
    ) -> Vec<Arc<Split>> {
        let n = self.desired_count(query, rows).min(rows.max(1));
        let per = div_ceil(rows, n).max(1);
        let count = div_ceil(rows, per).max(1);

        (0..count)
            .map(|i| {
                let offset = i * per;
                let last = i + 1 == count;
                arena.alloc(
                    None,
                    SplitBounds::OffsetWindow {
                        order_by: order_by.clone(),
                        offset,
                        limit: if last { None } else { Some(per) },
                    },
                    Some(if last { rows - offset } else { per }),
                    true,
                )
            })
            .collect()
    }

    /// Re-split the unconsumed remainder of `split_id` into up to `desired`
    /// children. The parent is marked replaced.
    pub fn resplit(
        &self,
        arena: &mut SplitArena,
        split_id: SplitId,
        checkpoint: &Checkpoint,
        desired: u32,
    ) -> Result<Vec<Arc<Split>>> {
        let split = arena.get(split_id)?;
        let state = arena.state(split_id)?;
        if state.is_terminal() {
            return Err(Error::split(format!(
                "split {} is {:?} and cannot be re-split",
                split_id, state
            )));
        }
        if !split.subdividable {
            return Err(Error::split(format!(
                "split {} is not subdividable",
                split_id
            )));
        }
        if checkpoint.split_id != split_id {
            return Err(Error::split(format!(
                "checkpoint for split {} does not belong to split {}",
                checkpoint.split_id, split_id
            )));
        }
        let desired = u64::from(desired.max(1));

        let children: Vec<(SplitBounds, Option<u64>, bool)> = match &split.bounds {
            SplitBounds::KeyRange {
                column,
                kind,
                lower,
                upper,
                open_lower,
                open_upper,
                skip_at_lower,
            } => {
                // The remainder starts at the last emitted key, minus the
                // rows of that key already read.
                let (start, skip) = match checkpoint.last_key {
                    Some(last) if last == *lower => {
                        (last, skip_at_lower + checkpoint.emitted_at_last_key)
                    }
                    Some(last) => (last, checkpoint.emitted_at_last_key),
                    None => (*lower, *skip_at_lower),
                };
                // A single key cannot be divided further.
                if width(start, *upper) <= 1 {
                    return Err(consumed(split_id));
                }
                let keep_open_lower = *open_lower && checkpoint.last_key.is_none();
                let remaining = split
                    .size_estimate
                    .map(|s| s.saturating_sub(checkpoint.rows_emitted));
                let total = width(start, *upper);
                let cuts = equal_width_cuts(start, *upper, desired);
                let pieces = cuts.len() as u64 - 1;
                let mut assigned = 0u64;
                cuts.windows(2)
                    .enumerate()
                    .map(|(i, pair)| {
                        let first = i == 0;
                        let last = i as u64 + 1 == pieces;
                        let size = remaining.map(|r| {
                            if last {
                                r.saturating_sub(assigned)
                            } else {
                                let s = proportional(r, width(pair[0], pair[1]), total);
                                assigned += s;
                                s
                            }
                        });
                        (
                            SplitBounds::KeyRange {
                                column: column.clone(),
                                kind: *kind,
                                lower: pair[0],
                                upper: pair[1],
                                open_lower: first && keep_open_lower,
                                open_upper: last && *open_upper,
                                skip_at_lower: if first { skip } else { 0 },
                            },
                            size,
                            width(pair[0], pair[1]) > 1,
                        )
                    })
                    .collect()
            }
            SplitBounds::OffsetWindow {
                order_by,
                offset,
                limit,
            } => {
                let start = offset + checkpoint.rows_emitted;
                let window = |offset: u64, limit: Option<u64>, size: Option<u64>| {
                    (
                        SplitBounds::OffsetWindow {
                            order_by: order_by.clone(),
                            offset,
                            limit,
                        },
                        size,
                        true,
                    )
                };
                match limit {
                    Some(limit) => {
                        let remaining = limit.saturating_sub(checkpoint.rows_emitted);
                        if remaining == 0 {
                            return Err(consumed(split_id));
                        }
                        let n = desired.min(remaining);
                        let per = div_ceil(remaining, n);
                        let count = div_ceil(remaining, per);
                        (0..count)
                            .map(|i| {
                                let len = per.min(remaining - i * per);
                                window(start + i * per, Some(len), Some(len))
                            })
                            .collect()
                    }
                    None => {
                        let remaining = split
                            .size_estimate
                            .map_or(0, |s| s.saturating_sub(checkpoint.rows_emitted));
                        let per = div_ceil(remaining, desired);
                        if desired == 1 || per == 0 {
                            vec![window(start, None, Some(remaining))]
                        } else {
                            let bounded = desired - 1;
                            let mut children: Vec<_> = (0..bounded)
                                .map(|i| window(start + i * per, Some(per), Some(per)))
                                .collect();
                            let tail = remaining.saturating_sub(bounded * per);
                            children.push(window(start + bounded * per, None, Some(tail)));
                            children
                        }
                    }
                }
            }
            SplitBounds::NullKeys { .. } | SplitBounds::Whole => {
                return Err(Error::split(format!(
                    "split {} is not subdividable",
                    split_id
                )))
            }
        };

        arena.set_state(split_id, SplitState::Replaced)?;
        let children: Vec<_> = children
            .into_iter()
            .map(|(bounds, size, subdividable)| {
                arena.alloc(Some(split_id), bounds, size, subdividable)
            })
            .collect();

        debug!(
            split_id = %split_id,
            children = children.len(),
            rows_emitted = checkpoint.rows_emitted,
            "Re-split remainder"
        );
        Ok(children)
    }
}

fn consumed(split_id: SplitId) -> Error {
    Error::split(format!("split {} has no remainder left to divide", split_id))
}

fn width(lower: i64, upper: i64) -> u64 {
    (i128::from(upper) - i128::from(lower)).clamp(0, i128::from(u64::MAX)) as u64
}

fn proportional(rows: u64, part: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (u128::from(rows) * u128::from(part) / u128::from(total)) as u64
}

/// Boundaries `lower = c0 < c1 < ... < cn = upper` of `min(n, width)`
/// equal-width ranges; the last range absorbs the remainder.
fn equal_width_cuts(lower: i64, upper: i64, n: u64) -> Vec<i64> {
    let total = width(lower, upper);
    let n = n.clamp(1, total.max(1));
    let chunk = total / n;
    let mut cuts = Vec::with_capacity(n as usize + 1);
    for i in 0..n {
        cuts.push((i128::from(lower) + i128::from(i) * i128::from(chunk)) as i64);
    }
    cuts.push(upper);
    cuts
}

fn percentile_cuts(lower: i64, upper: i64, boundaries: &[i64], n: u64) -> Vec<i64> {
    let mut inner: Vec<i64> = boundaries
        .iter()
        .copied()
        .filter(|b| *b > lower && *b < upper)
        .collect();
    inner.sort_unstable();
    inner.dedup();
    if inner.is_empty() {
        return equal_width_cuts(lower, upper, n);
    }
    let mut cuts = Vec::with_capacity(inner.len() + 2);
    cuts.push(lower);
    cuts.extend(inner);
    cuts.push(upper);
    cuts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, PostgresDialect};
    use crate::estimator::KeyStats;

    fn int_estimate(rows: u64, min: i64, max: i64, nulls: u64) -> RangeEstimate {
        RangeEstimate {
            row_count: Some(rows),
            key: Some(KeyStats {
                column: "id".into(),
                kind: Some(KeyKind::Integer),
                min: Some(min),
                max: Some(max),
                null_count: nulls,
            }),
            boundaries: Vec::new(),
        }
    }

    fn ranges(splits: &[Arc<Split>]) -> Vec<(i64, i64)> {
        splits
            .iter()
            .filter_map(|s| match s.bounds() {
                SplitBounds::KeyRange { lower, upper, .. } => Some((*lower, *upper)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_split_id_round_trip() {
        let id = SplitId::new(Uuid::from_u128(7), 42);
        let text = id.to_string();
        assert!(text.ends_with("/42"));
        assert_eq!(text.parse::<SplitId>().unwrap(), id);
        assert!("nope".parse::<SplitId>().is_err());
        assert!("00000000-0000-0000-0000-000000000007/x".parse::<SplitId>().is_err());
    }

    #[test]
    fn test_key_kind_domains() {
        let day = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        assert_eq!(KeyKind::of_value(&Value::Date(day)), Some(KeyKind::Date));
        assert_eq!(KeyKind::Date.to_domain(&Value::Date(day)), Some(10));
        assert_eq!(KeyKind::Date.to_value(10), Some(Value::Date(day)));

        let ts = day.and_hms_opt(0, 0, 1).unwrap();
        let micros = KeyKind::Timestamp.to_domain(&Value::DateTime(ts)).unwrap();
        assert_eq!(micros, 10 * 86_400_000_000 + 1_000_000);
        assert_eq!(KeyKind::Timestamp.to_value(micros), Some(Value::DateTime(ts)));

        assert_eq!(KeyKind::of_value(&Value::from("x")), None);
        assert_eq!(KeyKind::of_value(&Value::Float64(1.0)), None);
        assert_eq!(KeyKind::Date.to_value(i64::MAX), None);
    }

    #[test]
    fn test_plan_equal_width() {
        let query = QueryDescriptor::sql("SELECT * FROM items").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(250)
            .plan(&mut arena, &query, &int_estimate(1000, 0, 999, 0))
            .unwrap();
        assert_eq!(
            ranges(&splits),
            vec![(0, 250), (250, 500), (500, 750), (750, 1000)]
        );
        let total: u64 = splits.iter().filter_map(|s| s.size_estimate()).sum();
        assert_eq!(total, 1000);
        assert_eq!(
            splits.iter().map(|s| s.ordinal()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_plan_last_range_absorbs_remainder() {
        let query = QueryDescriptor::sql("SELECT * FROM t")
            .with_partition_column("id")
            .with_num_partitions(3);
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(1)
            .plan(&mut arena, &query, &int_estimate(10, 0, 9, 0))
            .unwrap();
        assert_eq!(ranges(&splits), vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn test_plan_clamps_to_key_width() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(1)
            .plan(&mut arena, &query, &int_estimate(100, 5, 6, 0))
            .unwrap();
        assert_eq!(ranges(&splits), vec![(5, 6), (6, 7)]);
        assert!(splits.iter().all(|s| !s.is_subdividable()));
    }

    #[test]
    fn test_plan_adds_null_split() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(50)
            .plan(&mut arena, &query, &int_estimate(110, 0, 99, 10))
            .unwrap();
        let last = splits.last().unwrap();
        assert_eq!(
            last.bounds(),
            &SplitBounds::NullKeys {
                column: "id".into()
            }
        );
        assert_eq!(last.size_estimate(), Some(10));
        assert!(!last.is_subdividable());
    }

    #[test]
    fn test_plan_zero_and_unknown_rows() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(10)
            .plan(&mut arena, &query, &int_estimate(0, 0, 0, 0))
            .unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].bounds(), &SplitBounds::Whole);
        assert_eq!(splits[0].size_estimate(), Some(0));

        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(10)
            .plan(&mut arena, &query, &RangeEstimate::unknown())
            .unwrap();
        assert_eq!(splits.len(), 1);
        assert!(!splits[0].is_subdividable());
    }

    #[test]
    fn test_plan_aggregate_query_is_whole() {
        let query = QueryDescriptor::sql("SELECT COUNT(*) FROM t");
        let mut arena = SplitArena::new(query.id());
        let estimate = RangeEstimate {
            row_count: Some(1),
            key: None,
            boundaries: Vec::new(),
        };
        let splits = Splitter::new(10).plan(&mut arena, &query, &estimate).unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].bounds(), &SplitBounds::Whole);
    }

    #[test]
    fn test_plan_offset_windows() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_order_by("name");
        let mut arena = SplitArena::new(query.id());
        let estimate = RangeEstimate {
            row_count: Some(25),
            key: None,
            boundaries: Vec::new(),
        };
        let splits = Splitter::new(10).plan(&mut arena, &query, &estimate).unwrap();
        let windows: Vec<_> = splits
            .iter()
            .map(|s| match s.bounds() {
                SplitBounds::OffsetWindow { offset, limit, .. } => (*offset, *limit),
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(windows, vec![(0, Some(9)), (9, Some(9)), (18, None)]);
    }

    #[test]
    fn test_plan_percentile() {
        let query = QueryDescriptor::sql("SELECT * FROM t")
            .with_partition_column("id")
            .with_strategy(BoundStrategy::Percentile);
        let mut arena = SplitArena::new(query.id());
        let mut estimate = int_estimate(100, 0, 999, 0);
        estimate.boundaries = vec![10, 10, 20, 900];
        let splits = Splitter::new(25).plan(&mut arena, &query, &estimate).unwrap();
        assert_eq!(
            ranges(&splits),
            vec![(0, 10), (10, 20), (20, 900), (900, 1000)]
        );
    }

    #[test]
    fn test_plan_twice_is_rejected() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splitter = Splitter::new(10);
        splitter
            .plan(&mut arena, &query, &int_estimate(10, 0, 9, 0))
            .unwrap();
        assert!(splitter
            .plan(&mut arena, &query, &int_estimate(10, 0, 9, 0))
            .is_err());
    }

    #[test]
    fn test_resplit_key_range_remainder() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splitter = Splitter::new(250);
        let splits = splitter
            .plan(&mut arena, &query, &int_estimate(1000, 0, 999, 0))
            .unwrap();
        let target = splits[2].id();

        let mut cp = Checkpoint::new(target);
        cp.last_key = Some(600);
        cp.emitted_at_last_key = 2;
        cp.rows_emitted = 101;
        let children = splitter.resplit(&mut arena, target, &cp, 3).unwrap();

        assert_eq!(ranges(&children), vec![(600, 650), (650, 700), (700, 750)]);
        let skips: Vec<u64> = children
            .iter()
            .map(|c| match c.bounds() {
                SplitBounds::KeyRange { skip_at_lower, .. } => *skip_at_lower,
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(skips, vec![2, 0, 0]);
        assert!(children.iter().all(|c| c.parent() == Some(target)));
        assert_eq!(
            children.iter().map(|c| c.ordinal()).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
        assert_eq!(arena.state(target).unwrap(), SplitState::Replaced);
        assert!(splitter.resplit(&mut arena, target, &cp, 2).is_err());
    }

    #[test]
    fn test_plan_with_bounds_opens_outer_ranges() {
        let query = QueryDescriptor::sql("SELECT * FROM t")
            .with_partition_column("id")
            .with_bounds(100_i64, 499_i64)
            .with_num_partitions(4);
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(1)
            .plan(&mut arena, &query, &int_estimate(1000, 100, 499, 0))
            .unwrap();
        assert_eq!(
            ranges(&splits),
            vec![(100, 200), (200, 300), (300, 400), (400, 500)]
        );
        let open: Vec<(bool, bool)> = splits
            .iter()
            .map(|s| match s.bounds() {
                SplitBounds::KeyRange {
                    open_lower,
                    open_upper,
                    ..
                } => (*open_lower, *open_upper),
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(
            open,
            vec![(true, false), (false, false), (false, false), (false, true)]
        );

        let sql: Vec<String> = splits
            .iter()
            .map(|s| s.to_literal_query(&PostgresDialect, "SELECT * FROM t").unwrap())
            .collect();
        assert_eq!(
            sql[0],
            "SELECT * FROM (SELECT * FROM t) AS sqlio_split WHERE \"id\" < 200 ORDER BY \"id\" ASC"
        );
        assert_eq!(
            sql[3],
            "SELECT * FROM (SELECT * FROM t) AS sqlio_split WHERE \"id\" >= 400 ORDER BY \"id\" ASC"
        );

        // a checkpoint below the bounds still resumes at its key
        let mut cp = Checkpoint::new(splits[0].id());
        cp.advance_key(-7).unwrap();
        let (_, params) = splits[0]
            .to_query(&PostgresDialect, "SELECT * FROM t", Some(&cp))
            .unwrap();
        assert_eq!(params, vec![Value::Int64(-7), Value::Int64(200)]);
    }

    #[test]
    fn test_resplit_keeps_open_ends() {
        let query = QueryDescriptor::sql("SELECT * FROM t")
            .with_partition_column("id")
            .with_bounds(0_i64, 99_i64)
            .with_num_partitions(1);
        let mut arena = SplitArena::new(query.id());
        let splitter = Splitter::new(1);
        let splits = splitter
            .plan(&mut arena, &query, &int_estimate(100, 0, 99, 0))
            .unwrap();
        let cp = Checkpoint::new(splits[0].id());
        let children = splitter.resplit(&mut arena, splits[0].id(), &cp, 2).unwrap();

        assert_eq!(ranges(&children), vec![(0, 50), (50, 100)]);
        let open: Vec<(bool, bool)> = children
            .iter()
            .map(|s| match s.bounds() {
                SplitBounds::KeyRange {
                    open_lower,
                    open_upper,
                    ..
                } => (*open_lower, *open_upper),
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(open, vec![(true, false), (false, true)]);
    }

    #[test]
    fn test_resplit_rejects_consumed_and_whole() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splitter = Splitter::new(10);
        let splits = splitter
            .plan(&mut arena, &query, &int_estimate(10, 0, 9, 0))
            .unwrap();
        let mut cp = Checkpoint::new(splits[0].id());
        cp.last_key = Some(9);
        assert!(splitter.resplit(&mut arena, splits[0].id(), &cp, 2).is_err());

        let mut arena = SplitArena::new(query.id());
        let whole = splitter
            .plan(&mut arena, &query, &RangeEstimate::unknown())
            .unwrap();
        let cp = Checkpoint::new(whole[0].id());
        let err = splitter.resplit(&mut arena, whole[0].id(), &cp, 2).unwrap_err();
        assert!(err.to_string().contains("not subdividable"));
    }

    #[test]
    fn test_resplit_offset_windows() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_order_by("id");
        let mut arena = SplitArena::new(query.id());
        let splitter = Splitter::new(100);
        let estimate = RangeEstimate {
            row_count: Some(300),
            key: None,
            boundaries: Vec::new(),
        };
        let splits = splitter.plan(&mut arena, &query, &estimate).unwrap();
        let mut cp = Checkpoint::new(splits[0].id());
        cp.rows_emitted = 40;
        let children = splitter.resplit(&mut arena, splits[0].id(), &cp, 2).unwrap();
        let windows: Vec<_> = children
            .iter()
            .map(|s| match s.bounds() {
                SplitBounds::OffsetWindow { offset, limit, .. } => (*offset, *limit),
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(windows, vec![(40, Some(30)), (70, Some(30))]);

        // open tail window: bounded pieces plus a new open tail
        let tail = splits[2].id();
        let mut cp = Checkpoint::new(tail);
        cp.rows_emitted = 10;
        let children = splitter.resplit(&mut arena, tail, &cp, 3).unwrap();
        let windows: Vec<_> = children
            .iter()
            .map(|s| match s.bounds() {
                SplitBounds::OffsetWindow { offset, limit, .. } => (*offset, *limit),
                other => panic!("unexpected bounds {:?}", other),
            })
            .collect();
        assert_eq!(windows, vec![(210, Some(30)), (240, Some(30)), (270, None)]);
    }

    #[test]
    fn test_to_query_key_range() {
        let query = QueryDescriptor::sql("SELECT * FROM items;").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(250)
            .plan(&mut arena, &query, &int_estimate(1000, 0, 999, 0))
            .unwrap();

        let (sql, params) = splits[1]
            .to_query(&PostgresDialect, "SELECT * FROM items;", None)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT * FROM items) AS sqlio_split WHERE \"id\" >= $1 AND \"id\" < $2 ORDER BY \"id\" ASC"
        );
        assert_eq!(params, vec![Value::Int64(250), Value::Int64(500)]);

        let mut cp = Checkpoint::new(splits[1].id());
        cp.last_key = Some(300);
        let (_, params) = splits[1]
            .to_query(&PostgresDialect, "SELECT * FROM items", Some(&cp))
            .unwrap();
        assert_eq!(params, vec![Value::Int64(300), Value::Int64(500)]);

        let foreign = Checkpoint::new(splits[0].id());
        assert!(splits[1]
            .to_query(&PostgresDialect, "SELECT * FROM items", Some(&foreign))
            .is_err());
    }

    #[test]
    fn test_to_query_null_window_and_whole() {
        let null_split = Split {
            id: SplitId::new(Uuid::nil(), 0),
            parent: None,
            bounds: SplitBounds::NullKeys {
                column: "id".into(),
            },
            size_estimate: None,
            subdividable: false,
        };
        let (sql, params) = null_split.to_query(&PostgresDialect, "SELECT * FROM t", None).unwrap();
        assert!(sql.ends_with("WHERE \"id\" IS NULL"));
        assert!(params.is_empty());

        let window = Split {
            bounds: SplitBounds::OffsetWindow {
                order_by: "name desc, id".into(),
                offset: 20,
                limit: Some(10),
            },
            ..null_split.clone()
        };
        let mut cp = Checkpoint::new(window.id());
        cp.rows_emitted = 4;
        let (sql, _) = window.to_query(&MySqlDialect, "SELECT * FROM t", Some(&cp)).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT * FROM t) AS sqlio_split ORDER BY `name` DESC, `id` LIMIT 6 OFFSET 24"
        );

        let whole = Split {
            bounds: SplitBounds::Whole,
            ..null_split
        };
        let (sql, _) = whole.to_query(&PostgresDialect, " SELECT 1; ", None).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_to_literal_query() {
        let query = QueryDescriptor::sql("SELECT * FROM t").with_partition_column("id");
        let mut arena = SplitArena::new(query.id());
        let splits = Splitter::new(5)
            .plan(&mut arena, &query, &int_estimate(10, 0, 9, 0))
            .unwrap();
        let sql = splits[0]
            .to_literal_query(&PostgresDialect, "SELECT * FROM t")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT * FROM t) AS sqlio_split WHERE \"id\" >= 0 AND \"id\" < 5 ORDER BY \"id\" ASC"
        );
    }
}
