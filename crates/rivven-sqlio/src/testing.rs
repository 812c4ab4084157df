//! In-memory database for tests
//!
//! [`MemoryDatabase`] implements the connection traits over plain tables
//! held in memory. It understands the statement shapes this crate generates
//! with [`PostgresDialect`](crate::dialect::PostgresDialect): bounded split
//! queries over a derived table, range estimates, schema samples and
//! `INSERT ... ON CONFLICT` upserts. Transactions are buffered and applied
//! atomically on commit.
//!
//! Faults can be injected to exercise retry paths: failing commits, broken
//! result streams, failing queries, slow queries and stale connections.
//!
//! ```rust,ignore
//! use rivven_sqlio::testing::MemoryDatabase;
//!
//! let db = MemoryDatabase::new();
//! db.create_table("items", &["id", "name"]);
//! db.insert_rows("items", (0..100).map(|i| vec![Value::Int64(i), Value::from("x")]));
//! db.fail_commit(2);
//! let pool = db.pool(4)?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, RowStream, Transaction,
};
use crate::dialect::strip_statement;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::types::{Row, Value};

/// Operation counters of a [`MemoryDatabase`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbCounters {
    /// Connections opened
    pub connections_opened: u64,
    /// Queries run (including streamed ones)
    pub queries: u64,
    /// Result streams opened
    pub streams_opened: u64,
    /// Commit attempts
    pub commit_attempts: u64,
    /// Successful commits
    pub commits: u64,
    /// Rollbacks
    pub rollbacks: u64,
    /// Statements applied to tables
    pub statements: u64,
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", name)))
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: HashSet<u64>,
    reject_commits: bool,
    failing_queries: u32,
    break_stream_after: Option<u64>,
    query_delay: Option<Duration>,
    stale_statistics: bool,
}

#[derive(Debug, Default)]
struct DbState {
    tables: HashMap<String, Table>,
    faults: Faults,
    counters: DbCounters,
    epoch: u64,
}

impl DbState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::query(format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::query(format!("relation \"{}\" does not exist", name)))
    }
}

/// Shared in-memory database; clones see the same tables
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MemoryDatabase {
    /// Empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        self.state.lock().tables.insert(
            name.to_ascii_lowercase(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Append rows to a table, bypassing transactions
    pub fn insert_rows<I>(&self, name: &str, rows: I)
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut state = self.state.lock();
        if let Ok(table) = state.table_mut(name) {
            table.rows.extend(rows);
        }
    }

    /// Current rows of a table in insertion order
    pub fn rows(&self, name: &str) -> Vec<Row> {
        let state = self.state.lock();
        state
            .table(name)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|values| Row::new(t.columns.clone(), values.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of rows in a table
    pub fn row_count(&self, name: &str) -> usize {
        self.state.lock().table(name).map_or(0, |t| t.rows.len())
    }

    /// Make commit attempt number `n` (1-based, counted across all
    /// transactions) fail with a transient connection error
    pub fn fail_commit(&self, n: u64) {
        self.state.lock().faults.failing_commits.insert(n);
    }

    /// Make every commit fail with a constraint violation
    pub fn reject_commits(&self, reject: bool) {
        self.state.lock().faults.reject_commits = reject;
    }

    /// Make the next `n` queries fail with a transient connection error
    pub fn fail_next_queries(&self, n: u32) {
        self.state.lock().faults.failing_queries = n;
    }

    /// Break the next result stream opened after it yielded `rows` rows
    pub fn break_next_stream_after(&self, rows: u64) {
        self.state.lock().faults.break_stream_after = Some(rows);
    }

    /// Delay every query by `delay`
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state.lock().faults.query_delay = delay;
    }

    /// Report unknown table statistics, forcing `COUNT(*)` estimates
    pub fn set_stale_statistics(&self, stale: bool) {
        self.state.lock().faults.stale_statistics = stale;
    }

    /// Invalidate every open connection; later statements on them fail
    pub fn invalidate_connections(&self) {
        self.state.lock().epoch += 1;
    }

    /// Counter snapshot
    pub fn counters(&self) -> DbCounters {
        self.state.lock().counters.clone()
    }

    /// Lazy pool of at most `max_size` connections to this database
    pub fn pool(&self, max_size: usize) -> Result<ConnectionPool> {
        ConnectionPool::lazy(
            PoolConfig::new("memory://sqlio")
                .with_max_size(max_size)
                .with_acquire_timeout(Duration::from_secs(5)),
            Arc::new(self.clone()),
        )
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatabase {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let epoch = {
            let mut state = self.state.lock();
            state.counters.connections_opened += 1;
            state.epoch
        };
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            epoch,
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

struct MemoryConnection {
    state: Arc<Mutex<DbState>>,
    epoch: u64,
}

impl MemoryConnection {
    /// Apply query faults and delay before a query runs
    async fn before_query(&self) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            self.check_epoch(&state)?;
            state.counters.queries += 1;
            if state.faults.failing_queries > 0 {
                state.faults.failing_queries -= 1;
                return Err(Error::connection("injected query failure"));
            }
            state.faults.query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn check_epoch(&self, state: &DbState) -> Result<()> {
        if state.epoch != self.epoch {
            return Err(Error::connection("connection was closed by the server"));
        }
        Ok(())
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let state = self.state.lock();
        let result = select(&state, sql, params)?;
        Ok(result.into_rows())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.before_query().await?;
        self.run_query(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut state = self.state.lock();
        self.check_epoch(&state)?;
        let insert = parse_insert(sql)?;
        state.counters.statements += 1;
        apply_insert(&mut state, &insert, params)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.check_epoch(&self.state.lock())?;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            epoch: self.epoch,
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.before_query().await?;
        let rows = self.run_query(sql, params)?;
        let break_after = {
            let mut state = self.state.lock();
            state.counters.streams_opened += 1;
            state.faults.break_stream_after.take()
        };
        Ok(Box::pin(MemoryRowStream {
            rows: rows.into(),
            yielded: 0,
            break_after,
        }))
    }

    async fn is_valid(&self) -> bool {
        self.state.lock().epoch == self.epoch
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<DbState>>,
    epoch: u64,
    pending: Mutex<Vec<(InsertStatement, Vec<Value>)>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let state = self.state.lock();
        Ok(select(&state, sql, params)?.into_rows())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let insert = parse_insert(sql)?;
        self.state.lock().table(&insert.table)?;
        self.pending.lock().push((insert, params.to_vec()));
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.commit_attempts += 1;
        if state.epoch != self.epoch {
            return Err(Error::connection("connection was closed by the server"));
        }
        let attempt = state.counters.commit_attempts;
        if state.faults.failing_commits.remove(&attempt) {
            return Err(Error::connection("injected commit failure"));
        }
        if state.faults.reject_commits {
            return Err(Error::Constraint {
                constraint_name: "injected".to_string(),
                message: "commit rejected".to_string(),
            });
        }

        // apply to a copy so a failing statement leaves no partial effects
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut staged: HashMap<String, Table> = HashMap::new();
        for (insert, _) in &pending {
            let key = insert.table.to_ascii_lowercase();
            if !staged.contains_key(&key) {
                let table = state.table(&insert.table)?;
                staged.insert(
                    key,
                    Table {
                        columns: table.columns.clone(),
                        rows: table.rows.clone(),
                    },
                );
            }
        }
        let mut scratch = DbState {
            tables: staged,
            ..Default::default()
        };
        for (insert, params) in &pending {
            apply_insert(&mut scratch, insert, params)?;
        }
        for (name, table) in scratch.tables {
            state.tables.insert(name, table);
        }
        state.counters.statements += pending.len() as u64;
        state.counters.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.state.lock().counters.rollbacks += 1;
        Ok(())
    }
}

struct MemoryRowStream {
    rows: VecDeque<Row>,
    yielded: u64,
    break_after: Option<u64>,
}

impl RowStream for MemoryRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            if self.break_after.is_some_and(|n| self.yielded >= n) {
                self.break_after = None;
                return Err(Error::connection("injected stream failure"));
            }
            let row = self.rows.pop_front();
            if row.is_some() {
                self.yielded += 1;
            }
            Ok(row)
        })
    }
}

// ===========================================================================
// Statement interpreter
// ===========================================================================

struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl ResultSet {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", name)))
    }

    fn into_rows(self) -> Vec<Row> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values))
            .collect()
    }
}

fn unsupported(sql: &str) -> Error {
    Error::query_with_sql("statement not understood by the memory database", sql)
}

fn unquote(identifier: &str) -> String {
    let identifier = identifier.trim();
    match identifier
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => identifier.to_string(),
    }
}

/// Unqualified table name of a possibly schema-qualified reference
fn table_name(reference: &str) -> String {
    reference
        .rsplit('.')
        .next()
        .map(unquote)
        .unwrap_or_default()
}

/// Index of the parenthesis closing the one at `s[0]`
fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn first_of(s: &str, needles: &[&str]) -> usize {
    needles
        .iter()
        .filter_map(|n| s.find(n))
        .min()
        .unwrap_or(s.len())
}

fn is_integer(value: &Value) -> bool {
    matches!(
        value,
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_)
    )
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        _ if is_integer(a) && is_integer(b) => Some(a.as_i64()?.cmp(&b.as_i64()?)),
        (Value::Float32(_) | Value::Float64(_) | Value::Decimal(_), _)
        | (_, Value::Float32(_) | Value::Float64(_) | Value::Decimal(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::DateTimeTz(x), Value::DateTimeTz(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn operand(token: &str, params: &[Value], sql: &str) -> Result<Value> {
    if let Some(index) = token.strip_prefix('$') {
        let index: usize = index.parse().map_err(|_| unsupported(sql))?;
        return params
            .get(index.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| Error::query(format!("missing parameter ${}", index)));
    }
    if let Some(text) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::String(text.replace("''", "'")));
    }
    token
        .parse::<i64>()
        .map(Value::Int64)
        .map_err(|_| unsupported(sql))
}

enum Predicate {
    Never,
    IsNull(usize, bool),
    Compare(usize, Ordering, bool, Value),
}

impl Predicate {
    fn matches(&self, row: &[Value]) -> bool {
        match self {
            Self::Never => false,
            Self::IsNull(idx, want_null) => row[*idx].is_null() == *want_null,
            Self::Compare(idx, ord, or_equal, value) => match compare(&row[*idx], value) {
                Some(o) => o == *ord || (*or_equal && o == Ordering::Equal),
                None => false,
            },
        }
    }
}

fn parse_predicate(cond: &str, source: &ResultSet, params: &[Value], sql: &str) -> Result<Predicate> {
    let cond = cond.trim();
    if cond == "1 = 0" {
        return Ok(Predicate::Never);
    }
    if let Some(col) = cond.strip_suffix(" IS NOT NULL") {
        return Ok(Predicate::IsNull(source.column_index(&unquote(col))?, false));
    }
    if let Some(col) = cond.strip_suffix(" IS NULL") {
        return Ok(Predicate::IsNull(source.column_index(&unquote(col))?, true));
    }

    let parts: Vec<&str> = cond.splitn(3, ' ').collect();
    let [col, op, value] = parts.as_slice() else {
        return Err(unsupported(sql));
    };
    let idx = source.column_index(&unquote(col))?;
    let value = operand(value.trim(), params, sql)?;
    let (ord, or_equal) = match *op {
        ">=" => (Ordering::Greater, true),
        ">" => (Ordering::Greater, false),
        "<=" => (Ordering::Less, true),
        "<" => (Ordering::Less, false),
        "=" => (Ordering::Equal, true),
        _ => return Err(unsupported(sql)),
    };
    Ok(Predicate::Compare(idx, ord, or_equal, value))
}

fn sort_rows(rows: &mut [Vec<Value>], source: &ResultSet, order_by: &str) -> Result<()> {
    let mut keys = Vec::new();
    for term in order_by.split(',') {
        let mut parts = term.split_whitespace();
        let col = parts.next().unwrap_or_default();
        let descending = parts
            .next()
            .is_some_and(|d| d.eq_ignore_ascii_case("DESC"));
        keys.push((source.column_index(&unquote(col))?, descending));
    }
    rows.sort_by(|a, b| {
        for (idx, descending) in &keys {
            // NULLs sort last ascending and first descending
            let ord = match (a[*idx].is_null(), b[*idx].is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare(&a[*idx], &b[*idx]).unwrap_or(Ordering::Equal),
            };
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

enum Projection {
    Column(usize),
    CountAll,
    Count(usize),
    Min(usize),
    Max(usize),
}

fn aggregate(rows: &[Vec<Value>], projection: &Projection) -> Value {
    let extreme = |idx: usize, want: Ordering| {
        rows.iter()
            .map(|r| &r[idx])
            .filter(|v| !v.is_null())
            .fold(None::<&Value>, |best, v| match best {
                Some(b) if compare(v, b) != Some(want) => Some(b),
                _ => Some(v),
            })
            .cloned()
            .unwrap_or(Value::Null)
    };
    match projection {
        Projection::CountAll => Value::Int64(rows.len() as i64),
        Projection::Count(idx) => {
            Value::Int64(rows.iter().filter(|r| !r[*idx].is_null()).count() as i64)
        }
        Projection::Min(idx) => extreme(*idx, Ordering::Less),
        Projection::Max(idx) => extreme(*idx, Ordering::Greater),
        Projection::Column(idx) => rows.first().map_or(Value::Null, |r| r[*idx].clone()),
    }
}

fn parse_projection(item: &str, source: &ResultSet) -> Result<(Projection, String)> {
    let (expr, alias) = match item.rsplit_once(" AS ") {
        Some((expr, alias)) => (expr.trim(), Some(unquote(alias))),
        None => (item.trim(), None),
    };
    let call = |name: &str| {
        expr.strip_prefix(name)
            .and_then(|s| s.strip_prefix('('))
            .and_then(|s| s.strip_suffix(')'))
    };
    let projection = if expr == "COUNT(*)" {
        Projection::CountAll
    } else if let Some(col) = call("COUNT") {
        Projection::Count(source.column_index(&unquote(col))?)
    } else if let Some(col) = call("MIN") {
        Projection::Min(source.column_index(&unquote(col))?)
    } else if let Some(col) = call("MAX") {
        Projection::Max(source.column_index(&unquote(col))?)
    } else {
        Projection::Column(source.column_index(&unquote(expr))?)
    };
    let name = alias.unwrap_or_else(|| unquote(expr));
    Ok((projection, name))
}

fn select(state: &DbState, sql: &str, params: &[Value]) -> Result<ResultSet> {
    let sql = strip_statement(sql);
    if sql.starts_with("SELECT reltuples") {
        return statistics(state, sql);
    }

    let body = sql.strip_prefix("SELECT ").ok_or_else(|| unsupported(sql))?;
    let from = body.find(" FROM ").ok_or_else(|| unsupported(sql))?;
    let projection = body[..from].trim();
    let rest = body[from + " FROM ".len()..].trim_start();

    let (source, clauses) = if rest.starts_with('(') {
        let close = closing_paren(rest).ok_or_else(|| unsupported(sql))?;
        let inner = select(state, &rest[1..close], params)?;
        let after = rest[close + 1..].trim_start();
        let after = after.strip_prefix("AS ").unwrap_or(after);
        let alias_end = after.find(' ').unwrap_or(after.len());
        (inner, after[alias_end..].trim())
    } else {
        let end = rest.find(' ').unwrap_or(rest.len());
        let table = state.table(&table_name(&rest[..end]))?;
        (
            ResultSet {
                columns: table.columns.clone(),
                rows: table.rows.clone(),
            },
            rest[end..].trim(),
        )
    };

    let mut clauses = clauses;
    let mut rows = source.rows.clone();

    if let Some(r) = clauses.strip_prefix("WHERE ") {
        let end = first_of(r, &[" ORDER BY ", " LIMIT ", " OFFSET "]);
        let predicates = r[..end]
            .split(" AND ")
            .map(|c| parse_predicate(c, &source, params, sql))
            .collect::<Result<Vec<_>>>()?;
        rows.retain(|row| predicates.iter().all(|p| p.matches(row)));
        clauses = r[end..].trim_start();
    }
    if let Some(r) = clauses.strip_prefix("ORDER BY ") {
        let end = first_of(r, &[" LIMIT ", " OFFSET "]);
        sort_rows(&mut rows, &source, &r[..end])?;
        clauses = r[end..].trim_start();
    }
    let mut limit = None;
    if let Some(r) = clauses.strip_prefix("LIMIT ") {
        let end = first_of(r, &[" OFFSET "]);
        limit = Some(r[..end].trim().parse::<u64>().map_err(|_| unsupported(sql))?);
        clauses = r[end..].trim_start();
    }
    if let Some(r) = clauses.strip_prefix("OFFSET ") {
        let offset: usize = r.trim().parse().map_err(|_| unsupported(sql))?;
        rows.drain(..offset.min(rows.len()));
        clauses = "";
    }
    if !clauses.is_empty() {
        return Err(unsupported(sql));
    }
    if let Some(limit) = limit {
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }

    if projection == "*" {
        return Ok(ResultSet {
            columns: source.columns,
            rows,
        });
    }

    let items = projection
        .split(", ")
        .map(|item| parse_projection(item, &source))
        .collect::<Result<Vec<_>>>()?;
    let columns = items.iter().map(|(_, name)| name.clone()).collect();
    let is_aggregate = items
        .iter()
        .any(|(p, _)| !matches!(p, Projection::Column(_)));

    let rows = if is_aggregate {
        vec![items.iter().map(|(p, _)| aggregate(&rows, p)).collect()]
    } else {
        rows.iter()
            .map(|row| {
                items
                    .iter()
                    .map(|(p, _)| match p {
                        Projection::Column(idx) => row[*idx].clone(),
                        _ => Value::Null,
                    })
                    .collect()
            })
            .collect()
    };
    Ok(ResultSet { columns, rows })
}

fn statistics(state: &DbState, sql: &str) -> Result<ResultSet> {
    let start = sql.find('\'').ok_or_else(|| unsupported(sql))?;
    let end = sql.rfind("'::regclass").ok_or_else(|| unsupported(sql))?;
    let relation = sql[start + 1..end].replace("''", "'");
    let table = state.table(&table_name(&relation))?;
    let estimate = if state.faults.stale_statistics {
        -1
    } else {
        table.rows.len() as i64
    };
    Ok(ResultSet {
        columns: vec!["row_count".to_string()],
        rows: vec![vec![Value::Int64(estimate)]],
    })
}

#[derive(Debug, Clone)]
enum Conflict {
    Fail,
    Nothing(Vec<String>),
    Update(Vec<String>, Vec<String>),
}

#[derive(Debug, Clone)]
struct InsertStatement {
    table: String,
    columns: Vec<String>,
    placeholders: Vec<usize>,
    conflict: Conflict,
}

fn parenthesized(s: &str, sql: &str) -> Result<(Vec<String>, usize)> {
    let open = s.find('(').ok_or_else(|| unsupported(sql))?;
    let close = closing_paren(&s[open..]).ok_or_else(|| unsupported(sql))? + open;
    let items = s[open + 1..close]
        .split(',')
        .map(|c| unquote(c.trim()))
        .collect();
    Ok((items, close + 1))
}

fn parse_insert(sql: &str) -> Result<InsertStatement> {
    let stmt = strip_statement(sql);
    let rest = stmt
        .strip_prefix("INSERT INTO ")
        .ok_or_else(|| unsupported(sql))?;
    let name_end = rest.find(" (").ok_or_else(|| unsupported(sql))?;
    let table = table_name(&rest[..name_end]);

    let (columns, used) = parenthesized(&rest[name_end..], sql)?;
    let rest = rest[name_end + used..].trim_start();
    let rest = rest.strip_prefix("VALUES ").ok_or_else(|| unsupported(sql))?;
    let (values, used) = parenthesized(rest, sql)?;
    let placeholders = values
        .iter()
        .map(|v| {
            v.strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| unsupported(sql))
        })
        .collect::<Result<Vec<_>>>()?;
    if placeholders.len() != columns.len() {
        return Err(unsupported(sql));
    }

    let rest = rest[used..].trim();
    let conflict = if rest.is_empty() {
        Conflict::Fail
    } else {
        let rest = rest
            .strip_prefix("ON CONFLICT ")
            .ok_or_else(|| unsupported(sql))?;
        let (key, used) = parenthesized(rest, sql)?;
        let action = rest[used..].trim();
        if action == "DO NOTHING" {
            Conflict::Nothing(key)
        } else {
            let sets = action
                .strip_prefix("DO UPDATE SET ")
                .ok_or_else(|| unsupported(sql))?;
            let updated = sets
                .split(", ")
                .filter_map(|s| s.split_once(" = ").map(|(col, _)| unquote(col)))
                .collect();
            Conflict::Update(key, updated)
        }
    };

    Ok(InsertStatement {
        table,
        columns,
        placeholders,
        conflict,
    })
}

fn apply_insert(state: &mut DbState, insert: &InsertStatement, params: &[Value]) -> Result<u64> {
    let table = state.table_mut(&insert.table)?;
    let mut row = vec![Value::Null; table.columns.len()];
    for (column, placeholder) in insert.columns.iter().zip(&insert.placeholders) {
        let idx = table.column_index(column)?;
        let value = params
            .get(placeholder.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| Error::query(format!("missing parameter ${}", placeholder)))?;
        row[idx] = value;
    }

    let (key, updated) = match &insert.conflict {
        Conflict::Fail => {
            table.rows.push(row);
            return Ok(1);
        }
        Conflict::Nothing(key) => (key, None),
        Conflict::Update(key, updated) => (key, Some(updated)),
    };
    let key_idx = key
        .iter()
        .map(|k| table.column_index(k))
        .collect::<Result<Vec<_>>>()?;

    let update_idx = updated
        .map(|columns| {
            columns
                .iter()
                .map(|c| table.column_index(c))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let position = table.rows.iter().position(|existing| {
        key_idx
            .iter()
            .all(|&i| compare(&existing[i], &row[i]) == Some(Ordering::Equal))
    });
    match (position, update_idx) {
        (None, _) => {
            table.rows.push(row);
            Ok(1)
        }
        (Some(_), None) => Ok(0),
        (Some(pos), Some(update_idx)) => {
            let existing = &mut table.rows[pos];
            for idx in update_idx {
                existing[idx] = row[idx].clone();
            }
            Ok(1)
        }
    }
}
