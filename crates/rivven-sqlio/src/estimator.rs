//! Range estimation: row count and partition-key statistics for a query

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::query::{BoundStrategy, QueryDescriptor};
use crate::split::KeyKind;
use crate::types::Row;

const ESTIMATE_ALIAS: &str = "sqlio_estimate";

/// Statistics of the partition column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    /// Partition column
    pub column: String,
    /// Integer domain of the key, `None` for keys without one
    pub kind: Option<KeyKind>,
    /// Smallest key in the integer domain
    pub min: Option<i64>,
    /// Largest key in the integer domain
    pub max: Option<i64>,
    /// Rows whose key is NULL
    pub null_count: u64,
}

/// Size and shape of a query's result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEstimate {
    /// Estimated row count, `None` when unknown
    pub row_count: Option<u64>,
    /// Partition key statistics
    pub key: Option<KeyStats>,
    /// Percentile boundaries in the key domain (percentile strategy only)
    pub boundaries: Vec<i64>,
}

impl RangeEstimate {
    /// Nothing is known; plans a single unsplittable split
    pub fn unknown() -> Self {
        Self {
            row_count: None,
            key: None,
            boundaries: Vec::new(),
        }
    }
}

fn count_of(row: &Row, column: &str) -> Option<u64> {
    row.get_by_name(column)
        .and_then(|v| v.as_i64())
        .and_then(|n| u64::try_from(n).ok())
}

/// Computes [`RangeEstimate`]s under a bounded time budget
pub struct RangeEstimator {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    timeout: Duration,
    target_split_size: u64,
}

impl RangeEstimator {
    /// Create an estimator with a 30 second budget
    pub fn new(pool: ConnectionPool, dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            pool,
            dialect,
            timeout: Duration::from_secs(30),
            target_split_size: 100_000,
        }
    }

    /// Time budget for one estimate
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rows per split, used to pick the number of percentile boundaries
    pub fn with_target_split_size(mut self, rows: u64) -> Self {
        self.target_split_size = rows.max(1);
        self
    }

    /// Estimate `query`.
    ///
    /// A timeout or transient failure degrades to [`RangeEstimate::unknown`];
    /// permanent failures (bad SQL, bad bounds) are returned.
    pub async fn estimate(&self, query: &QueryDescriptor) -> Result<RangeEstimate> {
        match tokio::time::timeout(self.timeout, self.estimate_inner(query)).await {
            Ok(Ok(estimate)) => {
                debug!(
                    query_id = %query.id(),
                    row_count = ?estimate.row_count,
                    key = ?estimate.key,
                    "Estimated query range"
                );
                Ok(estimate)
            }
            Ok(Err(e)) if e.is_retriable() => {
                warn!(
                    query_id = %query.id(),
                    error = %e,
                    "Range estimate failed, reading query as a single split"
                );
                Ok(RangeEstimate::unknown())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    query_id = %query.id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Range estimate timed out, reading query as a single split"
                );
                Ok(RangeEstimate::unknown())
            }
        }
    }

    async fn estimate_inner(&self, query: &QueryDescriptor) -> Result<RangeEstimate> {
        let lease = self.pool.acquire().await?;
        let conn = lease.conn()?;
        let base = query.base_sql(self.dialect.as_ref());
        let from = self.dialect.wrap_subquery(&base, ESTIMATE_ALIAS);

        let Some(column) = query.partition_column() else {
            if let Some(rows) = self.metadata_row_count(conn, query).await {
                return Ok(RangeEstimate {
                    row_count: Some(rows),
                    key: None,
                    boundaries: Vec::new(),
                });
            }
            let sql = format!("SELECT COUNT(*) AS row_count FROM {}", from);
            let row = conn.query_one(&sql, &[]).await?;
            return Ok(RangeEstimate {
                row_count: row.as_ref().and_then(|r| count_of(r, "row_count")),
                key: None,
                boundaries: Vec::new(),
            });
        };

        let col = self.dialect.quote_identifier(column);
        let sql = format!(
            "SELECT COUNT(*) AS row_count, COUNT({c}) AS key_count, MIN({c}) AS key_min, MAX({c}) AS key_max FROM {from}",
            c = col,
            from = from
        );
        let Some(row) = conn.query_one(&sql, &[]).await? else {
            return Ok(RangeEstimate::unknown());
        };

        let row_count = count_of(&row, "row_count");
        let key_count = count_of(&row, "key_count").unwrap_or(0);
        let null_count = row_count.map_or(0, |rows| rows.saturating_sub(key_count));

        let observed_min = row.get_by_name("key_min").filter(|v| !v.is_null());
        let observed_max = row.get_by_name("key_max").filter(|v| !v.is_null());
        let mut kind = observed_min.and_then(KeyKind::of_value);
        let mut min = kind.and_then(|k| observed_min.and_then(|v| k.to_domain(v)));
        let mut max = kind.and_then(|k| observed_max.and_then(|v| k.to_domain(v)));

        if let Some((bound_kind, lower, upper)) = query.domain_bounds()? {
            if kind.is_some_and(|k| k != bound_kind) {
                return Err(Error::config(format!(
                    "partition bounds do not match the type of column '{}'",
                    column
                )));
            }
            kind = Some(bound_kind);
            min = Some(lower);
            max = Some(upper);
        }

        let boundaries = match (query.strategy(), kind, row_count) {
            (BoundStrategy::Percentile, Some(kind), Some(rows)) if key_count > 0 => {
                let n = query
                    .num_partitions()
                    .map(u64::from)
                    .unwrap_or_else(|| rows.div_ceil(self.target_split_size))
                    .max(1);
                self.percentile_boundaries(conn, &from, &col, kind, key_count, n)
                    .await?
            }
            _ => Vec::new(),
        };

        Ok(RangeEstimate {
            row_count,
            key: Some(KeyStats {
                column: column.to_string(),
                kind,
                min,
                max,
                null_count,
            }),
            boundaries,
        })
    }

    async fn metadata_row_count(
        &self,
        conn: &dyn Connection,
        query: &QueryDescriptor,
    ) -> Option<u64> {
        let (schema, table) = query.table_ref()?;
        let sql = self.dialect.row_estimate_sql(schema, table)?;
        match conn.query_one(&sql, &[]).await {
            Ok(row) => row
                .as_ref()
                .and_then(|r| count_of(r, "row_count"))
                .filter(|n| *n > 0),
            Err(e) => {
                debug!(table = table, error = %e, "Row count statistics unavailable");
                None
            }
        }
    }

    async fn percentile_boundaries(
        &self,
        conn: &dyn Connection,
        from: &str,
        col: &str,
        kind: KeyKind,
        non_null: u64,
        n: u64,
    ) -> Result<Vec<i64>> {
        let mut boundaries = Vec::with_capacity(n as usize);
        for i in 1..n {
            let offset = (u128::from(non_null) * u128::from(i) / u128::from(n)) as u64;
            let sql = format!(
                "SELECT {c} AS key_value FROM {from} WHERE {c} IS NOT NULL ORDER BY {c} ASC{page}",
                c = col,
                from = from,
                page = self.dialect.limit_offset_sql(Some(1), Some(offset))
            );
            if let Some(value) = conn
                .query_one(&sql, &[])
                .await?
                .as_ref()
                .and_then(|r| r.get(0))
                .and_then(|v| kind.to_domain(v))
            {
                boundaries.push(value);
            }
        }
        boundaries.sort_unstable();
        boundaries.dedup();
        Ok(boundaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use crate::testing::MemoryDatabase;
    use crate::types::Value;
    use chrono::NaiveDate;

    fn db_with_keys<I: IntoIterator<Item = Value>>(keys: I) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table("t", &["id", "payload"]);
        db.insert_rows("t", keys.into_iter().map(|k| vec![k, Value::from("x")]));
        db
    }

    fn estimator(db: &MemoryDatabase) -> RangeEstimator {
        RangeEstimator::new(db.pool(2).unwrap(), Arc::new(PostgresDialect))
    }

    #[tokio::test]
    async fn test_min_max_and_nulls() {
        let keys = (0..100)
            .map(Value::Int64)
            .chain(std::iter::repeat(Value::Null).take(3));
        let db = db_with_keys(keys);
        let query = QueryDescriptor::table(None, "t").with_partition_column("id");

        let estimate = estimator(&db).estimate(&query).await.unwrap();
        assert_eq!(estimate.row_count, Some(103));
        let key = estimate.key.unwrap();
        assert_eq!(key.kind, Some(KeyKind::Integer));
        assert_eq!((key.min, key.max), (Some(0), Some(99)));
        assert_eq!(key.null_count, 3);
        assert!(estimate.boundaries.is_empty());
    }

    #[tokio::test]
    async fn test_percentile_boundaries_follow_skew() {
        let keys = (0..90).chain(1000..1010).map(Value::Int64);
        let db = db_with_keys(keys);
        let query = QueryDescriptor::table(None, "t")
            .with_partition_column("id")
            .with_strategy(BoundStrategy::Percentile)
            .with_num_partitions(4);

        let estimate = estimator(&db).estimate(&query).await.unwrap();
        assert_eq!(estimate.boundaries, vec![25, 50, 75]);
    }

    #[tokio::test]
    async fn test_explicit_bounds_override_observed_range() {
        let db = db_with_keys((0..10).map(Value::Int64));
        let query = QueryDescriptor::table(None, "t")
            .with_partition_column("id")
            .with_bounds(-5_i64, 50_i64);

        let key = estimator(&db).estimate(&query).await.unwrap().key.unwrap();
        assert_eq!((key.min, key.max), (Some(-5), Some(50)));
    }

    #[tokio::test]
    async fn test_bounds_of_wrong_kind_are_rejected() {
        let db = db_with_keys((0..10).map(Value::Int64));
        let date = |d| Value::Date(NaiveDate::from_ymd_opt(2024, 1, d).unwrap());
        let query = QueryDescriptor::table(None, "t")
            .with_partition_column("id")
            .with_bounds(date(1), date(31));

        let err = estimator(&db).estimate(&query).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_table_row_count_from_statistics() {
        let db = db_with_keys((0..42).map(Value::Int64));
        let query = QueryDescriptor::table(None, "t");

        let before = db.counters().queries;
        let estimate = estimator(&db).estimate(&query).await.unwrap();
        assert_eq!(estimate.row_count, Some(42));
        assert!(estimate.key.is_none());
        assert_eq!(db.counters().queries, before + 1);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_unknown() {
        let db = db_with_keys((0..10).map(Value::Int64));
        db.set_query_delay(Some(Duration::from_millis(500)));
        let query = QueryDescriptor::table(None, "t").with_partition_column("id");

        let estimate = estimator(&db)
            .with_timeout(Duration::from_millis(10))
            .estimate(&query)
            .await
            .unwrap();
        assert_eq!(estimate, RangeEstimate::unknown());
    }
}
