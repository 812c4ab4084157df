//! Connector facade: plan, read and write through one entry point
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use rivven_sqlio::prelude::*;
//!
//! let connector = SqlConnector::new(pool, Arc::new(PostgresDialect), SqlioConfig::default())?;
//!
//! let query = QueryDescriptor::table(Some("shop"), "orders").with_partition_column("id");
//! let mut handle = connector.read(&query).await?;
//! while let Some(event) = handle.next().await {
//!     // rows, checkpoints and split lifecycle events
//! }
//! handle.join().await?;
//! ```

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::codec::{Record, Schema};
use crate::config::SqlioConfig;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::estimator::RangeEstimator;
use crate::orchestrator::{ReadHandle, ReadOrchestrator, SharedArena};
use crate::pool::ConnectionPool;
use crate::query::{QueryDescriptor, SchemaSource};
use crate::reader::PartitionReader;
use crate::sink::{BatchWriter, CommitResult, WriteTarget};
use crate::split::{Split, SplitArena, SplitId, Splitter};

const SAMPLE_ALIAS: &str = "sqlio_sample";

/// Plans, reads and writes SQL queries
pub struct SqlConnector {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    config: SqlioConfig,
    splitter: Splitter,
    arenas: Mutex<HashMap<Uuid, SharedArena>>,
}

impl std::fmt::Debug for SqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnector")
            .field("dialect", &self.dialect.name())
            .field("pool", &self.pool)
            .field("queries", &self.arenas.lock().len())
            .finish()
    }
}

impl SqlConnector {
    /// Create a connector; the configuration is validated
    pub fn new(
        pool: ConnectionPool,
        dialect: Arc<dyn SqlDialect>,
        config: SqlioConfig,
    ) -> Result<Self> {
        config.validate_all()?;
        Ok(Self {
            pool,
            dialect,
            splitter: Splitter::new(config.target_split_size),
            config,
            arenas: Mutex::new(HashMap::new()),
        })
    }

    /// Configuration
    pub fn config(&self) -> &SqlioConfig {
        &self.config
    }

    /// Connection pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// SQL dialect
    pub fn dialect(&self) -> &Arc<dyn SqlDialect> {
        &self.dialect
    }

    fn estimator(&self) -> RangeEstimator {
        RangeEstimator::new(self.pool.clone(), Arc::clone(&self.dialect))
            .with_timeout(self.config.estimate_timeout())
            .with_target_split_size(self.config.target_split_size)
    }

    async fn plan_into(&self, query: &QueryDescriptor) -> Result<(SplitArena, Vec<Arc<Split>>)> {
        query.validate()?;
        let estimate = self.estimator().estimate(query).await?;
        let mut arena = SplitArena::new(query.id());
        let splits = self.splitter.plan(&mut arena, query, &estimate)?;
        Ok((arena, splits))
    }

    /// Estimate `query` and plan its splits.
    ///
    /// The plan is kept so later re-split requests extend it; planning the
    /// same query id twice is rejected.
    pub async fn plan_splits(&self, query: &QueryDescriptor) -> Result<Vec<Arc<Split>>> {
        if self.arenas.lock().contains_key(&query.id()) {
            return Err(Error::split(format!(
                "query {} already has a plan",
                query.id()
            )));
        }
        let (arena, splits) = self.plan_into(query).await?;
        self.arenas
            .lock()
            .insert(query.id(), Arc::new(Mutex::new(arena)));
        Ok(splits)
    }

    /// Plan `query` and render every split as a standalone SQL statement
    /// with bound values inlined. The plan is not kept.
    pub async fn split_queries(&self, query: &QueryDescriptor) -> Result<Vec<String>> {
        let (_, splits) = self.plan_into(query).await?;
        let base = query.base_sql(self.dialect.as_ref());
        splits
            .iter()
            .map(|split| split.to_literal_query(self.dialect.as_ref(), &base))
            .collect()
    }

    /// Record schema of `query`, explicit or inferred from a bounded sample
    pub async fn resolve_schema(&self, query: &QueryDescriptor) -> Result<Arc<Schema>> {
        let sample_rows = match query.schema_source() {
            SchemaSource::Explicit(schema) => return Ok(Arc::clone(schema)),
            SchemaSource::Infer { sample_rows } => *sample_rows,
        };

        let sql = format!(
            "SELECT * FROM {}{}",
            self.dialect
                .wrap_subquery(&query.base_sql(self.dialect.as_ref()), SAMPLE_ALIAS),
            self.dialect.limit_offset_sql(Some(sample_rows as u64), None)
        );
        let lease = self.pool.acquire().await?;
        let rows = lease.conn()?.query(&sql, &[]).await?;
        let schema = Schema::infer(&rows)?;
        debug!(
            query_id = %query.id(),
            sampled = rows.len(),
            columns = schema.len(),
            "Inferred record schema"
        );
        Ok(Arc::new(schema))
    }

    /// Start a reader on one split, resuming after `checkpoint` when given
    pub async fn read_split(
        &self,
        query: &QueryDescriptor,
        split: Arc<Split>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<PartitionReader> {
        if split.id().query() != query.id() {
            return Err(Error::split(format!(
                "split {} does not belong to query {}",
                split.id(),
                query.id()
            )));
        }
        let schema = self.resolve_schema(query).await?;
        let mut reader = PartitionReader::new(
            self.pool.clone(),
            Arc::clone(&self.dialect),
            query.base_sql(self.dialect.as_ref()),
            schema,
            self.config.retry_policy(),
        );
        reader.start(split, checkpoint).await?;
        Ok(reader)
    }

    fn orchestrator(&self) -> ReadOrchestrator {
        ReadOrchestrator::new(
            self.pool.clone(),
            Arc::clone(&self.dialect),
            self.splitter.clone(),
            self.config.orchestrator_config(),
        )
    }

    /// Plan `query` and read all of its splits in parallel
    pub async fn read(&self, query: &QueryDescriptor) -> Result<ReadHandle> {
        self.plan_splits(query).await?;
        self.resume(query, HashMap::new()).await
    }

    /// Read the pending splits of an already planned query, resuming splits
    /// with a persisted checkpoint
    pub async fn resume(
        &self,
        query: &QueryDescriptor,
        checkpoints: HashMap<SplitId, Checkpoint>,
    ) -> Result<ReadHandle> {
        let arena = self.arena(query.id()).ok_or_else(|| {
            Error::split(format!("query {} has not been planned", query.id()))
        })?;
        let schema = self.resolve_schema(query).await?;
        Ok(self
            .orchestrator()
            .resume(query, schema, arena, checkpoints))
    }

    /// Plan of a query planned by this connector
    pub fn arena(&self, query_id: Uuid) -> Option<SharedArena> {
        self.arenas.lock().get(&query_id).cloned()
    }

    /// Forget the plan of a finished query
    pub fn forget(&self, query_id: Uuid) -> bool {
        self.arenas.lock().remove(&query_id).is_some()
    }

    /// Re-split the unconsumed remainder of a split read outside an
    /// orchestrator (see [`SqlConnector::read_split`]). The caller must have
    /// suspended its reader at `checkpoint`.
    pub fn request_resplit(
        &self,
        split: &Split,
        checkpoint: &Checkpoint,
        desired: u32,
    ) -> Result<Vec<Arc<Split>>> {
        let arena = self.arena(split.id().query()).ok_or_else(|| {
            Error::split(format!("split {} belongs to no planned query", split.id()))
        })?;
        let mut arena = arena.lock();
        let children = self
            .splitter
            .resplit(&mut arena, split.id(), checkpoint, desired)?;
        info!(
            split_id = %split.id(),
            children = children.len(),
            "Re-split suspended split"
        );
        Ok(children)
    }

    /// Batch writer for `target`; the configured upsert key applies when
    /// the target has none
    pub fn writer(&self, mut target: WriteTarget) -> Result<BatchWriter> {
        if target.upsert_key.is_empty() {
            target.upsert_key = self.config.upsert_key.clone();
        }
        BatchWriter::new(
            self.pool.clone(),
            Arc::clone(&self.dialect),
            target,
            self.config.batch_config(),
        )
    }

    /// Write `records` to `target`, yielding one result per committed batch
    pub fn submit_rows<S>(
        &self,
        target: WriteTarget,
        records: S,
    ) -> Result<impl Stream<Item = Result<CommitResult>> + Send>
    where
        S: Stream<Item = Record> + Send + 'static,
    {
        Ok(self.writer(target)?.run(records))
    }
}
