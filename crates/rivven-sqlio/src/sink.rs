//! Batch writer: bounded transactional batches with upsert-keyed idempotency
//!
//! Records are encoded when they are written, so a record that does not fit
//! the destination is rejected on its own and never poisons a batch. A full
//! batch is committed as one transaction; a retriable failure rolls it back
//! and retries the whole batch. Because every statement is an upsert keyed
//! on the destination's natural key, replaying a batch that was in fact
//! committed leaves one copy of each row.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlio::prelude::*;
//!
//! let target = WriteTarget::new("orders").with_upsert_key(["id"]);
//! let mut writer = BatchWriter::new(pool, dialect, target, BatchConfig::default())?;
//!
//! for record in records {
//!     if let Some(commit) = writer.write(record).await? {
//!         println!("batch {} committed", commit.sequence);
//!     }
//! }
//! writer.flush().await?;
//! ```

use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{encode, Record};
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::retry::{RetryPolicy, RetryState};
use crate::security::validate_sql_identifier;
use crate::types::Value;

/// How rows are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert or update on the upsert key; replays are idempotent
    #[default]
    Upsert,
    /// Plain insert; replays duplicate rows
    Insert,
}

/// Destination table of a batch writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WriteTarget {
    /// Optional schema
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name
    pub table: String,
    /// Columns to write; empty means every column of the first record
    #[serde(default)]
    pub columns: Vec<String>,
    /// Natural key of the destination (required for upserts)
    #[serde(default)]
    pub upsert_key: Vec<String>,
    /// Write mode
    #[serde(default)]
    pub mode: WriteMode,
}

impl WriteTarget {
    /// Upsert into `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            columns: Vec::new(),
            upsert_key: Vec::new(),
            mode: WriteMode::Upsert,
        }
    }

    /// Set the schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Restrict the written columns
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the upsert key
    pub fn with_upsert_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upsert_key = key.into_iter().map(Into::into).collect();
        self
    }

    /// Set the write mode
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate identifiers and the upsert key
    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_sql_identifier(schema)?;
        }
        validate_sql_identifier(&self.table)?;
        for column in self.columns.iter().chain(&self.upsert_key) {
            validate_sql_identifier(column)?;
        }
        if self.mode == WriteMode::Upsert && self.upsert_key.is_empty() {
            return Err(Error::config(format!(
                "upsert into '{}' requires a non-empty upsert key",
                self.table
            )));
        }
        self.check_key_columns(&self.columns)
    }

    fn check_key_columns(&self, columns: &[String]) -> Result<()> {
        if columns.is_empty() || self.mode == WriteMode::Insert {
            return Ok(());
        }
        match self
            .upsert_key
            .iter()
            .find(|k| !columns.iter().any(|c| c.eq_ignore_ascii_case(k)))
        {
            Some(missing) => Err(Error::config(format!(
                "upsert key column '{}' is not written to '{}'",
                missing, self.table
            ))),
            None => Ok(()),
        }
    }

    fn statement(&self, dialect: &dyn SqlDialect, columns: &[String]) -> String {
        let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
        match self.mode {
            WriteMode::Upsert => {
                let key: Vec<&str> = self.upsert_key.iter().map(String::as_str).collect();
                dialect.upsert_sql(self.schema.as_deref(), &self.table, &key, &cols)
            }
            WriteMode::Insert => dialect.insert_sql(self.schema.as_deref(), &self.table, &cols),
        }
    }
}

/// Batching configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Rows per batch
    pub max_rows: usize,
    /// Approximate bytes per batch
    pub max_bytes: usize,
    /// Longest time a batch waits after its first row before it is
    /// committed
    pub flush_interval: Duration,
    /// Backoff for retriable commit failures
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            max_bytes: 16 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchConfig {
    /// Set rows per batch
    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows.max(1);
        self
    }

    /// Set bytes per batch
    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes.max(1);
        self
    }

    /// Set the flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the commit retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Pending rows of one transaction
#[derive(Debug, Clone)]
pub struct WriteBatch {
    sequence: u64,
    records: Vec<Record>,
    params: Vec<Vec<Value>>,
    bytes: usize,
}

impl WriteBatch {
    fn new(sequence: u64) -> Self {
        Self {
            sequence,
            records: Vec::new(),
            params: Vec::new(),
            bytes: 0,
        }
    }

    /// Sequence number, increasing per writer
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Records in the batch
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Hand the records over, e.g. to a dead-letter queue
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Approximate size in bytes
    pub fn approximate_size(&self) -> usize {
        self.bytes
    }
}

/// A committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// Batch sequence number
    pub sequence: u64,
    /// Rows in the batch
    pub rows: u64,
    /// Commit attempts, 1 when the first attempt succeeded
    pub attempts: u32,
    /// Time from the first attempt to the commit
    pub duration: Duration,
}

/// Writer statistics
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    /// Rows committed
    pub records_written: u64,
    /// Approximate bytes committed
    pub bytes_written: u64,
    /// Batches committed
    pub batches_committed: u64,
    /// Retried commit attempts
    pub batch_retries: u64,
    /// Batches that failed permanently
    pub batches_failed: u64,
}

/// Atomic writer statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicSinkStats {
    pub records_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub batches_committed: AtomicU64,
    pub batch_retries: AtomicU64,
    pub batches_failed: AtomicU64,
}

impl AtomicSinkStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed batch
    pub fn record_commit(&self, rows: u64, bytes: u64) {
        self.records_written.fetch_add(rows, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried commit
    pub fn record_retry(&self) {
        self.batch_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed batch
    pub fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> SinkStats {
        SinkStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batch_retries: self.batch_retries.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Buffers records into bounded transactional batches
pub struct BatchWriter {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    target: WriteTarget,
    config: BatchConfig,
    // resolved on the first record when the target lists no columns
    columns: Vec<String>,
    sql: Option<String>,
    current: WriteBatch,
    // when the first row of `current` was buffered
    opened_at: Option<tokio::time::Instant>,
    failed: Option<WriteBatch>,
    stats: Arc<AtomicSinkStats>,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("target", &self.target)
            .field("buffered", &self.current.len())
            .field("sequence", &self.current.sequence)
            .field("failed", &self.failed.as_ref().map(|b| b.sequence))
            .finish()
    }
}

impl BatchWriter {
    /// Create a writer for `target`
    pub fn new(
        pool: ConnectionPool,
        dialect: Arc<dyn SqlDialect>,
        target: WriteTarget,
        config: BatchConfig,
    ) -> Result<Self> {
        target.validate()?;
        let columns = target.columns.clone();
        let sql = (!columns.is_empty()).then(|| target.statement(dialect.as_ref(), &columns));
        Ok(Self {
            pool,
            dialect,
            target,
            config,
            columns,
            sql,
            current: WriteBatch::new(1),
            opened_at: None,
            failed: None,
            stats: Arc::new(AtomicSinkStats::new()),
        })
    }

    /// Destination
    pub fn target(&self) -> &WriteTarget {
        &self.target
    }

    /// Batching configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SinkStats {
        self.stats.snapshot()
    }

    /// Rows buffered and not yet committed
    pub fn buffered(&self) -> usize {
        self.current.len()
    }

    /// The failed batch, or else the batch being filled if it has rows
    pub fn pending_batch(&self) -> Option<&WriteBatch> {
        self.failed
            .as_ref()
            .or_else(|| (!self.current.is_empty()).then_some(&self.current))
    }

    /// Take the failed batch (e.g. for dead-lettering) so writing can
    /// continue with the next sequence number
    pub fn take_failed_batch(&mut self) -> Option<WriteBatch> {
        self.failed.take()
    }

    /// Buffer `record`; commits and returns the batch when it is full or
    /// its first row has waited a whole flush interval.
    ///
    /// Fails with [`Error::BatchPending`] while a failed batch is pending.
    pub async fn write(&mut self, record: Record) -> Result<Option<CommitResult>> {
        if let Some(failed) = &self.failed {
            return Err(Error::BatchPending {
                sequence: failed.sequence,
            });
        }

        let params = self.encode(&record)?;
        if self.current.is_empty() {
            self.opened_at = Some(tokio::time::Instant::now());
        }
        self.current.bytes += record.approximate_size();
        self.current.params.push(params);
        self.current.records.push(record);

        let expired = self
            .flush_deadline()
            .is_some_and(|deadline| deadline <= tokio::time::Instant::now());
        if expired
            || self.current.len() >= self.config.max_rows
            || self.current.bytes >= self.config.max_bytes
        {
            return self.flush().await;
        }
        Ok(None)
    }

    /// Commit the failed batch if one is pending, otherwise the buffered
    /// rows. `None` when there was nothing to commit.
    pub async fn flush(&mut self) -> Result<Option<CommitResult>> {
        let batch = match self.failed.take() {
            Some(failed) => failed,
            None if self.current.is_empty() => return Ok(None),
            None => {
                let next = WriteBatch::new(self.current.sequence + 1);
                self.opened_at = None;
                std::mem::replace(&mut self.current, next)
            }
        };

        match self.commit(&batch).await {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                self.failed = Some(batch);
                Err(e)
            }
        }
    }

    /// Commit `batch` as one transaction, retrying retriable failures
    pub async fn commit(&self, batch: &WriteBatch) -> Result<CommitResult> {
        let Some(sql) = self.sql.as_deref() else {
            return Err(Error::internal("no columns resolved for the write target"));
        };
        let started = Instant::now();
        let mut retry = RetryState::new();

        loop {
            retry.begin_attempt();
            match self.commit_once(sql, batch).await {
                Ok(()) => {
                    let result = CommitResult {
                        sequence: batch.sequence,
                        rows: batch.len() as u64,
                        attempts: retry.attempts(),
                        duration: started.elapsed(),
                    };
                    self.stats
                        .record_commit(result.rows, batch.bytes as u64);
                    info!(
                        table = %self.target.table,
                        sequence = result.sequence,
                        rows = result.rows,
                        attempts = result.attempts,
                        duration_ms = result.duration.as_millis() as u64,
                        "Batch committed"
                    );
                    return Ok(result);
                }
                Err(e) => match retry.backoff(&self.config.retry, &e) {
                    Some(delay) => {
                        warn!(
                            table = %self.target.table,
                            sequence = batch.sequence,
                            attempt = retry.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Batch commit failed, retrying"
                        );
                        self.stats.record_retry();
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            table = %self.target.table,
                            sequence = batch.sequence,
                            attempts = retry.attempts(),
                            rows = batch.len(),
                            error = %e,
                            "Batch commit failed permanently"
                        );
                        self.stats.record_failed();
                        return Err(Error::Write {
                            sequence: batch.sequence,
                            attempts: retry.attempts(),
                            source: Box::new(e),
                        });
                    }
                },
            }
        }
    }

    async fn commit_once(&self, sql: &str, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut lease = self.pool.acquire().await?;
        let result = async {
            let tx = lease.conn()?.begin().await?;
            let statements: Vec<(&str, &[Value])> =
                batch.params.iter().map(|p| (sql, p.as_slice())).collect();

            match tx.execute_batch(&statements).await {
                Ok(_) => tx.commit().await,
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        error!(error = %rollback_err, "Rollback failed after batch error");
                    }
                    Err(e)
                }
            }
        }
        .await;

        if let Err(e) = &result {
            if e.is_retriable() {
                lease.discard();
            }
        }
        debug!(sequence = batch.sequence, ok = result.is_ok(), "Batch transaction finished");
        result
    }

    fn encode(&mut self, record: &Record) -> Result<Vec<Value>> {
        if self.sql.is_none() {
            let columns = record.schema().column_names();
            self.target.check_key_columns(&columns)?;
            for column in &columns {
                validate_sql_identifier(column)?;
            }
            self.sql = Some(self.target.statement(self.dialect.as_ref(), &columns));
            self.columns = columns;
        }

        let row = encode(record, record.schema())?;
        self.columns
            .iter()
            .map(|column| {
                row.get_by_name(column).cloned().ok_or_else(|| {
                    Error::schema(format!(
                        "record has no column '{}' for table '{}'",
                        column, self.target.table
                    ))
                })
            })
            .collect()
    }

    /// When the batch being filled is due, `None` while it is empty
    fn flush_deadline(&self) -> Option<tokio::time::Instant> {
        self.opened_at
            .map(|opened| opened + self.config.flush_interval)
    }

    /// Next commit while consuming `records`: a full batch, a batch that
    /// waited a whole flush interval, or the remainder at end of input
    async fn next_commit<S>(
        &mut self,
        records: &mut S,
        exhausted: &mut bool,
    ) -> Option<Result<CommitResult>>
    where
        S: Stream<Item = Record> + Unpin,
    {
        while !*exhausted {
            let deadline = self.flush_deadline();
            tokio::select! {
                record = records.next() => match record {
                    Some(record) => match self.write(record).await {
                        Ok(Some(result)) => return Some(Ok(result)),
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    },
                    None => *exhausted = true,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    debug!(rows = self.current.len(), "Flush interval elapsed");
                    return self.flush().await.transpose();
                }
            }
        }
        self.flush().await.transpose()
    }

    /// Consume `records`, yielding one result per committed batch.
    ///
    /// Batches are committed when full or once their first row has waited
    /// `flush_interval`, whichever comes first, and the remainder is
    /// committed at end of input. The
    /// stream ends after the first error.
    pub fn run<S>(self, records: S) -> impl Stream<Item = Result<CommitResult>> + Send
    where
        S: Stream<Item = Record> + Send + 'static,
    {
        futures::stream::unfold(
            (self, records.boxed(), false, false),
            |(mut writer, mut records, mut exhausted, failed)| async move {
                if failed {
                    return None;
                }
                let result = writer.next_commit(&mut records, &mut exhausted).await?;
                let failed = result.is_err();
                Some((result, (writer, records, exhausted, failed)))
            },
        )
    }

    /// Drive the writer on its own task
    pub fn spawn<S>(mut self, records: S) -> WriterHandle
    where
        S: Stream<Item = Record> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(async move {
            let mut records = records.boxed();
            let mut exhausted = false;
            while let Some(result) = self.next_commit(&mut records, &mut exhausted).await {
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
            self
        });
        WriterHandle {
            results: rx,
            stats,
            task,
        }
    }
}

/// Handle to a writer running on its own task
pub struct WriterHandle {
    results: mpsc::Receiver<Result<CommitResult>>,
    stats: Arc<AtomicSinkStats>,
    task: JoinHandle<BatchWriter>,
}

impl WriterHandle {
    /// Next commit result
    pub async fn next_result(&mut self) -> Option<Result<CommitResult>> {
        self.results.recv().await
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SinkStats {
        self.stats.snapshot()
    }

    /// Wait for the input to be drained and return the writer, e.g. to take
    /// a failed batch. Unread results are discarded.
    pub async fn finish(mut self) -> Result<BatchWriter> {
        while self.results.recv().await.is_some() {}
        self.task
            .await
            .map_err(|e| Error::internal(format!("writer task failed: {}", e)))
    }
}

impl Stream for WriterHandle {
    type Item = Result<CommitResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().results.poll_recv(cx)
    }
}
