//! Partition reader: executes one split and tracks a resumable checkpoint
//!
//! The reader is a small state machine. `start` opens a cursor over the
//! split's bounded sub-query, `pull` hands out one record at a time and
//! advances the checkpoint before returning it, and `suspend` gives the
//! connection back and returns the checkpoint to resume from.
//!
//! Transient failures close the cursor, back off and reopen from the
//! checkpoint. A reopened key range starts at the last emitted key and
//! skips as many rows of that key as were already emitted; offset windows
//! start after the last emitted offset. Either way no row is emitted twice
//! and none is lost, provided rows sharing a key come back in a stable
//! order.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::checkpoint::Checkpoint;
use crate::codec::{decode, Record, Schema};
use crate::connection::RowStream;
use crate::dialect::SqlDialect;
use crate::error::{Error, ErrorCategory, Result};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::retry::{RetryPolicy, RetryState};
use crate::split::{Split, SplitBounds};
use crate::types::Row;

/// Reader lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No split assigned
    Idle,
    /// Cursor open or reopening
    Running,
    /// Stopped at a checkpoint, lease released
    Suspended,
    /// Split fully read
    Completed,
    /// Split failed permanently
    Failed,
}

/// Result of one pull
#[derive(Debug, Clone, PartialEq)]
pub enum ReadItem {
    /// Next record of the split
    Row(Record),
    /// The split is exhausted
    EndOfSplit,
}

/// Retry bookkeeping of a reader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderProgress {
    /// Attempts since the last successfully pulled row
    pub attempts: u32,
    /// Cursor reopens after transient failures
    pub reopens: u32,
}

/// Reader statistics
#[derive(Debug, Clone, Default)]
pub struct ReaderStats {
    /// Rows handed out
    pub rows_read: u64,
    /// Rows skipped while resuming
    pub rows_skipped: u64,
    /// Transient failures that were retried
    pub retries: u64,
    /// Cursors reopened
    pub reopens: u64,
    /// Splits read to the end
    pub splits_completed: u64,
    /// Splits that failed permanently
    pub splits_failed: u64,
}

/// Atomic reader statistics, shared by all readers of a query
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicReaderStats {
    pub rows_read: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub retries: AtomicU64,
    pub reopens: AtomicU64,
    pub splits_completed: AtomicU64,
    pub splits_failed: AtomicU64,
}

impl AtomicReaderStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row handed out
    pub fn record_row(&self) {
        self.rows_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a row skipped while resuming
    pub fn record_skip(&self) {
        self.rows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried failure
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cursor reopen
    pub fn record_reopen(&self) {
        self.reopens.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed split
    pub fn record_completed(&self) {
        self.splits_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed split
    pub fn record_failed(&self) {
        self.splits_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reopens: self.reopens.load(Ordering::Relaxed),
            splits_completed: self.splits_completed.load(Ordering::Relaxed),
            splits_failed: self.splits_failed.load(Ordering::Relaxed),
        }
    }
}

/// Open result set; the stream is dropped before the lease
struct Cursor {
    stream: Pin<Box<dyn RowStream>>,
    lease: ConnectionLease,
}

/// Reads one split at a time
pub struct PartitionReader {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    base_sql: Arc<str>,
    schema: Arc<Schema>,
    retry: RetryPolicy,
    stats: Arc<AtomicReaderStats>,
    split: Option<Arc<Split>>,
    checkpoint: Option<Checkpoint>,
    state: ReaderState,
    cursor: Option<Cursor>,
    retry_state: RetryState,
    reopens: u32,
    // rows still to skip after reopening a split that cannot seek past
    // rows it already emitted; for key ranges only rows at `skip_key` count
    skip_remaining: u64,
    skip_key: Option<i64>,
    // set while a fetch is awaited; still set on entry means it was cancelled
    fetch_in_flight: bool,
}

impl std::fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReader")
            .field("split", &self.split.as_ref().map(|s| s.id()))
            .field("state", &self.state)
            .field("checkpoint", &self.checkpoint)
            .field("cursor_open", &self.cursor.is_some())
            .finish()
    }
}

impl PartitionReader {
    /// Create an idle reader over `base_sql`
    pub fn new(
        pool: ConnectionPool,
        dialect: Arc<dyn SqlDialect>,
        base_sql: impl Into<Arc<str>>,
        schema: Arc<Schema>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            dialect,
            base_sql: base_sql.into(),
            schema,
            retry,
            stats: Arc::new(AtomicReaderStats::new()),
            split: None,
            checkpoint: None,
            state: ReaderState::Idle,
            cursor: None,
            retry_state: RetryState::new(),
            reopens: 0,
            skip_remaining: 0,
            skip_key: None,
            fetch_in_flight: false,
        }
    }

    /// Share statistics with other readers
    pub fn with_stats(mut self, stats: Arc<AtomicReaderStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Current state
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Split being read
    pub fn split(&self) -> Option<&Arc<Split>> {
        self.split.as_ref()
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Retry bookkeeping
    pub fn progress(&self) -> ReaderProgress {
        ReaderProgress {
            attempts: self.retry_state.attempts(),
            reopens: self.reopens,
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ReaderStats {
        self.stats.snapshot()
    }

    /// Start reading `split`, resuming after `checkpoint` when given
    pub async fn start(&mut self, split: Arc<Split>, checkpoint: Option<Checkpoint>) -> Result<()> {
        if self.state == ReaderState::Running {
            return Err(Error::internal("reader is already running"));
        }
        let checkpoint = match checkpoint {
            Some(cp) if cp.split_id != split.id() => {
                return Err(Error::split(format!(
                    "checkpoint for split {} does not belong to split {}",
                    cp.split_id,
                    split.id()
                )))
            }
            Some(cp) => cp,
            None => Checkpoint::new(split.id()),
        };

        self.close_cursor(false);
        self.split = Some(split);
        self.checkpoint = Some(checkpoint);
        self.retry_state.reset();
        self.reopens = 0;
        self.state = ReaderState::Running;

        loop {
            match self.open().await {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Pull the next record.
    ///
    /// Dropping the returned future is safe: the checkpoint stays at the
    /// last row handed out and the next pull resumes from it.
    pub async fn pull(&mut self) -> Result<ReadItem> {
        loop {
            match self.state {
                ReaderState::Running => {}
                ReaderState::Completed => return Ok(ReadItem::EndOfSplit),
                ReaderState::Failed => return Err(Error::internal("reader has failed")),
                ReaderState::Idle | ReaderState::Suspended => {
                    return Err(Error::internal("reader is not running"))
                }
            }

            if self.fetch_in_flight {
                // A previous pull was dropped mid-fetch; the row it may have
                // consumed was never emitted.
                self.fetch_in_flight = false;
                self.close_cursor(false);
            }

            if self.cursor.is_none() {
                if let Err(e) = self.open().await {
                    self.recover(e).await?;
                    continue;
                }
            }
            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };

            self.fetch_in_flight = true;
            let fetched = cursor.stream.next().await;
            self.fetch_in_flight = false;

            match fetched {
                Ok(Some(row)) => match self.accept(row) {
                    Ok(Some(record)) => {
                        self.retry_state.reset();
                        self.stats.record_row();
                        return Ok(ReadItem::Row(record));
                    }
                    Ok(None) => {
                        self.stats.record_skip();
                    }
                    Err(e) => return Err(self.fail(e)),
                },
                Ok(None) => {
                    self.close_cursor(false);
                    self.state = ReaderState::Completed;
                    self.stats.record_completed();
                    if let Some(cp) = &self.checkpoint {
                        debug!(
                            split_id = %cp.split_id,
                            rows = cp.rows_emitted,
                            "Split completed"
                        );
                    }
                    return Ok(ReadItem::EndOfSplit);
                }
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Stop reading, release the lease and return the checkpoint to resume
    /// from
    pub fn suspend(&mut self) -> Result<Checkpoint> {
        let checkpoint = self
            .checkpoint
            .clone()
            .ok_or_else(|| Error::internal("reader has no split"))?;
        self.close_cursor(false);
        self.fetch_in_flight = false;
        if self.state == ReaderState::Running {
            self.state = ReaderState::Suspended;
        }
        debug!(
            split_id = %checkpoint.split_id,
            rows = checkpoint.rows_emitted,
            "Reader suspended"
        );
        Ok(checkpoint)
    }

    async fn open(&mut self) -> Result<()> {
        self.retry_state.begin_attempt();
        let split = self
            .split
            .clone()
            .ok_or_else(|| Error::internal("reader has no split"))?;
        let checkpoint = self.checkpoint.as_ref();

        let (sql, params) = split.to_query(self.dialect.as_ref(), &self.base_sql, checkpoint)?;
        (self.skip_key, self.skip_remaining) = match split.bounds() {
            SplitBounds::Whole | SplitBounds::NullKeys { .. } => {
                (None, checkpoint.map_or(0, |cp| cp.rows_emitted))
            }
            SplitBounds::KeyRange {
                lower,
                skip_at_lower,
                ..
            } => match checkpoint.and_then(|cp| cp.last_key.map(|key| (key, cp))) {
                Some((key, cp)) if key == *lower => {
                    (Some(key), skip_at_lower + cp.emitted_at_last_key)
                }
                Some((key, cp)) => (Some(key), cp.emitted_at_last_key),
                None => (Some(*lower), *skip_at_lower),
            },
            SplitBounds::OffsetWindow { .. } => (None, 0),
        };

        let mut lease = self.pool.acquire().await?;
        let stream = match lease.conn()?.query_stream(&sql, &params).await {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_retriable() {
                    lease.discard();
                }
                return Err(e);
            }
        };
        self.cursor = Some(Cursor { stream, lease });

        debug!(
            split_id = %split.id(),
            attempt = self.retry_state.attempts(),
            skip = self.skip_remaining,
            "Opened split cursor"
        );
        Ok(())
    }

    /// Back off and schedule a reopen, or fail permanently
    async fn recover(&mut self, e: Error) -> Result<()> {
        self.close_cursor(true);
        match self.retry_state.backoff(&self.retry, &e) {
            Some(delay) => {
                warn!(
                    split_id = ?self.split.as_ref().map(|s| s.id().to_string()),
                    attempt = self.retry_state.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient split read failure, reopening from checkpoint"
                );
                self.stats.record_retry();
                tokio::time::sleep(delay).await;
                self.reopens += 1;
                self.stats.record_reopen();
                Ok(())
            }
            None => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.close_cursor(true);
        self.state = ReaderState::Failed;
        self.stats.record_failed();

        let split_id = self
            .split
            .as_ref()
            .map(|s| s.id().to_string())
            .unwrap_or_default();
        error!(split_id = %split_id, error = %e, "Split read failed");

        if e.category() == ErrorCategory::UnsupportedType {
            return e;
        }
        Error::PartitionRead {
            split_id,
            checkpoint: self.checkpoint.clone(),
            attempts: self.retry_state.attempts().max(1),
            source: Box::new(e),
        }
    }

    fn close_cursor(&mut self, discard: bool) {
        if let Some(mut cursor) = self.cursor.take() {
            if discard {
                cursor.lease.discard();
            }
            drop(cursor.stream);
            cursor.lease.release();
        }
    }

    /// Decode a fetched row and advance the checkpoint; `None` for rows
    /// already covered by the checkpoint
    fn accept(&mut self, row: Row) -> Result<Option<Record>> {
        let split = self
            .split
            .as_ref()
            .ok_or_else(|| Error::internal("reader has no split"))?;
        let checkpoint = self
            .checkpoint
            .as_mut()
            .ok_or_else(|| Error::internal("reader has no checkpoint"))?;

        match split.bounds() {
            SplitBounds::KeyRange { column, kind, .. } => {
                let key = row
                    .get_by_name(column)
                    .and_then(|v| kind.to_domain(v))
                    .ok_or_else(|| {
                        Error::schema(format!(
                            "partition column '{}' missing or not of the planned type",
                            column
                        ))
                    })?;
                if self.skip_remaining > 0 && self.skip_key == Some(key) {
                    self.skip_remaining -= 1;
                    return Ok(None);
                }
                self.skip_remaining = 0;
                let record = decode(&row, &self.schema)?;
                checkpoint.advance_key(key)?;
                Ok(Some(record))
            }
            SplitBounds::OffsetWindow { offset, .. } => {
                let record = decode(&row, &self.schema)?;
                checkpoint.advance_offset(*offset);
                Ok(Some(record))
            }
            SplitBounds::NullKeys { .. } | SplitBounds::Whole => {
                if self.skip_remaining > 0 {
                    self.skip_remaining -= 1;
                    return Ok(None);
                }
                let record = decode(&row, &self.schema)?;
                checkpoint.advance();
                Ok(Some(record))
            }
        }
    }
}
