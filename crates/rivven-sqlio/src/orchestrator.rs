//! Reader orchestrator: parallel split reads merged into one event stream
//!
//! A coordinator task owns the work queue. It starts one worker task per
//! split, bounded by a semaphore, and collects their outcomes. Workers
//! forward rows over a bounded channel, so a slow consumer applies
//! backpressure to every reader.
//!
//! Rebalancing goes through the coordinator as well: a re-split request
//! suspends the running worker, which replies with the checkpoint of the
//! last row it actually delivered, and the unconsumed remainder is
//! re-split and scheduled.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use rivven_sqlio::prelude::*;
//!
//! let mut handle = orchestrator.run(&query, schema, arena);
//! while let Some(event) = handle.next().await {
//!     if let ReadEvent::Row { record, .. } = event {
//!         process(record);
//!     }
//! }
//! let summary = handle.join().await?;
//! ```

use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::codec::{Record, Schema};
use crate::dialect::SqlDialect;
use crate::error::{Error, Result, SplitFailure};
use crate::pool::ConnectionPool;
use crate::query::QueryDescriptor;
use crate::reader::{AtomicReaderStats, PartitionReader, ReadItem, ReaderStats};
use crate::retry::RetryPolicy;
use crate::split::{Split, SplitArena, SplitId, SplitState, Splitter};

/// Split arena shared between the coordinator and its callers
pub type SharedArena = Arc<Mutex<SplitArena>>;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Splits read concurrently
    pub parallelism: usize,
    /// Rows between checkpoint events of one split
    pub checkpoint_interval: u64,
    /// Attempts per split before it is reported as failed
    pub max_split_attempts: u32,
    /// Capacity of the event channel
    pub event_buffer: usize,
    /// Backoff for transient failures inside one split read
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            checkpoint_interval: 1000,
            max_split_attempts: 3,
            event_buffer: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Set parallelism
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the checkpoint interval
    pub fn with_checkpoint_interval(mut self, rows: u64) -> Self {
        self.checkpoint_interval = rows.max(1);
        self
    }

    /// Set the attempts per split
    pub fn with_max_split_attempts(mut self, attempts: u32) -> Self {
        self.max_split_attempts = attempts.max(1);
        self
    }

    /// Set the event channel capacity
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Set the in-split retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Event emitted while reading a query
#[derive(Debug, Clone)]
pub enum ReadEvent {
    /// A decoded row of a split
    Row {
        /// Split the row belongs to
        split_id: SplitId,
        /// Decoded record
        record: Record,
    },
    /// Progress of a split, safe to persist
    Checkpoint(Checkpoint),
    /// A split was read to the end
    SplitCompleted {
        /// Completed split
        split_id: SplitId,
        /// Rows emitted by the split over all of its attempts
        rows: u64,
    },
    /// A split was retired by a re-split
    SplitReplaced {
        /// Retired split
        split_id: SplitId,
        /// Children covering its remainder
        children: Vec<SplitId>,
    },
    /// A split failed permanently
    SplitFailed {
        /// Failed split
        split_id: SplitId,
        /// Final error
        error: String,
    },
}

/// Outcome of a finished query read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Splits read to the end
    pub splits_completed: u64,
    /// Splits retired by re-splits
    pub splits_replaced: u64,
    /// Rows emitted
    pub rows: u64,
    /// Split attempts retried after a failure
    pub split_retries: u64,
}

struct WorkItem {
    split: Arc<Split>,
    checkpoint: Option<Checkpoint>,
}

enum Control {
    Suspend(oneshot::Sender<Checkpoint>),
}

enum Interrupt {
    Cancelled,
    Suspend(oneshot::Sender<Checkpoint>),
}

enum WorkerOutcome {
    Completed {
        split_id: SplitId,
        rows: u64,
    },
    Suspended {
        split_id: SplitId,
    },
    Cancelled {
        split_id: SplitId,
        checkpoint: Checkpoint,
    },
    Failed {
        split_id: SplitId,
        checkpoint: Checkpoint,
        error: Error,
    },
}

enum Command {
    Resplit {
        split_id: SplitId,
        desired: u32,
        reply: oneshot::Sender<Result<Vec<Arc<Split>>>>,
    },
}

#[derive(Clone)]
struct WorkerContext {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    base_sql: Arc<str>,
    schema: Arc<Schema>,
    retry: RetryPolicy,
    checkpoint_interval: u64,
    events: mpsc::Sender<ReadEvent>,
    stats: Arc<AtomicReaderStats>,
}

/// Runs partition readers in parallel
pub struct ReadOrchestrator {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    splitter: Splitter,
    config: OrchestratorConfig,
}

impl ReadOrchestrator {
    /// Create an orchestrator; `splitter` serves re-split requests
    pub fn new(
        pool: ConnectionPool,
        dialect: Arc<dyn SqlDialect>,
        splitter: Splitter,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            dialect,
            splitter,
            config,
        }
    }

    /// Configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Read every pending split of `arena`
    pub fn run(&self, query: &QueryDescriptor, schema: Arc<Schema>, arena: SharedArena) -> ReadHandle {
        self.resume(query, schema, arena, HashMap::new())
    }

    /// Read every pending split of `arena`, resuming splits that have a
    /// persisted checkpoint
    pub fn resume(
        &self,
        query: &QueryDescriptor,
        schema: Arc<Schema>,
        arena: SharedArena,
        mut checkpoints: HashMap<SplitId, Checkpoint>,
    ) -> ReadHandle {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let stats = Arc::new(AtomicReaderStats::new());

        let queue: VecDeque<WorkItem> = arena
            .lock()
            .splits()
            .filter(|(_, state)| matches!(state, SplitState::Pending | SplitState::Active))
            .map(|(split, _)| WorkItem {
                checkpoint: checkpoints.remove(&split.id()),
                split: Arc::clone(split),
            })
            .collect();

        info!(
            query_id = %query.id(),
            splits = queue.len(),
            parallelism = self.config.parallelism,
            "Starting query read"
        );

        let coordinator = Coordinator {
            query_id: query.id(),
            arena: Arc::clone(&arena),
            splitter: self.splitter.clone(),
            config: self.config.clone(),
            ctx: WorkerContext {
                pool: self.pool.clone(),
                dialect: Arc::clone(&self.dialect),
                base_sql: query.base_sql(self.dialect.as_ref()).into(),
                schema,
                retry: self.config.retry.clone(),
                checkpoint_interval: self.config.checkpoint_interval.max(1),
                events: events_tx,
                stats: Arc::clone(&stats),
            },
            cancel: cancel.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.parallelism.max(1))),
            queue,
            running: HashMap::new(),
            attempts: HashMap::new(),
            failures: Vec::new(),
            outbox: VecDeque::new(),
            summary: ReadSummary::default(),
        };

        ReadHandle {
            query_id: query.id(),
            events: events_rx,
            commands: commands_tx,
            cancel,
            arena,
            stats,
            coordinator: tokio::spawn(coordinator.run(commands_rx)),
        }
    }
}

struct Coordinator {
    query_id: Uuid,
    arena: SharedArena,
    splitter: Splitter,
    config: OrchestratorConfig,
    ctx: WorkerContext,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    queue: VecDeque<WorkItem>,
    running: HashMap<SplitId, mpsc::Sender<Control>>,
    attempts: HashMap<SplitId, u32>,
    failures: Vec<SplitFailure>,
    // lifecycle events waiting for channel capacity; the coordinator never
    // blocks on a full channel
    outbox: VecDeque<ReadEvent>,
    summary: ReadSummary,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<ReadSummary> {
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled {
                self.schedule(&mut workers);
            }
            if workers.is_empty() && (self.queue.is_empty() || cancelled) && self.outbox.is_empty()
            {
                break;
            }

            let events = self.ctx.events.clone();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    debug!(query_id = %self.query_id, "Query read cancelled");
                    cancelled = true;
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok(outcome) => self.on_outcome(outcome),
                    Err(e) => error!(query_id = %self.query_id, error = %e, "Reader task aborted"),
                },
                Some(command) = commands.recv() => match command {
                    Command::Resplit { split_id, desired, reply } => {
                        let result = self.resplit(split_id, desired).await;
                        let _ = reply.send(result);
                    }
                },
                permit = events.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.outbox.pop_front() {
                            permit.send(event);
                        }
                    }
                    // consumer is gone
                    Err(_) => {
                        self.outbox.clear();
                        self.cancel.cancel();
                    }
                },
                else => break,
            }
        }

        if cancelled {
            info!(query_id = %self.query_id, "Query read stopped after cancellation");
            return Err(Error::Cancelled);
        }
        if !self.failures.is_empty() {
            error!(
                query_id = %self.query_id,
                failed = self.failures.len(),
                completed = self.summary.splits_completed,
                "Query read finished with failed splits"
            );
            return Err(Error::QueryFailed {
                failures: self.failures,
            });
        }
        info!(
            query_id = %self.query_id,
            splits = self.summary.splits_completed,
            rows = self.summary.rows,
            "Query read completed"
        );
        Ok(self.summary)
    }

    fn schedule(&mut self, workers: &mut JoinSet<WorkerOutcome>) {
        while !self.queue.is_empty() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            let split_id = item.split.id();
            if let Err(e) = self.arena.lock().set_state(split_id, SplitState::Active) {
                warn!(split_id = %split_id, error = %e, "Skipping split that is no longer pending");
                continue;
            }

            let (control_tx, control_rx) = mpsc::channel(1);
            self.running.insert(split_id, control_tx);

            let ctx = self.ctx.clone();
            let cancel = self.cancel.child_token();
            workers.spawn(async move {
                let _permit = permit;
                let checkpoint = item
                    .checkpoint
                    .clone()
                    .unwrap_or_else(|| Checkpoint::new(split_id));
                AssertUnwindSafe(read_split(ctx, item, control_rx, cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| WorkerOutcome::Failed {
                        split_id,
                        checkpoint,
                        error: Error::internal("reader task panicked"),
                    })
            });
            debug!(split_id = %split_id, "Scheduled split");
        }
    }

    fn on_outcome(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Completed { split_id, rows } => {
                self.running.remove(&split_id);
                if let Err(e) = self.arena.lock().set_state(split_id, SplitState::Completed) {
                    warn!(split_id = %split_id, error = %e, "Could not mark split completed");
                }
                self.summary.splits_completed += 1;
                self.summary.rows += rows;
                self.outbox
                    .push_back(ReadEvent::SplitCompleted { split_id, rows });
            }
            // the re-split that suspended the worker already rescheduled
            // the remainder
            WorkerOutcome::Suspended { split_id } => {
                debug!(split_id = %split_id, "Reader suspended");
            }
            WorkerOutcome::Cancelled {
                split_id,
                checkpoint,
            } => {
                self.running.remove(&split_id);
                let _ = self.arena.lock().set_state(split_id, SplitState::Pending);
                self.outbox.push_back(ReadEvent::Checkpoint(checkpoint));
            }
            WorkerOutcome::Failed {
                split_id,
                checkpoint,
                error,
            } => {
                self.running.remove(&split_id);
                let attempts = self.attempts.entry(split_id).or_insert(0);
                *attempts += 1;
                let attempts = *attempts;

                if error.root().is_retriable() && attempts < self.config.max_split_attempts {
                    warn!(
                        split_id = %split_id,
                        attempt = attempts,
                        rows = checkpoint.rows_emitted,
                        error = %error,
                        "Retrying failed split from its checkpoint"
                    );
                    self.summary.split_retries += 1;
                    let _ = self.arena.lock().set_state(split_id, SplitState::Pending);
                    match self.arena.lock().get(split_id) {
                        Ok(split) => self.queue.push_back(WorkItem {
                            split,
                            checkpoint: Some(checkpoint),
                        }),
                        Err(e) => error!(split_id = %split_id, error = %e, "Lost failed split"),
                    }
                    return;
                }

                error!(
                    split_id = %split_id,
                    attempts = attempts,
                    error = %error,
                    "Split failed permanently"
                );
                let _ = self.arena.lock().set_state(split_id, SplitState::Failed);
                self.outbox.push_back(ReadEvent::SplitFailed {
                    split_id,
                    error: error.to_string(),
                });
                self.failures.push(SplitFailure {
                    split_id: split_id.to_string(),
                    attempts,
                    checkpoint: Some(checkpoint),
                    message: error.to_string(),
                });
            }
        }
    }

    async fn resplit(&mut self, split_id: SplitId, desired: u32) -> Result<Vec<Arc<Split>>> {
        let split = self.arena.lock().get(split_id)?;
        if !split.is_subdividable() {
            return Err(Error::split(format!(
                "split {} is not subdividable",
                split_id
            )));
        }

        let checkpoint = if let Some(control) = self.running.remove(&split_id) {
            let (reply_tx, reply_rx) = oneshot::channel();
            if control.send(Control::Suspend(reply_tx)).await.is_err() {
                return Err(Error::split(format!("split {} is no longer running", split_id)));
            }
            match reply_rx.await {
                Ok(checkpoint) => checkpoint,
                Err(_) => {
                    return Err(Error::split(format!(
                        "split {} finished before it could be suspended",
                        split_id
                    )))
                }
            }
        } else if let Some(pos) = self.queue.iter().position(|w| w.split.id() == split_id) {
            let Some(item) = self.queue.remove(pos) else {
                return Err(Error::internal("work queue changed during re-split"));
            };
            item.checkpoint.unwrap_or_else(|| Checkpoint::new(split_id))
        } else {
            let state = self.arena.lock().state(split_id)?;
            return Err(Error::split(format!(
                "split {} is {:?} and cannot be re-split",
                split_id, state
            )));
        };

        let result = {
            let mut arena = self.arena.lock();
            self.splitter
                .resplit(&mut arena, split_id, &checkpoint, desired)
        };
        match result {
            Ok(children) => {
                self.summary.splits_replaced += 1;
                self.summary.rows += checkpoint.rows_emitted;
                for child in &children {
                    self.queue.push_back(WorkItem {
                        split: Arc::clone(child),
                        checkpoint: None,
                    });
                }
                self.outbox
                    .push_back(ReadEvent::Checkpoint(checkpoint));
                self.outbox.push_back(ReadEvent::SplitReplaced {
                    split_id,
                    children: children.iter().map(|c| c.id()).collect(),
                });
                info!(
                    split_id = %split_id,
                    children = children.len(),
                    "Re-split running split"
                );
                Ok(children)
            }
            Err(e) => {
                // nothing left to divide; keep reading the split as it is
                let _ = self.arena.lock().set_state(split_id, SplitState::Pending);
                self.queue.push_front(WorkItem {
                    split,
                    checkpoint: Some(checkpoint),
                });
                Err(e)
            }
        }
    }
}

/// Await `fut` unless the worker is cancelled or asked to suspend
async fn interruptible<F: Future>(
    cancel: &CancellationToken,
    control: &mut mpsc::Receiver<Control>,
    fut: F,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        Some(Control::Suspend(reply)) = control.recv() => Err(Interrupt::Suspend(reply)),
        out = fut => Ok(out),
    }
}

fn current_checkpoint(reader: &PartitionReader, split_id: SplitId) -> Checkpoint {
    reader
        .checkpoint()
        .cloned()
        .unwrap_or_else(|| Checkpoint::new(split_id))
}

/// Stop the reader and report `delivered`, the checkpoint of the last row
/// the consumer actually received
fn interrupted(
    reader: &mut PartitionReader,
    split_id: SplitId,
    interrupt: Interrupt,
    delivered: Checkpoint,
) -> WorkerOutcome {
    let _ = reader.suspend();
    match interrupt {
        Interrupt::Suspend(reply) => {
            let _ = reply.send(delivered);
            WorkerOutcome::Suspended { split_id }
        }
        Interrupt::Cancelled => WorkerOutcome::Cancelled {
            split_id,
            checkpoint: delivered,
        },
    }
}

async fn read_split(
    ctx: WorkerContext,
    item: WorkItem,
    mut control: mpsc::Receiver<Control>,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let split_id = item.split.id();
    let initial = item
        .checkpoint
        .clone()
        .unwrap_or_else(|| Checkpoint::new(split_id));
    let mut reader = PartitionReader::new(
        ctx.pool.clone(),
        Arc::clone(&ctx.dialect),
        Arc::clone(&ctx.base_sql),
        Arc::clone(&ctx.schema),
        ctx.retry.clone(),
    )
    .with_stats(Arc::clone(&ctx.stats));

    match interruptible(
        &cancel,
        &mut control,
        reader.start(Arc::clone(&item.split), item.checkpoint),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            return WorkerOutcome::Failed {
                split_id,
                checkpoint: reader.checkpoint().cloned().unwrap_or(initial),
                error,
            }
        }
        Err(interrupt) => return interrupted(&mut reader, split_id, interrupt, initial),
    }

    let mut since_checkpoint = 0u64;
    loop {
        let delivered = current_checkpoint(&reader, split_id);
        let pulled = match interruptible(&cancel, &mut control, reader.pull()).await {
            Ok(pulled) => pulled,
            Err(interrupt) => return interrupted(&mut reader, split_id, interrupt, delivered),
        };

        match pulled {
            Ok(ReadItem::Row(record)) => {
                let event = ReadEvent::Row { split_id, record };
                match interruptible(&cancel, &mut control, ctx.events.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return interrupted(&mut reader, split_id, Interrupt::Cancelled, delivered)
                    }
                    Err(interrupt) => {
                        return interrupted(&mut reader, split_id, interrupt, delivered)
                    }
                }

                since_checkpoint += 1;
                if since_checkpoint >= ctx.checkpoint_interval {
                    since_checkpoint = 0;
                    let checkpoint = current_checkpoint(&reader, split_id);
                    let event = ReadEvent::Checkpoint(checkpoint.clone());
                    match interruptible(&cancel, &mut control, ctx.events.send(event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            return interrupted(
                                &mut reader,
                                split_id,
                                Interrupt::Cancelled,
                                checkpoint,
                            )
                        }
                        Err(interrupt) => {
                            return interrupted(&mut reader, split_id, interrupt, checkpoint)
                        }
                    }
                }
            }
            Ok(ReadItem::EndOfSplit) => {
                let checkpoint = current_checkpoint(&reader, split_id);
                let _ = interruptible(
                    &cancel,
                    &mut control,
                    ctx.events.send(ReadEvent::Checkpoint(checkpoint.clone())),
                )
                .await;
                return WorkerOutcome::Completed {
                    split_id,
                    rows: checkpoint.rows_emitted,
                };
            }
            Err(error) => {
                return WorkerOutcome::Failed {
                    split_id,
                    checkpoint: current_checkpoint(&reader, split_id),
                    error,
                }
            }
        }
    }
}

/// Handle to a running query read.
///
/// Yields [`ReadEvent`]s as a [`Stream`]; the stream ends when every split
/// has finished. Call [`ReadHandle::join`] afterwards for the outcome.
pub struct ReadHandle {
    query_id: Uuid,
    events: mpsc::Receiver<ReadEvent>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    arena: SharedArena,
    stats: Arc<AtomicReaderStats>,
    coordinator: JoinHandle<Result<ReadSummary>>,
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("query_id", &self.query_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ReadHandle {
    /// Query id
    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    /// Next event, `None` once every split has finished
    pub async fn next_event(&mut self) -> Option<ReadEvent> {
        self.events.recv().await
    }

    /// Suspend `split_id`, re-split its unconsumed remainder into up to
    /// `desired` children and schedule them
    pub async fn request_split(&self, split_id: SplitId, desired: u32) -> Result<Vec<Arc<Split>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Resplit {
                split_id,
                desired,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::split("query read has already finished"))?;
        reply_rx
            .await
            .map_err(|_| Error::split("query read has already finished"))?
    }

    /// Cancel every worker; checkpoints stay at the last delivered row
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// All splits of the query and their states
    pub fn splits(&self) -> Vec<(Arc<Split>, SplitState)> {
        self.arena
            .lock()
            .splits()
            .map(|(split, state)| (Arc::clone(split), state))
            .collect()
    }

    /// Reader statistics
    pub fn stats(&self) -> ReaderStats {
        self.stats.snapshot()
    }

    /// Wait for the read to finish. Events not yet consumed are discarded.
    ///
    /// Fails with [`Error::QueryFailed`] when any split failed permanently
    /// and with [`Error::Cancelled`] after [`ReadHandle::cancel`].
    pub async fn join(mut self) -> Result<ReadSummary> {
        while self.events.recv().await.is_some() {}
        self.coordinator
            .await
            .map_err(|e| Error::internal(format!("coordinator task failed: {}", e)))?
    }

    /// Event stream that owns the handle
    pub fn into_stream(self) -> impl Stream<Item = ReadEvent> + Send + 'static {
        futures::stream::unfold(self, |mut handle| async move {
            handle.events.recv().await.map(|event| (event, handle))
        })
    }
}

impl Stream for ReadHandle {
    type Item = ReadEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ReadEvent>> {
        self.get_mut().events.poll_recv(cx)
    }
}
