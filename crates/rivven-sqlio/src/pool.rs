//! Connection Provider for rivven-sqlio
//!
//! Pooled, lazily-established connections handed out as scoped leases:
//! - Bounded pool size enforced by a semaphore; acquisition waits at most
//!   `acquire_timeout` and then fails with [`Error::PoolExhausted`]
//! - Idle connections are probed with [`Connection::is_valid`] before reuse
//!   and discarded when the probe fails or they outlived their lifetime
//! - A [`ConnectionLease`] returns its connection on drop, synchronously, so
//!   the slot is freed on every exit path including cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlio::prelude::*;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(8),
//!     Arc::new(PgConnectionFactory),
//! ).await?;
//!
//! let lease = pool.acquire().await?;
//! lease.conn()?.execute("SELECT 1", &[]).await?;
//! // Connection is returned to the pool when `lease` is dropped
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Connections opened eagerly by [`ConnectionPool::new`]
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of acquisitions that reused an idle connection
    pub reused: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

impl PoolStats {
    /// Fraction of acquisitions served by an idle connection
    pub fn reuse_rate(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.reused as f64 / self.acquisitions as f64
        }
    }
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub reused: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64, reused: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
        }
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Internal pool entry with metadata
struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO)
    idle: Mutex<Vec<PoolEntry>>,
    /// One permit per connection slot
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

impl PoolInner {
    fn is_expired(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    fn forget_connection(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
    }

    /// Return a leased connection. Runs in `Drop`, so it must not await.
    fn give_back(&self, mut entry: PoolEntry, discard: bool) {
        if discard || self.closed.load(Ordering::Acquire) {
            self.forget_connection();
            return;
        }
        entry.last_used = Instant::now();
        self.idle.lock().push(entry);
    }

    async fn connect(&self) -> Result<PoolEntry> {
        let connect_timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);
        let conn = match tokio::time::timeout(
            connect_timeout,
            self.factory.connect(&self.config.connection),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::connection(format!(
                    "timed out connecting after {}ms",
                    connect_timeout.as_millis()
                )))
            }
        };
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        self.stats.record_created();
        let now = Instant::now();
        Ok(PoolEntry {
            conn,
            created_at: now,
            last_used: now,
        })
    }
}

/// A bounded pool of lazily-established connections.
///
/// Cloning is cheap; clones share the same slots and idle list.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("size", &self.size())
            .field("idle", &self.idle())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool and open `min_size` connections eagerly.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let pool = Self::lazy(config, factory)?;

        for _ in 0..pool.inner.config.min_size {
            match pool.inner.connect().await {
                Ok(entry) => pool.inner.idle.lock().push(entry),
                Err(e) => {
                    warn!(error = %e, "Failed to pre-open pooled connection");
                    break;
                }
            }
        }

        Ok(pool)
    }

    /// Create a pool that opens connections only on demand.
    pub fn lazy(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                config,
                factory,
                total_connections: AtomicUsize::new(0),
                stats: AtomicPoolStats::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Check out a connection.
    ///
    /// Waits at most `acquire_timeout` for a free slot. Reuses an idle
    /// connection when one passes validation, otherwise opens a new one.
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::connection("pool is closed"));
        }

        let start = Instant::now();
        let permit = match tokio::time::timeout(
            inner.config.acquire_timeout,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::connection("pool is closed")),
            Err(_) => {
                inner.stats.record_exhausted();
                return Err(Error::PoolExhausted {
                    message: format!(
                        "no connection available within {}ms",
                        inner.config.acquire_timeout.as_millis()
                    ),
                });
            }
        };

        let mut reused = None;
        loop {
            // Pop under the lock, probe outside of it.
            let candidate = inner.idle.lock().pop();
            let Some(entry) = candidate else { break };

            if inner.is_expired(&entry) {
                debug!("Recycling expired pooled connection");
                let _ = entry.conn.close().await;
                inner.forget_connection();
                continue;
            }
            if inner.config.test_on_borrow && !entry.conn.is_valid().await {
                warn!("Discarding pooled connection that failed validation");
                inner.stats.record_health_check_failure();
                inner.forget_connection();
                continue;
            }
            reused = Some(entry);
            break;
        }

        let was_reused = reused.is_some();
        let entry = match reused {
            Some(entry) => entry,
            // On failure the permit drops here and frees the slot.
            None => inner.connect().await?,
        };

        inner
            .stats
            .record_acquisition(start.elapsed().as_millis() as u64, was_reused);

        Ok(ConnectionLease {
            entry: Some(entry),
            permit: Some(permit),
            pool: Arc::clone(inner),
            discard: false,
        })
    }

    /// Current number of open connections (idle + leased)
    pub fn size(&self) -> usize {
        self.inner.total_connections.load(Ordering::Acquire)
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of leased connections
    pub fn in_use(&self) -> usize {
        self.inner.config.max_size - self.inner.semaphore.available_permits()
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Database type of the underlying factory
    pub fn database_type(&self) -> DatabaseType {
        self.inner.factory.database_type()
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close idle connections and refuse new acquisitions.
    ///
    /// Outstanding leases stay usable; their connections are dropped on release.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();

        let drained: Vec<PoolEntry> = std::mem::take(&mut *self.inner.idle.lock());
        for entry in drained {
            let _ = entry.conn.close().await;
            self.inner.forget_connection();
        }
    }
}

/// A pooled connection checked out for one unit of work.
///
/// The connection goes back to the pool when the lease is dropped or
/// [`release`](Self::release)d, whichever comes first.
pub struct ConnectionLease {
    entry: Option<PoolEntry>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    discard: bool,
}

impl ConnectionLease {
    /// Borrow the leased connection.
    pub fn conn(&self) -> Result<&dyn Connection> {
        self.entry
            .as_ref()
            .map(|e| e.conn.as_ref())
            .ok_or_else(|| Error::connection("lease already released"))
    }

    /// Mark the connection as broken so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Whether the lease still holds its connection
    pub fn is_held(&self) -> bool {
        self.entry.is_some()
    }

    /// Return the connection to the pool. Idempotent.
    pub fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.give_back(entry, self.discard);
        }
        // Slot is freed only after the connection is back in the idle list.
        self.permit.take();
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("held", &self.is_held())
            .field("discard", &self.discard)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release();
    }
}
