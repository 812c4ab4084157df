//! Configuration surface for rivven-sqlio
//!
//! Every field is optional when deserializing; defaults follow the values
//! documented on each field. Call [`SqlioConfig::validate_all`] before use.
//!
//! ```
//! use rivven_sqlio::config::SqlioConfig;
//!
//! let config: SqlioConfig = serde_json::from_str(r#"{
//!     "parallelism": 8,
//!     "batch": { "max_rows": 500 },
//!     "upsert_key": ["id"]
//! }"#).unwrap();
//!
//! assert_eq!(config.parallelism, 8);
//! assert_eq!(config.target_split_size, 100_000);
//! assert_eq!(config.batch.max_rows, 500);
//! assert!(config.validate_all().is_ok());
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::sink::BatchConfig;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SqlioConfig {
    /// Target rows per split (default: 100000)
    #[serde(default = "default_target_split_size")]
    #[validate(range(min = 1))]
    pub target_split_size: u64,

    /// Concurrent partition readers (default: 4)
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 1024))]
    pub parallelism: u32,

    /// Rows between checkpoint events per split (default: 1000)
    #[serde(default = "default_checkpoint_interval")]
    #[validate(range(min = 1))]
    pub checkpoint_interval: u64,

    /// Attempts per split before it is reported failed (default: 3)
    #[serde(default = "default_max_split_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_split_attempts: u32,

    /// Time budget for range estimation in milliseconds (default: 30000)
    #[serde(default = "default_estimate_timeout_ms")]
    #[validate(range(min = 1))]
    pub estimate_timeout_ms: u64,

    /// Connection pool settings
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,

    /// Batch writer settings
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchSettings,

    /// Retry settings shared by readers and writers
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Upsert key columns of the write target
    #[serde(default)]
    pub upsert_key: Vec<String>,
}

fn default_target_split_size() -> u64 {
    100_000
}

fn default_parallelism() -> u32 {
    4
}

fn default_checkpoint_interval() -> u64 {
    1000
}

fn default_max_split_attempts() -> u32 {
    3
}

fn default_estimate_timeout_ms() -> u64 {
    30_000
}

impl Default for SqlioConfig {
    fn default() -> Self {
        Self {
            target_split_size: default_target_split_size(),
            parallelism: default_parallelism(),
            checkpoint_interval: default_checkpoint_interval(),
            max_split_attempts: default_max_split_attempts(),
            estimate_timeout_ms: default_estimate_timeout_ms(),
            pool: PoolSettings::default(),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            upsert_key: Vec::new(),
        }
    }
}

impl SqlioConfig {
    /// Range estimation budget
    pub fn estimate_timeout(&self) -> Duration {
        Duration::from_millis(self.estimate_timeout_ms)
    }

    /// Field validation plus cross-field checks
    pub fn validate_all(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;
        if self.pool.min_size > self.pool.max_size {
            return Err(Error::config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms",
            ));
        }
        for column in &self.upsert_key {
            crate::security::validate_sql_identifier(column)?;
        }
        Ok(())
    }

    /// Retry policy for readers and writers
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    /// Runtime batch configuration
    pub fn batch_config(&self) -> BatchConfig {
        self.batch.to_batch_config(self.retry_policy())
    }

    /// Runtime orchestrator configuration
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_parallelism(self.parallelism as usize)
            .with_checkpoint_interval(self.checkpoint_interval)
            .with_max_split_attempts(self.max_split_attempts)
            .with_retry(self.retry_policy())
    }

    /// Runtime pool configuration for `url`
    pub fn pool_config(&self, url: impl Into<String>) -> PoolConfig {
        self.pool.to_pool_config(url)
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct PoolSettings {
    /// Maximum open connections (default: 10)
    #[serde(default = "default_max_size")]
    #[validate(range(min = 1, max = 1024))]
    pub max_size: u32,

    /// Connections opened eagerly (default: 0)
    #[serde(default)]
    pub min_size: u32,

    /// Maximum wait for a connection in milliseconds (default: 30000)
    #[serde(default = "default_acquire_timeout_ms")]
    #[validate(range(min = 1))]
    pub acquire_timeout_ms: u64,

    /// Maximum connection lifetime in seconds (default: 1800)
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Idle timeout in seconds (default: 600)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Probe idle connections before reuse (default: true)
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
}

fn default_max_size() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_size: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_lifetime_secs: default_max_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            test_on_borrow: true,
        }
    }
}

impl PoolSettings {
    /// Runtime pool configuration for `url`
    pub fn to_pool_config(&self, url: impl Into<String>) -> PoolConfig {
        PoolConfig::new(url)
            .with_max_size(self.max_size as usize)
            .with_min_size(self.min_size as usize)
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .with_max_lifetime(Duration::from_secs(self.max_lifetime_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_test_on_borrow(self.test_on_borrow)
    }
}

/// Batch writer settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct BatchSettings {
    /// Rows per batch (default: 1000)
    #[serde(default = "default_max_rows")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_rows: usize,

    /// Approximate bytes per batch (default: 16 MiB)
    #[serde(default = "default_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: usize,

    /// Flush a partial batch after this many milliseconds (default: 1000)
    #[serde(default = "default_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl BatchSettings {
    /// Runtime batch configuration
    pub fn to_batch_config(&self, retry: RetryPolicy) -> BatchConfig {
        BatchConfig::default()
            .with_max_rows(self.max_rows)
            .with_max_bytes(self.max_bytes)
            .with_flush_interval(Duration::from_millis(self.flush_interval_ms))
            .with_retry(retry)
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct RetrySettings {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    /// First backoff in milliseconds (default: 100)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds (default: 10000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor (default: 2.0)
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    /// Jitter fraction (default: 0.1)
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    /// Runtime retry policy
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: SqlioConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.target_split_size, 100_000);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.checkpoint_interval, 1000);
        assert_eq!(config.max_split_attempts, 3);
        assert_eq!(config.estimate_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.max_size, 10);
        assert!(config.pool.test_on_borrow);
        assert_eq!(config.batch.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.retry.max_backoff_ms, 10_000);
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn test_range_validation() {
        let mut config = SqlioConfig::default();
        config.parallelism = 0;
        assert!(config.validate_all().is_err());

        let mut config = SqlioConfig::default();
        config.batch.max_rows = 0;
        assert!(config.validate_all().is_err());

        let mut config = SqlioConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_cross_field_validation() {
        let mut config = SqlioConfig::default();
        config.pool.min_size = 20;
        assert!(config.validate_all().is_err());

        let mut config = SqlioConfig::default();
        config.retry.initial_backoff_ms = 20_000;
        assert!(config.validate_all().is_err());

        let mut config = SqlioConfig::default();
        config.upsert_key = vec!["id; --".into()];
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_runtime_conversions() {
        let config = SqlioConfig::default();
        let pool = config.pool_config("postgres://localhost/db");
        assert_eq!(pool.max_size, 10);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(30));

        let batch = config.batch_config();
        assert_eq!(batch.max_rows, 1000);
        assert_eq!(batch.flush_interval, Duration::from_secs(1));
        assert_eq!(batch.retry.max_retries, 3);
    }

    #[test]
    fn test_json_schema_is_generated() {
        let schema = schemars::schema_for!(SqlioConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("target_split_size"));
    }
}
