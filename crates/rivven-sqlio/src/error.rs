//! Error types for rivven-sqlio
//!
//! Errors are classified so that retries happen at the smallest correct unit:
//! - Retriable errors (connection, timeout, deadlock, pool exhaustion) are
//!   retried by the partition reader (one split) or the batch writer (one batch)
//! - Non-retriable errors (bad SQL, unsupported types, conversion failures)
//!   surface immediately
//! - Per-unit failures are wrapped in [`Error::PartitionRead`] and
//!   [`Error::Write`] once their retry budget is exhausted

use std::fmt;
use thiserror::Error;

use crate::checkpoint::Checkpoint;

/// Result type for rivven-sqlio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Column type the codec cannot represent (not retriable)
    UnsupportedType,
    /// Timeout errors (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Authentication failure
    Authentication,
    /// Configuration error
    Configuration,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Illegal split plan or re-split request
    Split,
    /// A split read exhausted its retries
    PartitionRead,
    /// A batch commit exhausted its retries
    Write,
    /// Operation cancelled
    Cancelled,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::PoolExhausted
        )
    }
}

/// A split that failed permanently while reading a query
#[derive(Debug, Clone, PartialEq)]
pub struct SplitFailure {
    /// Failed split id (`<query>/<ordinal>`)
    pub split_id: String,
    /// Number of times the split was attempted
    pub attempts: u32,
    /// Last checkpoint reached before the failure
    pub checkpoint: Option<Checkpoint>,
    /// Error message of the final attempt
    pub message: String,
}

impl fmt::Display for SplitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.split_id, self.attempts, self.message
        )
    }
}

/// Main error type for rivven-sqlio
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or the pool is closed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {constraint_name} - {message}")]
    Constraint {
        constraint_name: String,
        message: String,
    },

    /// Value does not fit the declared column type
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Column type with no codec mapping
    #[error("unsupported type '{type_name}' for column '{column}'")]
    UnsupportedType { column: String, type_name: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// No pooled connection became available within the acquire timeout
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Schema error (missing column, arity mismatch)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Illegal plan or re-split request
    #[error("split error: {message}")]
    Split { message: String },

    /// A split read failed after exhausting its retries
    #[error("partition read failed for split {split_id} after {attempts} attempt(s): {source}")]
    PartitionRead {
        split_id: String,
        checkpoint: Option<Checkpoint>,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A batch commit failed after exhausting its retries
    #[error("write of batch {sequence} failed after {attempts} attempt(s): {source}")]
    Write {
        sequence: u64,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A previous batch failed and is still pending
    #[error("batch {sequence} is pending after a failed commit")]
    BatchPending { sequence: u64 },

    /// One or more splits of a query failed permanently
    #[error("query failed: {} split(s) failed permanently", .failures.len())]
    QueryFailed { failures: Vec<SplitFailure> },

    /// Checkpoint or config (de)serialization failed
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::UnsupportedType { .. } => ErrorCategory::UnsupportedType,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Schema { .. } => ErrorCategory::Query,
            Self::Split { .. } => ErrorCategory::Split,
            Self::PartitionRead { .. } => ErrorCategory::PartitionRead,
            Self::Write { .. } | Self::BatchPending { .. } => ErrorCategory::Write,
            Self::QueryFailed { .. } => ErrorCategory::PartitionRead,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Serialization { .. } | Self::Unsupported { .. } | Self::Internal { .. } => {
                ErrorCategory::Other
            }
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error belongs to the connection class
    /// (I/O failure, pool exhaustion, authentication)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::PoolExhausted { .. } | Self::Authentication { .. }
        )
    }

    /// Innermost error, unwrapping `PartitionRead` and `Write`
    pub fn root(&self) -> &Error {
        match self {
            Self::PartitionRead { source, .. } | Self::Write { source, .. } => source.root(),
            other => other,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create an unsupported type error
    pub fn unsupported_type(column: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            column: column.into(),
            type_name: type_name.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a split error
    pub fn split(message: impl Into<String>) -> Self {
        Self::Split {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::UnsupportedType => write!(f, "unsupported_type"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Authentication => write!(f, "authentication"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Split => write!(f, "split"),
            Self::PartitionRead => write!(f, "partition_read"),
            Self::Write => write!(f, "write"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::Deadlock.is_retriable());
        assert!(ErrorCategory::PoolExhausted.is_retriable());

        assert!(!ErrorCategory::UnsupportedType.is_retriable());
        assert!(!ErrorCategory::TypeConversion.is_retriable());
        assert!(!ErrorCategory::Query.is_retriable());
        assert!(!ErrorCategory::PartitionRead.is_retriable());
    }

    #[test]
    fn test_wrapped_errors_are_not_retriable() {
        let err = Error::PartitionRead {
            split_id: "q/1".into(),
            checkpoint: None,
            attempts: 4,
            source: Box::new(Error::connection("reset")),
        };
        assert!(!err.is_retriable());
        assert!(err.root().is_retriable());
        assert!(err.to_string().contains("q/1"));
    }

    #[test]
    fn test_connection_class() {
        assert!(Error::connection("refused").is_connection_error());
        assert!(Error::PoolExhausted {
            message: "timeout".into()
        }
        .is_connection_error());
        assert!(Error::Authentication {
            message: "bad password".into()
        }
        .is_connection_error());
        assert!(!Error::timeout("slow").is_connection_error());
    }

    #[test]
    fn test_query_failed_display() {
        let err = Error::QueryFailed {
            failures: vec![SplitFailure {
                split_id: "q/2".into(),
                attempts: 3,
                checkpoint: None,
                message: "boom".into(),
            }],
        };
        assert!(err.to_string().contains("1 split(s)"));
    }
}
