//! Query descriptors: what to read and how to partition it

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::Schema;
use crate::dialect::{strip_statement, SqlDialect};
use crate::error::{Error, Result};
use crate::security::{validate_order_by, validate_query_text, validate_sql_identifier};
use crate::split::KeyKind;
use crate::types::Value;

/// Default number of rows sampled for schema inference
pub const DEFAULT_SAMPLE_ROWS: usize = 10;

/// How partition boundaries are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum BoundStrategy {
    /// Equal-width ranges between the key's minimum and maximum
    #[default]
    MinMax,
    /// Ranges cut at evenly spaced row offsets of the sorted key
    Percentile,
}

/// Where the record schema comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaSource {
    /// Caller-provided schema
    Explicit(Arc<Schema>),
    /// Inferred from the first `sample_rows` rows of the query
    Infer {
        /// Rows to sample
        sample_rows: usize,
    },
}

impl Default for SchemaSource {
    fn default() -> Self {
        Self::Infer {
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }
}

/// Base relation of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// Arbitrary single SELECT statement
    Sql(String),
    /// Whole table, read as `SELECT * FROM table`
    Table {
        /// Optional schema
        schema: Option<String>,
        /// Table name
        table: String,
    },
}

/// Immutable description of a query to split and read
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    id: Uuid,
    source: QuerySource,
    partition_column: Option<String>,
    bounds: Option<(Value, Value)>,
    num_partitions: Option<u32>,
    strategy: BoundStrategy,
    order_by: Option<String>,
    schema: SchemaSource,
}

impl QueryDescriptor {
    fn with_source(source: QuerySource) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            partition_column: None,
            bounds: None,
            num_partitions: None,
            strategy: BoundStrategy::default(),
            order_by: None,
            schema: SchemaSource::default(),
        }
    }

    /// Describe an arbitrary SELECT statement
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::with_source(QuerySource::Sql(sql.into()))
    }

    /// Describe a whole table
    pub fn table(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self::with_source(QuerySource::Table {
            schema: schema.map(str::to_string),
            table: table.into(),
        })
    }

    /// Use a fixed query id (e.g. when re-planning a persisted query)
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Partition on `column`; it must be a column of the result set
    pub fn with_partition_column(mut self, column: impl Into<String>) -> Self {
        self.partition_column = Some(column.into());
        self
    }

    /// Inclusive key bounds to partition between instead of the observed
    /// minimum and maximum. The bounds only place the split boundaries;
    /// rows outside them are read by the first and last splits.
    pub fn with_bounds(mut self, lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        self.bounds = Some((lower.into(), upper.into()));
        self
    }

    /// Fixed partition count, overriding the target split size
    pub fn with_num_partitions(mut self, n: u32) -> Self {
        self.num_partitions = Some(n);
        self
    }

    /// Partition boundary strategy
    pub fn with_strategy(mut self, strategy: BoundStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// ORDER BY list for offset windows when no partition column is set
    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// Use an explicit record schema
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = SchemaSource::Explicit(Arc::new(schema));
        self
    }

    /// Infer the record schema from `sample_rows` rows
    pub fn with_inferred_schema(mut self, sample_rows: usize) -> Self {
        self.schema = SchemaSource::Infer { sample_rows };
        self
    }

    /// Query id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Base relation
    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    /// Partition column
    pub fn partition_column(&self) -> Option<&str> {
        self.partition_column.as_deref()
    }

    /// Explicit key bounds
    pub fn bounds(&self) -> Option<(&Value, &Value)> {
        self.bounds.as_ref().map(|(l, u)| (l, u))
    }

    /// Explicit partition count
    pub fn num_partitions(&self) -> Option<u32> {
        self.num_partitions
    }

    /// Partition boundary strategy
    pub fn strategy(&self) -> BoundStrategy {
        self.strategy
    }

    /// ORDER BY list for offset windows
    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    /// Schema source
    pub fn schema_source(&self) -> &SchemaSource {
        &self.schema
    }

    /// Table reference for table descriptors
    pub fn table_ref(&self) -> Option<(Option<&str>, &str)> {
        match &self.source {
            QuerySource::Table { schema, table } => Some((schema.as_deref(), table.as_str())),
            QuerySource::Sql(_) => None,
        }
    }

    /// Base SQL the split queries are layered on
    pub fn base_sql(&self, dialect: &dyn SqlDialect) -> String {
        match &self.source {
            QuerySource::Sql(sql) => strip_statement(sql).to_string(),
            QuerySource::Table { schema, table } => format!(
                "SELECT * FROM {}",
                dialect.qualified_table(schema.as_deref(), table)
            ),
        }
    }

    /// Explicit bounds mapped into the key's integer domain
    pub fn domain_bounds(&self) -> Result<Option<(KeyKind, i64, i64)>> {
        let Some((lower, upper)) = &self.bounds else {
            return Ok(None);
        };
        let kind = KeyKind::of_value(lower).ok_or_else(|| {
            Error::config(format!(
                "partition bounds of type {} are not supported",
                lower.sql_type()
            ))
        })?;
        match (kind.to_domain(lower), kind.to_domain(upper)) {
            (Some(l), Some(u)) if l <= u => Ok(Some((kind, l, u))),
            (Some(_), Some(_)) => Err(Error::config("lower partition bound exceeds upper bound")),
            _ => Err(Error::config(format!(
                "partition bounds must have the same type (got {} and {})",
                lower.sql_type(),
                upper.sql_type()
            ))),
        }
    }

    /// Validate the descriptor before planning
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            QuerySource::Sql(sql) => validate_query_text(sql)?,
            QuerySource::Table { schema, table } => {
                if let Some(s) = schema {
                    validate_sql_identifier(s)?;
                }
                validate_sql_identifier(table)?;
            }
        }
        if let Some(col) = &self.partition_column {
            validate_sql_identifier(col)?;
        }
        if let Some(order_by) = &self.order_by {
            validate_order_by(order_by)?;
        }
        if self.bounds.is_some() && self.partition_column.is_none() {
            return Err(Error::config("partition bounds require a partition column"));
        }
        self.domain_bounds()?;
        if self.num_partitions == Some(0) {
            return Err(Error::config("num_partitions must be at least 1"));
        }
        match &self.schema {
            SchemaSource::Infer { sample_rows: 0 } => {
                Err(Error::config("schema inference needs at least one sample row"))
            }
            _ => Ok(()),
        }
    }
}
