//! PostgreSQL backend for rivven-sqlio
//!
//! Provides:
//! - Connections over tokio-postgres with parameter binding driven by the
//!   prepared statement's parameter types
//! - Incremental row streaming for partition readers
//! - Transactions for batch commits, with statements prepared once per batch
//! - Error classification (connection loss, deadlocks and serialization
//!   failures are retriable, constraint violations are not)

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, RowStream, Transaction,
};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type Param = Box<dyn ToSql + Sync + Send>;

/// Typed NULL accepted by a parameter of type `ty`
fn null_for(ty: &Type) -> Param {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::NUMERIC => Box::new(None::<rust_decimal::Decimal>),
        Type::BYTEA => Box::new(None::<Vec<u8>>),
        Type::DATE => Box::new(None::<chrono::NaiveDate>),
        Type::TIME => Box::new(None::<chrono::NaiveTime>),
        Type::TIMESTAMP => Box::new(None::<chrono::NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<chrono::DateTime<chrono::Utc>>),
        Type::UUID => Box::new(None::<uuid::Uuid>),
        Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
        _ => Box::new(None::<String>),
    }
}

fn out_of_range(value: impl std::fmt::Display, ty: &Type) -> Error {
    Error::type_conversion(format!("{} is out of range for {}", value, ty.name()))
}

/// Integer parameter narrowed or widened to the column type
fn int_param(n: i64, ty: &Type) -> Result<Param> {
    let param: Param = match *ty {
        Type::INT2 => Box::new(i16::try_from(n).map_err(|_| out_of_range(n, ty))?),
        Type::INT4 => Box::new(i32::try_from(n).map_err(|_| out_of_range(n, ty))?),
        Type::FLOAT4 => Box::new(n as f32),
        Type::FLOAT8 => Box::new(n as f64),
        Type::NUMERIC => Box::new(rust_decimal::Decimal::from(n)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => Box::new(n.to_string()),
        _ => Box::new(n),
    };
    Ok(param)
}

fn float_param(n: f64, ty: &Type) -> Result<Param> {
    let param: Param = match *ty {
        Type::FLOAT4 => Box::new(n as f32),
        Type::NUMERIC => Box::new(
            rust_decimal::Decimal::try_from(n).map_err(|_| out_of_range(n, ty))?,
        ),
        _ => Box::new(n),
    };
    Ok(param)
}

/// Convert a value to a parameter bound against `ty`
fn value_to_sql(value: &Value, ty: &Type) -> Result<Param> {
    let param: Param = match value {
        Value::Null => null_for(ty),
        Value::Bool(b) => Box::new(*b),
        Value::Int8(n) => int_param(i64::from(*n), ty)?,
        Value::Int16(n) => int_param(i64::from(*n), ty)?,
        Value::Int32(n) => int_param(i64::from(*n), ty)?,
        Value::Int64(n) => int_param(*n, ty)?,
        Value::Float32(n) => float_param(f64::from(*n), ty)?,
        Value::Float64(n) => float_param(*n, ty)?,
        Value::Decimal(d) => match *ty {
            Type::FLOAT8 | Type::FLOAT4 => {
                use rust_decimal::prelude::ToPrimitive;
                float_param(d.to_f64().ok_or_else(|| out_of_range(d, ty))?, ty)?
            }
            _ => Box::new(*d),
        },
        Value::String(s) => match *ty {
            Type::UUID => Box::new(
                uuid::Uuid::parse_str(s)
                    .map_err(|e| Error::type_conversion(format!("invalid uuid '{}': {}", s, e)))?,
            ),
            Type::JSON | Type::JSONB => Box::new(serde_json::Value::String(s.clone())),
            _ => Box::new(s.clone()),
        },
        Value::Bytes(b) | Value::Geometry(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => match *ty {
            Type::TEXT | Type::VARCHAR | Type::BPCHAR => Box::new(u.to_string()),
            _ => Box::new(*u),
        },
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(arr) => Box::new(
            serde_json::to_value(arr).map_err(|e| Error::serialization(e.to_string()))?,
        ),
        Value::Interval(_) => return Err(Error::unsupported_type("parameter", "INTERVAL")),
    };
    Ok(param)
}

/// Bind `params` against the parameter types of a prepared statement
fn bind(statement: &tokio_postgres::Statement, params: &[Value], sql: &str) -> Result<Vec<Param>> {
    let types = statement.params();
    if types.len() != params.len() {
        return Err(Error::query_with_sql(
            format!(
                "statement expects {} parameter(s), got {}",
                types.len(),
                params.len()
            ),
            sql,
        ));
    }
    params
        .iter()
        .zip(types)
        .map(|(value, ty)| value_to_sql(value, ty))
        .collect()
}

fn refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Classify a driver error
fn map_pg_error(e: tokio_postgres::Error, sql: Option<&str>) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    let Some(db) = e.as_db_error() else {
        let io = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
        if io {
            return Error::connection_with_source("I/O error", e);
        }
        return Error::Query {
            message: e.to_string(),
            sql: sql.map(str::to_string),
            source: Some(Box::new(e)),
        };
    };

    let code = db.code().code().to_string();
    let message = db.message().to_string();
    let constraint = db.constraint().map(str::to_string);
    match code.as_str() {
        // deadlock_detected, serialization_failure
        "40P01" | "40001" => Error::Deadlock,
        // query_canceled (statement_timeout)
        "57014" => Error::timeout(message),
        c if c.starts_with("08") || c.starts_with("57P") => Error::connection(message),
        c if c.starts_with("23") => Error::Constraint {
            constraint_name: constraint.unwrap_or_else(|| c.to_string()),
            message,
        },
        c if c.starts_with("28") => Error::Authentication { message },
        _ => Error::Query {
            message,
            sql: sql.map(str::to_string),
            source: Some(Box::new(e)),
        },
    }
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize, f: impl FnOnce(T) -> Value) -> Result<Value>
where
    T: FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map_or(Value::Null, f))
        .map_err(|e| Error::type_conversion(format!("column {}: {}", idx, e)))
}

/// Convert a PostgreSQL value to a driver value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    match *ty {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::CHAR => get(row, idx, Value::Int8),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::OID => get(row, idx, |v: u32| Value::Int64(i64::from(v))),
        Type::FLOAT4 => get(row, idx, Value::Float32),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get(row, idx, Value::String)
        }
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        Type::INT4_ARRAY => get(row, idx, |v: Vec<Option<i32>>| {
            Value::Array(v.into_iter().map(Value::from).collect())
        }),
        Type::INT8_ARRAY => get(row, idx, |v: Vec<Option<i64>>| {
            Value::Array(v.into_iter().map(Value::from).collect())
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get(row, idx, |v: Vec<Option<String>>| {
            Value::Array(v.into_iter().map(Value::from).collect())
        }),
        _ => {
            // enums and domains over text decode as strings; anything else is unsupported
            get(row, idx, Value::String).map_err(|_| {
                let column = row.columns()[idx].name();
                Error::unsupported_type(column, ty.name())
            })
        }
    }
}

/// Convert a tokio-postgres row to a driver row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns = pg_row.columns();
    let mut names = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        names.push(col.name().to_string());
        values.push(pg_value_to_value(pg_row, i, col.type_())?);
    }
    Ok(Row::new(names, values))
}

/// PostgreSQL connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    in_transaction: Arc<AtomicBool>,
    closed: AtomicBool,
    created_at: Instant,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            in_transaction: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    /// Time since the connection was established
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    async fn prepare(&self, sql: &str) -> Result<tokio_postgres::Statement> {
        self.client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let statement = self.prepare(sql).await?;
        let params = bind(&statement, params, sql)?;
        let pg_rows = self
            .client
            .query(&statement, &refs(&params))
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))?;
        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let statement = self.prepare(sql).await?;
        let params = bind(&statement, params, sql)?;
        self.client
            .execute(&statement, &refs(&params))
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        if self.in_transaction.swap(true, Ordering::AcqRel) {
            return Err(Error::transaction("a transaction is already open"));
        }
        if let Err(e) = self.client.batch_execute("BEGIN").await {
            self.in_transaction.store(false, Ordering::Release);
            return Err(map_pg_error(e, Some("BEGIN")));
        }
        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            in_transaction: Arc::clone(&self.in_transaction),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let statement = self.prepare(sql).await?;
        let params = bind(&statement, params, sql)?;
        let stream = self
            .client
            .query_raw(&statement, refs(&params))
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))?;
        debug!(columns = statement.columns().len(), "Opened PostgreSQL row stream");
        Ok(Box::pin(PgRowStream {
            inner: Box::pin(stream),
        }))
    }

    async fn is_valid(&self) -> bool {
        // a connection left inside a transaction is not reusable
        if self.closed.load(Ordering::Acquire)
            || self.client.is_closed()
            || self.in_transaction.load(Ordering::Acquire)
        {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.as_mut().next().await {
                Some(Ok(row)) => pg_row_to_row(&row).map(Some),
                Some(Err(e)) => Err(map_pg_error(e, None)),
                None => Ok(None),
            }
        })
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    in_transaction: Arc<AtomicBool>,
}

impl PgTransaction {
    async fn finish(&self, sql: &str) -> Result<()> {
        let result = self.client.batch_execute(sql).await;
        // the server ends the transaction on either outcome unless the connection is gone
        self.in_transaction.store(false, Ordering::Release);
        result.map_err(|e| match map_pg_error(e, Some(sql)) {
            Error::Query { message, source, .. } => Error::Transaction { message, source },
            other => other,
        })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))?;
        let params = bind(&statement, params, sql)?;
        let pg_rows = self
            .client
            .query(&statement, &refs(&params))
            .await
            .map_err(|e| map_pg_error(e, Some(sql)))?;
        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let results = self.execute_batch(&[(sql, params)]).await?;
        Ok(results.into_iter().sum())
    }

    async fn execute_batch(&self, statements: &[(&str, &[Value])]) -> Result<Vec<u64>> {
        let mut prepared: HashMap<&str, tokio_postgres::Statement> = HashMap::new();
        let mut results = Vec::with_capacity(statements.len());
        for &(sql, params) in statements {
            let statement = match prepared.get(sql) {
                Some(statement) => statement.clone(),
                None => {
                    let statement = self
                        .client
                        .prepare(sql)
                        .await
                        .map_err(|e| map_pg_error(e, Some(sql)))?;
                    prepared.insert(sql, statement.clone());
                    statement
                }
            };
            let params = bind(&statement, params, sql)?;
            let affected = self
                .client
                .execute(&statement, &refs(&params))
                .await
                .map_err(|e| map_pg_error(e, Some(sql)))?;
            results.push(affected);
        }
        Ok(results)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::config(format!("invalid url: {}", e)))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        if config.query_timeout_ms > 0 {
            let sql = format!("SET statement_timeout = {}", config.query_timeout_ms);
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| map_pg_error(e, Some(&sql)))?;
        }

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

/// Connect to a PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_params_narrow_to_column_type() {
        assert!(int_param(42, &Type::INT2).is_ok());
        assert!(int_param(i64::from(i16::MAX) + 1, &Type::INT2).is_err());
        assert!(int_param(i64::from(i32::MIN), &Type::INT4).is_ok());
        assert!(int_param(i64::MAX, &Type::INT4).is_err());
        assert!(int_param(i64::MAX, &Type::INT8).is_ok());
    }

    #[test]
    fn test_value_conversion() {
        assert!(value_to_sql(&Value::Null, &Type::INT4).is_ok());
        assert!(value_to_sql(&Value::String("hello".into()), &Type::TEXT).is_ok());
        assert!(value_to_sql(&Value::String("nope".into()), &Type::UUID).is_err());
        assert!(value_to_sql(&Value::Interval(1), &Type::INTERVAL).is_err());
    }

    #[test]
    fn test_pg_connection_factory_type() {
        let factory = PgConnectionFactory;
        assert_eq!(factory.database_type(), DatabaseType::PostgreSQL);
    }
}
