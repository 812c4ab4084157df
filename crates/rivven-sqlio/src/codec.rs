//! Row codec: database values to typed pipeline records and back
//!
//! A [`Schema`] fixes one [`SqlType`] per column. [`decode`] turns a driver
//! [`Row`] into a [`Record`] and [`encode`] goes the other way. Both are
//! exact: a value that does not fit its declared column type is an error,
//! never a silent coercion.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Column type understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    /// BOOLEAN
    Boolean,
    /// SMALLINT (16-bit)
    SmallInt,
    /// INTEGER (32-bit)
    Integer,
    /// BIGINT (64-bit)
    BigInt,
    /// REAL (32-bit float)
    Real,
    /// DOUBLE PRECISION
    Double,
    /// NUMERIC / DECIMAL with optional precision and scale
    Decimal {
        /// Total number of significant digits
        precision: Option<u32>,
        /// Digits after the decimal point
        scale: Option<u32>,
    },
    /// Character data
    Text,
    /// Binary data
    Binary,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP without time zone
    Timestamp,
    /// TIMESTAMP WITH TIME ZONE
    TimestampTz,
}

impl SqlType {
    /// Parse a vendor type name such as `int4`, `VARCHAR(255)` or
    /// `numeric(12,2)`.
    ///
    /// Unknown names are reported as [`Error::UnsupportedType`] for `column`.
    pub fn parse(column: &str, type_name: &str) -> Result<Self> {
        let normalized = type_name.trim().to_ascii_lowercase();
        let (base, args) = match normalized.find('(') {
            Some(open) => {
                let close = normalized.rfind(')').unwrap_or(normalized.len());
                let args = normalized.get(open + 1..close).unwrap_or("");
                let rest = normalized.get(close + 1..).unwrap_or("").trim();
                let head = normalized[..open].trim();
                // e.g. `timestamp(3) with time zone`
                let base = if rest.is_empty() {
                    head.to_string()
                } else {
                    format!("{} {}", head, rest)
                };
                (base, Some(args.to_string()))
            }
            None => (normalized.clone(), None),
        };
        let base = base.split_whitespace().collect::<Vec<_>>().join(" ");

        let ty = match base.as_str() {
            "bool" | "boolean" | "bit" => Self::Boolean,
            "tinyint" | "smallint" | "int2" | "smallserial" => Self::SmallInt,
            "int" | "integer" | "int4" | "mediumint" | "serial" => Self::Integer,
            "bigint" | "int8" | "bigserial" => Self::BigInt,
            "real" | "float4" => Self::Real,
            "double" | "double precision" | "float8" | "float" => Self::Double,
            "numeric" | "decimal" | "number" | "money" => {
                let (precision, scale) = parse_precision_scale(column, type_name, args.as_deref())?;
                Self::Decimal { precision, scale }
            }
            "text" | "varchar" | "char" | "character" | "character varying" | "nvarchar"
            | "nchar" | "ntext" | "bpchar" | "string" | "tinytext" | "mediumtext" | "longtext"
            | "name" | "citext" => Self::Text,
            "bytea" | "blob" | "binary" | "varbinary" | "tinyblob" | "mediumblob"
            | "longblob" | "image" => Self::Binary,
            "date" => Self::Date,
            "time" | "time without time zone" => Self::Time,
            "timestamp" | "timestamp without time zone" | "datetime" | "datetime2"
            | "smalldatetime" => Self::Timestamp,
            "timestamptz" | "timestamp with time zone" | "datetimeoffset" => Self::TimestampTz,
            _ => return Err(Error::unsupported_type(column, type_name)),
        };
        Ok(ty)
    }

    /// Codec type of a driver value, `None` for NULL and for kinds the codec
    /// does not support
    pub fn of_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Bool(_) => Self::Boolean,
            Value::Int8(_) | Value::Int16(_) => Self::SmallInt,
            Value::Int32(_) => Self::Integer,
            Value::Int64(_) => Self::BigInt,
            Value::Float32(_) => Self::Real,
            Value::Float64(_) => Self::Double,
            Value::Decimal(_) => Self::Decimal {
                precision: None,
                scale: None,
            },
            Value::String(_) => Self::Text,
            Value::Bytes(_) => Self::Binary,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::DateTime(_) => Self::Timestamp,
            Value::DateTimeTz(_) => Self::TimestampTz,
            _ => return None,
        })
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::SmallInt => write!(f, "SMALLINT"),
            Self::Integer => write!(f, "INTEGER"),
            Self::BigInt => write!(f, "BIGINT"),
            Self::Real => write!(f, "REAL"),
            Self::Double => write!(f, "DOUBLE PRECISION"),
            Self::Decimal {
                precision: Some(p),
                scale: Some(s),
            } => write!(f, "DECIMAL({},{})", p, s),
            Self::Decimal {
                precision: Some(p),
                scale: None,
            } => write!(f, "DECIMAL({})", p),
            Self::Decimal { .. } => write!(f, "DECIMAL"),
            Self::Text => write!(f, "TEXT"),
            Self::Binary => write!(f, "BINARY"),
            Self::Date => write!(f, "DATE"),
            Self::Time => write!(f, "TIME"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::TimestampTz => write!(f, "TIMESTAMPTZ"),
        }
    }
}

fn parse_precision_scale(
    column: &str,
    type_name: &str,
    args: Option<&str>,
) -> Result<(Option<u32>, Option<u32>)> {
    let Some(args) = args else {
        return Ok((None, None));
    };
    let mut parts = args.split(',').map(str::trim);
    let parse = |s: &str| {
        s.parse::<u32>().map_err(|_| {
            Error::type_conversion(format!(
                "column '{}': invalid precision/scale in type '{}'",
                column, type_name
            ))
        })
    };
    let precision = match parts.next() {
        Some(p) if !p.is_empty() => Some(parse(p)?),
        _ => None,
    };
    let scale = match parts.next() {
        Some(s) if !s.is_empty() => Some(parse(s)?),
        _ => None,
    };
    Ok((precision, scale.or(precision.map(|_| 0))))
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// Column type
    pub sql_type: SqlType,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl ColumnSpec {
    /// Nullable column
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered column definitions for a result set or a write target
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
}

impl Schema {
    /// Create a schema from column definitions
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// Infer a schema from sample rows.
    ///
    /// Each column takes the type of its first non-null value. A column that
    /// is NULL in every sample row is typed as text. Inferred columns are
    /// nullable and inferred decimals carry no precision or scale.
    pub fn infer(rows: &[Row]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Ok(Self::default());
        };

        let mut columns = Vec::with_capacity(first.len());
        for (idx, name) in first.columns().iter().enumerate() {
            let sample = rows
                .iter()
                .filter_map(|r| r.get(idx))
                .find(|v| !v.is_null());
            let sql_type = match sample {
                None => SqlType::Text,
                Some(v) => SqlType::of_value(v)
                    .ok_or_else(|| Error::unsupported_type(name.clone(), v.sql_type()))?,
            };
            columns.push(ColumnSpec::new(name.clone(), sql_type));
        }
        Ok(Self { columns })
    }

    /// Column definitions in order
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column (case-insensitive)
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column definition by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Typed pipeline value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    /// NULL
    Null,
    /// Boolean
    Boolean(bool),
    /// Any integer column
    Int(i64),
    /// Any floating point column
    Float(f64),
    /// Exact decimal
    Decimal(Decimal),
    /// Text
    Text(String),
    /// Binary
    Binary(Vec<u8>),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp without time zone
    Timestamp(NaiveDateTime),
    /// Timestamp in UTC
    TimestampTz(DateTime<Utc>),
}

impl Datum {
    /// Whether the datum is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer value, if this is an integer datum
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Text value, if this is a text datum
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
        }
    }

    /// Approximate in-memory size in bytes
    pub fn approximate_size(&self) -> usize {
        match self {
            Self::Null | Self::Boolean(_) => 1,
            Self::Date(_) => 4,
            Self::Int(_) | Self::Float(_) | Self::Time(_) => 8,
            Self::Timestamp(_) | Self::TimestampTz(_) => 12,
            Self::Decimal(_) => 16,
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Decimal> for Datum {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Typed row flowing through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Datum>,
}

impl Record {
    /// Create a record; the value count must match the schema
    pub fn new(schema: Arc<Schema>, values: Vec<Datum>) -> Result<Self> {
        if schema.len() != values.len() {
            return Err(Error::schema(format!(
                "record has {} values but schema has {} columns",
                values.len(),
                schema.len()
            )));
        }
        Ok(Self { schema, values })
    }

    /// Record schema
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Values in column order
    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    /// Value by column name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Approximate in-memory size in bytes, used for byte-bounded batching
    pub fn approximate_size(&self) -> usize {
        self.values.iter().map(Datum::approximate_size).sum()
    }

    /// Take the values out of the record
    pub fn into_values(self) -> Vec<Datum> {
        self.values
    }
}

/// Decode a driver row into a typed record
pub fn decode(row: &Row, schema: &Arc<Schema>) -> Result<Record> {
    if row.len() != schema.len() {
        return Err(Error::schema(format!(
            "row has {} columns but schema has {}",
            row.len(),
            schema.len()
        )));
    }

    let values = schema
        .columns()
        .iter()
        .zip(row.values())
        .map(|(spec, value)| decode_value(spec, value))
        .collect::<Result<Vec<_>>>()?;

    Ok(Record {
        schema: Arc::clone(schema),
        values,
    })
}

/// Encode a typed record into a driver row, in schema column order
pub fn encode(record: &Record, schema: &Schema) -> Result<Row> {
    if record.values.len() != schema.len() {
        return Err(Error::schema(format!(
            "record has {} values but schema has {} columns",
            record.values.len(),
            schema.len()
        )));
    }

    let values = schema
        .columns()
        .iter()
        .zip(&record.values)
        .map(|(spec, datum)| encode_datum(spec, datum))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(schema.column_names(), values))
}

fn mismatch(spec: &ColumnSpec, found: &str) -> Error {
    Error::type_conversion(format!(
        "column '{}': {} value does not fit {}",
        spec.name, found, spec.sql_type
    ))
}

fn out_of_range(spec: &ColumnSpec, value: impl fmt::Display) -> Error {
    Error::type_conversion(format!(
        "column '{}': value {} out of range for {}",
        spec.name, value, spec.sql_type
    ))
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int8(n) => Some(i64::from(*n)),
        Value::Int16(n) => Some(i64::from(*n)),
        Value::Int32(n) => Some(i64::from(*n)),
        Value::Int64(n) => Some(*n),
        _ => None,
    }
}

fn check_integer(spec: &ColumnSpec, n: i64) -> Result<i64> {
    let fits = match spec.sql_type {
        SqlType::SmallInt => i16::try_from(n).is_ok(),
        SqlType::Integer => i32::try_from(n).is_ok(),
        _ => true,
    };
    if fits {
        Ok(n)
    } else {
        Err(out_of_range(spec, n))
    }
}

fn fits_real(x: f64) -> bool {
    x.is_nan() || (x as f32) as f64 == x
}

fn check_decimal(spec: &ColumnSpec, d: Decimal) -> Result<Decimal> {
    let SqlType::Decimal { precision, scale } = spec.sql_type else {
        return Ok(d);
    };
    let normalized = d.normalize();
    if let Some(s) = scale {
        if normalized.scale() > s {
            return Err(out_of_range(spec, d));
        }
    }
    if let Some(p) = precision {
        let integer_digits = {
            let int_part = normalized.abs().trunc();
            if int_part.is_zero() {
                0
            } else {
                int_part.normalize().to_string().len() as u32
            }
        };
        if integer_digits > p.saturating_sub(scale.unwrap_or(0)) {
            return Err(out_of_range(spec, d));
        }
    }
    Ok(d)
}

fn decode_value(spec: &ColumnSpec, value: &Value) -> Result<Datum> {
    if value.is_null() {
        return if spec.nullable {
            Ok(Datum::Null)
        } else {
            Err(Error::type_conversion(format!(
                "column '{}': NULL in NOT NULL column",
                spec.name
            )))
        };
    }

    if SqlType::of_value(value).is_none() {
        return Err(Error::unsupported_type(spec.name.clone(), value.sql_type()));
    }

    let datum = match (spec.sql_type, value) {
        (SqlType::Boolean, Value::Bool(b)) => Datum::Boolean(*b),
        (SqlType::Boolean, v) => match integer_of(v) {
            Some(0) => Datum::Boolean(false),
            Some(1) => Datum::Boolean(true),
            _ => return Err(mismatch(spec, v.sql_type())),
        },
        (SqlType::SmallInt | SqlType::Integer | SqlType::BigInt, v) => {
            let n = integer_of(v).ok_or_else(|| mismatch(spec, v.sql_type()))?;
            Datum::Int(check_integer(spec, n)?)
        }
        (SqlType::Real, Value::Float32(x)) => Datum::Float(f64::from(*x)),
        (SqlType::Real, Value::Float64(x)) => {
            if !fits_real(*x) {
                return Err(out_of_range(spec, x));
            }
            Datum::Float(*x)
        }
        (SqlType::Double, Value::Float32(x)) => Datum::Float(f64::from(*x)),
        (SqlType::Double, Value::Float64(x)) => Datum::Float(*x),
        (SqlType::Decimal { .. }, Value::Decimal(d)) => Datum::Decimal(check_decimal(spec, *d)?),
        (SqlType::Decimal { .. }, v) => {
            let n = integer_of(v).ok_or_else(|| mismatch(spec, v.sql_type()))?;
            Datum::Decimal(check_decimal(spec, Decimal::from(n))?)
        }
        (SqlType::Text, Value::String(s)) => Datum::Text(s.clone()),
        (SqlType::Binary, Value::Bytes(b)) => Datum::Binary(b.clone()),
        (SqlType::Date, Value::Date(d)) => Datum::Date(*d),
        (SqlType::Time, Value::Time(t)) => Datum::Time(*t),
        (SqlType::Timestamp, Value::DateTime(ts)) => Datum::Timestamp(*ts),
        (SqlType::TimestampTz, Value::DateTimeTz(ts)) => Datum::TimestampTz(*ts),
        (_, v) => return Err(mismatch(spec, v.sql_type())),
    };
    Ok(datum)
}

fn encode_datum(spec: &ColumnSpec, datum: &Datum) -> Result<Value> {
    let value = match (spec.sql_type, datum) {
        (_, Datum::Null) if spec.nullable => Value::Null,
        (_, Datum::Null) => {
            return Err(Error::type_conversion(format!(
                "column '{}': NULL in NOT NULL column",
                spec.name
            )))
        }
        (SqlType::Boolean, Datum::Boolean(b)) => Value::Bool(*b),
        (SqlType::SmallInt, Datum::Int(n)) => {
            Value::Int16(i16::try_from(*n).map_err(|_| out_of_range(spec, n))?)
        }
        (SqlType::Integer, Datum::Int(n)) => {
            Value::Int32(i32::try_from(*n).map_err(|_| out_of_range(spec, n))?)
        }
        (SqlType::BigInt, Datum::Int(n)) => Value::Int64(*n),
        (SqlType::Real, Datum::Float(x)) => {
            if !fits_real(*x) {
                return Err(out_of_range(spec, x));
            }
            Value::Float32(*x as f32)
        }
        (SqlType::Double, Datum::Float(x)) => Value::Float64(*x),
        (SqlType::Decimal { .. }, Datum::Decimal(d)) => Value::Decimal(check_decimal(spec, *d)?),
        (SqlType::Text, Datum::Text(s)) => Value::String(s.clone()),
        (SqlType::Binary, Datum::Binary(b)) => Value::Bytes(b.clone()),
        (SqlType::Date, Datum::Date(d)) => Value::Date(*d),
        (SqlType::Time, Datum::Time(t)) => Value::Time(*t),
        (SqlType::Timestamp, Datum::Timestamp(ts)) => Value::DateTime(*ts),
        (SqlType::TimestampTz, Datum::TimestampTz(ts)) => Value::DateTimeTz(*ts),
        (_, d) => return Err(mismatch(spec, d.kind())),
    };
    Ok(value)
}
