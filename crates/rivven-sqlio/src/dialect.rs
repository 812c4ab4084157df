//! SQL dialect abstraction for rivven-sqlio
//!
//! Vendor-specific SQL generation for the statements this crate issues:
//! bounded split sub-queries, range estimates, and batch upserts.
//! PostgreSQL and MySQL write statements are built with sea-query; SQL Server
//! has no sea-query backend and uses hand-written MERGE.

use chrono::SecondsFormat;
use sea_query::{
    Alias, Expr, IntoIden, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder, Query, TableRef,
};

use crate::connection::DatabaseType;
use crate::error::{Error, Result};
use crate::security::escape_string_literal;
use crate::types::Value;

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index (e.g., $1, ?, @p1)
    fn placeholder(&self, index: usize) -> String;

    /// Get the LIMIT/OFFSET suffix, including a leading space
    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String;

    /// Statistics query returning a single `row_count` column, if the
    /// database keeps cheap row estimates for tables
    fn row_estimate_sql(&self, schema: Option<&str>, table: &str) -> Option<String>;

    /// Generate an idempotent insert keyed on `key_columns`
    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        key_columns: &[&str],
        columns: &[&str],
    ) -> String;

    /// Generate a plain insert
    fn insert_sql(&self, schema: Option<&str>, table: &str, columns: &[&str]) -> String;

    /// Schema-qualified, quoted table name
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Wrap a query as a derived table so predicates can be layered on top
    fn wrap_subquery(&self, sql: &str, alias: &str) -> String {
        format!("({}) AS {}", strip_statement(sql), alias)
    }

    /// Boolean literal
    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Render a value as an inline SQL literal.
    ///
    /// Only scalar values are supported; used when a split query has to be
    /// handed out as a standalone SQL string.
    fn literal(&self, value: &Value) -> Result<String> {
        ansi_literal(self, value)
    }
}

/// Strip surrounding whitespace and trailing semicolons from a statement
pub fn strip_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(l) = limit {
            sql.push_str(&format!(" LIMIT {}", l));
        }
        if let Some(o) = offset {
            sql.push_str(&format!(" OFFSET {}", o));
        }
        sql
    }

    fn row_estimate_sql(&self, schema: Option<&str>, table: &str) -> Option<String> {
        let relation = escape_string_literal(&self.qualified_table(schema, table));
        Some(format!(
            "SELECT reltuples::bigint AS row_count FROM pg_class WHERE oid = '{}'::regclass",
            relation
        ))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        key_columns: &[&str],
        columns: &[&str],
    ) -> String {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let update_cols: Vec<_> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| Alias::new(*c).into_iden())
            .collect();
        let key_idens: Vec<_> = key_columns
            .iter()
            .map(|c| Alias::new(*c).into_iden())
            .collect();

        let values: Vec<_> = (1..=columns.len())
            .map(|i| Expr::cust(self.placeholder(i)))
            .collect();

        let mut on_conflict = OnConflict::columns(key_idens);
        if update_cols.is_empty() {
            // Key-only rows: a replay has nothing to update.
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(update_cols);
        }

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema, table))
            .columns(col_idens)
            .values_panic(values)
            .on_conflict(on_conflict.to_owned());

        stmt.to_string(PostgresQueryBuilder)
    }

    fn insert_sql(&self, schema: Option<&str>, table: &str, columns: &[&str]) -> String {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = (1..=columns.len())
            .map(|i| Expr::cust(self.placeholder(i)))
            .collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema, table))
            .columns(col_idens)
            .values_panic(values);

        stmt.to_string(PostgresQueryBuilder)
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!(" LIMIT {}", l),
            (None, Some(o)) => format!(" LIMIT 18446744073709551615 OFFSET {}", o),
            (None, None) => String::new(),
        }
    }

    fn row_estimate_sql(&self, schema: Option<&str>, table: &str) -> Option<String> {
        let schema_clause = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        Some(format!(
            "SELECT TABLE_ROWS AS row_count FROM information_schema.TABLES WHERE TABLE_SCHEMA = {} AND TABLE_NAME = '{}'",
            schema_clause,
            escape_string_literal(table)
        ))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        _key_columns: &[&str],
        columns: &[&str],
    ) -> String {
        // ON DUPLICATE KEY matches any unique key, so the key list is implicit.
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let update_cols: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = columns.iter().map(|_| Expr::cust("?")).collect();

        let mut on_conflict = OnConflict::new();
        on_conflict.update_columns(update_cols);

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema, table))
            .columns(col_idens)
            .values_panic(values)
            .on_conflict(on_conflict.to_owned());

        stmt.to_string(MysqlQueryBuilder)
    }

    fn insert_sql(&self, schema: Option<&str>, table: &str, columns: &[&str]) -> String {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = columns.iter().map(|_| Expr::cust("?")).collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema, table))
            .columns(col_idens)
            .values_panic(values);

        stmt.to_string(MysqlQueryBuilder)
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn literal(&self, value: &Value) -> Result<String> {
        match value {
            // Backslash is an escape character in MySQL string literals.
            Value::String(s) => Ok(format!(
                "'{}'",
                s.replace('\\', "\\\\").replace('\'', "\\'")
            )),
            Value::DateTimeTz(dt) => Ok(format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f"))),
            Value::Bool(b) => Ok(self.boolean_literal(*b).to_string()),
            other => ansi_literal(self, other),
        }
    }
}

// ===========================================================================
// SQL Server
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{}", index)
    }

    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        // OFFSET/FETCH requires ORDER BY; split windows always carry one.
        let mut sql = format!(" OFFSET {} ROWS", offset.unwrap_or(0));
        if let Some(l) = limit {
            sql.push_str(&format!(" FETCH NEXT {} ROWS ONLY", l));
        }
        sql
    }

    fn row_estimate_sql(&self, schema: Option<&str>, table: &str) -> Option<String> {
        let object = escape_string_literal(&self.qualified_table(Some(schema.unwrap_or("dbo")), table));
        Some(format!(
            "SELECT SUM(p.rows) AS row_count FROM sys.partitions p WHERE p.object_id = OBJECT_ID('{}') AND p.index_id IN (0, 1)",
            object
        ))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        key_columns: &[&str],
        columns: &[&str],
    ) -> String {
        let target = self.qualified_table(schema, table);
        let cols: Vec<_> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let source_cols: Vec<_> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} AS {}", self.placeholder(i + 1), self.quote_identifier(c)))
            .collect();
        let join_conditions: Vec<_> = key_columns
            .iter()
            .map(|c| {
                let c = self.quote_identifier(c);
                format!("target.{} = source.{}", c, c)
            })
            .collect();
        let update_cols: Vec<_> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| {
                let c = self.quote_identifier(c);
                format!("target.{} = source.{}", c, c)
            })
            .collect();
        let insert_cols: Vec<_> = columns
            .iter()
            .map(|c| format!("source.{}", self.quote_identifier(c)))
            .collect();

        let matched = if update_cols.is_empty() {
            String::new()
        } else {
            format!(" WHEN MATCHED THEN UPDATE SET {}", update_cols.join(", "))
        };

        format!(
            "MERGE {} AS target USING (SELECT {}) AS source ON ({}){} WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            target,
            source_cols.join(", "),
            join_conditions.join(" AND "),
            matched,
            cols.join(", "),
            insert_cols.join(", ")
        )
    }

    fn insert_sql(&self, schema: Option<&str>, table: &str, columns: &[&str]) -> String {
        let cols: Vec<_> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let params: Vec<_> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_table(schema, table),
            cols.join(", "),
            params.join(", ")
        )
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn literal(&self, value: &Value) -> Result<String> {
        match value {
            Value::String(s) => Ok(format!("N'{}'", escape_string_literal(s))),
            Value::Bool(b) => Ok(self.boolean_literal(*b).to_string()),
            other => ansi_literal(self, other),
        }
    }
}

/// ANSI literal rendering, shared by dialects that override a few cases
fn ansi_literal<D: SqlDialect + ?Sized>(dialect: &D, value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => dialect.boolean_literal(*b).to_string(),
        Value::Int8(n) => n.to_string(),
        Value::Int16(n) => n.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Float32(n) if n.is_finite() => n.to_string(),
        Value::Float64(n) if n.is_finite() => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) => format!("'{}'", escape_string_literal(s)),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
        Value::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        Value::DateTimeTz(dt) => format!("'{}'", dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
        other => {
            return Err(Error::unsupported(format!(
                "cannot render {} as a SQL literal",
                other.sql_type()
            )))
        }
    })
}

/// Get a dialect by database name (`postgres`, `mysql`, `sqlserver`, ...)
pub fn dialect_for(db_type: &str) -> Box<dyn SqlDialect> {
    match db_type.to_lowercase().as_str() {
        "mysql" | "mariadb" => Box::new(MySqlDialect),
        "sqlserver" | "mssql" | "sql server" => Box::new(SqlServerDialect),
        _ => Box::new(PostgresDialect),
    }
}

/// Get the dialect matching a connection factory's database type
pub fn dialect_for_type(db_type: DatabaseType) -> Box<dyn SqlDialect> {
    match db_type {
        DatabaseType::MySQL => Box::new(MySqlDialect),
        DatabaseType::SqlServer => Box::new(SqlServerDialect),
        DatabaseType::PostgreSQL | DatabaseType::Unknown => Box::new(PostgresDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(PostgresDialect.quote_identifier("id"), "\"id\"");
        assert_eq!(PostgresDialect.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(MySqlDialect.quote_identifier("id"), "`id`");
        assert_eq!(SqlServerDialect.quote_identifier("id"), "[id]");
    }

    #[test]
    fn test_wrap_subquery_strips_semicolon() {
        let sql = PostgresDialect.wrap_subquery("SELECT * FROM t; ", "sqlio_split");
        assert_eq!(sql, "(SELECT * FROM t) AS sqlio_split");
    }

    #[test]
    fn test_postgres_upsert_updates_non_key_columns() {
        let sql = PostgresDialect.upsert_sql(Some("public"), "users", &["id"], &["id", "name"]);
        assert!(sql.starts_with("INSERT INTO"));
        assert!(sql.contains("\"public\".\"users\""));
        assert!(sql.contains("$1"));
        assert!(sql.contains("$2"));
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("\"name\" = \"excluded\".\"name\""));
    }

    #[test]
    fn test_postgres_upsert_key_only_does_nothing() {
        let sql = PostgresDialect.upsert_sql(None, "tags", &["id"], &["id"]);
        assert!(sql.contains("DO NOTHING"));
    }

    #[test]
    fn test_mysql_upsert_output() {
        let sql = MySqlDialect.upsert_sql(None, "orders", &["id"], &["id", "total"]);
        assert!(sql.contains("`orders`"));
        assert!(sql.contains("VALUES (?, ?)"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
    }

    #[test]
    fn test_sqlserver_merge() {
        let sql = SqlServerDialect.upsert_sql(Some("dbo"), "users", &["id"], &["id", "name"]);
        assert!(sql.starts_with("MERGE [dbo].[users]"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET target.[name] = source.[name]"));
        assert!(sql.contains("@p2 AS [name]"));
    }

    #[test]
    fn test_insert_sql() {
        let sql = PostgresDialect.insert_sql(None, "events", &["id", "payload"]);
        assert!(sql.starts_with("INSERT INTO \"events\""));
        assert!(!sql.contains("ON CONFLICT"));
        let sql = SqlServerDialect.insert_sql(None, "events", &["id", "payload"]);
        assert_eq!(sql, "INSERT INTO [events] ([id], [payload]) VALUES (@p1, @p2)");
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(
            PostgresDialect.limit_offset_sql(Some(10), Some(20)),
            " LIMIT 10 OFFSET 20"
        );
        assert_eq!(PostgresDialect.limit_offset_sql(None, Some(5)), " OFFSET 5");
        assert!(MySqlDialect
            .limit_offset_sql(None, Some(5))
            .contains("18446744073709551615"));
        assert_eq!(
            SqlServerDialect.limit_offset_sql(Some(10), None),
            " OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_literals() {
        let pg = PostgresDialect;
        assert_eq!(pg.literal(&Value::Int64(42)).unwrap(), "42");
        assert_eq!(pg.literal(&Value::from("it's")).unwrap(), "'it''s'");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(pg.literal(&Value::Date(date)).unwrap(), "'2024-02-29'");
        assert!(pg.literal(&Value::Json(serde_json::json!({}))).is_err());

        assert_eq!(MySqlDialect.literal(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(MySqlDialect.literal(&Value::Int32(7)).unwrap(), "7");
        assert_eq!(SqlServerDialect.literal(&Value::from("x")).unwrap(), "N'x'");
    }

    #[test]
    fn test_row_estimate_sql() {
        let sql = PostgresDialect.row_estimate_sql(Some("public"), "items").unwrap();
        assert!(sql.contains("reltuples"));
        assert!(sql.contains("'\"public\".\"items\"'::regclass"));
        assert!(MySqlDialect
            .row_estimate_sql(None, "items")
            .unwrap()
            .contains("DATABASE()"));
    }

    #[test]
    fn test_dialect_for() {
        assert_eq!(dialect_for("postgres").name(), "PostgreSQL");
        assert_eq!(dialect_for("mysql").name(), "MySQL");
        assert_eq!(dialect_for("sqlserver").name(), "SQL Server");
        assert_eq!(dialect_for_type(DatabaseType::MySQL).name(), "MySQL");
    }
}
