//! Guards for SQL text that cannot be parameterized.
//!
//! Split queries layer predicates on top of a caller-supplied query, and
//! write statements interpolate table and column names. Identifiers are
//! validated before they reach a dialect; literals that must be inlined are
//! escaped.

use crate::error::{Error, Result};

/// Maximum identifier length accepted by [`validate_sql_identifier`]
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Validate a SQL identifier (schema, table or column name).
///
/// Accepts `^[A-Za-z_][A-Za-z0-9_]{0,254}$`.
///
/// ```
/// use rivven_sqlio::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("order_id").is_ok());
/// assert!(validate_sql_identifier("id; DROP TABLE t").is_err());
/// assert!(validate_sql_identifier("9lives").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    if !matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_') {
        return Err(Error::config(format!(
            "invalid SQL identifier '{}': must start with a letter or underscore",
            name
        )));
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Escape a value for a single-quoted SQL string literal (`'` becomes `''`).
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate an ORDER BY list: comma-separated identifiers, each optionally
/// followed by `ASC` or `DESC`.
///
/// ```
/// use rivven_sqlio::security::validate_order_by;
///
/// assert!(validate_order_by("created_at DESC, id").is_ok());
/// assert!(validate_order_by("id; DELETE FROM t").is_err());
/// ```
pub fn validate_order_by(order_by: &str) -> Result<()> {
    if order_by.trim().is_empty() {
        return Err(Error::config("ORDER BY list cannot be empty"));
    }

    for term in order_by.split(',') {
        let mut parts = term.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| Error::config(format!("empty ORDER BY term in '{}'", order_by)))?;
        validate_sql_identifier(column)?;

        match parts.next() {
            None => {}
            Some(dir) if dir.eq_ignore_ascii_case("asc") || dir.eq_ignore_ascii_case("desc") => {}
            Some(other) => {
                return Err(Error::config(format!(
                    "invalid ORDER BY direction '{}'",
                    other
                )))
            }
        }

        if parts.next().is_some() {
            return Err(Error::config(format!(
                "invalid ORDER BY term '{}'",
                term.trim()
            )));
        }
    }

    Ok(())
}

/// Validate a caller-supplied base query before it is wrapped as a derived
/// table. Rejects stacked statements; a single trailing `;` is allowed.
pub fn validate_query_text(sql: &str) -> Result<()> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    if body.is_empty() {
        return Err(Error::config("query text cannot be empty"));
    }
    if body.contains(';') {
        return Err(Error::config(
            "query text must be a single statement (found ';')",
        ));
    }
    Ok(())
}
