//! The narrow persistence contract the core depends on.
//!
//! A [`Database`] hands out [`Connection`]s; a connection executes
//! statements with positional `$n` parameters and exposes explicit
//! transaction control. [`with_transaction`] is the scoped form: it commits
//! when the body returns `Ok` and rolls back when it returns `Err`.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::errors::PersistenceError;

/// A value crossing the driver boundary, as a parameter or a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Any integer column.
    Int(i64),
    /// Text column.
    Text(String),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Returns the integer, if this is one.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the timestamp; RFC 3339 text is parsed, since `SQLite` stores timestamps as text.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            Self::Text(v) => DateTime::parse_from_rfc3339(v)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Whether this is `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One result row, columns in `SELECT` order.
pub type Row = Vec<SqlValue>;

/// SQL dialect of a driver; DDL differs slightly between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `PostgreSQL`.
    Postgres,
    /// `SQLite`.
    Sqlite,
}

impl Dialect {
    /// Upper bound on bind parameters in one statement.
    #[must_use]
    pub const fn max_bind_params(&self) -> usize {
        match self {
            Self::Postgres => 65_535,
            Self::Sqlite => 32_766,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// An open connection. Dropping it releases the underlying handle.
pub trait Connection: Send {
    /// The driver's dialect.
    fn dialect(&self) -> Dialect;

    /// Executes one statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError>;

    /// Runs a query and returns every row.
    fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PersistenceError>;

    /// Executes one or more parameterless statements.
    fn batch_execute(&mut self, sql: &str) -> Result<(), PersistenceError>;

    /// Runs a query and returns the first row, if any.
    fn fetch_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, PersistenceError> {
        Ok(self.fetch_all(sql, params)?.into_iter().next())
    }

    /// Opens a transaction.
    fn begin(&mut self) -> Result<(), PersistenceError> {
        self.batch_execute("BEGIN")
    }

    /// Commits the open transaction.
    fn commit(&mut self) -> Result<(), PersistenceError> {
        self.batch_execute("COMMIT")
    }

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> Result<(), PersistenceError> {
        self.batch_execute("ROLLBACK")
    }

    /// Closes the connection, reporting errors that a plain drop would swallow.
    fn close(self: Box<Self>) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// A connection factory. Connections are opened lazily, per operation.
pub trait Database: Send + Sync {
    /// Opens a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>, PersistenceError>;

    /// The dialect of connections this factory opens.
    fn dialect(&self) -> Dialect;
}

/// Runs `body` inside a transaction on `conn`.
///
/// Commits on `Ok`. On `Err` the transaction is rolled back and the body's
/// error is returned; a failed rollback is logged, never reported instead.
pub fn with_transaction<T, E, F>(conn: &mut dyn Connection, body: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn Connection) -> Result<T, E>,
    E: From<PersistenceError> + fmt::Display,
{
    conn.begin()?;
    match body(&mut *conn) {
        Ok(value) => match conn.commit() {
            Ok(()) => Ok(value),
            Err(err) => {
                rollback_quietly(conn);
                Err(err.into())
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "Rolling back transaction");
            rollback_quietly(conn);
            Err(err)
        }
    }
}

fn rollback_quietly(conn: &mut dyn Connection) {
    if let Err(err) = conn.rollback() {
        tracing::warn!(error = %err, "Rollback failed");
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Checks that `name` can be interpolated into SQL as a relation name.
///
/// Accepts `table` or `schema.table`, ASCII letters, digits and underscores.
pub fn validate_identifier(name: &str) -> Result<&str, PersistenceError> {
    let valid = match name.split_once('.') {
        Some((schema, table)) => is_plain_identifier(schema) && is_plain_identifier(table),
        None => is_plain_identifier(name),
    };
    if valid {
        Ok(name)
    } else {
        Err(PersistenceError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(SqlValue::from(5_i64), SqlValue::Int(5));
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".to_string()));
        assert!(SqlValue::Null.is_null());
        assert_eq!(SqlValue::Int(3).as_i64(), Some(3));
        assert_eq!(SqlValue::Text("a".into()).as_i64(), None);
    }

    #[test]
    fn test_timestamp_from_text() {
        let value = SqlValue::Text("2024-05-01T10:00:00+00:00".to_string());
        let ts = value.as_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(SqlValue::Text("yesterday".into()).as_timestamp().is_none());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("posts").is_ok());
        assert!(validate_identifier("raw.posts_v2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("posts; DROP TABLE x").is_err());
        assert!(validate_identifier("1posts").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("raw.").is_err());
        assert!(validate_identifier("_staging._t1").is_ok());
        assert!(validate_identifier("pöst").is_err());
    }

    #[test]
    fn test_dialect_display() {
        assert_eq!(Dialect::Postgres.to_string(), "postgres");
        assert_eq!(Dialect::Sqlite.to_string(), "sqlite");
        assert!(Dialect::Sqlite.max_bind_params() < Dialect::Postgres.max_bind_params());
    }

    #[test]
    fn test_traits_are_object_safe() {
        fn _assert_connection(_: &dyn Connection) {}
        fn _assert_database(_: &dyn Database) {}
    }
}
