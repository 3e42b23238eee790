//! `SQLite` driver.
//!
//! Each [`SqliteDatabase::connect`] opens the file anew. Timestamps are
//! stored as RFC 3339 text.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};

use super::driver::{Connection, Database, Dialect, Row, SqlValue};
use crate::errors::PersistenceError;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A `SQLite` database file.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDatabase {
    /// Targets the file at `path`; it is created on first connect.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// How long a connection waits on a locked database before failing.
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// The database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Database for SqliteDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>, PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(PersistenceError::connect)?;
        }
        let conn = rusqlite::Connection::open(&self.path).map_err(PersistenceError::connect)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(PersistenceError::connect)?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Timestamp(v) => ToSqlOutput::Owned(Value::Text(v.to_rfc3339())),
        })
    }
}

fn column_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        ValueRef::Text(v) | ValueRef::Blob(v) => {
            SqlValue::Text(String::from_utf8_lossy(v).into_owned())
        }
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        let mut stmt = self.conn.prepare(sql)?;
        let affected = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PersistenceError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            (0..columns)
                .map(|idx| row.get_ref(idx).map(column_value))
                .collect::<rusqlite::Result<Row>>()
        })?;
        let rows = rows.collect::<rusqlite::Result<Vec<Row>>>()?;
        Ok(rows)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), PersistenceError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // Take the write lock up front so concurrent writers wait on the busy
    // timeout instead of failing on lock upgrade.
    fn begin(&mut self) -> Result<(), PersistenceError> {
        self.batch_execute("BEGIN IMMEDIATE")
    }

    fn close(self: Box<Self>) -> Result<(), PersistenceError> {
        self.conn.close().map_err(|(_, err)| err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn open() -> (tempfile::TempDir, SqliteDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::new(dir.path().join("nested").join("test.db"));
        (dir, db)
    }

    #[test]
    fn test_connect_creates_parent_dirs() {
        let (_dir, db) = open();
        let conn = db.connect().unwrap();
        assert_eq!(conn.dialect(), Dialect::Sqlite);
        assert!(db.path().exists());
        conn.close().unwrap();
    }

    #[test]
    fn test_execute_and_fetch() {
        let (_dir, db) = open();
        let mut conn = db.connect().unwrap();
        conn.batch_execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, seen TEXT)")
            .unwrap();

        let now = Utc::now();
        let affected = conn
            .execute(
                "INSERT INTO t (id, name, seen) VALUES ($1, $2, $3), ($4, $5, $6)",
                &[
                    SqlValue::Int(1),
                    "a".into(),
                    SqlValue::Timestamp(now),
                    SqlValue::Int(2),
                    SqlValue::Null,
                    SqlValue::Null,
                ],
            )
            .unwrap();
        assert_eq!(affected, 2);

        let rows = conn
            .fetch_all("SELECT id, name, seen FROM t ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], SqlValue::Int(1));
        assert_eq!(rows[0][1], SqlValue::Text("a".to_string()));
        assert_eq!(rows[0][2].as_timestamp(), Some(now));
        assert!(rows[1][1].is_null());

        let one = conn
            .fetch_one("SELECT name FROM t WHERE id = $1", &[SqlValue::Int(1)])
            .unwrap();
        assert_eq!(one, Some(vec![SqlValue::Text("a".to_string())]));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, db) = open();
        let mut conn = db.connect().unwrap();
        conn.batch_execute("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();

        conn.begin().unwrap();
        conn.execute("INSERT INTO t (id) VALUES ($1)", &[SqlValue::Int(7)])
            .unwrap();
        conn.rollback().unwrap();

        let rows = conn.fetch_all("SELECT id FROM t", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_bad_sql_is_backend_error() {
        let (_dir, db) = open();
        let mut conn = db.connect().unwrap();
        let err = conn.execute("INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, PersistenceError::Backend(_)));
    }
}
