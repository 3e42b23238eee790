//! Sample payloads and database helpers.

use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::errors::PersistenceError;
use crate::persistence::{validate_identifier, Database, SqlValue, SqliteDatabase};

/// A post-shaped object as a typical API returns it.
#[must_use]
pub fn sample_post(id: i64) -> Value {
    json!({
        "id": id,
        "title": format!("post {id}"),
        "body": format!("body of post {id}"),
        "userId": (id % 10) + 1,
    })
}

/// An array of `count` posts with ids `1..=count`.
#[must_use]
pub fn sample_posts(count: i64) -> Value {
    Value::Array((1..=count).map(sample_post).collect())
}

/// Number of rows in `table`.
pub fn count_rows(database: &dyn Database, table: &str) -> Result<i64, PersistenceError> {
    validate_identifier(table)?;
    let mut conn = database.connect()?;
    let row = conn.fetch_one(&format!("SELECT COUNT(*) FROM {table}"), &[])?;
    Ok(row
        .and_then(|r| r.first().and_then(SqlValue::as_i64))
        .unwrap_or(0))
}

/// Opens a `SQLite` database named `name` inside `dir`.
#[must_use]
pub fn sqlite_in(dir: &Path, name: &str) -> Arc<dyn Database> {
    Arc::new(SqliteDatabase::new(dir.join(name)))
}
