//! Append-only audit log of pipeline run transitions.

use std::sync::Arc;

use tracing::debug;

use crate::core::{RunEvent, RunStatus, RunStatusMap};
use crate::errors::{IngestError, PersistenceError};
use crate::persistence::{validate_identifier, with_transaction, Database, Dialect, Row, SqlValue};
use crate::worker;

/// Default relation for run events.
pub const DEFAULT_EVENTS_TABLE: &str = "ingestion_events";

/// Writes [`RunEvent`]s to a relation, one row per event.
///
/// Every append uses its own short-lived connection and transaction.
#[derive(Clone)]
pub struct EventStore {
    database: Arc<dyn Database>,
    table: String,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Uses the default `ingestion_events` relation.
    #[must_use]
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self {
            database,
            table: DEFAULT_EVENTS_TABLE.to_string(),
        }
    }

    /// Uses `table` instead of the default relation.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidIdentifier`] for unsafe names.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, PersistenceError> {
        let table = table.into();
        validate_identifier(&table)?;
        self.table = table;
        Ok(self)
    }

    /// The relation events are written to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the relation if it does not exist.
    pub fn ensure_table(&self) -> Result<(), PersistenceError> {
        let mut conn = self.database.connect()?;
        let ddl = create_table_sql(&self.table, conn.dialect());
        with_transaction(conn.as_mut(), |tx| tx.batch_execute(&ddl))?;
        debug!(table = %self.table, "Ensured event table exists");
        conn.close()
    }

    /// Appends one event.
    pub fn log(&self, event: &RunEvent) -> Result<(), PersistenceError> {
        let sql = format!(
            "INSERT INTO {} (pipeline, status, detail, started_at, finished_at, records) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        );
        let params = [
            SqlValue::from(event.pipeline.as_str()),
            SqlValue::from(event.status.as_str()),
            SqlValue::from(event.detail.clone()),
            SqlValue::from(event.started_at),
            SqlValue::from(event.finished_at),
            SqlValue::from(event.records.map(|n| i64::try_from(n).unwrap_or(i64::MAX))),
        ];

        let mut conn = self.database.connect()?;
        with_transaction(conn.as_mut(), |tx| tx.execute(&sql, &params))?;
        debug!(pipeline = %event.pipeline, status = %event.status, "Logged run event");
        conn.close()
    }

    /// Every event for `pipeline`, oldest first.
    pub fn events_for(&self, pipeline: &str) -> Result<Vec<RunEvent>, PersistenceError> {
        let sql = format!(
            "SELECT pipeline, status, detail, started_at, finished_at, records \
             FROM {} WHERE pipeline = $1 ORDER BY id",
            self.table
        );
        let mut conn = self.database.connect()?;
        let rows = conn.fetch_all(&sql, &[SqlValue::from(pipeline)])?;
        conn.close()?;
        rows.into_iter().map(event_from_row).collect()
    }

    /// The most recently logged status of every pipeline in the relation.
    pub fn latest_statuses(&self) -> Result<RunStatusMap, PersistenceError> {
        let sql = format!("SELECT pipeline, status FROM {} ORDER BY id", self.table);
        let mut conn = self.database.connect()?;
        let rows = conn.fetch_all(&sql, &[])?;
        conn.close()?;

        let mut statuses = RunStatusMap::new();
        for row in rows {
            let (pipeline, status) = match row.as_slice() {
                [SqlValue::Text(p), SqlValue::Text(s)] => (p.clone(), parse_status(s)?),
                _ => return Err(PersistenceError::Backend("malformed event row".to_string())),
            };
            statuses.insert(pipeline, status);
        }
        Ok(statuses)
    }

    /// [`EventStore::ensure_table`] on the blocking pool.
    pub async fn ensure_table_async(&self) -> Result<(), IngestError> {
        let store = self.clone();
        worker::run_blocking(move || store.ensure_table()).await??;
        Ok(())
    }

    /// [`EventStore::log`] on the blocking pool.
    pub async fn log_async(&self, event: RunEvent) -> Result<(), IngestError> {
        let store = self.clone();
        worker::run_blocking(move || store.log(&event)).await??;
        Ok(())
    }

    /// [`EventStore::latest_statuses`] on the blocking pool.
    pub async fn latest_statuses_async(&self) -> Result<RunStatusMap, IngestError> {
        let store = self.clone();
        Ok(worker::run_blocking(move || store.latest_statuses()).await??)
    }
}

fn create_table_sql(table: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => format!(
            "CREATE TABLE IF NOT EXISTS {table} (
    id BIGSERIAL PRIMARY KEY,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    detail TEXT NULL,
    started_at TIMESTAMPTZ NULL,
    finished_at TIMESTAMPTZ NULL,
    records BIGINT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"
        ),
        Dialect::Sqlite => format!(
            "CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    detail TEXT NULL,
    started_at TEXT NULL,
    finished_at TEXT NULL,
    records INTEGER NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)"
        ),
    }
}

fn parse_status(raw: &str) -> Result<RunStatus, PersistenceError> {
    raw.parse()
        .map_err(|_| PersistenceError::Backend(format!("unknown run status {raw:?}")))
}

fn event_from_row(row: Row) -> Result<RunEvent, PersistenceError> {
    let [pipeline, status, detail, started_at, finished_at, records]: [SqlValue; 6] = row
        .try_into()
        .map_err(|_| PersistenceError::Backend("malformed event row".to_string()))?;

    let pipeline = match pipeline {
        SqlValue::Text(p) => p,
        _ => return Err(PersistenceError::Backend("event row without pipeline".to_string())),
    };
    let status = parse_status(status.as_str().unwrap_or_default())?;

    Ok(RunEvent {
        pipeline,
        status,
        detail: detail.as_str().map(str::to_string),
        started_at: started_at.as_timestamp(),
        finished_at: finished_at.as_timestamp(),
        records: records.as_i64().and_then(|n| u64::try_from(n).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sqlite_in, FaultyDatabase};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_log_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(sqlite_in(dir.path(), "events.db"));
        store.ensure_table().unwrap();
        store.ensure_table().unwrap();

        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(250);
        store.log(&RunEvent::running("posts", start)).unwrap();
        store.log(&RunEvent::success("posts", start, end, 42)).unwrap();
        store
            .log(&RunEvent::failed("users", start, end, "HTTP 500"))
            .unwrap();

        let events = store.events_for("posts").unwrap();
        assert_eq!(
            events,
            vec![
                RunEvent::running("posts", start),
                RunEvent::success("posts", start, end, 42)
            ]
        );

        let latest = store.latest_statuses().unwrap();
        assert_eq!(latest.get("posts"), Some(&RunStatus::Success));
        assert_eq!(latest.get("users"), Some(&RunStatus::Failed));
    }

    #[test]
    fn test_custom_table_name_validated() {
        let dir = tempfile::tempdir().unwrap();
        let db = sqlite_in(dir.path(), "events.db");
        assert!(EventStore::new(db.clone()).with_table("audit.runs; --").is_err());

        let store = EventStore::new(db).with_table("run_audit").unwrap();
        assert_eq!(store.table(), "run_audit");
        store.ensure_table().unwrap();
    }

    #[test]
    fn test_failed_append_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let inner = sqlite_in(dir.path(), "events.db");
        EventStore::new(inner.clone()).ensure_table().unwrap();

        let faulty = Arc::new(FaultyDatabase::new(inner.clone()).fail_on_statement("INSERT", 1));
        let store = EventStore::new(faulty);
        assert!(store.log(&RunEvent::new("posts", RunStatus::Running)).is_err());

        assert!(EventStore::new(inner).latest_statuses().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(sqlite_in(dir.path(), "events.db"));
        store.ensure_table_async().await.unwrap();
        store
            .log_async(RunEvent::running("posts", Utc::now()))
            .await
            .unwrap();
        let latest = store.latest_statuses_async().await.unwrap();
        assert_eq!(latest.get("posts"), Some(&RunStatus::Running));
    }
}
