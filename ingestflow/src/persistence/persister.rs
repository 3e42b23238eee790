//! Chunked, idempotent upserts of normalized records.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::driver::{validate_identifier, with_transaction, Connection, Database, Dialect, SqlValue};
use crate::core::NormalizedRecord;
use crate::errors::{IngestError, PersistenceError};
use crate::events::{noop_sink, EventSink};
use crate::worker;

const COLUMNS: [&str; 4] = ["id", "title", "body", "user_id"];

/// What a [`BatchPersister::save`] call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Records written.
    pub records: usize,
    /// Chunks committed.
    pub chunks: usize,
}

/// Writes [`NormalizedRecord`]s to one relation.
///
/// Records are split into chunks of `batch_size`; each chunk is one
/// transaction. A failing chunk is rolled back and aborts the save, while
/// chunks committed before it stay committed. Writes are upserts keyed on
/// `id`, so replaying a save leaves the relation unchanged.
#[derive(Clone)]
pub struct BatchPersister {
    database: Arc<dyn Database>,
    table: String,
    batch_size: usize,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BatchPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPersister")
            .field("table", &self.table)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl BatchPersister {
    /// Creates a persister for `table`. A `batch_size` of zero writes everything as one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidIdentifier`] if `table` is not a
    /// plain (optionally schema-qualified) identifier.
    pub fn new(
        database: Arc<dyn Database>,
        table: impl Into<String>,
        batch_size: usize,
    ) -> Result<Self, PersistenceError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            database,
            table,
            batch_size,
            sink: noop_sink(),
        })
    }

    /// Reports chunk failures to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The target relation.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the target relation if it does not exist.
    pub fn ensure_schema(&self) -> Result<(), PersistenceError> {
        let mut conn = self.database.connect()?;
        let result = self.ensure_schema_on(conn.as_mut());
        close_quietly(conn);
        result
    }

    /// Upserts `records`, chunk by chunk.
    ///
    /// An empty slice returns immediately without opening a connection.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Chunk`] naming the first chunk that
    /// failed, or the connection/schema error that prevented any write.
    pub fn save(&self, records: &[NormalizedRecord]) -> Result<SaveSummary, PersistenceError> {
        if records.is_empty() {
            info!(table = %self.table, "No records to save.");
            return Ok(SaveSummary::default());
        }

        info!(table = %self.table, records = records.len(), "Saving records");
        let mut conn = self.database.connect()?;
        let result = self.save_on(conn.as_mut(), records);
        close_quietly(conn);
        result
    }

    /// [`BatchPersister::save`] on the blocking pool.
    pub async fn save_async(
        &self,
        records: Vec<NormalizedRecord>,
    ) -> Result<SaveSummary, IngestError> {
        let persister = self.clone();
        let summary = worker::run_blocking(move || persister.save(&records)).await??;
        Ok(summary)
    }

    fn ensure_schema_on(&self, conn: &mut dyn Connection) -> Result<(), PersistenceError> {
        let ddl = create_table_sql(&self.table, conn.dialect());
        with_transaction(conn, |tx| tx.batch_execute(&ddl))?;
        debug!(table = %self.table, "Ensured table exists");
        Ok(())
    }

    fn save_on(
        &self,
        conn: &mut dyn Connection,
        records: &[NormalizedRecord],
    ) -> Result<SaveSummary, PersistenceError> {
        self.ensure_schema_on(conn)?;

        let rows_per_statement = (conn.dialect().max_bind_params() / COLUMNS.len()).max(1);
        let mut summary = SaveSummary::default();

        for (index, chunk) in chunks(records, self.batch_size).enumerate() {
            let rows = last_write_wins(chunk);
            let result = with_transaction(conn, |tx| {
                for page in rows.chunks(rows_per_statement) {
                    let (sql, params) = upsert_statement(&self.table, page);
                    tx.execute(&sql, &params)?;
                }
                Ok::<_, PersistenceError>(())
            });

            if let Err(err) = result {
                error!(
                    table = %self.table,
                    chunk = index,
                    committed = summary.chunks,
                    error = %err,
                    "Failed to upsert chunk"
                );
                self.sink.try_emit(
                    "persist.chunk_failed",
                    Some(json!({
                        "table": self.table,
                        "chunk": index,
                        "committed_chunks": summary.chunks,
                        "error": err.to_string(),
                    })),
                );
                return Err(PersistenceError::Chunk {
                    table: self.table.clone(),
                    chunk: index,
                    message: err.to_string(),
                });
            }

            summary.chunks += 1;
            summary.records += chunk.len();
            debug!(table = %self.table, chunk = index, "Upserted {} record(s)", chunk.len());
        }

        info!(
            table = %self.table,
            records = summary.records,
            chunks = summary.chunks,
            "Save completed"
        );
        Ok(summary)
    }
}

fn close_quietly(conn: Box<dyn Connection>) {
    if let Err(err) = conn.close() {
        warn!(error = %err, "Error closing connection");
    }
}

fn chunks<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    if size == 0 {
        items.chunks(items.len().max(1))
    } else {
        items.chunks(size)
    }
}

/// Keeps the last occurrence of each id, in first-seen order.
///
/// One upsert statement may not touch the same key twice on Postgres.
fn last_write_wins(chunk: &[NormalizedRecord]) -> Vec<&NormalizedRecord> {
    let mut slot: HashMap<i64, usize> = HashMap::with_capacity(chunk.len());
    let mut rows: Vec<&NormalizedRecord> = Vec::with_capacity(chunk.len());
    for record in chunk {
        match slot.get(&record.id) {
            Some(&pos) => rows[pos] = record,
            None => {
                slot.insert(record.id, rows.len());
                rows.push(record);
            }
        }
    }
    rows
}

fn create_table_sql(table: &str, dialect: Dialect) -> String {
    let id_type = match dialect {
        Dialect::Postgres => "BIGINT",
        Dialect::Sqlite => "INTEGER",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id {id_type} PRIMARY KEY,\n\
         \x20   title TEXT NOT NULL,\n\
         \x20   body TEXT NOT NULL,\n\
         \x20   user_id {id_type}\n\
         )"
    )
}

fn upsert_statement(table: &str, rows: &[&NormalizedRecord]) -> (String, Vec<SqlValue>) {
    let mut params = Vec::with_capacity(rows.len() * COLUMNS.len());
    let mut tuples = Vec::with_capacity(rows.len());
    for record in rows {
        let base = params.len();
        tuples.push(format!(
            "(${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4
        ));
        params.push(SqlValue::Int(record.id));
        params.push(SqlValue::Text(record.title.clone()));
        params.push(SqlValue::Text(record.body.clone()));
        params.push(record.owner_id.into());
    }
    let sql = format!(
        "INSERT INTO {table} ({columns}) VALUES {values} \
         ON CONFLICT (id) DO UPDATE SET \
         title = excluded.title, body = excluded.body, user_id = excluded.user_id",
        columns = COLUMNS.join(", "),
        values = tuples.join(", "),
    );
    (sql, params)
}
