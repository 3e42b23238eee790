//! Test doubles for the fetch and persistence seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::RawPayload;
use crate::errors::{FetchError, PersistenceError};
use crate::fetch::Fetcher;
use crate::persistence::{Connection, Database, Dialect, Row, SqlValue};

/// A fetcher that answers from a fixed table of URLs.
///
/// Unknown URLs fail with a transient 404.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    responses: HashMap<String, Result<RawPayload, FetchError>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    /// Creates an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `url` with `payload`.
    #[must_use]
    pub fn with_payload(mut self, url: impl Into<String>, payload: RawPayload) -> Self {
        self.responses.insert(url.into(), Ok(payload));
        self
    }

    /// Answers `url` with `error`.
    #[must_use]
    pub fn with_error(mut self, url: impl Into<String>, error: FetchError) -> Self {
        self.responses.insert(url.into(), Err(error));
        self
    }

    /// Sleeps before answering `url`.
    #[must_use]
    pub fn with_delay(mut self, url: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(url.into(), delay);
        self
    }

    /// URLs requested so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of requests made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_one(&self, url: &str) -> Result<RawPayload, FetchError> {
        self.calls.lock().push(url.to_string());
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        self.responses
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::transient(url, "HTTP 404 Not Found").with_status(404)))
    }

    async fn fetch_many(&self, urls: &[String]) -> Vec<Option<RawPayload>> {
        let requests = urls.iter().map(|url| async move { self.fetch_one(url).await.ok() });
        futures::future::join_all(requests).await
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

/// Wraps a real [`Database`] and injects failures.
///
/// Counts connections and statements across every connection it opens.
pub struct FaultyDatabase {
    inner: Arc<dyn Database>,
    fail_connect: bool,
    fail_statement: Option<(String, usize)>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for FaultyDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyDatabase")
            .field("fail_connect", &self.fail_connect)
            .field("fail_statement", &self.fail_statement)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl FaultyDatabase {
    /// Wraps `inner` without any fault armed.
    #[must_use]
    pub fn new(inner: Arc<dyn Database>) -> Self {
        Self {
            inner,
            fail_connect: false,
            fail_statement: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Every connect fails.
    #[must_use]
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// The `nth` (1-based) statement starting with `prefix` fails.
    #[must_use]
    pub fn fail_on_statement(mut self, prefix: impl Into<String>, nth: usize) -> Self {
        self.fail_statement = Some((prefix.into(), nth));
        self
    }

    /// Connection attempts so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Statements attempted so far that start with `prefix`.
    #[must_use]
    pub fn statements_matching(&self, prefix: &str) -> usize {
        self.counters
            .statements
            .lock()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }
}

impl Database for FaultyDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>, PersistenceError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(PersistenceError::Connect("injected connect failure".to_string()));
        }
        Ok(Box::new(FaultyConnection {
            inner: self.inner.connect()?,
            fail_statement: self.fail_statement.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }
}

struct FaultyConnection {
    inner: Box<dyn Connection>,
    fail_statement: Option<(String, usize)>,
    counters: Arc<Counters>,
}

impl FaultyConnection {
    fn record(&self, sql: &str) -> Result<(), PersistenceError> {
        let sql = sql.trim_start();
        let mut statements = self.counters.statements.lock();
        statements.push(sql.to_string());
        if let Some((prefix, nth)) = &self.fail_statement {
            if sql.starts_with(prefix.as_str())
                && statements.iter().filter(|s| s.starts_with(prefix.as_str())).count() == *nth
            {
                return Err(PersistenceError::Backend(format!(
                    "injected failure on statement {nth} matching {prefix}"
                )));
            }
        }
        Ok(())
    }
}

impl Connection for FaultyConnection {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        self.record(sql)?;
        self.inner.execute(sql, params)
    }

    fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PersistenceError> {
        self.record(sql)?;
        self.inner.fetch_all(sql, params)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), PersistenceError> {
        self.record(sql)?;
        self.inner.batch_execute(sql)
    }

    fn close(self: Box<Self>) -> Result<(), PersistenceError> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteDatabase;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new()
            .with_payload("http://a", json!({"id": 1}))
            .with_error("http://b", FetchError::permanent("http://b", "gone"));

        assert_eq!(fetcher.fetch_one("http://a").await.unwrap()["id"], 1);
        assert!(fetcher.fetch_one("http://b").await.is_err());
        let slots = fetcher
            .fetch_many(&["http://a".to_string(), "http://missing".to_string()])
            .await;
        assert!(slots[0].is_some());
        assert!(slots[1].is_none());
        assert_eq!(fetcher.call_count(), 4);
    }

    #[test]
    fn test_faulty_database_fails_nth_statement() {
        let dir = tempfile::tempdir().unwrap();
        let inner: Arc<dyn Database> = Arc::new(SqliteDatabase::new(dir.path().join("f.db")));
        let db = FaultyDatabase::new(inner).fail_on_statement("SELECT", 2);

        let mut conn = db.connect().unwrap();
        assert!(conn.fetch_all("SELECT 1", &[]).is_ok());
        assert!(conn.fetch_all("SELECT 1", &[]).is_err());
        assert!(conn.fetch_all("SELECT 1", &[]).is_ok());
        assert_eq!(db.statements_matching("SELECT"), 3);
        assert_eq!(db.connects(), 1);
    }
}
