//! [`Fetcher`] over a shared `reqwest` client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::Fetcher;
use crate::config::HttpSettings;
use crate::core::RawPayload;
use crate::errors::{ConfigurationError, FetchError};
use crate::events::{noop_sink, EventSink};
use crate::retry::RetryPolicy;

/// HTTP GET fetcher with bounded retries.
///
/// Each attempt is bounded by the configured timeout. Network errors,
/// timeouts and non-2xx responses are transient and retried; a 2xx body
/// that is not JSON is permanent. When a concurrency cap is set, a permit is
/// held for the duration of one attempt, not across backoff waits.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    limiter: Option<Arc<Semaphore>>,
    timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("limit", &self.limiter.as_ref().map(|s| s.available_permits()))
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Builds the client from `settings`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the client cannot be built or
    /// the concurrency cap is zero.
    pub fn new(settings: &HttpSettings, retry: RetryPolicy) -> Result<Self, ConfigurationError> {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.as_str())
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| ConfigurationError::new(format!("failed to build HTTP client: {e}")))?;

        let limiter = match settings.max_concurrency {
            Some(0) => {
                return Err(ConfigurationError::new(
                    "http.max_concurrency must be at least 1",
                ))
            }
            Some(limit) => Some(Arc::new(Semaphore::new(limit))),
            None => None,
        };

        Ok(Self {
            client,
            retry,
            limiter,
            timeout,
            sink: noop_sink(),
        })
    }

    /// Reports per-URL failures in [`Fetcher::fetch_many`] to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// One GET, no retries.
    async fn get_once(&self, url: &str) -> Result<RawPayload, FetchError> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .acquire()
                    .await
                    .map_err(|e| FetchError::permanent(url, e.to_string()))?,
            ),
            None => None,
        };

        let response = self.client.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("timed out after {:?}", self.timeout)
            } else {
                e.to_string()
            };
            FetchError::transient(url, message)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                FetchError::transient(url, format!("HTTP {status}")).with_status(status.as_u16()),
            );
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::transient(url, format!("failed to read body: {e}")))?;

        serde_json::from_slice(&body).map_err(|e| {
            FetchError::permanent(url, format!("response is not valid JSON: {e}"))
                .with_status(status.as_u16())
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_one(&self, url: &str) -> Result<RawPayload, FetchError> {
        debug!(url, "Fetching");
        let payload = self
            .retry
            .execute(url, || self.get_once(url), FetchError::is_retryable)
            .await?;
        info!(url, "Fetched");
        Ok(payload)
    }

    async fn fetch_many(&self, urls: &[String]) -> Vec<Option<RawPayload>> {
        let requests = urls.iter().map(|url| async move {
            match self.fetch_one(url).await {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(url = %url, error = %err, "Fetch failed, leaving slot empty");
                    self.sink.try_emit(
                        "fetch.failed",
                        Some(json!({"url": url, "error": err.to_string()})),
                    );
                    None
                }
            }
        });
        let results = join_all(requests).await;
        debug!(
            requested = urls.len(),
            fetched = results.iter().filter(|r| r.is_some()).count(),
            "Multi-fetch finished"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::fetch::MockFetcher;
    use crate::testing::{StubResponse, StubServer};
    use pretty_assertions::assert_eq;

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .unwrap()
            .with_initial_delay(Duration::from_millis(5))
    }

    fn fetcher(attempts: u32) -> HttpFetcher {
        HttpFetcher::new(&HttpSettings::default().with_timeout(2.0), quick_retry(attempts)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_one_returns_json() {
        let server = StubServer::start(|path| match path {
            "/posts/1" => StubResponse::json(r#"{"id": 1, "title": "t", "body": "b"}"#),
            _ => StubResponse::status(404),
        })
        .await
        .unwrap();

        let payload = fetcher(1).fetch_one(&server.url("/posts/1")).await.unwrap();
        assert_eq!(payload["id"], 1);
    }

    #[tokio::test]
    async fn test_non_2xx_is_retried_until_exhausted() {
        let server = StubServer::start(|_| StubResponse::status(503)).await.unwrap();

        let err = fetcher(3).fetch_one(&server.url("/flaky")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(503));
        assert_eq!(server.hits("/flaky"), 3);
    }

    #[tokio::test]
    async fn test_invalid_json_is_not_retried() {
        let server = StubServer::start(|_| StubResponse::json("<html>nope</html>"))
            .await
            .unwrap();

        let err = fetcher(3).fetch_one(&server.url("/bad")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(server.hits("/bad"), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = StubServer::start(|_| {
            StubResponse::json("{}").with_delay(Duration::from_millis(500))
        })
        .await
        .unwrap();
        let settings = HttpSettings::default().with_timeout(0.05);
        let fetcher = HttpFetcher::new(&settings, quick_retry(2)).unwrap();

        let err = fetcher.fetch_one(&server.url("/slow")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(server.hits("/slow"), 2);
    }

    #[tokio::test]
    async fn test_fetch_many_keeps_order_and_empty_slots() {
        let server = StubServer::start(|path| match path {
            "/posts/2" => StubResponse::status(500),
            p => {
                let id = p.trim_start_matches("/posts/");
                StubResponse::json(format!(r#"{{"id": {id}}}"#))
            }
        })
        .await
        .unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let fetcher = fetcher(2).with_sink(sink.clone());
        let urls: Vec<String> = (1..=3).map(|i| server.url(&format!("/posts/{i}"))).collect();

        let results = fetcher.fetch_many(&urls).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap()["id"], 1);
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap()["id"], 3);
        assert_eq!(server.hits("/posts/2"), 2);
        assert_eq!(sink.events_of_type("fetch.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_cap_still_completes() {
        let server = StubServer::start(|_| {
            StubResponse::json("[]").with_delay(Duration::from_millis(20))
        })
        .await
        .unwrap();
        let settings = HttpSettings::default().with_max_concurrency(2);
        let fetcher = HttpFetcher::new(&settings, quick_retry(1)).unwrap();
        let urls: Vec<String> = (1..=6).map(|i| server.url(&format!("/{i}"))).collect();

        let results = fetcher.fetch_many(&urls).await;
        assert!(results.iter().all(Option::is_some));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let settings = HttpSettings {
            max_concurrency: Some(0),
            ..HttpSettings::default()
        };
        assert!(HttpFetcher::new(&settings, RetryPolicy::default()).is_err());
    }

    #[tokio::test]
    async fn test_mock_fetcher_through_trait_object() {
        let mut mock = MockFetcher::new();
        mock.expect_fetch_one()
            .returning(|_| Ok(serde_json::json!({"id": 1})));
        let fetcher: Arc<dyn Fetcher> = Arc::new(mock);
        assert_eq!(fetcher.fetch_one("http://x").await.unwrap()["id"], 1);
    }
}
