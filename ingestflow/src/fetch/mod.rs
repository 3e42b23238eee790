//! HTTP retrieval of raw payloads.

mod http;

pub use http::HttpFetcher;

use async_trait::async_trait;

use crate::core::RawPayload;
use crate::errors::FetchError;

/// Retrieves JSON payloads by URL.
///
/// Implementations are shared across pipelines, so they must be cheap to
/// call concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches one URL, retrying transient failures.
    async fn fetch_one(&self, url: &str) -> Result<RawPayload, FetchError>;

    /// Fetches every URL concurrently.
    ///
    /// The result has one slot per input URL, in input order. A URL that
    /// failed after its retries leaves `None` in its slot; it never fails
    /// the whole call.
    async fn fetch_many(&self, urls: &[String]) -> Vec<Option<RawPayload>>;
}
