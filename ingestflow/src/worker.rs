//! Offloading synchronous work from the async runtime.

use crate::errors::IngestError;

/// Runs `work` on tokio's blocking pool and awaits its result.
///
/// Validation and every database call go through here so a slow driver
/// never stalls the tasks sharing the runtime.
///
/// # Errors
///
/// Returns [`IngestError::Worker`] if the closure panicked or the task was
/// cancelled.
pub async fn run_blocking<F, T>(work: F) -> Result<T, IngestError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| IngestError::Worker(err.to_string()))
}
