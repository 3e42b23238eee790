//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] wraps a fallible operation. The first attempt is not a
//! retry; after each retryable failure short of the last attempt the policy
//! waits, then multiplies the delay by the backoff factor. Non-retryable
//! errors and the final attempt's error propagate immediately.

use rand::Rng;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::errors::ConfigurationError;
use crate::events::{noop_sink, EventSink};

/// Outcome of a retry decision after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Per-call mutable state: the attempt counter and the next base delay.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempt that just ran (1-based).
    pub attempt: u32,
    delay: Duration,
}

impl RetryState {
    /// Starts at attempt 1 with the given base delay.
    #[must_use]
    pub const fn new(initial_delay: Duration) -> Self {
        Self {
            attempt: 1,
            delay: initial_delay,
        }
    }
}

/// Retry configuration plus the sink that observes each attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    jitter: Duration,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter: Duration::ZERO,
            sink: noop_sink(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` total attempts.
    ///
    /// Zero attempts is rejected: every call must run the operation at least once.
    pub fn new(max_attempts: u32) -> Result<Self, ConfigurationError> {
        if max_attempts == 0 {
            return Err(ConfigurationError::new(
                "retry max_attempts must be at least 1",
            ));
        }
        Ok(Self {
            max_attempts,
            ..Self::default()
        })
    }

    /// Builds a policy from config settings.
    pub fn from_settings(settings: &RetrySettings) -> Result<Self, ConfigurationError> {
        if !settings.backoff_factor.is_finite() || settings.backoff_factor < 0.0 {
            return Err(ConfigurationError::new(format!(
                "retry backoff_factor must be a non-negative number, got {}",
                settings.backoff_factor
            )));
        }
        Ok(Self::new(settings.max_attempts)?
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_backoff_factor(settings.backoff_factor)
            .with_jitter(Duration::from_millis(settings.jitter_ms)))
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the multiplier applied to the delay after each retry.
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the jitter bound; each wait is `delay ± uniform(0, jitter)`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after the attempt recorded in `state` failed.
    ///
    /// On [`RetryDecision::Retry`] the state is advanced to the next attempt
    /// and its base delay scaled by the backoff factor.
    pub fn decide(&self, state: &mut RetryState, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::NotRetryable;
        }
        if state.attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let wait = self.jittered(state.delay);
        state.delay = scale(state.delay, self.backoff_factor);
        state.attempt += 1;
        RetryDecision::Retry(wait)
    }

    /// Runs an async operation under this policy.
    ///
    /// Backoff waits use `tokio::time::sleep`, so only the calling task is
    /// suspended.
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut state = RetryState::new(self.initial_delay);
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.on_failure(label, &mut state, &err, is_retryable(&err)) {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => return Err(err),
                },
            }
        }
    }

    /// Runs a synchronous operation under this policy, sleeping the current thread.
    ///
    /// Call it from a blocking worker, never directly on an async task.
    pub fn execute_blocking<T, E, F, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut state = RetryState::new(self.initial_delay);
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => match self.on_failure(label, &mut state, &err, is_retryable(&err)) {
                    Some(wait) => std::thread::sleep(wait),
                    None => return Err(err),
                },
            }
        }
    }

    /// Logs the failed attempt and returns the wait before the next one.
    fn on_failure(
        &self,
        label: &str,
        state: &mut RetryState,
        err: &dyn fmt::Display,
        retryable: bool,
    ) -> Option<Duration> {
        let attempt = state.attempt;
        match self.decide(state, retryable) {
            RetryDecision::Retry(wait) => {
                let delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %err,
                    next_delay_ms = delay_ms,
                    "Attempt failed, retrying"
                );
                self.sink.try_emit(
                    "retry.attempt_failed",
                    Some(json!({
                        "label": label,
                        "attempt": attempt,
                        "error": err.to_string(),
                        "next_delay_ms": delay_ms,
                    })),
                );
                Some(wait)
            }
            RetryDecision::GiveUp => {
                tracing::error!(label, attempt, error = %err, "Final attempt failed");
                self.sink.try_emit(
                    "retry.exhausted",
                    Some(json!({"label": label, "attempts": attempt, "error": err.to_string()})),
                );
                None
            }
            RetryDecision::NotRetryable => {
                tracing::error!(label, attempt, error = %err, "Non-retryable failure");
                self.sink.try_emit(
                    "retry.not_retryable",
                    Some(json!({"label": label, "attempt": attempt, "error": err.to_string()})),
                );
                None
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let bound = self.jitter.as_secs_f64();
        let offset = rand::thread_rng().gen_range(-bound..=bound);
        secs_to_duration(delay.as_secs_f64() + offset)
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    secs_to_duration(delay.as_secs_f64() * factor)
}

/// Converts seconds to a duration, flooring at zero and saturating on overflow.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .unwrap()
            .with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::new(0).is_err());
        assert!(RetryPolicy::new(1).is_ok());
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert!((policy.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decide_exponential_without_jitter() {
        let policy = RetryPolicy::new(4)
            .unwrap()
            .with_initial_delay(Duration::from_millis(100));
        let mut state = RetryState::new(policy.initial_delay);

        assert_eq!(
            policy.decide(&mut state, true),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(&mut state, true),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(
            policy.decide(&mut state, true),
            RetryDecision::Retry(Duration::from_millis(400))
        );
        assert_eq!(state.attempt, 4);
        assert_eq!(policy.decide(&mut state, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_not_retryable() {
        let policy = RetryPolicy::new(5).unwrap();
        let mut state = RetryState::new(policy.initial_delay);
        assert_eq!(policy.decide(&mut state, false), RetryDecision::NotRetryable);
        assert_eq!(state.attempt, 1);
    }

    #[test]
    fn test_jitter_floored_at_zero() {
        let policy = RetryPolicy::new(3)
            .unwrap()
            .with_jitter(Duration::from_millis(50));

        for _ in 0..50 {
            let wait = policy.jittered(Duration::from_millis(10));
            assert!(wait <= Duration::from_millis(60));
        }
        for _ in 0..50 {
            let wait = policy.jittered(Duration::ZERO);
            assert!(wait <= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_retry_bound_returns_third_error() {
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .execute(
                "always-fails",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(format!("failure #{n}")) }
                },
                |_| true,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result, Err("failure #3".to_string()));
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .execute(
                "flaky",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err("503".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_single_attempt_means_no_retry() {
        let policy = fast_policy(1);
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = policy
            .execute(
                "once",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("nope") }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let sink = Arc::new(CollectingEventSink::new());
        let policy = RetryPolicy::new(5)
            .unwrap()
            .with_initial_delay(Duration::from_secs(30))
            .with_sink(sink.clone());
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), &str> = policy
            .execute(
                "decode",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad json") }
                },
                |_| false,
            )
            .await;

        assert_eq!(result, Err("bad json"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.events_of_type("retry.not_retryable").len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_reported_to_sink() {
        let sink = Arc::new(CollectingEventSink::new());
        let policy = fast_policy(3).with_sink(sink.clone());

        let _: Result<(), &str> = policy
            .execute("observed", || async { Err("timeout") }, |_| true)
            .await;

        let attempts = sink.events_of_type("retry.attempt_failed");
        assert_eq!(attempts.len(), 2);
        let first = &attempts[0].data;
        assert_eq!(first["attempt"], 1);
        assert_eq!(first["error"], "timeout");
        assert_eq!(sink.events_of_type("retry.exhausted").len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_does_not_block_sibling_tasks() {
        let slow = RetryPolicy::new(2)
            .unwrap()
            .with_initial_delay(Duration::from_millis(300));
        let start = Instant::now();

        let backing_off = slow.execute("slow", || async { Err::<(), _>("down") }, |_| true);
        let sibling = async {
            tokio::task::yield_now().await;
            start.elapsed()
        };

        let (slow_result, sibling_elapsed) = tokio::join!(backing_off, sibling);
        assert!(slow_result.is_err());
        assert!(sibling_elapsed < Duration::from_millis(300));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_execute_blocking_counts_attempts() {
        let policy = fast_policy(3);
        let mut calls = 0;

        let result: Result<(), String> = policy.execute_blocking(
            "blocking",
            || {
                calls += 1;
                Err(format!("attempt {calls}"))
            },
            |_| true,
        );

        assert_eq!(calls, 3);
        assert_eq!(result, Err("attempt 3".to_string()));
    }

    #[test]
    fn test_from_settings_validates_factor() {
        let settings = RetrySettings {
            backoff_factor: -1.0,
            ..RetrySettings::default()
        };
        assert!(RetryPolicy::from_settings(&settings).is_err());

        let settings = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert!(RetryPolicy::from_settings(&settings).is_err());
    }
}
