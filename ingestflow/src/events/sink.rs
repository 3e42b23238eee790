//! Sink trait and the three sinks the crate ships.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receives named events from retries, validation, persistence and runs.
///
/// Names are dotted, family first: `retry.exhausted`, `validation.rejected`,
/// `persist.chunk_failed`, `run.success`, `orchestrator.completed`.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event from synchronous code. Never fails.
    fn try_emit(&self, event_type: &str, data: Option<Value>);

    /// Records an event from async code.
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
///
/// Failure events (`*.failed`, `*.exhausted`, `*.not_retryable`,
/// `*.rejected`) are always logged at WARN; everything else at the
/// configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs routine events at `level`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs routine events at DEBUG.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

fn is_failure(event_type: &str) -> bool {
    const SUFFIXES: [&str; 4] = ["failed", ".exhausted", ".not_retryable", ".rejected"];
    SUFFIXES.iter().any(|suffix| event_type.ends_with(suffix))
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        let data = data.unwrap_or(Value::Null);
        if is_failure(event_type) {
            warn!(event = event_type, %data, "Sink event");
        } else if self.level <= Level::INFO {
            // `Level` orders by verbosity: INFO < DEBUG < TRACE.
            info!(event = event_type, %data, "Sink event");
        } else {
            debug!(event = event_type, %data, "Sink event");
        }
    }
}

/// One event held by a [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEvent {
    /// Dotted event name.
    pub name: String,
    /// Payload, `Null` when none was given.
    pub data: Value,
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingEventSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    #[must_use]
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events whose name starts with `prefix`, e.g. `"retry."`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<SinkEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.lock().push(SinkEvent {
            name: event_type.to_string(),
            data: data.unwrap_or(Value::Null),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_failure_names() {
        for name in [
            "fetch.failed",
            "retry.exhausted",
            "retry.not_retryable",
            "validation.rejected",
            "persist.chunk_failed",
            "run.failed",
        ] {
            assert!(is_failure(name), "{name}");
        }
        for name in ["run.running", "run.success", "orchestrator.completed"] {
            assert!(!is_failure(name), "{name}");
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_everything() {
        NoOpEventSink.emit("run.success", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("run.running", Some(json!({"pipeline": "posts"}))).await;
        sink.try_emit("fetch.failed", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_keeps_order_and_filters() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("retry.attempt_failed", Some(json!({"attempt": 1}))).await;
        sink.try_emit("validation.rejected", None);
        sink.try_emit("retry.exhausted", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.events()[0],
            SinkEvent {
                name: "retry.attempt_failed".to_string(),
                data: json!({"attempt": 1}),
            }
        );
        assert_eq!(sink.events()[1].data, Value::Null);
        let retries: Vec<String> = sink
            .events_of_type("retry.")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(retries, vec!["retry.attempt_failed", "retry.exhausted"]);
    }
}
