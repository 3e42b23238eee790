//! Event sink system for observability.
//!
//! Components receive an `Arc<dyn EventSink>` when they are constructed and
//! report retries, rejections and run transitions through it. There is no
//! process-wide sink; callers decide where events go.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, SinkEvent};

use std::sync::Arc;

/// Returns a shared no-op sink, the default for every component.
#[must_use]
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}
