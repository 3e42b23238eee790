//! Run lifecycle events appended to the event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunStatus;

/// An immutable record of one pipeline run transition.
///
/// A runner emits one `RUNNING` event when it starts and exactly one
/// terminal event (`SUCCESS` or `FAILED`) when it ends. Both carry the same
/// `pipeline` name so they can be correlated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// The pipeline this event belongs to.
    pub pipeline: String,
    /// Status reached by the transition.
    pub status: RunStatus,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of records persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
}

impl RunEvent {
    /// Creates a bare event.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, status: RunStatus) -> Self {
        Self {
            pipeline: pipeline.into(),
            status,
            detail: None,
            started_at: None,
            finished_at: None,
            records: None,
        }
    }

    /// Creates the `RUNNING` event emitted when a runner starts.
    #[must_use]
    pub fn running(pipeline: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..Self::new(pipeline, RunStatus::Running)
        }
    }

    /// Creates a terminal `SUCCESS` event.
    #[must_use]
    pub fn success(
        pipeline: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        records: u64,
    ) -> Self {
        Self {
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            records: Some(records),
            ..Self::new(pipeline, RunStatus::Success)
        }
    }

    /// Creates a terminal `FAILED` event.
    #[must_use]
    pub fn failed(
        pipeline: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            detail: Some(detail.into()),
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            ..Self::new(pipeline, RunStatus::Failed)
        }
    }

    /// Whether this event closes a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Event-sink payload for this transition.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
