//! Executes one pipeline declaration end to end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn, Instrument};

use crate::config::{FetchMode, PipelineDeclaration};
use crate::core::{RawPayload, RunEvent, RunStatus};
use crate::errors::{ConfigurationError, IngestError};
use crate::events::{noop_sink, EventSink};
use crate::fetch::Fetcher;
use crate::orchestrator::EventStore;
use crate::persistence::{BatchPersister, Database};
use crate::validation::Normalizer;

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Pipeline name.
    pub pipeline: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Records persisted; zero on failure.
    pub records: u64,
    /// Items dropped by validation, also counted when a later step fails.
    pub rejected: u64,
    /// Failure description.
    pub detail: Option<String>,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl PipelineOutcome {
    /// A failed outcome that never ran, e.g. when the task panicked.
    #[must_use]
    pub fn failed(pipeline: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            status: RunStatus::Failed,
            records: 0,
            rejected: 0,
            detail: Some(detail.into()),
            duration: Duration::ZERO,
        }
    }

    /// Whether the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Counts gathered while a run progresses.
#[derive(Debug, Default)]
struct Tally {
    records: u64,
    rejected: u64,
}

/// Runs a single [`PipelineDeclaration`]: fetch, normalize, persist.
///
/// Every run logs a `RUNNING` event and then exactly one terminal event.
/// Failures inside the run become a `FAILED` outcome and never propagate;
/// failing to write an event is logged and does not change the outcome.
#[derive(Clone)]
pub struct PipelineRunner {
    fetcher: Arc<dyn Fetcher>,
    database: Arc<dyn Database>,
    events: EventStore,
    normalizer: Normalizer,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Creates a runner that writes records and events to `database`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, database: Arc<dyn Database>) -> Self {
        let events = EventStore::new(Arc::clone(&database));
        Self {
            fetcher,
            database,
            events,
            normalizer: Normalizer::new(),
            sink: noop_sink(),
        }
    }

    /// Uses `events` for run transitions.
    #[must_use]
    pub fn with_event_store(mut self, events: EventStore) -> Self {
        self.events = events;
        self
    }

    /// Reports transitions, rejections and chunk failures to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.normalizer = self.normalizer.with_sink(Arc::clone(&sink));
        self.sink = sink;
        self
    }

    /// Runs `decl` to a terminal state.
    pub async fn run(&self, decl: &PipelineDeclaration) -> PipelineOutcome {
        let span = tracing::info_span!("pipeline", pipeline = %decl.name, mode = decl.mode.label());
        self.run_inner(decl).instrument(span).await
    }

    async fn run_inner(&self, decl: &PipelineDeclaration) -> PipelineOutcome {
        let clock = Instant::now();
        let started_at = Utc::now();
        let mut status = RunStatus::Pending;

        advance(&mut status, RunStatus::Running);
        info!(table = %decl.table, "Pipeline started");
        self.record(RunEvent::running(&decl.name, started_at)).await;

        let mut tally = Tally::default();
        let result = self.execute(decl, &mut tally).await;
        let finished_at = Utc::now();
        let duration = clock.elapsed();

        match result {
            Ok(()) => {
                advance(&mut status, RunStatus::Success);
                info!(
                    records = tally.records,
                    rejected = tally.rejected,
                    elapsed_ms = millis(duration),
                    "Pipeline succeeded"
                );
                self.record(RunEvent::success(&decl.name, started_at, finished_at, tally.records))
                    .await;
                PipelineOutcome {
                    pipeline: decl.name.clone(),
                    status,
                    records: tally.records,
                    rejected: tally.rejected,
                    detail: None,
                    duration,
                }
            }
            Err(err) => {
                advance(&mut status, RunStatus::Failed);
                let detail = err.to_string();
                error!(
                    error = %detail,
                    rejected = tally.rejected,
                    elapsed_ms = millis(duration),
                    "Pipeline failed"
                );
                self.record(RunEvent::failed(&decl.name, started_at, finished_at, &detail))
                    .await;
                PipelineOutcome {
                    pipeline: decl.name.clone(),
                    status,
                    records: 0,
                    rejected: tally.rejected,
                    detail: Some(detail),
                    duration,
                }
            }
        }
    }

    async fn execute(&self, decl: &PipelineDeclaration, tally: &mut Tally) -> Result<(), IngestError> {
        let raw = self.fetch(decl).await?;

        let normalized = self.normalizer.normalize_async(raw).await?;
        tally.rejected = normalized.rejections.len() as u64;
        if tally.rejected > 0 {
            warn!(rejected = tally.rejected, "Dropped invalid records");
        }

        let persister = BatchPersister::new(Arc::clone(&self.database), &decl.table, decl.batch_size)?
            .with_sink(Arc::clone(&self.sink));
        let summary = persister.save_async(normalized.records).await?;
        tally.records = summary.records as u64;
        Ok(())
    }

    /// Fetches according to the mode and returns one payload to normalize.
    async fn fetch(&self, decl: &PipelineDeclaration) -> Result<RawPayload, IngestError> {
        match &decl.mode {
            FetchMode::SingleFetch { .. } => {
                let url = decl
                    .urls()?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ConfigurationError::for_pipeline(&decl.name, "no URL to fetch"))?;
                Ok(self.fetcher.fetch_one(&url).await?)
            }
            FetchMode::MultiFetch { .. } => {
                let urls = decl.urls()?;
                let slots = self.fetcher.fetch_many(&urls).await;
                let missing = slots.iter().filter(|s| s.is_none()).count();
                if missing > 0 {
                    warn!(missing, requested = urls.len(), "Some fetches returned nothing");
                }
                Ok(flatten(slots.into_iter().flatten()))
            }
            FetchMode::Invalid { reason, .. } => {
                Err(ConfigurationError::for_pipeline(&decl.name, reason).into())
            }
        }
    }

    async fn record(&self, event: RunEvent) {
        self.sink
            .emit(&format!("run.{}", event.status.as_str().to_lowercase()), Some(event.to_json()))
            .await;
        let status = event.status;
        if let Err(err) = self.events.log_async(event).await {
            warn!(status = %status, error = %err, "Failed to write run event");
        }
    }
}

/// Collects multi-fetch payloads into one sequence; array payloads are spliced in.
fn flatten(payloads: impl Iterator<Item = RawPayload>) -> RawPayload {
    let mut items = Vec::new();
    for payload in payloads {
        match payload {
            Value::Array(inner) => items.extend(inner),
            other => items.push(other),
        }
    }
    Value::Array(items)
}

fn advance(status: &mut RunStatus, next: RunStatus) {
    debug_assert!(
        status.can_transition_to(next),
        "illegal transition {status} -> {next}"
    );
    *status = next;
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
