//! Concurrent execution of every enabled pipeline.
//!
//! The orchestrator prepares the event relation once, spawns one task per
//! enabled declaration and waits for all of them. Pipelines are isolated: a
//! failing or panicking pipeline never cancels or alters its siblings.

mod event_store;
mod render;
mod task_group;

pub use event_store::{EventStore, DEFAULT_EVENTS_TABLE};
pub use render::{mermaid_status_graph, write_status_graph, StatusGraph};
pub use task_group::IsolatedTaskGroup;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, PipelineDeclaration};
use crate::core::{RunEvent, RunStatusMap};
use crate::errors::{ConfigurationError, IngestError};
use crate::events::{noop_sink, EventSink};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::persistence::{open_database, Database};
use crate::pipeline::{PipelineOutcome, PipelineRunner};
use crate::retry::RetryPolicy;

/// Aggregate result of one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Correlates the log lines of this run.
    pub run_id: Uuid,
    /// One outcome per enabled pipeline, in declaration order.
    pub outcomes: Vec<PipelineOutcome>,
    /// Terminal status per pipeline.
    pub statuses: RunStatusMap,
    /// Wall-clock time of the whole run.
    pub duration: Duration,
}

impl RunReport {
    fn empty(run_id: Uuid) -> Self {
        Self {
            run_id,
            outcomes: Vec::new(),
            statuses: RunStatusMap::new(),
            duration: Duration::ZERO,
        }
    }

    /// Number of pipelines that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// Number of pipelines that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Whether every pipeline that ran succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Outcome for `pipeline`, if it ran.
    #[must_use]
    pub fn outcome(&self, pipeline: &str) -> Option<&PipelineOutcome> {
        self.outcomes.iter().find(|o| o.pipeline == pipeline)
    }
}

/// Runs pipeline declarations concurrently on the current runtime.
#[derive(Clone)]
pub struct Orchestrator {
    runner: PipelineRunner,
    events: EventStore,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator sharing `fetcher` and `database` across pipelines.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, database: Arc<dyn Database>) -> Self {
        let events = EventStore::new(Arc::clone(&database));
        Self {
            runner: PipelineRunner::new(fetcher, database).with_event_store(events.clone()),
            events,
            sink: noop_sink(),
        }
    }

    /// Wires the HTTP fetcher, retry policy and database described by `config`.
    ///
    /// No connection is opened and no request is made.
    pub fn from_config(config: &AppConfig, sink: Arc<dyn EventSink>) -> Result<Self, IngestError> {
        let retry = RetryPolicy::from_settings(&config.retry)?.with_sink(Arc::clone(&sink));
        let fetcher = HttpFetcher::new(&config.http, retry)?.with_sink(Arc::clone(&sink));
        let database = open_database(&config.database)?;
        let events =
            EventStore::new(Arc::clone(&database)).with_table(&config.database.events_table)?;
        Ok(Self::new(Arc::new(fetcher), database)
            .with_event_store(events)
            .with_sink(sink))
    }

    /// Uses `events` for run transitions.
    #[must_use]
    pub fn with_event_store(mut self, events: EventStore) -> Self {
        self.runner = self.runner.with_event_store(events.clone());
        self.events = events;
        self
    }

    /// Reports run, retry and validation events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.runner = self.runner.with_sink(Arc::clone(&sink));
        self.sink = sink;
        self
    }

    /// The store run transitions are written to.
    #[must_use]
    pub fn event_store(&self) -> &EventStore {
        &self.events
    }

    /// Runs every enabled declaration and waits for all of them.
    ///
    /// # Errors
    ///
    /// Fails before any pipeline starts if two enabled declarations share a
    /// name or the event relation cannot be prepared. Pipeline failures are
    /// reported in the [`RunReport`], never as an error.
    pub async fn run_all(&self, declarations: &[PipelineDeclaration]) -> Result<RunReport, IngestError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.run_all_inner(run_id, declarations).instrument(span).await
    }

    async fn run_all_inner(
        &self,
        run_id: Uuid,
        declarations: &[PipelineDeclaration],
    ) -> Result<RunReport, IngestError> {
        let clock = Instant::now();
        let enabled: Vec<PipelineDeclaration> =
            declarations.iter().filter(|d| d.enabled).cloned().collect();
        let skipped = declarations.len() - enabled.len();
        if skipped > 0 {
            info!(skipped, "Skipping disabled pipelines");
        }
        ensure_unique_names(&enabled)?;

        if enabled.is_empty() {
            info!("No enabled pipelines");
            return Ok(RunReport::empty(run_id));
        }

        self.events.ensure_table_async().await?;
        info!(pipelines = enabled.len(), "Starting pipelines");

        let group = IsolatedTaskGroup::new();
        for decl in enabled {
            let runner = self.runner.clone();
            group.spawn(
                decl.name.clone(),
                async move { runner.run(&decl).await }.in_current_span(),
            );
        }

        let mut outcomes = Vec::with_capacity(group.task_count());
        for (name, result) in group.wait().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => outcomes.push(self.abandoned(&name, &join_error).await),
            }
        }

        let statuses: RunStatusMap = outcomes
            .iter()
            .map(|o| (o.pipeline.clone(), o.status))
            .collect();
        let report = RunReport {
            run_id,
            outcomes,
            statuses,
            duration: clock.elapsed(),
        };

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            elapsed_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Run finished"
        );
        self.sink
            .emit(
                "orchestrator.completed",
                Some(json!({
                    "run_id": run_id.to_string(),
                    "succeeded": report.succeeded(),
                    "failed": report.failed(),
                })),
            )
            .await;
        Ok(report)
    }

    /// Closes out a pipeline whose task died before reporting.
    async fn abandoned(&self, pipeline: &str, join_error: &str) -> PipelineOutcome {
        error!(pipeline, error = join_error, "Pipeline task aborted");
        let now = Utc::now();
        if let Err(err) = self
            .events
            .log_async(RunEvent::failed(pipeline, now, now, join_error))
            .await
        {
            warn!(pipeline, error = %err, "Failed to write run event");
        }
        PipelineOutcome::failed(pipeline, join_error)
    }

    /// Validates `config`, runs its pipelines and writes the status graph if enabled.
    pub async fn run_config(&self, config: &AppConfig) -> Result<RunReport, IngestError> {
        let declarations = config.declarations()?;
        let report = self.run_all(&declarations).await?;

        if config.output.render_status_graph {
            let names = config.pipeline_names();
            let graph = mermaid_status_graph(&names, &report.statuses);
            write_status_graph(&config.output.status_graph_path, &graph)?;
        }
        Ok(report)
    }
}

fn ensure_unique_names(declarations: &[PipelineDeclaration]) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::with_capacity(declarations.len());
    for decl in declarations {
        if !seen.insert(decl.name.as_str()) {
            return Err(ConfigurationError::for_pipeline(
                &decl.name,
                "duplicate pipeline name",
            ));
        }
    }
    Ok(())
}
