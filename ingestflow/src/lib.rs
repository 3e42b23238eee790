//! # Ingestflow
//!
//! Concurrent HTTP-to-relational ingestion pipelines with run tracking.
//!
//! Each pipeline declaration names an upstream JSON endpoint (or a templated
//! family of endpoints) and a target table. A run:
//!
//! - **Fetches** the payloads with bounded retries and a shared HTTP client
//! - **Normalizes** heterogeneous items into `(id, title, body, owner_id)`,
//!   skipping bad items with a logged reason
//! - **Persists** the records in idempotent, chunked upserts
//! - **Tracks** every `PENDING → RUNNING → SUCCESS | FAILED` transition in an
//!   append-only event relation
//!
//! The [`Orchestrator`] runs all enabled pipelines concurrently and can render
//! their final statuses as a Mermaid graph.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ingestflow::prelude::*;
//!
//! let config = load_config(Path::new("configs/pipelines.yaml"))?;
//! let orchestrator = Orchestrator::from_config(&config, Arc::new(LoggingEventSink::default()))?;
//! let report = orchestrator.run_config(&config).await?;
//! println!("{} succeeded, {} failed", report.succeeded(), report.failed());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    missing_docs,
    rust_2018_idioms
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod orchestrator;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod testing;
pub mod validation;
pub mod worker;

pub use errors::{IngestError, Result};
pub use orchestrator::{Orchestrator, RunReport};
pub use pipeline::{PipelineOutcome, PipelineRunner};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        load_config, parse_config_str, AppConfig, DatabaseSettings, FetchMode, HttpSettings,
        IdRange, PipelineDeclaration,
    };
    pub use crate::core::{NormalizedRecord, RawPayload, RunEvent, RunStatus, RunStatusMap};
    pub use crate::errors::{
        ConfigurationError, FetchError, IngestError, PersistenceError, Result,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::fetch::{Fetcher, HttpFetcher};
    pub use crate::orchestrator::{
        mermaid_status_graph, write_status_graph, EventStore, Orchestrator, RunReport,
    };
    pub use crate::persistence::{open_database, BatchPersister, Database, SaveSummary};
    pub use crate::pipeline::{PipelineOutcome, PipelineRunner};
    pub use crate::retry::RetryPolicy;
    pub use crate::validation::{Normalization, Normalizer, RejectionError};
}
