//! Runtime settings for retries, HTTP, the database and rendered output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{PipelineDeclaration, RawPipelineDeclaration};
use crate::errors::ConfigurationError;

/// Top-level config file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Declared pipelines, in render order.
    #[serde(default)]
    pub pipelines: Vec<RawPipelineDeclaration>,
    /// Retry policy for fetches.
    #[serde(default)]
    pub retry: RetrySettings,
    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpSettings,
    /// Relational store settings.
    #[serde(default)]
    pub database: DatabaseSettings,
    /// Status graph output.
    #[serde(default)]
    pub output: OutputSettings,
}

impl AppConfig {
    /// Validates every pipeline entry.
    pub fn declarations(&self) -> Result<Vec<PipelineDeclaration>, ConfigurationError> {
        self.pipelines
            .iter()
            .cloned()
            .map(RawPipelineDeclaration::into_declaration)
            .collect()
    }

    /// Names of all declared pipelines, enabled or not.
    #[must_use]
    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.iter().map(|p| p.name.clone()).collect()
    }
}

/// Retry configuration for fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied after each retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Jitter bound in milliseconds.
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_ms: 0,
        }
    }
}

/// Configuration for the HTTP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    /// User agent string.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Cap on in-flight requests per fetcher; `null` lifts the cap.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: Option<usize>,
    /// Whether to verify TLS certificates.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_timeout() -> f64 {
    10.0
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_concurrency() -> Option<usize> {
    Some(16)
}

fn default_user_agent() -> String {
    concat!("ingestflow/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_verify_tls() -> bool {
    true
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
            max_concurrency: default_max_concurrency(),
            verify_tls: default_verify_tls(),
        }
    }
}

impl HttpSettings {
    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the concurrency cap.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Gets timeout as Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Which relational driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// `PostgreSQL` over the sync `postgres` client.
    #[default]
    Postgres,
    /// A local `SQLite` file.
    Sqlite,
}

/// Relational store settings. Postgres fields default from `DB_*` env vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Driver selection.
    #[serde(default)]
    pub backend: DatabaseBackend,
    /// Postgres host.
    #[serde(default = "default_db_host")]
    pub host: String,
    /// Postgres port.
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Postgres database name.
    #[serde(default = "default_db_name")]
    pub dbname: String,
    /// Postgres user.
    #[serde(default = "default_db_user")]
    pub user: String,
    /// Postgres password.
    #[serde(default = "default_db_password")]
    pub password: String,
    /// `SQLite` database file.
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    /// Relation holding run events.
    #[serde(default = "default_events_table")]
    pub events_table: String,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn default_db_host() -> String {
    env_or("DB_HOST", "localhost")
}

fn default_db_port() -> u16 {
    std::env::var("DB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5432)
}

fn default_db_name() -> String {
    env_or("DB_NAME", "ingestiondb")
}

fn default_db_user() -> String {
    env_or("DB_USER", "ingestionuser")
}

fn default_db_password() -> String {
    env_or("DB_PASSWORD", "postgres")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("ingestflow.db")
}

fn default_events_table() -> String {
    "ingestion_events".to_string()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_db_name(),
            user: default_db_user(),
            password: default_db_password(),
            path: default_sqlite_path(),
            events_table: default_events_table(),
        }
    }
}

impl DatabaseSettings {
    /// Settings for a `SQLite` file.
    #[must_use]
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            path: path.into(),
            ..Self::default()
        }
    }

    /// libpq-style connection string for the Postgres backend.
    ///
    /// Text values are single-quoted with `\` and `'` escaped, so
    /// credentials may contain spaces and quotes.
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            quote_conninfo(&self.host),
            self.port,
            quote_conninfo(&self.dbname),
            quote_conninfo(&self.user),
            quote_conninfo(&self.password)
        )
    }
}

fn quote_conninfo(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Where the status graph goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Whether to write the graph after a run.
    #[serde(default = "default_render")]
    pub render_status_graph: bool,
    /// Markdown file receiving the Mermaid graph.
    #[serde(default = "default_status_graph_path")]
    pub status_graph_path: PathBuf,
}

fn default_render() -> bool {
    true
}

fn default_status_graph_path() -> PathBuf {
    PathBuf::from("docs/ingestion_dag.md")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            render_status_graph: default_render(),
            status_graph_path: default_status_graph_path(),
        }
    }
}
