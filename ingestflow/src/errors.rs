//! Error types for ingestflow.
//!
//! The taxonomy follows the failure classes a pipeline run can hit:
//! transient and permanent fetch failures, persistence failures scoped to a
//! chunk or a connection, and configuration errors. Per-record validation
//! rejections live in [`crate::validation`] and never escape the validator.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IngestError>;

/// The main error type for ingestflow operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A fetch failed after the retry budget was spent, or permanently.
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// A write or schema operation against the relational store failed.
    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// A declaration or config file is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A blocking worker task panicked or was cancelled.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.is_retryable())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for IngestError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(ConfigurationError::new(format!("invalid config: {err}")))
    }
}

/// Errors raised at the HTTP fetch boundary.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network, timeout or non-2xx failures. Worth retrying.
    #[error("transient fetch error for {url}: {message}")]
    Transient {
        /// The requested URL.
        url: String,
        /// Human-readable cause.
        message: String,
        /// HTTP status, when a response was received.
        status: Option<u16>,
    },

    /// Failures that will not change on retry, such as an undecodable body.
    #[error("permanent fetch error for {url}: {message}")]
    Permanent {
        /// The requested URL.
        url: String,
        /// Human-readable cause.
        message: String,
        /// HTTP status, when a response was received.
        status: Option<u16>,
    },
}

impl FetchError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Attaches the HTTP status code.
    #[must_use]
    pub fn with_status(mut self, code: u16) -> Self {
        match &mut self {
            Self::Transient { status, .. } | Self::Permanent { status, .. } => {
                *status = Some(code);
            }
        }
        self
    }

    /// Whether the error belongs to the retryable class.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The URL the failed request targeted.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Transient { url, .. } | Self::Permanent { url, .. } => url,
        }
    }

    /// The HTTP status code, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::Permanent { status, .. } => *status,
        }
    }
}

/// Errors produced by the persistence layer.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Opening a connection failed.
    #[error("failed to connect to database: {0}")]
    Connect(String),

    /// A statement failed.
    #[error("database error: {0}")]
    Backend(String),

    /// A chunk upsert failed and was rolled back.
    #[error("failed to upsert chunk {chunk} into {table}: {message}")]
    Chunk {
        /// Target relation.
        table: String,
        /// Zero-based chunk index.
        chunk: usize,
        /// Underlying cause.
        message: String,
    },

    /// A relation name is not a safe SQL identifier.
    #[error("invalid table name: {0:?}")]
    InvalidIdentifier(String),
}

impl PersistenceError {
    /// Wraps any driver error as a backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Wraps any driver error as a connection failure.
    pub fn connect(err: impl std::fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for PersistenceError {
    fn from(err: postgres::Error) -> Self {
        Self::backend(err)
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::backend(err)
    }
}

/// Error raised when a pipeline declaration or config file is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The pipeline the error belongs to, if any.
    pub pipeline: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pipeline: None,
        }
    }

    /// Creates an error scoped to one pipeline; the message is prefixed with its name.
    #[must_use]
    pub fn for_pipeline(pipeline: impl Into<String>, message: impl AsRef<str>) -> Self {
        let pipeline = pipeline.into();
        Self {
            message: format!("{pipeline}: {}", message.as_ref()),
            pipeline: Some(pipeline),
        }
    }
}
