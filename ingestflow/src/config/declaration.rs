//! Pipeline declarations: the raw config shape and its validated form.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::errors::ConfigurationError;

/// Placeholder substituted with each id of a multi-fetch range.
pub const ID_PLACEHOLDER: &str = "{id}";

fn default_enabled() -> bool {
    true
}

const DEFAULT_BATCH_SIZE: usize = 500;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[allow(clippy::cast_possible_wrap)]
fn default_raw_batch_size() -> i64 {
    DEFAULT_BATCH_SIZE as i64
}

/// Inclusive id range for multi-fetch pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First id.
    pub start: i64,
    /// Last id, inclusive.
    pub end: i64,
}

impl IdRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// The ids covered by the range.
    #[must_use]
    pub const fn ids(&self) -> RangeInclusive<i64> {
        self.start..=self.end
    }
}

/// A pipeline entry as written in the config file.
///
/// `mode` is free text here; [`RawPipelineDeclaration::into_declaration`]
/// turns it into a [`FetchMode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPipelineDeclaration {
    /// Unique pipeline name.
    pub name: String,
    /// Whether the orchestrator should run it.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// `single-fetch` (alias `sync`) or `multi-fetch` (alias `async`).
    pub mode: String,
    /// URL prefix for every request.
    pub base_url: String,
    /// Target relation.
    pub table: String,
    /// Records per upsert chunk. Signed so a negative value is reported by
    /// name instead of as a YAML type error; `0` means one chunk.
    #[serde(default = "default_raw_batch_size")]
    pub batch_size: i64,
    /// Single-fetch path appended to `base_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Multi-fetch path template containing `{id}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    /// Multi-fetch id range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_range: Option<IdRange>,
}

impl RawPipelineDeclaration {
    /// Validates identity fields and resolves the fetch mode.
    ///
    /// An empty name or a negative `batch_size` is a load error. Mode problems (unknown mode, missing
    /// mode fields, reversed range) are kept as [`FetchMode::Invalid`] so the
    /// runner can report the pipeline as failed without touching the network.
    pub fn into_declaration(self) -> Result<PipelineDeclaration, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::new("pipeline name must not be empty"));
        }
        let batch_size = usize::try_from(self.batch_size).map_err(|_| {
            ConfigurationError::for_pipeline(
                &self.name,
                format!("batch_size must not be negative (got {})", self.batch_size),
            )
        })?;
        let mode = resolve_mode(&self);
        Ok(PipelineDeclaration {
            name: self.name,
            enabled: self.enabled,
            base_url: self.base_url,
            table: self.table,
            batch_size,
            mode,
        })
    }
}

fn resolve_mode(raw: &RawPipelineDeclaration) -> FetchMode {
    let invalid = |reason: String| FetchMode::Invalid {
        mode: raw.mode.clone(),
        reason,
    };
    match raw.mode.as_str() {
        "single-fetch" | "sync" => match &raw.endpoint {
            Some(endpoint) => FetchMode::SingleFetch {
                endpoint: endpoint.clone(),
            },
            None => invalid("single-fetch pipeline requires endpoint".to_string()),
        },
        "multi-fetch" | "async" => match (&raw.url_pattern, raw.id_range) {
            (Some(pattern), Some(range)) if range.start <= range.end => FetchMode::MultiFetch {
                url_pattern: pattern.clone(),
                id_range: range,
            },
            (Some(_), Some(range)) => invalid(format!(
                "id_range start {} is greater than end {}",
                range.start, range.end
            )),
            _ => invalid("multi-fetch pipeline requires url_pattern and id_range".to_string()),
        },
        other => invalid(format!("invalid mode {other}")),
    }
}

/// How a pipeline obtains its payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    /// One GET of `base_url + endpoint`.
    SingleFetch {
        /// Path appended to the base URL.
        endpoint: String,
    },
    /// One GET per id in `id_range`, issued concurrently.
    MultiFetch {
        /// Path template containing `{id}`.
        url_pattern: String,
        /// Inclusive ids to substitute.
        id_range: IdRange,
    },
    /// A mode that cannot run; the runner fails it without any network call.
    Invalid {
        /// The mode as written in config.
        mode: String,
        /// Why it cannot run.
        reason: String,
    },
}

impl FetchMode {
    /// Short label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::SingleFetch { .. } => "single-fetch",
            Self::MultiFetch { .. } => "multi-fetch",
            Self::Invalid { mode, .. } => mode,
        }
    }
}

/// A validated, immutable pipeline declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDeclaration {
    /// Unique pipeline name.
    pub name: String,
    /// Whether the orchestrator should run it.
    pub enabled: bool,
    /// URL prefix for every request.
    pub base_url: String,
    /// Target relation.
    pub table: String,
    /// Records per upsert chunk; `0` means one chunk.
    pub batch_size: usize,
    /// Fetch strategy.
    pub mode: FetchMode,
}

impl PipelineDeclaration {
    /// Declares an enabled single-fetch pipeline.
    #[must_use]
    pub fn single_fetch(
        name: impl Into<String>,
        base_url: impl Into<String>,
        endpoint: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            base_url: base_url.into(),
            table: table.into(),
            batch_size: default_batch_size(),
            mode: FetchMode::SingleFetch {
                endpoint: endpoint.into(),
            },
        }
    }

    /// Declares an enabled multi-fetch pipeline.
    #[must_use]
    pub fn multi_fetch(
        name: impl Into<String>,
        base_url: impl Into<String>,
        url_pattern: impl Into<String>,
        id_range: IdRange,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            base_url: base_url.into(),
            table: table.into(),
            batch_size: default_batch_size(),
            mode: FetchMode::MultiFetch {
                url_pattern: url_pattern.into(),
                id_range,
            },
        }
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Replaces the fetch mode.
    #[must_use]
    pub fn with_mode(mut self, mode: FetchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Materializes the request URLs for this declaration.
    pub fn urls(&self) -> Result<Vec<String>, ConfigurationError> {
        match &self.mode {
            FetchMode::SingleFetch { endpoint } => Ok(vec![format!("{}{endpoint}", self.base_url)]),
            FetchMode::MultiFetch {
                url_pattern,
                id_range,
            } => Ok(id_range
                .ids()
                .map(|id| {
                    format!(
                        "{}{}",
                        self.base_url,
                        url_pattern.replace(ID_PLACEHOLDER, &id.to_string())
                    )
                })
                .collect()),
            FetchMode::Invalid { reason, .. } => {
                Err(ConfigurationError::for_pipeline(&self.name, reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(mode: &str) -> RawPipelineDeclaration {
        RawPipelineDeclaration {
            name: "posts".to_string(),
            enabled: true,
            mode: mode.to_string(),
            base_url: "https://api.example.com".to_string(),
            table: "posts".to_string(),
            batch_size: 500,
            endpoint: None,
            url_pattern: None,
            id_range: None,
        }
    }

    #[test]
    fn test_single_fetch_resolves() {
        let decl = RawPipelineDeclaration {
            endpoint: Some("/posts".to_string()),
            ..raw("single-fetch")
        }
        .into_declaration()
        .unwrap();

        assert_eq!(
            decl.mode,
            FetchMode::SingleFetch {
                endpoint: "/posts".to_string()
            }
        );
        assert_eq!(decl.urls().unwrap(), vec!["https://api.example.com/posts"]);
    }

    #[test]
    fn test_legacy_mode_aliases() {
        let sync = RawPipelineDeclaration {
            endpoint: Some("/posts".to_string()),
            ..raw("sync")
        };
        assert_eq!(sync.into_declaration().unwrap().mode.label(), "single-fetch");

        let asynchronous = RawPipelineDeclaration {
            url_pattern: Some("/posts/{id}".to_string()),
            id_range: Some(IdRange::new(1, 2)),
            ..raw("async")
        };
        assert_eq!(
            asynchronous.into_declaration().unwrap().mode.label(),
            "multi-fetch"
        );
    }

    #[test]
    fn test_multi_fetch_expands_inclusive_range() {
        let decl = RawPipelineDeclaration {
            url_pattern: Some("/posts/{id}".to_string()),
            id_range: Some(IdRange::new(3, 5)),
            ..raw("multi-fetch")
        }
        .into_declaration()
        .unwrap();

        assert_eq!(
            decl.urls().unwrap(),
            vec![
                "https://api.example.com/posts/3",
                "https://api.example.com/posts/4",
                "https://api.example.com/posts/5",
            ]
        );
    }

    #[test]
    fn test_unknown_mode_is_invalid_not_load_error() {
        let decl = raw("streaming").into_declaration().unwrap();
        assert!(matches!(decl.mode, FetchMode::Invalid { .. }));

        let err = decl.urls().unwrap_err();
        assert_eq!(err.to_string(), "posts: invalid mode streaming");
    }

    #[test]
    fn test_missing_mode_fields_are_invalid() {
        let decl = raw("multi-fetch").into_declaration().unwrap();
        assert!(decl
            .urls()
            .unwrap_err()
            .to_string()
            .contains("requires url_pattern and id_range"));

        let decl = raw("single-fetch").into_declaration().unwrap();
        assert!(decl.urls().unwrap_err().to_string().contains("requires endpoint"));
    }

    #[test]
    fn test_reversed_range_is_invalid() {
        let decl = RawPipelineDeclaration {
            url_pattern: Some("/posts/{id}".to_string()),
            id_range: Some(IdRange::new(9, 1)),
            ..raw("multi-fetch")
        }
        .into_declaration()
        .unwrap();
        assert!(matches!(decl.mode, FetchMode::Invalid { .. }));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = RawPipelineDeclaration {
            name: "  ".to_string(),
            ..raw("sync")
        }
        .into_declaration();
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = "name: posts\nmode: sync\nbase_url: http://h\ntable: posts\nendpoint: /posts\n";
        let raw: RawPipelineDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert!(raw.enabled);
        assert_eq!(raw.batch_size, 500);
        assert_eq!(raw.into_declaration().unwrap().batch_size, 500);
    }

    #[test]
    fn test_negative_batch_size_is_named() {
        let yaml =
            "name: posts\nmode: sync\nbase_url: http://h\ntable: posts\nendpoint: /posts\nbatch_size: -1\n";
        let raw: RawPipelineDeclaration = serde_yaml::from_str(yaml).unwrap();

        let err = raw.into_declaration().unwrap_err();
        assert_eq!(err.pipeline.as_deref(), Some("posts"));
        assert_eq!(
            err.to_string(),
            "posts: batch_size must not be negative (got -1)"
        );
    }

    #[test]
    fn test_zero_batch_size_is_accepted() {
        let decl = RawPipelineDeclaration {
            batch_size: 0,
            endpoint: Some("/posts".to_string()),
            ..raw("sync")
        }
        .into_declaration()
        .unwrap();
        assert_eq!(decl.batch_size, 0);
    }
}
