//! Turns raw payloads into [`NormalizedRecord`]s, one item at a time.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{NormalizedRecord, RawPayload};
use crate::errors::IngestError;
use crate::events::{noop_sink, EventSink};
use crate::worker;

/// Why a single item was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionError {
    /// A required key is absent.
    #[error("record at index {index}: missing required key {field:?}")]
    MissingField {
        /// Position in the payload sequence.
        index: usize,
        /// The missing key.
        field: &'static str,
    },

    /// A key is present but cannot be coerced.
    #[error("record at index {index}: bad value for {field:?}: {reason}")]
    InvalidField {
        /// Position in the payload sequence.
        index: usize,
        /// The offending key.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The item is not a mapping.
    #[error("record at index {index}: expected an object, got {found}")]
    NotAnObject {
        /// Position in the payload sequence.
        index: usize,
        /// JSON type that was found instead.
        found: &'static str,
    },
}

impl RejectionError {
    /// Position of the rejected item.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::MissingField { index, .. }
            | Self::InvalidField { index, .. }
            | Self::NotAnObject { index, .. } => *index,
        }
    }

    /// The key at fault, if the item was a mapping.
    #[must_use]
    pub const fn field(&self) -> Option<&'static str> {
        match self {
            Self::MissingField { field, .. } | Self::InvalidField { field, .. } => Some(*field),
            Self::NotAnObject { .. } => None,
        }
    }
}

/// Result of normalizing one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalization {
    /// Valid records, in input order.
    pub records: Vec<NormalizedRecord>,
    /// One entry per dropped item, in input order.
    pub rejections: Vec<RejectionError>,
}

impl Normalization {
    /// Number of items inspected.
    #[must_use]
    pub fn inspected(&self) -> usize {
        self.records.len() + self.rejections.len()
    }
}

/// Validates and coerces payload items.
///
/// A mapping payload is one item at index 0; a sequence payload is one item
/// per element. Anything else yields nothing. Bad items are logged with
/// their index, reported to the sink and skipped; they never fail the call.
#[derive(Clone)]
pub struct Normalizer {
    sink: Arc<dyn EventSink>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer").finish_non_exhaustive()
    }
}

impl Normalizer {
    /// Creates a normalizer that reports to a no-op sink.
    #[must_use]
    pub fn new() -> Self {
        Self { sink: noop_sink() }
    }

    /// Reports rejections to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Normalizes every item of `raw`.
    #[must_use]
    pub fn normalize(&self, raw: &RawPayload) -> Normalization {
        let mut out = Normalization::default();
        let items: &[Value] = match raw {
            Value::Array(items) => items,
            Value::Object(_) => std::slice::from_ref(raw),
            other => {
                warn!(found = json_type(other), "Payload is neither an object nor an array");
                self.sink.try_emit(
                    "validation.unexpected_payload",
                    Some(json!({ "found": json_type(other) })),
                );
                return out;
            }
        };

        for (index, item) in items.iter().enumerate() {
            match normalize_item(index, item) {
                Ok(record) => out.records.push(record),
                Err(rejection) => {
                    warn!(index, error = %rejection, "Skipping bad record at index {index}");
                    self.sink.try_emit(
                        "validation.rejected",
                        Some(json!({
                            "index": index,
                            "field": rejection.field(),
                            "error": rejection.to_string(),
                        })),
                    );
                    out.rejections.push(rejection);
                }
            }
        }

        debug!(
            valid = out.records.len(),
            rejected = out.rejections.len(),
            "Normalized payload"
        );
        out
    }

    /// [`Normalizer::normalize`] on the blocking pool.
    pub async fn normalize_async(&self, raw: RawPayload) -> Result<Normalization, IngestError> {
        let normalizer = self.clone();
        worker::run_blocking(move || normalizer.normalize(&raw)).await
    }
}

/// Validates a single item.
///
/// Keys are checked in order `id`, `title`, `body`, then the owner, so the
/// first problem found is the one reported. The owner is read from
/// `user_id`, falling back to `userId`; `null` means absent.
pub fn normalize_item(index: usize, item: &Value) -> Result<NormalizedRecord, RejectionError> {
    let Value::Object(map) = item else {
        return Err(RejectionError::NotAnObject {
            index,
            found: json_type(item),
        });
    };

    let id = coerce_int(index, "id", required(index, map, "id")?)?;
    let title = coerce_text(index, "title", required(index, map, "title")?)?;
    let body = coerce_text(index, "body", required(index, map, "body")?)?;
    let owner_id = match owner(map) {
        Some((field, value)) => Some(coerce_int(index, field, value)?),
        None => None,
    };

    Ok(NormalizedRecord {
        id,
        title,
        body,
        owner_id,
    })
}

fn required<'a>(
    index: usize,
    map: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, RejectionError> {
    map.get(field)
        .ok_or(RejectionError::MissingField { index, field })
}

fn owner(map: &Map<String, Value>) -> Option<(&'static str, &Value)> {
    match map.get("user_id") {
        Some(Value::Null) | None => map
            .get("userId")
            .filter(|v| !v.is_null())
            .map(|v| ("userId", v)),
        Some(value) => Some(("user_id", value)),
    }
}

fn coerce_int(index: usize, field: &'static str, value: &Value) -> Result<i64, RejectionError> {
    let invalid = |reason: String| RejectionError::InvalidField {
        index,
        field,
        reason,
    };
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(v)
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.abs() < 9.2e18 => {
                        #[allow(clippy::cast_possible_truncation)]
                        let truncated = f.trunc() as i64;
                        Ok(truncated)
                    }
                    _ => Err(invalid(format!("{n} is out of integer range"))),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("{s:?} is not an integer"))),
        other => Err(invalid(format!("expected an integer, got {}", json_type(other)))),
    }
}

fn coerce_text(index: usize, field: &'static str, value: &Value) -> Result<String, RejectionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(RejectionError::InvalidField {
            index,
            field,
            reason: format!("expected text, got {}", json_type(other)),
        }),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
