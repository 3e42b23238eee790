//! Record validation and normalization.
//!
//! Per-item problems become [`RejectionError`]s that are logged and counted;
//! they never fail the pipeline.

mod normalizer;

pub use normalizer::{normalize_item, Normalization, Normalizer, RejectionError};
