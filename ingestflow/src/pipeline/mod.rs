//! Single-pipeline execution.

mod runner;

pub use runner::{PipelineOutcome, PipelineRunner};
