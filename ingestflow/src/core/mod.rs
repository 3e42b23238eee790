//! Core domain model types for ingestflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run status enum and its state machine
//! - Run lifecycle events
//! - Normalized records

mod event;
mod record;
mod status;

pub use event::RunEvent;
pub use record::{NormalizedRecord, RawPayload};
pub use status::{RunStatus, RunStatusMap};
