//! Testing utilities for ingestflow pipelines.
//!
//! This module provides:
//! - Fetcher and database doubles
//! - A local HTTP stub server
//! - Sample payloads

mod fixtures;
mod mocks;
mod stub_server;

pub use fixtures::{count_rows, sample_post, sample_posts, sqlite_in};
pub use mocks::{FaultyDatabase, StaticFetcher};
pub use stub_server::{StubResponse, StubServer};
