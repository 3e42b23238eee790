//! Configuration for ingestion runs.
//!
//! This module provides:
//! - Pipeline declarations (raw config shape and validated form)
//! - Retry, HTTP, database and output settings
//! - YAML loading with `${VAR}` substitution

mod declaration;
mod loader;
mod settings;

pub use declaration::{
    FetchMode, IdRange, PipelineDeclaration, RawPipelineDeclaration, ID_PLACEHOLDER,
};
pub use loader::{load_config, parse_config_str, substitute_env_vars};
pub use settings::{
    AppConfig, DatabaseBackend, DatabaseSettings, HttpSettings, OutputSettings, RetrySettings,
};
