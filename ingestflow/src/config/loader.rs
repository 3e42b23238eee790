//! Config file loading with environment variable substitution.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::AppConfig;
use crate::errors::{ConfigurationError, IngestError, Result};

fn env_var_re() -> std::result::Result<&'static Regex, ConfigurationError> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}"))
        .as_ref()
        .map_err(|e| ConfigurationError::new(format!("env var pattern: {e}")))
}

/// Substitutes `${VAR_NAME}` patterns with environment variable values.
///
/// Full-line `#` comments are copied untouched. Every missing variable is
/// reported, not just the first.
pub fn substitute_env_vars(input: &str) -> std::result::Result<String, ConfigurationError> {
    let re = env_var_re()?;
    let mut missing = Vec::new();
    let mut substituted = String::with_capacity(input.len());

    for line in input.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            substituted.push_str(line);
            continue;
        }
        let replaced = re.replace_all(line, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| {
                missing.push(caps[1].to_string());
                String::new()
            })
        });
        substituted.push_str(&replaced);
    }

    if !missing.is_empty() {
        return Err(ConfigurationError::new(format!(
            "Missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(substituted)
}

/// Parses a YAML config string after env var substitution.
pub fn parse_config_str(yaml: &str) -> Result<AppConfig> {
    let substituted = substitute_env_vars(yaml)?;
    let config: AppConfig = serde_yaml::from_str(&substituted)?;
    Ok(config)
}

/// Reads and parses a YAML config file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IngestError::Configuration(ConfigurationError::new(format!(
            "Failed to read config file {}: {e}",
            path.display()
        )))
    })?;
    let config = parse_config_str(&content)?;
    tracing::debug!(path = %path.display(), pipelines = config.pipelines.len(), "Loaded config");
    Ok(config)
}
