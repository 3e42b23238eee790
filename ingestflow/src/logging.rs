//! Subscriber setup for the CLI: a console layer plus an optional JSON log file.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` wins over `log_level` when set.
fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn console_layer(log_level: &str, json: bool) -> BoxedLayer {
    let layer = fmt::layer().with_target(false);
    if json {
        layer.json().with_filter(level_filter(log_level)).boxed()
    } else {
        layer.with_filter(level_filter(log_level)).boxed()
    }
}

/// JSON lines appended to `path` from a background writer thread.
///
/// Lines are only guaranteed on disk once the returned guard is dropped.
fn file_layer(path: &Path, log_level: &str) -> anyhow::Result<(BoxedLayer, WorkerGuard)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file path {} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .with_filter(level_filter(log_level))
        .boxed();
    Ok((layer, guard))
}

/// Installs the global subscriber.
///
/// Console output goes to stdout, plain or JSON. With `log_file` set, every
/// record at the same level is also appended there as JSON. Keep the guard
/// alive until exit or buffered lines are lost.
pub fn init(
    log_level: &str,
    json: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let mut layers = vec![console_layer(log_level, json)];
    let guard = match log_file {
        Some(path) => {
            let (layer, guard) = file_layer(path, log_level)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    if let Some(path) = log_file {
        tracing::debug!(log_file = %path.display(), "File logging enabled");
    }
    Ok(guard)
}
