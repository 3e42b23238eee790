//! Mermaid rendering of pipeline statuses.

use std::fmt;
use std::path::Path;

use crate::core::{RunStatus, RunStatusMap};

const CLASS_DEFS: [&str; 4] = [
    "  classDef success fill:#d4f8d4,stroke:#0a0,stroke-width:1px;",
    "  classDef failed fill:#ffd6d6,stroke:#a00,stroke-width:1px;",
    "  classDef running fill:#fff3bf,stroke:#aa0,stroke-width:1px;",
    "  classDef pending fill:#eee,stroke:#999,stroke-width:1px;",
];

const fn class_for(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
        RunStatus::Running => "running",
        RunStatus::Pending => "pending",
    }
}

/// Node id for a pipeline name: anything outside `[A-Za-z0-9_]` becomes `_`.
fn node_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn node_label(name: &str) -> String {
    name.replace('"', "#quot;")
}

/// One node per pipeline, styled by status, inside a fenced block.
///
/// Pipelines appear in the order given; a name missing from `statuses`
/// renders as pending.
#[derive(Debug, Clone, Copy)]
pub struct StatusGraph<'a> {
    pipelines: &'a [String],
    statuses: &'a RunStatusMap,
}

impl<'a> StatusGraph<'a> {
    /// Borrows the pipeline order and their statuses.
    #[must_use]
    pub const fn new(pipelines: &'a [String], statuses: &'a RunStatusMap) -> Self {
        Self {
            pipelines,
            statuses,
        }
    }
}

impl fmt::Display for StatusGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "```mermaid")?;
        writeln!(f, "graph LR")?;
        for line in CLASS_DEFS {
            writeln!(f, "{line}")?;
        }
        for name in self.pipelines {
            let status = self.statuses.get(name).copied().unwrap_or_default();
            let id = node_id(name);
            writeln!(f, "  {id}[\"{}\"]", node_label(name))?;
            writeln!(f, "  class {id} {};", class_for(status))?;
        }
        writeln!(f, "```")
    }
}

/// Markdown text of [`StatusGraph`].
#[must_use]
pub fn mermaid_status_graph(pipelines: &[String], statuses: &RunStatusMap) -> String {
    StatusGraph::new(pipelines, statuses).to_string()
}

/// Writes `markdown` to `path`, creating parent directories.
pub fn write_status_graph(path: &Path, markdown: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, markdown)?;
    tracing::info!(path = %path.display(), "Wrote status graph");
    Ok(())
}
