mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ingestflow::config::{load_config, AppConfig, PipelineDeclaration};
use ingestflow::events::LoggingEventSink;
use ingestflow::{Orchestrator, RunReport};

#[derive(Parser)]
#[command(
    name = "ingestflow",
    version,
    about = "Concurrent HTTP-to-relational ingestion pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also append JSON logs to this file, e.g. logs/app.log
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled pipeline in a config file
    Run {
        /// Path to the pipelines YAML file
        #[arg(long, default_value = "configs/pipelines.yaml")]
        config: PathBuf,
        /// Skip writing the status graph
        #[arg(long)]
        no_render: bool,
    },
    /// Fetch one URL and upsert its records into a table
    Fetch {
        /// Endpoint returning a JSON object or array
        #[arg(long)]
        url: String,
        /// Target table
        #[arg(long, default_value = "posts")]
        table: String,
        /// Config file supplying retry, HTTP and database settings
        #[arg(long)]
        config: Option<PathBuf>,
        /// Records per upsert chunk
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init(&cli.log_level, cli.json_logs, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Run { config, no_render } => run(&config, no_render).await,
        Commands::Fetch {
            url,
            table,
            config,
            batch_size,
        } => fetch(url, table, config.as_deref(), batch_size).await,
    }
}

async fn run(path: &Path, no_render: bool) -> anyhow::Result<()> {
    let mut config = load_config(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    if no_render {
        config.output.render_status_graph = false;
    }

    let orchestrator = Orchestrator::from_config(&config, Arc::new(LoggingEventSink::debug()))?;
    let report = orchestrator.run_config(&config).await?;
    print_summary(&report);
    Ok(())
}

async fn fetch(
    url: String,
    table: String,
    config: Option<&Path>,
    batch_size: Option<usize>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };

    let mut declaration = PipelineDeclaration::single_fetch(table.clone(), url, "", table);
    if let Some(size) = batch_size {
        declaration = declaration.with_batch_size(size);
    }

    let orchestrator = Orchestrator::from_config(&config, Arc::new(LoggingEventSink::debug()))?;
    let report = orchestrator.run_all(&[declaration]).await?;
    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    for outcome in &report.outcomes {
        match &outcome.detail {
            Some(detail) => println!(
                "{:<24} {:<8} {detail}",
                outcome.pipeline,
                outcome.status.as_str()
            ),
            None => println!(
                "{:<24} {:<8} {} record(s), {} rejected in {:.2}s",
                outcome.pipeline,
                outcome.status.as_str(),
                outcome.records,
                outcome.rejected,
                outcome.duration.as_secs_f64()
            ),
        }
    }
    println!(
        "run {}: {} succeeded, {} failed in {:.2}s",
        report.run_id,
        report.succeeded(),
        report.failed(),
        report.duration.as_secs_f64()
    );
}
