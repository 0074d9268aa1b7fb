//! chronosink - replicate change-data-capture streams into a temporal database
//!
//! # Architecture
//!
//! A capture engine (or a recorded event file) delivers raw change-event
//! envelopes; the pipeline parses them, translates them into temporal
//! writes, and applies them batch-by-batch with offset checkpointing.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Source    │────▶│   Pipeline   │────▶│ Temporal DB  │
//! │ (CDC feed)  │     │  (batches)   │     │  (pgwire)    │
//! └─────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline
//! chronosink -c chronosink.yaml
//!
//! # Validate configuration
//! chronosink -c chronosink.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chronosink::batch::{BatchController, BatchOptions};
use chronosink::checkpoint::{CheckpointStore, SharedCheckpointBackend};
use chronosink::config::PipelineConfig;
use chronosink::envelope::EnvelopeParser;
use chronosink::pipeline::Pipeline;
use chronosink::schema_history::SchemaHistory;
use chronosink::source::FileEventSource;
use chronosink::translate::Translator;

#[derive(Parser)]
#[command(name = "chronosink")]
#[command(version, about = "Replicate CDC streams into a temporal database")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "chronosink.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication pipeline (default)
    Run,
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: PipelineConfig) -> Result<()> {
    info!("Starting chronosink");
    info!("Stream: {}", config.source.stream);
    info!("Target: {}", config.target.url);

    let checkpoints: SharedCheckpointBackend =
        Arc::new(CheckpointStore::new(&config.checkpoint_dir).await?);
    let history = SchemaHistory::open(&config.schema_history_path).await?;

    let source = match &config.source.events_file {
        Some(path) => Box::new(FileEventSource::open(path).await?),
        None => {
            // Live capture plugs in through QueueEventSource; the engine task
            // is deployed separately and embeds the library directly.
            anyhow::bail!(
                "this binary only runs recorded replay (set source.events_file); \
                 live capture is driven by an external engine feeding a queue source"
            );
        }
    };

    let target = connect_target(&config).await?;

    let controller = BatchController::new(
        target,
        EnvelopeParser::new(&config.id_field),
        Translator::new(&config.id_field),
        BatchOptions {
            call_timeout: config.call_timeout(),
            retry: (&config.retry).into(),
            include_tables: config.include_tables.iter().cloned().collect(),
        },
    );

    let pipeline = Pipeline::new(
        config.source.stream.clone(),
        config.batch.max_events,
        source,
        controller,
        checkpoints,
        history,
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mut run_task = tokio::spawn(pipeline.run(stop_rx));

    let report = tokio::select! {
        report = &mut run_task => report.context("pipeline task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal (Ctrl+C)");
            let _ = stop_tx.send(true);

            match tokio::time::timeout(config.shutdown_grace(), run_task).await {
                Ok(report) => report.context("pipeline task panicked")?,
                Err(_) => {
                    warn!("Shutdown grace period elapsed with a batch still in flight");
                    std::process::exit(2);
                }
            }
        }
    };

    match report.error {
        None => {
            info!("Shutdown complete ({})", report.summary);
            Ok(())
        }
        Some(e) => {
            error!("Pipeline failed: {e}");
            anyhow::bail!("pipeline failed after {}: {e}", report.summary);
        }
    }
}

#[cfg(feature = "postgres")]
async fn connect_target(config: &PipelineConfig) -> Result<chronosink::target::SharedTarget> {
    use chronosink::target::PgWireTarget;
    let target = PgWireTarget::connect(&config.target)
        .await
        .context("Failed to connect to temporal target")?;
    Ok(Arc::new(target))
}

#[cfg(not(feature = "postgres"))]
async fn connect_target(_config: &PipelineConfig) -> Result<chronosink::target::SharedTarget> {
    anyhow::bail!("built without the 'postgres' feature; no target driver available")
}

fn validate_config(config: PipelineConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    println!("  Stream: {}", config.source.stream);
    match &config.source.events_file {
        Some(path) => println!("  Events file: {}", path.display()),
        None => println!(
            "  Live capture: {}:{}",
            config.source.host.as_deref().unwrap_or("?"),
            config.source.port.unwrap_or(0)
        ),
    }
    if !config.source.is_replay() {
        println!(
            "  WARNING: 'run' cannot drive live capture; it needs an external \
             engine feeding a queue source. Set source.events_file for replay."
        );
    }
    println!();

    println!("Target:");
    println!("  URL: {}", config.target.url);
    println!();

    println!("Pipeline:");
    println!("  Identity field: {}", config.id_field);
    if config.include_tables.is_empty() {
        println!("  Tables: all");
    } else {
        println!("  Tables: {}", config.include_tables.join(", "));
    }
    println!("  Batch size: {} events", config.batch.max_events);
    println!("  Call timeout: {}ms", config.batch.call_timeout_ms);
    println!();

    println!("Retry Policy:");
    println!("  Max retries: {}", config.retry.max_retries);
    println!("  Initial delay: {}ms", config.retry.initial_delay_ms);
    println!("  Max delay: {}ms", config.retry.max_delay_ms);
    println!();

    println!("Durability:");
    println!("  Checkpoints: {}", config.checkpoint_dir.display());
    println!("  Schema history: {}", config.schema_history_path.display());

    Ok(())
}
