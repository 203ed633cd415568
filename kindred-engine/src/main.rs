//! kindred-engine - Friendship Discovery & Connection Engine runner
//!
//! Runs daily queue builds and lifecycle sweeps against the shared
//! database, once or on an interval.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kindred_common::config::{load_toml_config, locate_config_file, resolve_data_folder, DATA_FOLDER_ENV};
use kindred_engine::matching::QueueBuildReport;
use kindred_engine::{Engine, EngineConfig};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Command-line arguments for kindred-engine
#[derive(Parser, Debug)]
#[command(name = "kindred-engine")]
#[command(about = "Friendship discovery and connection engine")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder holding the database
    #[arg(short, long, env = "KINDRED_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build today's match queues
    BuildQueues {
        /// Only this viewer (default: every profile)
        #[arg(long)]
        user: Option<Uuid>,
    },
    /// Refresh connection levels, milestones and dormancy
    Sweep,
    /// Build queues and sweep periodically until interrupted
    Run {
        #[arg(long, default_value = "3600")]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = locate_config_file(args.config.as_deref());
    let config: EngineConfig = load_toml_config(config_path.as_deref())
        .context("Failed to load configuration")?;

    // Initialize tracing
    let default_filter = format!(
        "kindred_engine={level},kindred_common={level}",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kindred-engine v{}", env!("CARGO_PKG_VERSION"));

    let data_folder = resolve_data_folder(
        args.data_folder.as_deref(),
        DATA_FOLDER_ENV,
        config.data_folder.as_deref(),
    );
    info!("Data folder: {}", data_folder.display());

    let engine = Engine::open(config, &data_folder)
        .await
        .context("Failed to initialize engine")?;

    match args.command {
        Command::BuildQueues { user: Some(viewer_id) } => {
            let queue = engine
                .queue()
                .build_daily_queue(viewer_id)
                .await
                .with_context(|| format!("Failed to build queue for {}", viewer_id))?;
            info!(viewer_id = %viewer_id, size = queue.len(), "Queue ready");
        }
        Command::BuildQueues { user: None } => {
            let reports = engine
                .queue()
                .build_all_queues()
                .await
                .context("Failed to list viewers")?;
            summarize(&reports);
        }
        Command::Sweep => {
            engine.lifecycle().sweep().await.context("Lifecycle sweep failed")?;
        }
        Command::Run { interval_secs } => {
            run(&engine, Duration::from_secs(interval_secs.max(1))).await;
        }
    }

    info!("kindred-engine finished");
    Ok(())
}

/// Maintenance loop; a failed round is logged and retried on the next tick
async fn run(engine: &Engine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    info!("Running maintenance every {}s", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run_maintenance().await {
                    Ok((reports, _)) => summarize(&reports),
                    Err(e) => error!(error = %e, "Maintenance round failed"),
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

fn summarize(reports: &[QueueBuildReport]) {
    let failed = reports.iter().filter(|r| r.outcome.is_err()).count();
    let surfaced: usize = reports
        .iter()
        .filter_map(|r| r.outcome.as_ref().ok())
        .map(|queue| queue.len())
        .sum();

    if failed > 0 {
        warn!(viewers = reports.len(), failed, "Some queue builds failed");
    }
    info!(viewers = reports.len(), candidates = surfaced, "Queue builds completed");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
