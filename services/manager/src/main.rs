//! Flotilla Fleet Manager
//!
//! Runs the reconciliation engine against the configured channel, or, when
//! invoked with the hidden `worker` subcommand, runs a single worker.
//!
//! ## Architecture
//!
//! - **Engine**: Follows the config channel and converges worker processes
//! - **Registry**: Maps worker class names to entry points
//! - **Launcher**: Spawns each worker as `flotilla-manager worker ..`

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flotilla_channel::{open_channel, ConnectionInfo};
use flotilla_manager::config::Config;
use flotilla_manager::worker::{config_from_env, run_worker};
use flotilla_manager::{EngineConfig, PluginRegistry, ProcessLauncher, ReconciliationEngine};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flotilla fleet manager.
#[derive(Parser, Debug)]
#[command(name = "flotilla-manager")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile worker processes against the config channel (default).
    Serve,

    /// Run one worker in this process.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Worker id.
    #[arg(long)]
    id: String,

    /// Worker class to run.
    #[arg(long = "class")]
    worker_class: String,

    /// Config channel the worker may read.
    #[arg(long)]
    connection: ConnectionInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker(args) => worker(config, args).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting flotilla fleet manager");
    info!(
        channel_url = %config.channel_url,
        plugin_dir = ?config.plugin_dir,
        terminate_grace_ms = config.terminate_grace.as_millis() as u64,
        empty_document = ?config.empty_document,
        "Configuration loaded"
    );

    let registry = Arc::new(PluginRegistry::bootstrap(config.plugin_dir.as_deref()));
    let channel = open_channel(&config.channel_url, config.poll_interval)
        .context("failed to open config channel")?;
    let launcher = Arc::new(
        ProcessLauncher::current_exe(config.terminate_grace)
            .context("failed to locate manager executable")?,
    );

    let engine = Arc::new(ReconciliationEngine::new(
        registry,
        launcher,
        channel,
        EngineConfig {
            empty_document: config.empty_document,
        },
    ));

    let mut follower = engine.initialize().await?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        result = &mut follower => {
            if let Err(e) = result {
                error!(error = %e, "Config follower task panicked");
            }
        }
    }

    // Lets an in-flight pass finish before the remaining workers are stopped.
    let stopped = engine.shutdown().await;
    if let Err(e) = follower.await {
        if !e.is_cancelled() {
            error!(error = %e, "Config follower task panicked");
        }
    }

    info!(stopped, "Fleet manager shutdown complete");
    Ok(())
}

async fn worker(config: Config, args: WorkerArgs) -> Result<()> {
    let registry = PluginRegistry::bootstrap(config.plugin_dir.as_deref());
    let config_json = config_from_env()?;
    run_worker(
        &registry,
        &args.id,
        &args.worker_class,
        args.connection,
        &config_json,
    )
    .await
}
