//! CLI commands.

mod workers;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flotilla_channel::{open_channel, ConfigClient, ConnectionInfo};

use crate::output::OutputFormat;

/// flotillactl - Manage the workers a flotilla fleet manager runs.
#[derive(Debug, Parser)]
#[command(name = "flotillactl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Config channel holding the desired configuration.
    #[arg(
        long,
        global = true,
        env = "FLOTILLA_CHANNEL_URL",
        default_value = "sqlite:///var/lib/flotilla/desired.db"
    )]
    channel: ConnectionInfo,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add a worker.
    Add(workers::AddArgs),

    /// Replace a worker's settings (its class is kept).
    Update(workers::UpdateArgs),

    /// Remove a worker.
    Remove(workers::RemoveArgs),

    /// List workers in the desired configuration.
    List,

    /// Show one worker.
    Get(workers::GetArgs),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let ctx = CommandContext {
            channel: self.channel,
            format,
        };

        match self.command {
            Commands::Add(args) => workers::add(ctx, args).await,
            Commands::Update(args) => workers::update(ctx, args).await,
            Commands::Remove(args) => workers::remove(ctx, args).await,
            Commands::List => workers::list(ctx).await,
            Commands::Get(args) => workers::get(ctx, args).await,
            Commands::Version => {
                println!("flotillactl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub channel: ConnectionInfo,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Open the channel and wrap it in a client.
    pub fn client(&self) -> Result<ConfigClient> {
        // One-shot commands never subscribe, so the poll interval is unused.
        let channel = open_channel(&self.channel, Duration::from_millis(500))
            .with_context(|| format!("failed to open channel {}", self.channel))?;
        Ok(ConfigClient::new(channel))
    }
}
