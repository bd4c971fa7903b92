//! flotillactl - CLI for the flotilla desired configuration
//!
//! Adds, updates and removes workers in the document the fleet manager
//! reconciles against.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;
mod settings;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
