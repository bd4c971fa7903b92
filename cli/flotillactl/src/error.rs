//! Error handling and display for the CLI.

use colored::Colorize;
use flotilla_channel::{ChannelError, ClientError};
use flotilla_reconcile::DocumentError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid setting '{0}'. Use format KEY=VALUE (e.g., output=o1)")]
    InvalidSetting(String),

    #[error("--config is not valid JSON: {0}")]
    InvalidConfigJson(#[from] serde_json::Error),

    #[error("--config must be a JSON object")]
    ConfigNotObject,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", hint.yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<String> {
    if let Some(client_err) = err.downcast_ref::<ClientError>() {
        return match client_err {
            ClientError::DuplicateWorkerId(id) => Some(format!(
                "Hint: Use `flotillactl update {id}` to change an existing worker."
            )),
            ClientError::WorkerNotFound(_) => {
                Some("Hint: Run `flotillactl list` to see configured workers.".to_string())
            }
            ClientError::MalformedDocument(_) => Some(
                "Hint: The stored document is not valid; nothing was written over it.".to_string(),
            ),
            ClientError::InvalidSpec(DocumentError::ReservedField { .. }) => {
                Some("Hint: `id` and `worker_cls` cannot be used as setting names.".to_string())
            }
            ClientError::InvalidSpec(_) => None,
            ClientError::Channel(_) => Some(channel_hint()),
        };
    }

    if err.downcast_ref::<ChannelError>().is_some() {
        return Some(channel_hint());
    }

    None
}

fn channel_hint() -> String {
    "Hint: Check --channel or FLOTILLA_CHANNEL_URL (memory:// or sqlite:///path/to/file.db)."
        .to_string()
}
