//! Configuration for the fleet manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use flotilla_channel::ConnectionInfo;

use crate::engine::EmptyDocumentPolicy;

/// Environment variable holding the fallback log filter.
pub const LOG_LEVEL_ENV: &str = "FLOTILLA_LOG_LEVEL";

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the desired configuration is published.
    pub channel_url: ConnectionInfo,

    /// Directory scanned for external worker plugins.
    pub plugin_dir: Option<PathBuf>,

    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,

    /// Poll interval for SQLite channel subscriptions.
    pub poll_interval: Duration,

    /// What an explicit empty worker list means.
    pub empty_document: EmptyDocumentPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let channel_url = lookup("FLOTILLA_CHANNEL_URL")
            .unwrap_or_else(|| "sqlite:///var/lib/flotilla/desired.db".to_string())
            .parse::<ConnectionInfo>()
            .context("FLOTILLA_CHANNEL_URL is not a valid channel url")?;

        let plugin_dir = lookup("FLOTILLA_PLUGIN_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let terminate_grace = lookup("FLOTILLA_TERMINATE_GRACE_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(crate::process::DEFAULT_TERMINATE_GRACE);

        let poll_interval = lookup("FLOTILLA_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(500));

        let empty_document = match lookup("FLOTILLA_EMPTY_DOCUMENT") {
            Some(value) => value
                .parse()
                .context("FLOTILLA_EMPTY_DOCUMENT must be `stop-all` or `ignore`")?,
            None => EmptyDocumentPolicy::default(),
        };

        let log_level = lookup(LOG_LEVEL_ENV).unwrap_or_else(|| "info".to_string());

        Ok(Self {
            channel_url,
            plugin_dir,
            terminate_grace,
            poll_interval,
            empty_document,
            log_level,
        })
    }
}
