//! Built-in worker entry points.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flotilla_channel::ConnectionInfo;
use flotilla_reconcile::WorkerConfig;
use serde_json::Value;
use tracing::info;

use crate::registry::WorkerRunner;
use crate::worker::{CONNECTION_ENV, WORKER_CONFIG_ENV};

const DEFAULT_ECHO_INTERVAL_MS: u64 = 1000;

/// Logs a heartbeat carrying its `output` setting.
///
/// Settings: `output` (string), `interval_ms` (default 1000) and `count`
/// (stop after that many beats; runs forever when absent).
pub struct EchoWorker;

impl EchoWorker {
    pub const NAME: &'static str = "EchoWorker";
}

#[async_trait]
impl WorkerRunner for EchoWorker {
    async fn run(&self, config: WorkerConfig, connection: ConnectionInfo) -> Result<()> {
        let output = config
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("stdout")
            .to_string();
        let interval_ms = config
            .get("interval_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_ECHO_INTERVAL_MS)
            .max(1);
        let limit = config.get("count").and_then(Value::as_u64);

        info!(output = %output, interval_ms, connection = %connection, "Echo worker running");

        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut beats: u64 = 0;
        loop {
            ticker.tick().await;
            beats += 1;
            info!(output = %output, beats, "echo");

            if limit.is_some_and(|limit| beats >= limit) {
                return Ok(());
            }
        }
    }
}

/// Runs an external plugin executable as the worker.
///
/// The plugin gets its config as JSON in `FLOTILLA_WORKER_CONFIG` and the
/// channel address in `FLOTILLA_CONNECTION`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkerRunner for CommandRunner {
    async fn run(&self, config: WorkerConfig, connection: ConnectionInfo) -> Result<()> {
        let config = serde_json::to_string(&config)?;
        let status = tokio::process::Command::new(&self.program)
            .env(WORKER_CONFIG_ENV, config)
            .env(CONNECTION_ENV, connection.as_str())
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("failed to run plugin {}", self.program.display()))?;

        anyhow::ensure!(
            status.success(),
            "plugin {} exited with {}",
            self.program.display(),
            status
        );
        Ok(())
    }
}
