//! Worker process entry.
//!
//! The manager launches `flotilla-manager worker --id .. --class ..
//! --connection ..` with the worker config in `FLOTILLA_WORKER_CONFIG`.
//! This module turns that invocation into a call of the registered
//! entry point.

use anyhow::{Context, Result};
use flotilla_channel::ConnectionInfo;
use flotilla_reconcile::WorkerConfig;
use tracing::info;

use crate::registry::PluginRegistry;

/// Environment variable carrying the worker config as JSON.
pub const WORKER_CONFIG_ENV: &str = "FLOTILLA_WORKER_CONFIG";

/// Environment variable carrying the connection info for external plugins.
pub const CONNECTION_ENV: &str = "FLOTILLA_CONNECTION";

/// Read the worker config handed over by the launcher.
pub fn config_from_env() -> Result<String> {
    std::env::var(WORKER_CONFIG_ENV)
        .with_context(|| format!("{WORKER_CONFIG_ENV} is not set"))
}

/// Resolve `worker_class` and run it until it returns.
pub async fn run_worker(
    registry: &PluginRegistry,
    worker_id: &str,
    worker_class: &str,
    connection: ConnectionInfo,
    config_json: &str,
) -> Result<()> {
    let config: WorkerConfig = serde_json::from_str(config_json)
        .with_context(|| format!("config for worker {worker_id} is not a JSON object"))?;

    let runner = registry
        .resolve(worker_class)
        .with_context(|| format!("unknown worker class {worker_class}"))?;

    info!(
        worker_id = %worker_id,
        worker_class = %worker_class,
        pid = std::process::id(),
        "Worker process starting"
    );

    runner
        .run(config, connection)
        .await
        .with_context(|| format!("worker {worker_id} failed"))
}
