//! OS process launcher.
//!
//! Each worker runs in its own process group so a terminate reaches anything
//! the worker spawned. By default the launcher re-executes the manager binary
//! with the `worker` subcommand; the child resolves the worker class in its
//! own registry and calls the entry point.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::launcher::{LaunchError, LaunchRequest, Launcher, WorkerProcess};
use crate::worker::WORKER_CONFIG_ENV;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Launcher that spawns real OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Program to execute.
    program: PathBuf,
    /// Arguments placed before the worker arguments.
    base_args: Vec<String>,
    /// Time a worker gets to exit after SIGTERM.
    terminate_grace: Duration,
}

impl ProcessLauncher {
    /// Launch workers through `program base_args.. --id .. --class .. --connection ..`.
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, terminate_grace: Duration) -> Self {
        Self {
            program: program.into(),
            base_args,
            terminate_grace,
        }
    }

    /// Launch workers by re-executing the running binary.
    pub fn current_exe(terminate_grace: Duration) -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec!["worker".to_string()],
            terminate_grace,
        ))
    }

    fn command(&self, request: &LaunchRequest<'_>) -> Result<Command, LaunchError> {
        let config = serde_json::to_string(request.config).map_err(|source| LaunchError::Config {
            worker_id: request.worker_id.to_string(),
            source,
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--id")
            .arg(request.worker_id)
            .arg("--class")
            .arg(request.worker_class)
            .arg("--connection")
            .arg(request.connection.as_str())
            .env(WORKER_CONFIG_ENV, config)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // New process group so we can signal all descendants
            .process_group(0)
            // Backstop if a process handle is dropped without `terminate`
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(
        &self,
        request: LaunchRequest<'_>,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let child = self
            .command(&request)?
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                worker_id: request.worker_id.to_string(),
                source,
            })?;
        let pid = child.id();

        info!(
            worker_id = %request.worker_id,
            worker_class = %request.worker_class,
            pid = ?pid,
            "Worker process spawned"
        );

        Ok(Box::new(ChildProcess {
            worker_id: request.worker_id.to_string(),
            pid,
            child,
            terminate_grace: self.terminate_grace,
        }))
    }
}

/// A spawned worker process.
#[derive(Debug)]
pub struct ChildProcess {
    worker_id: String,
    /// Captured at spawn; `Child::id` is gone once the child is reaped.
    pid: Option<u32>,
    child: Child,
    terminate_grace: Duration,
}

impl ChildProcess {
    fn signal_group(&self, pid: u32, signal: Signal) -> Result<bool, LaunchError> {
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(LaunchError::Signal { pid, source }),
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<(), LaunchError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if !self.is_alive() {
            debug!(worker_id = %self.worker_id, pid, "Worker already exited");
            return Ok(());
        }

        if !self.signal_group(pid, Signal::SIGTERM)? {
            return Ok(());
        }

        match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %self.worker_id, pid, %status, "Worker exited");
                Ok(())
            }
            Ok(Err(source)) => Err(LaunchError::Wait { pid, source }),
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    pid,
                    grace_ms = self.terminate_grace.as_millis() as u64,
                    "Worker did not respond to SIGTERM, sending SIGKILL"
                );
                self.signal_group(pid, Signal::SIGKILL)?;
                self.child
                    .wait()
                    .await
                    .map_err(|source| LaunchError::Wait { pid, source })?;
                Ok(())
            }
        }
    }
}
