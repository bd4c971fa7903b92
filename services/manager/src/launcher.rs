//! Worker launcher interface and mock implementation.
//!
//! The launcher interface abstracts worker process lifecycle:
//! - Starting a worker's entry point in a fresh OS process
//! - Terminating it and checking liveness through the returned handle
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use flotilla_channel::ConnectionInfo;
use flotilla_reconcile::WorkerConfig;
use thiserror::Error;
use tracing::{debug, info};

/// Launcher errors.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode config for worker {worker_id}: {source}")]
    Config {
        worker_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("failed to reap process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Injected(String),
}

/// What to launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub worker_id: &'a str,
    pub worker_class: &'a str,
    pub config: &'a WorkerConfig,
    pub connection: &'a ConnectionInfo,
}

/// Handle to one running worker process.
#[async_trait]
pub trait WorkerProcess: Send + Sync + fmt::Debug {
    /// OS process id, if the launcher has one.
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Stop the process. A process that already exited counts as stopped.
    async fn terminate(&mut self) -> Result<(), LaunchError>;
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a worker; returns once the process exists, not when it finishes.
    async fn start(&self, request: LaunchRequest<'_>)
        -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// Lifecycle event recorded by [`MockLauncher`].
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchEvent {
    Started {
        worker_id: String,
        config: WorkerConfig,
    },
    Terminated {
        worker_id: String,
    },
}

#[derive(Debug, Default)]
struct MockState {
    events: Vec<LaunchEvent>,
    /// pid -> worker id, for processes still alive.
    alive: HashMap<u32, String>,
    max_live_per_id: usize,
    fail_starts: HashSet<String>,
    fail_terminates: bool,
    next_pid: u32,
}

impl MockState {
    fn live_count(&self, worker_id: &str) -> usize {
        self.alive.values().filter(|id| *id == worker_id).count()
    }
}

/// Mock launcher for testing and development.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,

    /// Simulated startup delay.
    start_delay: Duration,

    /// Simulated time for a process to exit after being asked to stop.
    terminate_delay: Duration,
}

impl MockLauncher {
    /// Create a new mock launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock launcher whose starts take `delay`.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    /// Make every terminate take `delay` before the process is gone.
    pub fn with_terminate_delay(mut self, delay: Duration) -> Self {
        self.terminate_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Make every start of `worker_id` fail until cleared.
    pub fn fail_starts_for(&self, worker_id: &str) {
        self.state().fail_starts.insert(worker_id.to_string());
    }

    pub fn clear_start_failures(&self) {
        self.state().fail_starts.clear();
    }

    /// Make every terminate report an error (the process still dies).
    pub fn fail_terminates(&self, fail: bool) {
        self.state().fail_terminates = fail;
    }

    /// Simulate a worker exiting on its own.
    pub fn crash(&self, worker_id: &str) {
        self.state().alive.retain(|_, id| id != worker_id);
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn starts_for(&self, worker_id: &str) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, LaunchEvent::Started { worker_id: id, .. } if id == worker_id))
            .count()
    }

    pub fn terminations_for(&self, worker_id: &str) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, LaunchEvent::Terminated { worker_id: id } if id == worker_id))
            .count()
    }

    /// Ids with a live process, sorted.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().alive.values().cloned().collect();
        ids.sort();
        ids
    }

    /// Highest number of simultaneously live processes seen for any one id.
    pub fn max_live_per_id(&self) -> usize {
        self.state().max_live_per_id
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn start(
        &self,
        request: LaunchRequest<'_>,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut state = self.state();
        if state.fail_starts.contains(request.worker_id) {
            return Err(LaunchError::Injected(format!(
                "mock launcher configured to fail {}",
                request.worker_id
            )));
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        state.alive.insert(pid, request.worker_id.to_string());
        let live = state.live_count(request.worker_id);
        state.max_live_per_id = state.max_live_per_id.max(live);
        state.events.push(LaunchEvent::Started {
            worker_id: request.worker_id.to_string(),
            config: request.config.clone(),
        });

        info!(
            worker_id = %request.worker_id,
            worker_class = %request.worker_class,
            pid,
            "[MOCK] Worker started"
        );

        Ok(Box::new(MockProcess {
            worker_id: request.worker_id.to_string(),
            pid,
            terminate_delay: self.terminate_delay,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Process handle produced by [`MockLauncher`].
pub struct MockProcess {
    worker_id: String,
    pid: u32,
    terminate_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProcess")
            .field("worker_id", &self.worker_id)
            .field("pid", &self.pid)
            .finish()
    }
}

#[async_trait]
impl WorkerProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        lock(&self.state).alive.contains_key(&self.pid)
    }

    async fn terminate(&mut self) -> Result<(), LaunchError> {
        if !self.terminate_delay.is_zero() && self.is_alive() {
            tokio::time::sleep(self.terminate_delay).await;
        }

        let mut state = lock(&self.state);
        if state.alive.remove(&self.pid).is_none() {
            debug!(worker_id = %self.worker_id, pid = self.pid, "[MOCK] Worker already exited");
            return Ok(());
        }

        state.events.push(LaunchEvent::Terminated {
            worker_id: self.worker_id.clone(),
        });
        debug!(worker_id = %self.worker_id, pid = self.pid, "[MOCK] Worker terminated");

        if state.fail_terminates {
            return Err(LaunchError::Injected(format!(
                "mock terminate of {} reported failure",
                self.worker_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        id: &'a str,
        config: &'a WorkerConfig,
        connection: &'a ConnectionInfo,
    ) -> LaunchRequest<'a> {
        LaunchRequest {
            worker_id: id,
            worker_class: "EchoWorker",
            config,
            connection,
        }
    }

    #[tokio::test]
    async fn test_mock_start_and_terminate() {
        let launcher = MockLauncher::new();
        let config = WorkerConfig::new();
        let connection = ConnectionInfo::memory();

        let mut process = launcher
            .start(request("w1", &config, &connection))
            .await
            .unwrap();
        assert!(process.is_alive());
        assert_eq!(launcher.live_ids(), vec!["w1".to_string()]);

        process.terminate().await.unwrap();
        assert!(!process.is_alive());
        assert!(launcher.live_ids().is_empty());
        assert_eq!(launcher.starts_for("w1"), 1);
        assert_eq!(launcher.terminations_for("w1"), 1);
    }

    #[tokio::test]
    async fn test_mock_terminate_after_crash_is_ok() {
        let launcher = MockLauncher::new();
        let config = WorkerConfig::new();
        let connection = ConnectionInfo::memory();

        let mut process = launcher
            .start(request("w1", &config, &connection))
            .await
            .unwrap();
        launcher.crash("w1");

        assert!(!process.is_alive());
        process.terminate().await.unwrap();
        assert_eq!(launcher.terminations_for("w1"), 0);
    }

    #[tokio::test]
    async fn test_mock_failing_start() {
        let launcher = MockLauncher::new();
        launcher.fail_starts_for("w1");
        let config = WorkerConfig::new();
        let connection = ConnectionInfo::memory();

        let result = launcher.start(request("w1", &config, &connection)).await;
        assert!(matches!(result, Err(LaunchError::Injected(_))));
        assert!(launcher.events().is_empty());

        launcher.clear_start_failures();
        assert!(launcher
            .start(request("w1", &config, &connection))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_mock_terminate_delay_keeps_process_alive_until_done() {
        let launcher = MockLauncher::new().with_terminate_delay(Duration::from_millis(200));
        let config = WorkerConfig::new();
        let connection = ConnectionInfo::memory();

        let mut process = launcher
            .start(request("w1", &config, &connection))
            .await
            .unwrap();

        // Abandoning a slow terminate leaves the process running.
        let cut_short =
            tokio::time::timeout(Duration::from_millis(20), process.terminate()).await;
        assert!(cut_short.is_err());
        assert_eq!(launcher.live_ids(), vec!["w1".to_string()]);

        process.terminate().await.unwrap();
        assert!(launcher.live_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mock_tracks_overlapping_processes() {
        let launcher = MockLauncher::new();
        let config = WorkerConfig::new();
        let connection = ConnectionInfo::memory();

        let _a = launcher
            .start(request("w1", &config, &connection))
            .await
            .unwrap();
        let _b = launcher
            .start(request("w1", &config, &connection))
            .await
            .unwrap();

        assert_eq!(launcher.max_live_per_id(), 2);
    }
}
