//! Reconciliation engine.
//!
//! The engine:
//! - Owns every running worker process, keyed by worker id
//! - Diffs each published document against the running set
//! - Starts, restarts and stops worker processes to converge
//!
//! Passes are serialized by one lock held for the whole pass, whether they
//! come from the subscription task or from a direct call.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flotilla_channel::{ChannelError, ConfigChannel, ConnectionInfo};
use flotilla_reconcile::{
    plan_actions, DesiredConfigDocument, SpecHash, WorkerConfig, WorkerSpec,
};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::launcher::{LaunchError, LaunchRequest, Launcher, WorkerProcess};
use crate::registry::PluginRegistry;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// What an explicit `{"workers": []}` means.
///
/// An absent or unparseable document is never an instruction; this only
/// covers a well-formed document that lists no workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyDocumentPolicy {
    /// Converge to zero workers.
    #[default]
    StopAll,
    /// Leave running workers alone.
    Ignore,
}

#[derive(Debug, Error)]
#[error("unknown empty-document policy: {0}")]
pub struct UnknownPolicy(String);

impl std::str::FromStr for EmptyDocumentPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop-all" => Ok(Self::StopAll),
            "ignore" => Ok(Self::Ignore),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub empty_document: EmptyDocumentPolicy,
}

/// One live worker owned by the engine.
#[derive(Debug)]
struct RunningWorker {
    worker_class: String,
    /// Config the process was started with.
    config: WorkerConfig,
    fingerprint: SpecHash,
    started_at: DateTime<Utc>,
    process: Box<dyn WorkerProcess>,
}

/// Status snapshot of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: String,
    pub worker_class: String,
    pub fingerprint: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub started_at: DateTime<Utc>,
}

/// A worker that could not be started this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
    pub worker_id: String,
    pub error: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
    pub unresolved: Vec<String>,
    pub failed: Vec<StartFailure>,
}

impl ReconcileReport {
    /// True when the pass touched no process.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.restarted.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
    }
}

/// Keeps running workers converged on the desired document.
pub struct ReconciliationEngine {
    registry: Arc<PluginRegistry>,
    launcher: Arc<dyn Launcher>,
    channel: Arc<dyn ConfigChannel>,
    connection: ConnectionInfo,
    config: EngineConfig,

    /// Running workers by id. Held for the duration of a pass.
    workers: Mutex<BTreeMap<String, RunningWorker>>,

    /// Set once by `shutdown`; passes after that touch nothing.
    stopping: watch::Sender<bool>,
}

impl ReconciliationEngine {
    /// Create an engine. The registry must already hold every plugin.
    pub fn new(
        registry: Arc<PluginRegistry>,
        launcher: Arc<dyn Launcher>,
        channel: Arc<dyn ConfigChannel>,
        config: EngineConfig,
    ) -> Self {
        let connection = channel.connection_info();
        let (stopping, _) = watch::channel(false);
        Self {
            registry,
            launcher,
            channel,
            connection,
            config,
            workers: Mutex::new(BTreeMap::new()),
            stopping,
        }
    }

    /// Reconcile against the current document, then follow changes.
    ///
    /// Returns the handle of the task consuming change notifications. The
    /// task ends after [`shutdown`](Self::shutdown), once any in-flight pass
    /// has finished.
    pub async fn initialize(self: &Arc<Self>) -> Result<JoinHandle<()>, EngineError> {
        info!(
            connection = %self.connection,
            worker_classes = ?self.registry.names(),
            "Initializing reconciliation engine"
        );

        // Subscribe before reading so a change in between is not lost.
        let notifications = self.channel.subscribe().await?;

        match self.channel.read().await? {
            Some(text) => {
                self.on_raw_document(&text).await;
            }
            None => info!("No desired configuration published yet"),
        }

        let engine = Arc::clone(self);
        let stopped = self.stopping.subscribe();
        Ok(tokio::spawn(async move {
            engine.follow(notifications, stopped).await;
        }))
    }

    async fn follow(
        &self,
        mut notifications: broadcast::Receiver<String>,
        mut stopped: watch::Receiver<bool>,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped.wait_for(|stopping| *stopping) => break,
                received = notifications.recv() => received,
            };

            let mut latest = match received {
                Ok(text) => Some(text),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Config notifications lagged, skipping to the latest");
                    None
                }
                Err(RecvError::Closed) => {
                    info!("Config channel closed, no longer following changes");
                    break;
                }
            };

            // Only the newest queued document is reconciled.
            loop {
                match notifications.try_recv() {
                    Ok(text) => latest = Some(text),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }

            let text = match latest {
                Some(text) => text,
                None => match self.channel.read().await {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, "Failed to re-read config channel");
                        continue;
                    }
                },
            };
            self.on_raw_document(&text).await;
        }
        debug!("Config follower stopped");
    }

    /// Parse and reconcile a raw document.
    ///
    /// A malformed document is logged and ignored; running workers are left
    /// as they are. Returns `None` in that case.
    pub async fn on_raw_document(&self, text: &str) -> Option<ReconcileReport> {
        match DesiredConfigDocument::parse(text) {
            Ok(document) => Some(self.on_config_changed(&document).await),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed config document");
                None
            }
        }
    }

    /// Run one reconciliation pass against `document`.
    pub async fn on_config_changed(&self, document: &DesiredConfigDocument) -> ReconcileReport {
        let mut workers = self.workers.lock().await;
        let mut report = ReconcileReport::default();

        if *self.stopping.borrow() {
            debug!("Engine is shutting down, ignoring config change");
            return report;
        }

        if document.is_empty() && self.config.empty_document == EmptyDocumentPolicy::Ignore {
            debug!(
                running = workers.len(),
                "Empty worker list ignored by policy"
            );
            return report;
        }

        let plan = plan_actions(
            document,
            workers.iter().map(|(id, w)| (id.as_str(), &w.config)),
            |class| self.registry.contains(class),
        );

        let status = plan.status();
        if status.is_converged() {
            debug!(workers = workers.len(), "Workers already converged");
            report.unchanged = plan.unchanged;
            return report;
        }
        debug!(
            status = ?status,
            start = plan.start.len(),
            restart = plan.restart.len(),
            stop = plan.stop.len(),
            "Planned reconciliation pass"
        );

        for spec in &plan.unresolved {
            warn!(
                worker_id = %spec.id,
                worker_class = %spec.worker_class,
                "Unknown worker class, skipping"
            );
            report.unresolved.push(spec.id.clone());
        }

        for id in &plan.stop {
            if let Some(mut worker) = workers.remove(id) {
                Self::terminate(id, &mut worker).await;
                report.stopped.push(id.clone());
            }
        }

        for spec in &plan.restart {
            if let Some(mut old) = workers.remove(&spec.id) {
                info!(
                    worker_id = %spec.id,
                    old_fingerprint = %old.fingerprint,
                    "Worker config changed, restarting"
                );
                // The old process is gone before the replacement is recorded.
                Self::terminate(&spec.id, &mut old).await;
            }
            match self.start(spec).await {
                Ok(worker) => {
                    workers.insert(spec.id.clone(), worker);
                    report.restarted.push(spec.id.clone());
                }
                Err(e) => report.failed.push(Self::start_failed(spec, e)),
            }
        }

        for spec in &plan.start {
            match self.start(spec).await {
                Ok(worker) => {
                    workers.insert(spec.id.clone(), worker);
                    report.started.push(spec.id.clone());
                }
                Err(e) => report.failed.push(Self::start_failed(spec, e)),
            }
        }

        report.unchanged = plan.unchanged;

        info!(
            started = report.started.len(),
            restarted = report.restarted.len(),
            stopped = report.stopped.len(),
            unchanged = report.unchanged.len(),
            unresolved = report.unresolved.len(),
            failed = report.failed.len(),
            running = workers.len(),
            "Reconciliation pass complete"
        );

        report
    }

    async fn start(&self, spec: &WorkerSpec) -> Result<RunningWorker, LaunchError> {
        let config = spec.config();
        let fingerprint = SpecHash::of_config(&config);

        info!(
            worker_id = %spec.id,
            worker_class = %spec.worker_class,
            fingerprint = %fingerprint,
            "Starting worker"
        );

        let process = self
            .launcher
            .start(LaunchRequest {
                worker_id: &spec.id,
                worker_class: &spec.worker_class,
                config: &config,
                connection: &self.connection,
            })
            .await?;

        Ok(RunningWorker {
            worker_class: spec.worker_class.clone(),
            config,
            fingerprint,
            started_at: Utc::now(),
            process,
        })
    }

    fn start_failed(spec: &WorkerSpec, e: LaunchError) -> StartFailure {
        error!(worker_id = %spec.id, error = %e, "Failed to start worker");
        StartFailure {
            worker_id: spec.id.clone(),
            error: e.to_string(),
        }
    }

    async fn terminate(id: &str, worker: &mut RunningWorker) {
        info!(worker_id = %id, pid = ?worker.process.pid(), "Stopping worker");
        if let Err(e) = worker.process.terminate().await {
            warn!(worker_id = %id, error = %e, "Error stopping worker, treating as stopped");
        }
    }

    /// Stop following changes and terminate every running worker.
    ///
    /// A pass already in flight finishes first, so no worker it touched is
    /// left behind; no later pass starts anything. Returns how many workers
    /// were stopped.
    pub async fn shutdown(&self) -> usize {
        self.stopping.send_replace(true);
        let mut workers = self.workers.lock().await;
        let count = workers.len();
        info!(count, "Stopping all workers");

        while let Some((id, mut worker)) = workers.pop_first() {
            Self::terminate(&id, &mut worker).await;
        }
        count
    }

    /// Ids of running workers, sorted.
    pub async fn running_ids(&self) -> Vec<String> {
        self.workers.lock().await.keys().cloned().collect()
    }

    /// Config a running worker was started with.
    pub async fn worker_config(&self, id: &str) -> Option<WorkerConfig> {
        self.workers.lock().await.get(id).map(|w| w.config.clone())
    }

    /// Status of every running worker.
    ///
    /// `alive` is informational: a worker that exited on its own is not
    /// restarted until its spec changes.
    pub async fn running_workers(&self) -> Vec<WorkerStatus> {
        let mut workers = self.workers.lock().await;
        workers
            .iter_mut()
            .map(|(id, w)| WorkerStatus {
                id: id.clone(),
                worker_class: w.worker_class.clone(),
                fingerprint: w.fingerprint.to_string(),
                pid: w.process.pid(),
                alive: w.process.is_alive(),
                started_at: w.started_at,
            })
            .collect()
    }
}
