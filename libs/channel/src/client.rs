//! Read-modify-write client for the desired-configuration document.
//!
//! Every mutation reads the whole document, edits it in memory and publishes
//! the whole document back. Writers are not coordinated: two clients editing
//! at the same time race and the last write wins.

use std::sync::Arc;

use flotilla_reconcile::{DesiredConfigDocument, DocumentError, WorkerConfig, WorkerSpec};
use thiserror::Error;
use tracing::{debug, info};

use crate::{ChannelError, ConfigChannel};

/// Errors from config client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("worker id already present: {0}")]
    DuplicateWorkerId(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("stored document is malformed: {0}")]
    MalformedDocument(#[source] DocumentError),

    #[error("invalid worker spec: {0}")]
    InvalidSpec(#[source] DocumentError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Façade for adding, updating and removing single workers.
#[derive(Clone)]
pub struct ConfigClient {
    channel: Arc<dyn ConfigChannel>,
}

impl ConfigClient {
    pub fn new(channel: Arc<dyn ConfigChannel>) -> Self {
        Self { channel }
    }

    /// Read the current document. An empty slot is an empty document.
    pub async fn load(&self) -> Result<DesiredConfigDocument, ClientError> {
        match self.channel.read().await? {
            None => Ok(DesiredConfigDocument::new()),
            Some(text) => {
                DesiredConfigDocument::parse(&text).map_err(ClientError::MalformedDocument)
            }
        }
    }

    async fn publish(&self, document: &DesiredConfigDocument) -> Result<(), ClientError> {
        let text = document.to_json().map_err(ClientError::InvalidSpec)?;
        self.channel.write(&text).await?;
        debug!(worker_count = document.len(), "Published desired configuration");
        Ok(())
    }

    /// Add a worker. Fails if the id is already present.
    pub async fn add_worker(
        &self,
        id: &str,
        config: WorkerConfig,
        worker_class: &str,
    ) -> Result<WorkerSpec, ClientError> {
        let spec = WorkerSpec::new(id, worker_class, config).map_err(ClientError::InvalidSpec)?;

        let mut document = self.load().await?;
        if document.contains(id) {
            return Err(ClientError::DuplicateWorkerId(id.to_string()));
        }
        document
            .insert(spec.clone())
            .map_err(ClientError::InvalidSpec)?;

        self.publish(&document).await?;
        info!(worker_id = %id, worker_class = %worker_class, "Worker added");
        Ok(spec)
    }

    /// Replace a worker's settings, keeping its class.
    pub async fn update_worker(
        &self,
        id: &str,
        config: WorkerConfig,
    ) -> Result<WorkerSpec, ClientError> {
        let mut document = self.load().await?;
        let entry = document
            .get_mut(id)
            .ok_or_else(|| ClientError::WorkerNotFound(id.to_string()))?;

        let spec = WorkerSpec::new(id, entry.worker_class.clone(), config)
            .map_err(ClientError::InvalidSpec)?;
        *entry = spec.clone();

        self.publish(&document).await?;
        info!(worker_id = %id, "Worker updated");
        Ok(spec)
    }

    /// Remove a worker. Returns false (and publishes nothing) if absent.
    pub async fn remove_worker(&self, id: &str) -> Result<bool, ClientError> {
        let mut document = self.load().await?;
        if document.remove(id).is_none() {
            debug!(worker_id = %id, "Worker not present, nothing to remove");
            return Ok(false);
        }

        self.publish(&document).await?;
        info!(worker_id = %id, "Worker removed");
        Ok(true)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerSpec>, ClientError> {
        Ok(self.load().await?.workers)
    }

    pub async fn get_worker(&self, id: &str) -> Result<WorkerSpec, ClientError> {
        self.load()
            .await?
            .remove(id)
            .ok_or_else(|| ClientError::WorkerNotFound(id.to_string()))
    }
}
