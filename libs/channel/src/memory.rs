//! In-process config channel.

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::{ChannelError, ConfigChannel, ConnectionInfo, NOTIFY_CAPACITY};

/// Config channel backed by process memory.
pub struct MemoryChannel {
    slot: RwLock<Option<String>>,
    notifier: broadcast::Sender<String>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::from_slot(None)
    }

    /// Create a channel already holding a document.
    pub fn with_document(document: impl Into<String>) -> Self {
        Self::from_slot(Some(document.into()))
    }

    fn from_slot(slot: Option<String>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            slot: RwLock::new(slot),
            notifier,
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigChannel for MemoryChannel {
    async fn read(&self) -> Result<Option<String>, ChannelError> {
        Ok(self.slot.read().await.clone())
    }

    async fn write(&self, document: &str) -> Result<(), ChannelError> {
        // Notify under the lock so subscribers see writes in order.
        let mut slot = self.slot.write().await;
        *slot = Some(document.to_string());
        // No subscribers is fine.
        let _ = self.notifier.send(document.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<String>, ChannelError> {
        Ok(self.notifier.subscribe())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::memory()
    }
}
