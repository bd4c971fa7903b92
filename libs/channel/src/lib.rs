//! Config channel: where the desired-configuration document lives.
//!
//! A channel is a single durable slot holding the current document plus a
//! topic that announces every new version of it. Managers subscribe; clients
//! read, modify and write the whole document back.
//!
//! ## Transports
//!
//! - [`MemoryChannel`]: in-process slot, for tests and single-process setups
//! - [`SqliteChannel`]: slot in a SQLite file shared between processes;
//!   subscribers poll a revision counter
//!
//! Channels are addressed by a [`ConnectionInfo`] URL (`memory://` or
//! `sqlite:///path/to/file.db?key=slot`). The same URL is what workers receive
//! as their connection info.

pub mod client;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use client::{ClientError, ConfigClient};
pub use memory::MemoryChannel;
pub use sqlite::SqliteChannel;

/// Default slot name inside a shared store.
pub const DEFAULT_SLOT: &str = "workers";

/// Capacity of the change-notification topic.
///
/// Slow subscribers lag instead of blocking writers; a lagged subscriber
/// should re-read the slot.
pub const NOTIFY_CAPACITY: usize = 16;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid channel url: {0}")]
    InvalidUrl(String),

    #[error("channel task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared slot + pub/sub topic for the desired-configuration document.
///
/// Documents travel as raw text so that a malformed write is still delivered
/// and the receiver decides what it means.
#[async_trait]
pub trait ConfigChannel: Send + Sync {
    /// Read the current document, `None` if nothing was ever written.
    async fn read(&self) -> Result<Option<String>, ChannelError>;

    /// Replace the document and notify subscribers.
    async fn write(&self, document: &str) -> Result<(), ChannelError>;

    /// Subscribe to document changes.
    ///
    /// Every write that completes after this returns is delivered.
    async fn subscribe(&self) -> Result<broadcast::Receiver<String>, ChannelError>;

    /// Address of this channel, as handed to workers.
    fn connection_info(&self) -> ConnectionInfo;
}

/// Opaque channel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo(String);

/// Parsed form of a [`ConnectionInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    Memory,
    Sqlite { path: PathBuf, slot: String },
}

impl ConnectionInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn memory() -> Self {
        Self("memory://".to_string())
    }

    pub fn sqlite(path: impl Into<PathBuf>, slot: &str) -> Self {
        let path = path.into();
        if slot == DEFAULT_SLOT {
            Self(format!("sqlite://{}", path.display()))
        } else {
            Self(format!("sqlite://{}?key={}", path.display(), slot))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the URL into a transport address.
    pub fn address(&self) -> Result<ChannelAddress, ChannelError> {
        let url = self.0.trim();
        if url == "memory://" || url == "memory:" {
            return Ok(ChannelAddress::Memory);
        }

        let Some(rest) = url.strip_prefix("sqlite://") else {
            return Err(ChannelError::InvalidUrl(self.0.clone()));
        };

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(ChannelError::InvalidUrl(self.0.clone()));
        }

        let mut slot = DEFAULT_SLOT.to_string();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("key", value)) if !value.is_empty() => slot = value.to_string(),
                _ => return Err(ChannelError::InvalidUrl(self.0.clone())),
            }
        }

        Ok(ChannelAddress::Sqlite {
            path: PathBuf::from(path),
            slot,
        })
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ConnectionInfo {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let info = Self::new(s);
        info.address()?;
        Ok(info)
    }
}

/// Open the channel a [`ConnectionInfo`] points at.
///
/// A `memory://` channel is private to the calling process.
pub fn open_channel(
    info: &ConnectionInfo,
    poll_interval: Duration,
) -> Result<Arc<dyn ConfigChannel>, ChannelError> {
    match info.address()? {
        ChannelAddress::Memory => Ok(Arc::new(MemoryChannel::new())),
        ChannelAddress::Sqlite { path, slot } => {
            Ok(Arc::new(SqliteChannel::open(path, &slot, poll_interval)?))
        }
    }
}
