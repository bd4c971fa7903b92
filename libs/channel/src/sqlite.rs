//! SQLite-backed config channel.
//!
//! The document lives in one row of `config_slots`, keyed by slot name. Every
//! write bumps the row's `revision`; subscribers are fed by a poller that
//! watches the revision, so writers in other processes are observed too.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ChannelError, ConfigChannel, ConnectionInfo, NOTIFY_CAPACITY};

/// Wait for a lock held by another process before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Connection>>;

/// Config channel stored in a SQLite file.
pub struct SqliteChannel {
    conn: SharedConnection,
    slot: String,
    info: ConnectionInfo,
    poll_interval: Duration,
    notifier: broadcast::Sender<String>,
    poller: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SqliteChannel {
    /// Open or create the store at `path`, using the given slot.
    pub fn open<P: AsRef<Path>>(
        path: P,
        slot: &str,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets the manager poll while clients write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn, ConnectionInfo::sqlite(path, slot), slot, poll_interval)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(slot: &str, poll_interval: Duration) -> Result<Self, ChannelError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, ConnectionInfo::memory(), slot, poll_interval)
    }

    fn from_connection(
        conn: Connection,
        info: ConnectionInfo,
        slot: &str,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        init_schema(&conn)?;
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            slot: slot.to_string(),
            info,
            poll_interval,
            notifier,
            poller: tokio::sync::Mutex::new(None),
        })
    }

    /// Current revision of the slot, 0 if it was never written.
    pub async fn revision(&self) -> Result<i64, ChannelError> {
        let conn = Arc::clone(&self.conn);
        let slot = self.slot.clone();
        let row = tokio::task::spawn_blocking(move || load_slot(&conn, &slot)).await??;
        Ok(row.map(|(revision, _)| revision).unwrap_or(0))
    }

    async fn ensure_poller(&self) -> Result<(), ChannelError> {
        // Held across the baseline read so concurrent subscribers start one poller.
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        // Baseline read before `subscribe` returns: later writes are always announced.
        let conn = Arc::clone(&self.conn);
        let slot = self.slot.clone();
        let baseline = tokio::task::spawn_blocking(move || load_slot(&conn, &slot))
            .await??
            .map(|(revision, _)| revision);

        *poller = Some(tokio::spawn(poll_slot(
            Arc::clone(&self.conn),
            self.slot.clone(),
            self.poll_interval,
            self.notifier.clone(),
            baseline,
        )));
        Ok(())
    }
}

impl Drop for SqliteChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ConfigChannel for SqliteChannel {
    async fn read(&self) -> Result<Option<String>, ChannelError> {
        let conn = Arc::clone(&self.conn);
        let slot = self.slot.clone();
        let row = tokio::task::spawn_blocking(move || load_slot(&conn, &slot)).await??;
        Ok(row.map(|(_, document)| document))
    }

    async fn write(&self, document: &str) -> Result<(), ChannelError> {
        let conn = Arc::clone(&self.conn);
        let slot = self.slot.clone();
        let document = document.to_string();

        let revision =
            tokio::task::spawn_blocking(move || store_slot(&conn, &slot, &document)).await??;
        debug!(slot = %self.slot, revision, "Config document written");
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<String>, ChannelError> {
        let rx = self.notifier.subscribe();
        self.ensure_poller().await?;
        Ok(rx)
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

fn init_schema(conn: &Connection) -> Result<(), ChannelError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS config_slots (
            slot TEXT PRIMARY KEY,
            document TEXT NOT NULL,
            revision INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn lock(conn: &SharedConnection) -> std::sync::MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn load_slot(conn: &SharedConnection, slot: &str) -> Result<Option<(i64, String)>, ChannelError> {
    let conn = lock(conn);
    let row = conn
        .query_row(
            "SELECT revision, document FROM config_slots WHERE slot = ?1",
            params![slot],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

fn store_slot(conn: &SharedConnection, slot: &str, document: &str) -> Result<i64, ChannelError> {
    let conn = lock(conn);
    let now = chrono::Utc::now().to_rfc3339();
    let revision = conn.query_row(
        r#"
        INSERT INTO config_slots (slot, document, revision, updated_at)
        VALUES (?1, ?2, 1, ?3)
        ON CONFLICT(slot) DO UPDATE SET
            document = excluded.document,
            revision = config_slots.revision + 1,
            updated_at = excluded.updated_at
        RETURNING revision
        "#,
        params![slot, document, now],
        |row| row.get(0),
    )?;
    Ok(revision)
}

async fn poll_slot(
    conn: SharedConnection,
    slot: String,
    interval: Duration,
    notifier: broadcast::Sender<String>,
    mut last_seen: Option<i64>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if notifier.receiver_count() == 0 {
            debug!(slot = %slot, "No subscribers left, stopping poller");
            break;
        }

        let conn = Arc::clone(&conn);
        let key = slot.clone();
        let row = match tokio::task::spawn_blocking(move || load_slot(&conn, &key)).await {
            Ok(Ok(row)) => row,
            Ok(Err(e)) => {
                warn!(error = %e, slot = %slot, "Failed to poll config slot");
                continue;
            }
            Err(e) => {
                warn!(error = %e, slot = %slot, "Config slot poll task failed");
                continue;
            }
        };

        if let Some((revision, document)) = row {
            if last_seen != Some(revision) {
                debug!(slot = %slot, revision, "Config document changed");
                last_seen = Some(revision);
                let _ = notifier.send(document);
            }
        }
    }
}
