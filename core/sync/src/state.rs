//! Transfer counters and the event stream of a sync target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::pool::ConnectionHealth;
use remotesync_common::RemotePath;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Kind of remote transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
            TransferKind::Delete => "delete",
        })
    }
}

/// Counters reported by [`crate::SyncTarget::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub deletes_succeeded: u64,
    pub deletes_failed: u64,
    /// Time of the last settled transfer.
    pub last_activity: Option<DateTime<Utc>>,
    pub connected: bool,
    /// Operations queued and not yet started.
    pub queue_length: usize,
}

/// Something that happened on a sync target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    Uploaded {
        local_path: PathBuf,
        remote_path: RemotePath,
    },
    Downloaded {
        remote_path: RemotePath,
        local_path: PathBuf,
    },
    Deleted {
        remote_path: RemotePath,
    },
    Failed {
        kind: TransferKind,
        path: String,
        error: String,
    },
    HealthChanged {
        health: ConnectionHealth,
    },
}

/// Counts settled transfers and fans events out to subscribers.
pub(crate) struct StatsRecorder {
    stats: Mutex<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            stats: Mutex::new(SyncStats::default()),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Count `event` and publish it. Nobody listening is fine.
    pub(crate) fn record(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            let counter = match &event {
                SyncEvent::Uploaded { .. } => Some(&mut stats.uploads_succeeded),
                SyncEvent::Downloaded { .. } => Some(&mut stats.downloads_succeeded),
                SyncEvent::Deleted { .. } => Some(&mut stats.deletes_succeeded),
                SyncEvent::Failed { kind, .. } => Some(match kind {
                    TransferKind::Upload => &mut stats.uploads_failed,
                    TransferKind::Download => &mut stats.downloads_failed,
                    TransferKind::Delete => &mut stats.deletes_failed,
                }),
                SyncEvent::HealthChanged { .. } => None,
            };
            if let Some(counter) = counter {
                *counter += 1;
                stats.last_activity = Some(Utc::now());
            }
        }
        let _ = self.events.send(event);
    }

    /// Counters with the live fields filled in by the caller.
    pub(crate) fn snapshot(&self, connected: bool, queue_length: usize) -> SyncStats {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
        stats.connected = connected;
        stats.queue_length = queue_length;
        stats
    }
}
