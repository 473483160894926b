//! Debouncing and deduplication of local change events.
//!
//! Each path has at most one debounce timer. A new event for the path
//! cancels the running timer and starts a fresh one, so a burst of saves
//! turns into one submission carrying the last change kind. A path whose
//! previous submission has not settled yet is skipped, and paths being
//! uploaded by hand are muted until shortly after that upload finishes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ignore::IgnorePredicate;
use crate::watcher::{ChangeEvent, ChangeKind};
use remotesync_common::Result;

/// Priority for uploads of created or changed files.
pub const UPLOAD_PRIORITY: i32 = 1;
/// Priority for deletes, which run after uploads queued alongside them.
pub const DELETE_PRIORITY: i32 = 0;

/// Receiver of coalesced changes.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Queue work for `path` and wait until it settles.
    async fn submit(&self, path: PathBuf, kind: ChangeKind, priority: i32) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Quiet period before a change is submitted.
    pub debounce: Duration,
    /// How long a manual upload keeps its path muted after settling.
    pub upload_release_delay: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            upload_release_delay: Duration::from_secs(1),
        }
    }
}

struct PendingChange {
    kind: ChangeKind,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct CoalescerState {
    timers: HashMap<PathBuf, PendingChange>,
    in_flight: HashSet<PathBuf>,
    /// Overlapping manual uploads of one path each hold a count.
    active_uploads: HashMap<PathBuf, usize>,
    next_generation: u64,
}

struct Inner {
    root: PathBuf,
    config: CoalescerConfig,
    ignore: Arc<dyn IgnorePredicate>,
    sink: Arc<dyn ChangeSink>,
    state: Mutex<CoalescerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CoalescerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fire(self: Arc<Self>, path: PathBuf, generation: u64) {
        let kind = {
            let mut state = self.lock();
            let kind = match state.timers.get(&path) {
                Some(pending) if pending.generation == generation => pending.kind,
                _ => return,
            };
            state.timers.remove(&path);
            if !state.in_flight.insert(path.clone()) {
                debug!(path = %path.display(), "Change already in flight, dropping");
                return;
            }
            kind
        };

        let priority = match kind {
            ChangeKind::Deleted => DELETE_PRIORITY,
            ChangeKind::Created | ChangeKind::Changed => UPLOAD_PRIORITY,
        };
        debug!(path = %path.display(), %kind, priority, "Submitting change");
        if let Err(e) = self.sink.submit(path.clone(), kind, priority).await {
            warn!(path = %path.display(), %kind, "Change failed: {}", e);
        }
        self.lock().in_flight.remove(&path);
    }

    fn release_upload(&self, path: &Path) {
        let mut state = self.lock();
        if let Some(count) = state.active_uploads.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                state.active_uploads.remove(path);
            }
        }
    }
}

/// Turns raw filesystem events into debounced sink submissions.
#[derive(Clone)]
pub struct ChangeCoalescer {
    inner: Arc<Inner>,
}

impl ChangeCoalescer {
    pub fn new(
        root: impl Into<PathBuf>,
        config: CoalescerConfig,
        ignore: Arc<dyn IgnorePredicate>,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                config,
                ignore,
                sink,
                state: Mutex::new(CoalescerState::default()),
            }),
        }
    }

    /// Handle one raw event. Must be called inside a Tokio runtime.
    pub fn handle_event(&self, event: ChangeEvent) {
        let ChangeEvent { path, kind } = event;
        let relative = match path.strip_prefix(&self.inner.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => return,
        };
        if self.inner.ignore.is_ignored(relative) {
            debug!(path = %relative.display(), "Ignored");
            return;
        }

        let mut state = self.inner.lock();
        if state.active_uploads.contains_key(&path) {
            debug!(path = %relative.display(), "Manual upload in progress, suppressing event");
            return;
        }
        if let Some(previous) = state.timers.remove(&path) {
            previous.timer.abort();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let inner = self.inner.clone();
        let debounce = self.inner.config.debounce;
        let timer_path = path.clone();
        let timer = tokio::spawn(async move {
            sleep(debounce).await;
            inner.fire(timer_path, generation).await;
        });
        state.timers.insert(
            path,
            PendingChange {
                kind,
                generation,
                timer,
            },
        );
    }

    /// Mute `path` for the lifetime of the returned guard plus the release
    /// delay, cancelling any debounce timer it has.
    pub fn mark_active_upload(&self, path: &Path) -> ActiveUpload {
        let mut state = self.inner.lock();
        *state.active_uploads.entry(path.to_path_buf()).or_insert(0) += 1;
        if let Some(pending) = state.timers.remove(path) {
            pending.timer.abort();
            debug!(path = %path.display(), "Cancelled pending change for manual upload");
        }
        ActiveUpload {
            inner: self.inner.clone(),
            path: path.to_path_buf(),
        }
    }

    /// Run a manual transfer of `path` with its change events muted.
    pub async fn run_manual<F, T>(&self, path: &Path, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _muted = self.mark_active_upload(path);
        work.await
    }

    pub fn is_active_upload(&self, path: &Path) -> bool {
        self.inner.lock().active_uploads.contains_key(path)
    }

    /// Kind waiting on the debounce timer for `path`, if any.
    pub fn pending_kind(&self, path: &Path) -> Option<ChangeKind> {
        self.inner.lock().timers.get(path).map(|pending| pending.kind)
    }

    /// Paths with a running debounce timer.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Paths submitted and not yet settled.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Cancel every debounce timer. In-flight submissions are left alone.
    pub fn cancel_pending(&self) -> usize {
        let mut state = self.inner.lock();
        let count = state.timers.len();
        for (_, pending) in state.timers.drain() {
            pending.timer.abort();
        }
        count
    }
}

/// Mute guard from [`ChangeCoalescer::mark_active_upload`].
pub struct ActiveUpload {
    inner: Arc<Inner>,
    path: PathBuf,
}

impl Drop for ActiveUpload {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        let path = std::mem::take(&mut self.path);
        let delay = inner.config.upload_release_delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    sleep(delay).await;
                    inner.release_upload(&path);
                });
            }
            Err(_) => inner.release_upload(&path),
        }
    }
}
