//! Prioritized operation queue with timeout, retry and expiry.
//!
//! Operations run one at a time, highest priority first and in arrival
//! order among equal priorities. A transient failure puts the operation
//! back at the front after a short delay; an operation that waits longer
//! than twice its own timeout before starting is rejected unrun.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::retry::RetryConfig;
use remotesync_common::{Error, Result};

/// A target has one connection, so transfers never overlap.
const MAX_CONCURRENCY: usize = 1;

/// Unit of queued work. Called once per attempt.
pub type OperationFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pending operations allowed before enqueue is refused.
    pub capacity: usize,
    /// Requested parallelism. Always clamped to 1.
    pub concurrency: usize,
    /// Timeout for operations that do not set their own.
    pub default_timeout: Duration,
    /// Retry ceiling for operations that do not set their own.
    pub default_max_retries: u32,
    /// Delay before a failed operation runs again.
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            concurrency: 1,
            default_timeout: Duration::from_secs(120),
            default_max_retries: 3,
            retry: RetryConfig::queue(),
        }
    }
}

/// Per-operation settings.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs sooner.
    pub priority: i32,
    pub timeout: Option<Duration>,
    /// Total attempts, including the first.
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

struct QueuedOperation {
    id: Uuid,
    label: String,
    priority: i32,
    enqueued_at: Instant,
    timeout: Duration,
    retry_count: u32,
    max_retries: u32,
    work: OperationFn,
    done: oneshot::Sender<Result<()>>,
}

impl QueuedOperation {
    fn expires_at(&self) -> Instant {
        self.enqueued_at + self.timeout * 2
    }

    fn settle(self, result: Result<()>) {
        // The caller may have stopped waiting.
        let _ = self.done.send(result);
    }
}

/// Processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Processing,
    Paused,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub status: QueueStatus,
    /// Queued or waiting out a retry delay, not running.
    pub pending: usize,
    /// Currently executing (0 or 1).
    pub active: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedOperation>,
    /// Failed attempts sitting out their retry delay.
    retrying: HashMap<Uuid, QueuedOperation>,
    active: usize,
    paused: bool,
    stopped: bool,
}

enum Next {
    Run(QueuedOperation),
    /// Sleep until woken or until the earliest expiry.
    Wait(Option<Instant>),
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Reject everything that waited past its expiry.
    fn expire(&self, state: &mut QueueState) {
        let now = Instant::now();
        let mut kept = VecDeque::with_capacity(state.pending.len());
        for op in state.pending.drain(..) {
            if now > op.expires_at() {
                let waited = now - op.enqueued_at;
                warn!(op = %op.label, "Operation expired after waiting {:?}", waited);
                let label = op.label.clone();
                op.settle(Err(Error::OperationExpired { label, waited }));
            } else {
                kept.push_back(op);
            }
        }
        state.pending = kept;
    }

    fn insert(state: &mut QueueState, op: QueuedOperation) {
        let pos = state
            .pending
            .iter()
            .position(|queued| queued.priority < op.priority)
            .unwrap_or(state.pending.len());
        state.pending.insert(pos, op);
    }

    /// Move a retrying operation back to the front once its delay is over.
    /// Does nothing if it was cleared in the meantime.
    fn requeue_front(&self, id: Uuid) {
        let mut state = self.lock();
        let Some(mut op) = state.retrying.remove(&id) else {
            return;
        };
        if state.stopped {
            drop(state);
            op.settle(Err(Error::Disposed("operation queue shut down".to_string())));
            return;
        }
        op.enqueued_at = Instant::now();
        state.pending.push_front(op);
        drop(state);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.stopped {
                    break;
                }
                self.expire(&mut state);
                let ready = !state.paused && state.active < self.concurrency();
                let op = if ready { state.pending.pop_front() } else { None };
                match op {
                    Some(op) => {
                        state.active += 1;
                        Next::Run(op)
                    }
                    None => Next::Wait(state.pending.iter().map(QueuedOperation::expires_at).min()),
                }
            };

            match next {
                Next::Run(op) => self.execute(op).await,
                Next::Wait(Some(expiry)) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = sleep_until(expiry + Duration::from_millis(1)) => {}
                    }
                }
                Next::Wait(None) => self.wake.notified().await,
            }
        }
        debug!("Operation queue worker stopped");
    }

    async fn execute(self: &Arc<Self>, mut op: QueuedOperation) {
        debug!(op = %op.label, id = %op.id, attempt = op.retry_count + 1, "Running operation");
        let result = match timeout(op.timeout, (op.work)()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(op.label.as_str(), op.timeout)),
        };

        match result {
            Ok(()) => {
                self.lock().active -= 1;
                debug!(op = %op.label, "Operation succeeded");
                op.settle(Ok(()));
            }
            Err(e) if e.is_transient() && op.retry_count + 1 < op.max_retries => {
                op.retry_count += 1;
                let delay = self.config.retry.delay_for_attempt(op.retry_count - 1);
                warn!(
                    op = %op.label,
                    "Attempt {} of {} failed: {}. Retrying in {:?}",
                    op.retry_count, op.max_retries, e, delay
                );
                let id = op.id;
                {
                    let mut state = self.lock();
                    state.active -= 1;
                    state.retrying.insert(id, op);
                }
                let shared = self.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    shared.requeue_front(id);
                });
            }
            Err(e) => {
                self.lock().active -= 1;
                error!(op = %op.label, attempts = op.retry_count + 1, "Operation failed: {}", e);
                op.settle(Err(e));
            }
        }
    }
}

/// Completion handle returned by [`OperationQueue::enqueue`].
pub struct OperationHandle {
    id: Uuid,
    receiver: oneshot::Receiver<Result<()>>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the operation's final outcome.
    pub async fn wait(self) -> Result<()> {
        self.receiver
            .await
            .map_err(|_| Error::Disposed("operation queue shut down".to_string()))?
    }
}

/// Single-worker priority queue for one sync target.
pub struct OperationQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    /// Create a queue and spawn its worker. Must be called inside a Tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        if config.concurrency != MAX_CONCURRENCY {
            info!(requested = config.concurrency, "Queue concurrency clamped to 1");
        }
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(shared.clone().run());
        Self { shared, worker }
    }

    /// Queue `work` and return a handle that settles with its final outcome.
    ///
    /// # Errors
    /// - `QueueFull` when capacity is reached
    /// - `Disposed` after shutdown
    pub fn enqueue<F, Fut>(
        &self,
        label: impl Into<String>,
        options: EnqueueOptions,
        work: F,
    ) -> Result<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let work: OperationFn = Box::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(work()) });
        let (done, receiver) = oneshot::channel();
        let op = QueuedOperation {
            id: Uuid::new_v4(),
            label: label.into(),
            priority: options.priority,
            enqueued_at: Instant::now(),
            timeout: options.timeout.unwrap_or(self.shared.config.default_timeout),
            retry_count: 0,
            max_retries: options
                .max_retries
                .unwrap_or(self.shared.config.default_max_retries)
                .max(1),
            work,
            done,
        };
        let id = op.id;

        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(Error::Disposed("operation queue shut down".to_string()));
            }
            if state.pending.len() >= self.shared.config.capacity {
                warn!(op = %op.label, "Operation queue full, rejecting");
                return Err(Error::QueueFull(state.pending.len()));
            }
            debug!(op = %op.label, priority = op.priority, "Enqueued operation");
            Shared::insert(&mut state, op);
        }
        self.shared.wake.notify_one();

        Ok(OperationHandle { id, receiver })
    }

    /// Stop starting new operations. The running one finishes.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        info!("Operation queue paused");
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.wake.notify_one();
        info!("Operation queue resumed");
    }

    /// Reject every pending or retry-waiting operation with `QueueCleared`.
    /// Returns how many.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedOperation> = {
            let mut state = self.shared.lock();
            let retrying: Vec<QueuedOperation> = state.retrying.drain().map(|(_, op)| op).collect();
            state.pending.drain(..).chain(retrying).collect()
        };
        let count = drained.len();
        for op in drained {
            op.settle(Err(Error::QueueCleared));
        }
        if count > 0 {
            info!(count, "Cleared pending operations");
        }
        count
    }

    pub fn status(&self) -> QueueSnapshot {
        let state = self.shared.lock();
        let status = if state.paused {
            QueueStatus::Paused
        } else if state.active > 0 || !state.pending.is_empty() || !state.retrying.is_empty() {
            QueueStatus::Processing
        } else {
            QueueStatus::Idle
        };
        QueueSnapshot {
            status,
            pending: state.pending.len() + state.retrying.len(),
            active: state.active,
        }
    }

    /// Clear pending work and stop the worker once the running operation ends.
    pub fn shutdown(&self) {
        self.clear();
        self.shared.lock().stopped = true;
        self.shared.wake.notify_one();
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shared.lock().stopped = true;
        self.worker.abort();
    }
}
