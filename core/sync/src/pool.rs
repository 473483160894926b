//! Per-target connection pool.
//!
//! A [`ConnectionPool`] owns at most one live [`RemoteClient`]. It tracks the
//! connection's health, reconnects with exponential backoff and runs every
//! remote operation one at a time under a timeout.
//!
//! Health moves through:
//!
//! ```text
//! disconnected -> healthy -> degraded -> healthy | failed
//!      any state -> rate-limited -> healthy | failed
//! ```
//!
//! `failed` with the reconnect budget spent is sticky until
//! [`ConnectionPool::force_reconnect`]. A disposed pool refuses all work
//! until [`ConnectionPool::reopen`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::retry::RetryConfig;
use remotesync_common::{Error, RemotePath, Result, TargetId};
use remotesync_remote::RemoteClient;

/// Health of a pool's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionHealth {
    Disconnected,
    Healthy,
    Degraded,
    Failed,
    RateLimited,
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionHealth::Disconnected => "disconnected",
            ConnectionHealth::Healthy => "healthy",
            ConnectionHealth::Degraded => "degraded",
            ConnectionHealth::Failed => "failed",
            ConnectionHealth::RateLimited => "rate-limited",
        };
        f.write_str(name)
    }
}

/// Builds a fresh, unconnected client. Called on every (re)connect.
pub type ClientFactory = Arc<dyn Fn() -> Result<Arc<dyn RemoteClient>> + Send + Sync>;

/// Timing and retry limits for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for a connect and for each operation attempt.
    pub operation_timeout: Duration,
    /// Longest a caller waits for someone else's connect.
    pub connect_wait: Duration,
    /// Attempts per `execute_with_retry` call.
    pub max_retries: u32,
    /// Backoff between reconnects; `max_attempts` is the reconnect budget.
    pub reconnect: RetryConfig,
    /// Idle time after which the health check probes the server.
    pub keep_alive: Duration,
    /// Deadline for the health probe.
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            connect_wait: Duration::from_secs(60),
            max_retries: 3,
            reconnect: RetryConfig::reconnect(),
            keep_alive: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

struct PoolState {
    health: ConnectionHealth,
    client: Option<Arc<dyn RemoteClient>>,
    slot_held: bool,
    reconnect_attempts: u32,
    last_activity: Instant,
    health_task: Option<JoinHandle<()>>,
}

/// Single-connection pool for one sync target.
pub struct ConnectionPool {
    id: TargetId,
    remote_root: RemotePath,
    config: PoolConfig,
    factory: ClientFactory,
    admission: Arc<AdmissionController>,
    state: Mutex<PoolState>,
    /// Serializes operations on the client.
    op_lock: AsyncMutex<()>,
    /// Single-flight guard for connects.
    connect_lock: AsyncMutex<()>,
    health_tx: watch::Sender<ConnectionHealth>,
    /// Set by `dispose`, cleared by `reopen`.
    closed: watch::Sender<bool>,
    me: Weak<ConnectionPool>,
}

impl ConnectionPool {
    /// Create a disconnected pool. Nothing connects until first use.
    pub fn new(
        id: TargetId,
        remote_root: RemotePath,
        config: PoolConfig,
        factory: ClientFactory,
        admission: Arc<AdmissionController>,
    ) -> Arc<Self> {
        let (health_tx, _) = watch::channel(ConnectionHealth::Disconnected);
        let (closed, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            id,
            remote_root,
            config,
            factory,
            admission,
            state: Mutex::new(PoolState {
                health: ConnectionHealth::Disconnected,
                client: None,
                slot_held: false,
                reconnect_attempts: 0,
                last_activity: Instant::now(),
                health_task: None,
            }),
            op_lock: AsyncMutex::new(()),
            connect_lock: AsyncMutex::new(()),
            health_tx,
            closed,
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_health(&self, state: &mut PoolState, health: ConnectionHealth) {
        if state.health != health {
            debug!(target_id = %self.id, from = %state.health, to = %health, "Connection health changed");
            state.health = health;
            self.health_tx.send_replace(health);
        }
    }

    /// Current health.
    pub fn health(&self) -> ConnectionHealth {
        self.lock().health
    }

    /// Watch health transitions.
    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health_tx.subscribe()
    }

    /// True only when a client exists and health is `healthy`.
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.client.is_some() && state.health == ConnectionHealth::Healthy
    }

    /// Reconnects attempted since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        *self.closed.borrow()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed(format!("connection pool for {}", self.id)));
        }
        Ok(())
    }

    /// Run `fut` unless the pool is disposed first.
    async fn until_disposed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = fut => result,
            _ = async { closed.wait_for(|closed| *closed).await.map(|_| ()) } => {
                Err(Error::Disposed(format!("connection pool for {}", self.id)))
            }
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        self.until_disposed(async {
            sleep(delay).await;
            Ok(())
        })
        .await
    }

    fn live_client(&self) -> Option<Arc<dyn RemoteClient>> {
        let client = {
            let state = self.lock();
            if state.health != ConnectionHealth::Healthy {
                return None;
            }
            state.client.clone()?
        };
        client.is_connected().then_some(client)
    }

    /// Return the live client, connecting first when there is none.
    ///
    /// Concurrent callers share one connect attempt.
    ///
    /// # Errors
    /// - `Disposed` after [`dispose`](Self::dispose)
    /// - `MaxReconnectAttemptsExceeded` once the pool has given up
    /// - `Timeout` when another caller's connect takes longer than the connect wait
    /// - Whatever the connect itself fails with
    pub async fn get_connection(&self) -> Result<Arc<dyn RemoteClient>> {
        self.check_open()?;
        if let Some(client) = self.live_client() {
            return Ok(client);
        }
        self.check_not_exhausted()?;

        let _connecting = timeout(self.config.connect_wait, self.connect_lock.lock())
            .await
            .map_err(|_| Error::timeout("wait for connect", self.config.connect_wait))?;

        if let Some(client) = self.live_client() {
            return Ok(client);
        }
        self.connect().await
    }

    fn check_not_exhausted(&self) -> Result<()> {
        let state = self.lock();
        let budget = self.config.reconnect.max_attempts;
        if state.health == ConnectionHealth::Failed && state.reconnect_attempts >= budget {
            return Err(Error::MaxReconnectAttemptsExceeded(budget));
        }
        Ok(())
    }

    /// Open a new connection. Callers hold `connect_lock`.
    async fn connect(&self) -> Result<Arc<dyn RemoteClient>> {
        self.check_open()?;
        self.teardown().await;

        self.until_disposed(self.admission.acquire_slot()).await?;
        self.lock().slot_held = true;

        let client = match (self.factory)() {
            Ok(client) => client,
            Err(e) => {
                self.release_slot();
                let mut state = self.lock();
                self.set_health(&mut state, ConnectionHealth::Failed);
                return Err(e);
            }
        };

        let result = match timeout(self.config.operation_timeout, client.connect()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("connect", self.config.operation_timeout)),
        };

        match result {
            Ok(()) => {
                let mut state = self.lock();
                state.client = Some(client.clone());
                state.reconnect_attempts = 0;
                state.last_activity = Instant::now();
                self.set_health(&mut state, ConnectionHealth::Healthy);
                self.start_health_task(&mut state);
                info!(target_id = %self.id, protocol = client.protocol(), "Connected");
                Ok(client)
            }
            Err(e) => {
                client.disconnect().await;
                self.release_slot();
                let mut state = self.lock();
                if e.is_rate_limit() {
                    self.set_health(&mut state, ConnectionHealth::RateLimited);
                    drop(state);
                    self.admission.set_rate_limited();
                } else {
                    self.set_health(&mut state, ConnectionHealth::Failed);
                }
                warn!(target_id = %self.id, "Connect failed: {}", e);
                Err(e)
            }
        }
    }

    fn release_slot(&self) {
        let held = std::mem::take(&mut self.lock().slot_held);
        if held {
            self.admission.release_slot();
        }
    }

    /// Drop the current client and its slot.
    async fn teardown(&self) {
        let client = {
            let mut state = self.lock();
            if let Some(task) = state.health_task.take() {
                task.abort();
            }
            self.set_health(&mut state, ConnectionHealth::Disconnected);
            state.client.take()
        };
        if let Some(client) = client {
            if timeout(self.config.probe_timeout, client.disconnect()).await.is_err() {
                debug!(target_id = %self.id, "Disconnect did not finish, abandoning client");
            }
        }
        self.release_slot();
    }

    /// Reconnect after a connection failure.
    ///
    /// Waits out an active rate-limit cooldown first (which also restores
    /// the attempt budget), then backs off exponentially.
    ///
    /// # Errors
    /// - `MaxReconnectAttemptsExceeded` when the budget is spent
    pub async fn reconnect(&self) -> Result<Arc<dyn RemoteClient>> {
        let cooldown = self.admission.rate_limit_remaining();
        if !cooldown.is_zero() {
            info!(target_id = %self.id, "Waiting {:?} for rate-limit cooldown before reconnecting", cooldown);
            self.pause(cooldown).await?;
            self.lock().reconnect_attempts = 0;
        }

        let budget = self.config.reconnect.max_attempts;
        let attempt = {
            let mut state = self.lock();
            if state.reconnect_attempts >= budget {
                self.set_health(&mut state, ConnectionHealth::Failed);
                return Err(Error::MaxReconnectAttemptsExceeded(budget));
            }
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        let delay = self.config.reconnect.delay_for_attempt(attempt - 1);
        info!(target_id = %self.id, attempt, budget, "Reconnecting in {:?}", delay);
        self.pause(delay).await?;

        let _connecting = timeout(self.config.connect_wait, self.connect_lock.lock())
            .await
            .map_err(|_| Error::timeout("wait for connect", self.config.connect_wait))?;
        self.connect().await
    }

    /// Reset the attempt budget and reconnect, waiting for any running operation.
    pub async fn force_reconnect(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        info!(target_id = %self.id, "Forced reconnect");
        self.lock().reconnect_attempts = 0;
        self.reconnect().await.map(|_| ())
    }

    /// Run `op` against the live client, serialized with every other
    /// operation on this pool.
    ///
    /// Each attempt is bounded by the operation timeout. A rate-limit error
    /// waits out the cooldown and drops the connection; a connection-class
    /// error reconnects; any other error returns at once.
    ///
    /// # Errors
    /// - The last error once `max_retries` attempts are spent
    /// - Non-retryable errors unchanged
    pub async fn execute_with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn RemoteClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _op = self.op_lock.lock().await;
        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_retries {
            self.check_open()?;
            let result = match self.get_connection().await {
                Ok(client) => match timeout(self.config.operation_timeout, op(client)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(label, self.config.operation_timeout)),
                },
                Err(e) => Err(e),
            };
            self.lock().last_activity = Instant::now();

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if matches!(
                err,
                Error::MaxReconnectAttemptsExceeded(_) | Error::SlotTimeout(_) | Error::Disposed(_)
            ) {
                return Err(err);
            }

            if err.is_rate_limit() {
                warn!(target_id = %self.id, op = label, attempt, "Rate limited: {}", err);
                {
                    let mut state = self.lock();
                    self.set_health(&mut state, ConnectionHealth::RateLimited);
                }
                self.admission.set_rate_limited();
                if attempt < max_retries {
                    self.pause(self.admission.rate_limit_remaining()).await?;
                    self.teardown().await;
                }
            } else if err.is_connection_error() {
                warn!(target_id = %self.id, op = label, attempt, "Connection error: {}", err);
                {
                    let mut state = self.lock();
                    self.set_health(&mut state, ConnectionHealth::Degraded);
                }
                if attempt < max_retries {
                    match self.reconnect().await {
                        Ok(_) => {}
                        Err(e @ Error::MaxReconnectAttemptsExceeded(_)) => return Err(e),
                        Err(e) => debug!(target_id = %self.id, "Reconnect failed: {}", e),
                    }
                }
            } else {
                return Err(err);
            }
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| Error::Connection(format!("{} failed", label))))
    }

    fn start_health_task(&self, state: &mut PoolState) {
        if let Some(task) = state.health_task.take() {
            task.abort();
        }
        let period = self.config.keep_alive / 2;
        if period.is_zero() {
            return;
        }
        let pool = self.me.clone();
        state.health_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.check_health().await;
            }
        }));
    }

    /// Probe an idle connection. Skipped while an operation holds the pool.
    async fn check_health(&self) {
        let Ok(_op) = self.op_lock.try_lock() else {
            return;
        };
        let client = {
            let state = self.lock();
            if state.health != ConnectionHealth::Healthy
                || state.last_activity.elapsed() < self.config.keep_alive
            {
                return;
            }
            match &state.client {
                Some(client) => client.clone(),
                None => return,
            }
        };

        let alive = client.is_connected()
            && timeout(self.config.probe_timeout, client.exists(&self.remote_root))
                .await
                .unwrap_or(false);

        let mut state = self.lock();
        if alive {
            state.last_activity = Instant::now();
        } else {
            warn!(target_id = %self.id, "Health check failed, connection degraded");
            self.set_health(&mut state, ConnectionHealth::Degraded);
        }
    }

    /// Stop health checks, disconnect and give back the slot. Idempotent.
    ///
    /// Backoff and cooldown waits end at once; an operation attempt already
    /// talking to the server finishes (bounded by the operation timeout)
    /// before the connection is torn down. Every later call fails with
    /// `Disposed` until [`reopen`](Self::reopen).
    pub async fn dispose(&self) {
        self.closed.send_replace(true);
        let _op = self.op_lock.lock().await;
        let _connecting = self.connect_lock.lock().await;
        self.teardown().await;
        debug!(target_id = %self.id, "Connection pool disposed");
    }

    /// Accept work again after [`dispose`](Self::dispose). The next
    /// operation connects with a fresh reconnect budget.
    pub fn reopen(&self) {
        if self.closed.send_replace(false) {
            self.lock().reconnect_attempts = 0;
            debug!(target_id = %self.id, "Connection pool reopened");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = state.health_task.take() {
            task.abort();
        }
        if std::mem::take(&mut state.slot_held) {
            self.admission.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotesync_remote::MemoryServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_pool(server: &MemoryServer, admission: Arc<AdmissionController>) -> Arc<ConnectionPool> {
        let server = server.clone();
        let factory: ClientFactory =
            Arc::new(move || -> Result<Arc<dyn RemoteClient>> { Ok(Arc::new(server.client())) });
        ConnectionPool::new(
            TargetId::new("site").unwrap(),
            RemotePath::parse("/www").unwrap(),
            PoolConfig::default(),
            factory,
            admission,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_recover_from_dead_transport() {
        let server = MemoryServer::new();
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        assert_eq!(pool.health(), ConnectionHealth::Disconnected);
        assert!(!pool.is_connected());

        pool.get_connection().await.unwrap();
        assert_eq!(pool.health(), ConnectionHealth::Healthy);
        assert!(pool.is_connected());

        server.kill_sessions();
        let client = pool.get_connection().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(pool.health(), ConnectionHealth::Healthy);
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_connect() {
        let server = MemoryServer::new();
        server.set_latency(Duration::from_millis(200));
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));

        let (a, b) = tokio::join!(pool.get_connection(), pool.get_connection());
        a.unwrap();
        b.unwrap();
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_connect_releases_slot() {
        let server = MemoryServer::new();
        server.fail_connects(1, "530 Sorry, the maximum number of clients (2) are already connected");
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());

        let err = match pool.get_connection().await {
            Ok(_) => panic!("connect should be refused"),
            Err(e) => e,
        };
        assert!(err.is_rate_limit());
        assert_eq!(pool.health(), ConnectionHealth::RateLimited);
        assert!(admission.is_rate_limited());
        assert_eq!(admission.held_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_operation_waits_out_cooldown() {
        let server = MemoryServer::new();
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());
        pool.get_connection().await.unwrap();
        server.fail_operations(1, "530 Sorry, the maximum number of clients (2) are already connected");

        let started = Instant::now();
        let mut health = pool.subscribe_health();
        let entries = pool
            .execute_with_retry("list /", |client| async move {
                client.list_directory(&RemotePath::root()).await
            })
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(health.has_changed().unwrap());
        assert_eq!(server.connects(), 2);
        assert_eq!(admission.held_slots(), 1);
        assert!(!admission.is_rate_limited());
        assert_eq!(pool.health(), ConnectionHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_cooldown_restores_budget() {
        let server = MemoryServer::new();
        server.fail_connects(2, "connect ECONNREFUSED 10.0.0.1:21");
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());

        assert!(pool.reconnect().await.is_err());
        assert!(pool.reconnect().await.is_err());
        assert_eq!(pool.reconnect_attempts(), 2);

        admission.set_rate_limited();
        pool.reconnect().await.unwrap();
        assert!(!admission.is_rate_limited());
        assert_eq!(pool.reconnect_attempts(), 0);
        assert_eq!(pool.health(), ConnectionHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_ends_reconnect_backoff() {
        let server = MemoryServer::new();
        server.fail_connects(100, "connect ECONNREFUSED 10.0.0.1:21");
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());

        let op = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.execute_with_retry("list /", |client| async move {
                    client.list_directory(&RemotePath::root()).await
                })
                .await
            }
        });
        sleep(Duration::from_millis(500)).await;
        assert!(!op.is_finished());

        let started = Instant::now();
        pool.dispose().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(op.await.unwrap(), Err(Error::Disposed(_))));
        assert_eq!(admission.held_slots(), 0);
        assert_eq!(pool.health(), ConnectionHealth::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_is_not_retried() {
        let server = MemoryServer::new();
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = pool
            .execute_with_retry("delete /missing", |client| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    client.delete_file(&RemotePath::parse("/missing")?).await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_reconnects_and_retries() {
        let server = MemoryServer::new();
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        pool.get_connection().await.unwrap();
        server.fail_operations(1, "read ECONNRESET");

        let entries = pool
            .execute_with_retry("list /", |client| async move {
                client.list_directory(&RemotePath::root()).await
            })
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert_eq!(server.connects(), 2);
        assert_eq!(pool.health(), ConnectionHealth::Healthy);
        assert_eq!(pool.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_never_overlap() {
        let server = MemoryServer::new();
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for n in 0..5 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.execute_with_retry(&format!("op {}", n), |_| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        if n % 2 == 0 {
                            Ok(())
                        } else {
                            Err(Error::Remote("550 denied".to_string()))
                        }
                    }
                })
                .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout() {
        let server = MemoryServer::new();
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = pool
            .execute_with_retry("upload /big.bin", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(600)).await;
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_and_force_reconnect() {
        let server = MemoryServer::new();
        server.fail_connects(100, "connect ECONNREFUSED 10.0.0.1:21");
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());

        for _ in 0..5 {
            assert!(pool.reconnect().await.is_err());
        }
        assert!(matches!(
            pool.reconnect().await,
            Err(Error::MaxReconnectAttemptsExceeded(5))
        ));
        assert_eq!(pool.health(), ConnectionHealth::Failed);
        assert!(matches!(
            pool.get_connection().await,
            Err(Error::MaxReconnectAttemptsExceeded(5))
        ));
        assert_eq!(admission.held_slots(), 0);

        server.clear_faults();
        pool.force_reconnect().await.unwrap();
        assert!(pool.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_health_check_degrades_dead_connection() {
        let server = MemoryServer::new();
        server.put_file(&RemotePath::parse("/www/index.html").unwrap(), b"ok");
        let pool = memory_pool(&server, Arc::new(AdmissionController::default()));
        pool.get_connection().await.unwrap();

        sleep(Duration::from_secs(95)).await;
        assert_eq!(pool.health(), ConnectionHealth::Healthy);

        server.kill_sessions();
        sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.health(), ConnectionHealth::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let server = MemoryServer::new();
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());
        pool.get_connection().await.unwrap();
        assert_eq!(admission.held_slots(), 1);

        pool.dispose().await;
        pool.dispose().await;
        assert!(pool.is_disposed());
        assert_eq!(admission.held_slots(), 0);
        assert_eq!(server.live_sessions(), 0);
        assert_eq!(pool.health(), ConnectionHealth::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposed_pool_refuses_work_until_reopened() {
        let server = MemoryServer::new();
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());
        pool.dispose().await;

        assert!(matches!(pool.get_connection().await, Err(Error::Disposed(_))));
        let result = pool
            .execute_with_retry("list /", |client| async move {
                client.list_directory(&RemotePath::root()).await
            })
            .await;
        assert!(matches!(result, Err(Error::Disposed(_))));
        assert_eq!(server.connects(), 0);
        assert_eq!(admission.held_slots(), 0);

        pool.reopen();
        assert!(!pool.is_disposed());
        pool.get_connection().await.unwrap();
        assert_eq!(server.connects(), 1);
        assert_eq!(admission.held_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_waits_for_running_operation() {
        let server = MemoryServer::new();
        let admission = Arc::new(AdmissionController::default());
        let pool = memory_pool(&server, admission.clone());
        let finished = Arc::new(AtomicUsize::new(0));

        let op = tokio::spawn({
            let pool = pool.clone();
            let finished = finished.clone();
            async move {
                pool.execute_with_retry("upload /slow.bin", |_| {
                    let finished = finished.clone();
                    async move {
                        sleep(Duration::from_secs(2)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
            }
        });
        sleep(Duration::from_millis(100)).await;
        assert_eq!(admission.held_slots(), 1);

        pool.dispose().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        op.await.unwrap().unwrap();
        assert_eq!(admission.held_slots(), 0);
        assert_eq!(server.live_sessions(), 0);
    }
}
