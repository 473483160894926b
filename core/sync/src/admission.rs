//! Process-wide admission control for remote connections.
//!
//! Every connection pool in the process shares one [`AdmissionController`]
//! and must hold a slot from it while its connection is open. Slots are
//! granted first come, first served. After a server rejects a connection
//! for exceeding its own client limit, no new slot is handed out until a
//! cooldown has passed.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use remotesync_common::{Error, Result};

/// Limits enforced by the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Connections that may be open at once across all targets.
    pub max_slots: usize,
    /// Longest an acquisition may wait before failing.
    pub slot_timeout: Duration,
    /// Pause after a rate-limit rejection.
    pub cooldown: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_slots: 2,
            slot_timeout: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
        }
    }
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct AdmissionState {
    held: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    rate_limited_until: Option<Instant>,
}

/// Bounded, FIFO-fair connection slot counter with a rate-limit cooldown.
///
/// Shared through an `Arc`; each test or process creates its own.
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire one connection slot.
    ///
    /// Waits out any active cooldown, then takes a free slot or queues
    /// behind earlier callers. Every successful call must be matched by
    /// exactly one [`release_slot`](Self::release_slot).
    ///
    /// # Errors
    /// - `SlotTimeout` when no slot was granted within the slot timeout
    /// - `Disposed` when the controller was reset while waiting
    pub async fn acquire_slot(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.slot_timeout;

        self.wait_for_cooldown(deadline).await?;
        self.take_slot(deadline).await?;

        // A cooldown may have started while we were queued. The slot goes
        // back if this wait fails or the caller gives up on it.
        let held = HeldSlot(Some(self));
        self.wait_for_cooldown(deadline).await?;
        held.keep();
        Ok(())
    }

    async fn wait_for_cooldown(&self, deadline: Instant) -> Result<()> {
        loop {
            let until = match self.lock().rate_limited_until {
                Some(until) if until > Instant::now() => until,
                _ => return Ok(()),
            };
            if until > deadline {
                sleep_until(deadline).await;
                return Err(Error::SlotTimeout(self.config.slot_timeout));
            }
            debug!("Waiting {:?} for rate-limit cooldown", until - Instant::now());
            sleep_until(until).await;
        }
    }

    async fn take_slot(&self, deadline: Instant) -> Result<()> {
        let (id, receiver) = {
            let mut state = self.lock();
            if state.held < self.config.max_slots && state.waiters.is_empty() {
                state.held += 1;
                debug!(held = state.held, "Slot granted");
                return Ok(());
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (grant, receiver) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant });
            debug!(waiting = state.waiters.len(), "Queued for a connection slot");
            (id, receiver)
        };

        let mut pending = PendingSlot {
            controller: self,
            id,
            receiver,
            settled: false,
        };

        match timeout_at(deadline, &mut pending.receiver).await {
            Ok(Ok(())) => {
                pending.settled = true;
                Ok(())
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(Error::Disposed("admission controller was reset".to_string()))
            }
            Err(_) => {
                pending.settled = true;
                let mut state = self.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    warn!("Timed out waiting for a connection slot");
                    return Err(Error::SlotTimeout(self.config.slot_timeout));
                }
                drop(state);
                // Granted between the deadline and the lock.
                match pending.receiver.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Error::Disposed("admission controller was reset".to_string())),
                }
            }
        }
    }

    /// Return one slot and hand it to the oldest waiter, if any.
    ///
    /// Never drops the count below zero.
    pub fn release_slot(&self) {
        let mut state = self.lock();
        state.held = state.held.saturating_sub(1);
        self.grant_waiters(&mut state);
        debug!(held = state.held, "Slot released");
    }

    fn grant_waiters(&self, state: &mut AdmissionState) {
        while state.held < self.config.max_slots {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.grant.send(()).is_ok() {
                state.held += 1;
            }
        }
    }

    /// Start (or extend) the cooldown after a server rate-limit rejection.
    pub fn set_rate_limited(&self) {
        let until = Instant::now() + self.config.cooldown;
        let mut state = self.lock();
        if state.rate_limited_until.map_or(true, |current| current < until) {
            state.rate_limited_until = Some(until);
        }
        info!("Server connection limit reached, pausing connects for {:?}", self.config.cooldown);
    }

    /// Whether a cooldown is in effect.
    pub fn is_rate_limited(&self) -> bool {
        !self.rate_limit_remaining().is_zero()
    }

    /// Time left in the current cooldown; zero when none.
    pub fn rate_limit_remaining(&self) -> Duration {
        self.lock()
            .rate_limited_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Slots currently held.
    pub fn held_slots(&self) -> usize {
        self.lock().held
    }

    /// Callers queued for a slot.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Forget all slots, waiters and cooldowns. Queued callers fail with `Disposed`.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.held = 0;
        state.waiters.clear();
        state.rate_limited_until = None;
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

/// A granted slot not yet handed to the caller.
struct HeldSlot<'a>(Option<&'a AdmissionController>);

impl HeldSlot<'_> {
    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for HeldSlot<'_> {
    fn drop(&mut self) {
        if let Some(controller) = self.0.take() {
            controller.release_slot();
        }
    }
}

/// A queued acquisition. Dropping it unsettled (the caller's future was
/// cancelled) withdraws the request, or gives back a slot granted to nobody.
struct PendingSlot<'a> {
    controller: &'a AdmissionController,
    id: u64,
    receiver: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.controller.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        if self.receiver.try_recv().is_ok() {
            state.held = state.held.saturating_sub(1);
            self.controller.grant_waiters(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn controller() -> Arc<AdmissionController> {
        Arc::new(AdmissionController::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_bounded() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();
        assert_eq!(admission.held_slots(), 2);

        let third = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire_slot().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(admission.waiting(), 1);
        assert!(!third.is_finished());

        admission.release_slot();
        third.await.unwrap().unwrap();
        assert_eq!(admission.held_slots(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_granted_in_fifo_order() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..4 {
            let admission = admission.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                admission.acquire_slot().await.unwrap();
                order.lock().await.push(n);
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(admission.waiting(), 4);

        for _ in 0..4 {
            admission.release_slot();
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();

        let started = Instant::now();
        let err = admission.acquire_slot().await.unwrap_err();
        assert!(matches!(err, Error::SlotTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(admission.waiting(), 0);
        assert_eq!(admission.held_slots(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_clamped_at_zero() {
        let admission = controller();
        admission.release_slot();
        admission.release_slot();
        assert_eq!(admission.held_slots(), 0);
        admission.acquire_slot().await.unwrap();
        assert_eq!(admission.held_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_delays_acquisition() {
        let admission = controller();
        admission.set_rate_limited();
        assert!(admission.is_rate_limited());

        let started = Instant::now();
        admission.acquire_slot().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(!admission.is_rate_limited());

        // After the cooldown a free slot is immediate.
        let started = Instant::now();
        admission.acquire_slot().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_restarts_from_latest_rejection() {
        let admission = controller();
        admission.set_rate_limited();
        tokio::time::advance(Duration::from_secs(30)).await;
        admission.set_rate_limited();
        assert_eq!(admission.rate_limit_remaining(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_is_withdrawn() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();

        let waiter = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire_slot().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(admission.waiting(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(admission.waiting(), 0);

        admission.release_slot();
        assert_eq!(admission.held_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_granted_during_cooldown_returns_when_abandoned() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();

        let waiter = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire_slot().await }
        });
        tokio::task::yield_now().await;

        admission.set_rate_limited();
        admission.release_slot();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(admission.waiting(), 0);
        assert_eq!(admission.held_slots(), 2);
        assert!(!waiter.is_finished());

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(admission.held_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_waiters() {
        let admission = controller();
        admission.acquire_slot().await.unwrap();
        admission.acquire_slot().await.unwrap();

        let waiter = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire_slot().await }
        });
        tokio::task::yield_now().await;

        admission.reset();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Disposed(_))));
        assert_eq!(admission.held_slots(), 0);
    }
}
