//! Backoff schedules for reconnects and queue retries.

use std::time::Duration;

/// How the delay grows from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Growth {
    /// `initial × multiplier^attempt`.
    Exponential(f64),
    /// `initial × (attempt + 1)`.
    Linear,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for growth).
    pub max_delay: Duration,
    /// Growth curve.
    pub growth: Growth,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Exponential schedule doubling from one second.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            growth: Growth::Exponential(2.0),
            jitter: false,
        }
    }

    /// Schedule used between reconnect attempts: 1s, 2s, 4s ... capped at 30s,
    /// each spread by jitter so targets sharing a server do not reconnect in step.
    pub fn reconnect() -> Self {
        Self::new(5)
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(true)
    }

    /// Schedule used before a queued operation runs again: 1s × retry count.
    pub fn queue() -> Self {
        Self::new(3).with_growth(Growth::Linear)
    }

    /// Set maximum attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set growth curve.
    pub fn with_growth(mut self, growth: Growth) -> Self {
        self.growth = growth;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis() as f64;
        let base_delay = match self.growth {
            Growth::Exponential(multiplier) => initial * multiplier.powi(attempt as i32),
            Growth::Linear => initial * (attempt as f64 + 1.0),
        };

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
