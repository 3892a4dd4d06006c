//! Reconnect Backoff
//!
//! Exponential backoff with full jitter for remote channel retries.

use std::time::Duration;

use rand::Rng;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Backoff ceiling for the first retry
    pub initial_delay: Duration,
    /// Backoff ceiling never grows past this
    pub max_delay: Duration,
    /// Consecutive failed attempts allowed, `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RetryConfig {
    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Limit the number of consecutive failed attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Upper bound of the delay before retry number `attempt` (0-based):
    /// `min(max_delay, initial_delay * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay before retry number `attempt`, uniform in `[0, ceiling]`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }

    /// Whether `failures` consecutive failed attempts use up the budget
    pub fn is_exhausted(&self, failures: u32) -> bool {
        match self.max_retries {
            Some(max) => failures > max,
            None => false,
        }
    }
}
