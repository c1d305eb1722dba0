//! Bounded retry schedules
//!
//! Retry loops in the engine are explicit: a step counter bounded by
//! `max_retries` and a delay looked up per step. Nothing here sleeps; callers
//! await `tokio::time::sleep(policy.delay_for(step))` themselves.

use crate::config::{Backoff, Config};
use std::time::Duration;

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth between steps
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(10),
            backoff,
        }
    }

    /// Stale-session policy: 100ms, 200ms, 400ms, …
    pub fn session_from_config(config: &Config) -> Self {
        Self::new(
            config.session_retry_attempts,
            Duration::from_millis(config.session_retry_base_ms),
            Backoff::Exponential,
        )
    }

    /// Caller-facing click retry policy
    pub fn click_from_config(config: &Config) -> Self {
        Self::new(
            config.click_retries,
            Duration::from_millis(config.click_retry_delay_ms),
            config.click_backoff,
        )
    }

    /// Delay to wait before retry number `step` (0-based)
    pub fn delay_for(&self, step: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(step.saturating_add(1)),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(step.min(16)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Full delay table, one entry per retry
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|step| self.delay_for(step)).collect()
    }

    /// Whether another attempt is allowed after `retries_done` retries
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Backoff::Exponential)
    }
}
