//! Exponential backoff schedule for broker reconnection.
//!
//! The schedule is computed once from the retry configuration:
//! ```text
//! delay[i] = min(initial * 2^i, max)
//! ```
//! Attempts past the end of the schedule wait `max`.

use std::time::Duration;

use crate::config::RetryConfig;

/// Precomputed, immutable sequence of reconnection delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
    max_delay: Duration,
}

impl BackoffSchedule {
    /// Build a schedule of `attempts` delays doubling from `initial`, capped at `max`.
    pub fn new(initial: Duration, max: Duration, attempts: u32) -> Self {
        let mut delays = Vec::with_capacity(attempts as usize);
        let mut delay = initial.min(max);
        for _ in 0..attempts {
            delays.push(delay);
            delay = delay.saturating_mul(2).min(max);
        }

        Self {
            delays,
            max_delay: max,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before reconnection attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt as usize)
            .copied()
            .unwrap_or(self.max_delay)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}
