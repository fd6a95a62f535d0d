//! Circuit breaker guarding the broker connection.
//!
//! # States
//! - Closed: normal operation, attempts pass through
//! - Open: broker assumed down, attempts fail fast
//! - Half-Open: the next real operation probes recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: reset timeout elapsed since last failure (checked lazily)
//! Half-Open → Closed: any success
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - One breaker per broker connection; it outlives reconnects
//! - Threshold and reset timeout are fixed, not configuration
//! - No synthetic health probe; callers report real outcomes

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::observability::metrics;

/// Consecutive failures that open the circuit.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Cooldown before an open circuit allows a probe.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Armed only while Open.
    reset_deadline: Option<Instant>,
}

/// Three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_limits(FAILURE_THRESHOLD, RESET_TIMEOUT)
    }

    pub(crate) fn with_limits(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                reset_deadline: None,
            }),
        }
    }

    /// Whether an attempt may proceed. Flips Open → HalfOpen once the cooldown is over.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        inner.state != CircuitState::Open
    }

    /// Current state, applying any pending Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Time left before an open circuit admits a probe.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let inner = self.state.lock();
        match (inner.state, inner.reset_deadline) {
            (CircuitState::Open, Some(deadline)) => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.state.lock();
        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.reset_deadline = None;

        if previous != CircuitState::Closed {
            tracing::info!(previous = %previous, "Circuit breaker closed");
            metrics::record_circuit_state(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.state.lock();
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                self.open(&mut inner, now);
                tracing::warn!(
                    failures = inner.failure_count,
                    reset_timeout = ?self.reset_timeout,
                    "Circuit breaker opened"
                );
            }
            CircuitState::Closed => {
                tracing::debug!(
                    failures = inner.failure_count,
                    threshold = self.threshold,
                    "Circuit breaker failure recorded"
                );
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner, now);
                tracing::warn!("Circuit breaker re-opened: probe failed");
            }
            CircuitState::Open => {
                // Cooldown restarts from the latest failure.
                inner.reset_deadline = Some(now + self.reset_timeout);
            }
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.reset_deadline = Some(now + self.reset_timeout);
        metrics::record_circuit_state(CircuitState::Open);
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed() >= self.reset_timeout)
            .unwrap_or(true);
        if elapsed {
            inner.state = CircuitState::HalfOpen;
            inner.reset_deadline = None;
            tracing::info!("Circuit breaker half-open, next operation probes the broker");
            metrics::record_circuit_state(CircuitState::HalfOpen);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new();
        for n in 1..FAILURE_THRESHOLD {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed, "after {} failures", n);
            assert!(breaker.can_attempt());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new();
        trip(&breaker);

        tokio::time::advance(RESET_TIMEOUT - Duration::from_millis(1)).await;
        assert!(!breaker.can_attempt());
        assert!(breaker.remaining_cooldown().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.remaining_cooldown(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_closes_and_resets_count() {
        let breaker = CircuitBreaker::new();
        trip(&breaker);
        tokio::time::advance(RESET_TIMEOUT).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new();
        trip(&breaker);
        tokio::time::advance(RESET_TIMEOUT).await;
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.remaining_cooldown(), Some(RESET_TIMEOUT));

        tokio::time::advance(RESET_TIMEOUT).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_open_extends_cooldown() {
        let breaker = CircuitBreaker::new();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(20)).await;
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
