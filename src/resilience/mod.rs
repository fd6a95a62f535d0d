//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Broker connect / channel operation:
//!     → circuit_breaker.rs (fail fast while open, count failures)
//!     → On connection loss: backoff.rs (delay before the next reconnect)
//! ```
//!
//! # Design Decisions
//! - The breaker is the connection's memory across reconnects
//! - Backoff delays are precomputed and deterministic
//! - Reconnects are event driven; no retry loop spins on its own

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::BackoffSchedule;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
