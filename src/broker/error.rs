use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The circuit breaker is open; no transport call was made.
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("broker channel unavailable")]
    ChannelUnavailable,

    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish buffer did not drain within {0:?}")]
    BackpressureTimeout(Duration),

    #[error("publish still backpressured after {0} drain waits")]
    BackpressureExhausted(u32),

    #[error("broker TLS setup failed: {0}")]
    Tls(String),

    #[error("message handler failed: {0}")]
    HandlerFailure(String),
}

impl BrokerError {
    pub(crate) fn transport(operation: &'static str, source: TransportError) -> Self {
        BrokerError::Transport { operation, source }
    }

    /// True for errors meaning "no usable connection right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BrokerError::CircuitOpen | BrokerError::ChannelUnavailable)
    }
}
