//! Wrapper applied to every channel operation.

use std::future::Future;
use std::sync::Arc;

use super::connection::{ConnectionManager, Link};
use super::error::BrokerError;
use crate::resilience::CircuitState;
use crate::transport::TransportError;

impl ConnectionManager {
    /// Run `op` against the current link.
    ///
    /// Fails fast with `CircuitOpen` while the breaker refuses attempts, and
    /// tries one connect when there is no link. Outcomes only feed the
    /// breaker while it is half-open.
    pub(crate) async fn with_link<T, F, Fut>(
        &self,
        operation: &'static str,
        op: F,
    ) -> Result<T, BrokerError>
    where
        F: FnOnce(Arc<Link>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if !self.breaker().can_attempt() {
            tracing::debug!(operation, "Rejected: circuit breaker open");
            return Err(BrokerError::CircuitOpen);
        }

        let link = match self.current_link() {
            Some(link) => link,
            None => {
                self.connect().await;
                self.current_link().ok_or(BrokerError::ChannelUnavailable)?
            }
        };

        let result = op(link).await;
        let probing = self.breaker().state() == CircuitState::HalfOpen;
        match result {
            Ok(value) => {
                if probing {
                    self.breaker().record_success();
                }
                Ok(value)
            }
            Err(e) => {
                if probing {
                    self.breaker().record_failure();
                }
                tracing::error!(operation, error = %e, "Broker operation failed");
                Err(BrokerError::transport(operation, e))
            }
        }
    }
}
