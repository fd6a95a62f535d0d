//! Backpressure-aware publish.
//!
//! The message is serialized once. When the transport reports backpressure
//! the same bytes are sent again after the drain signal fires, up to the
//! configured number of waits.

use serde::Serialize;

use super::client::BrokerClient;
use super::error::BrokerError;
use super::options::PublishOptions;
use crate::observability::metrics;
use crate::transport::PublishOutcome;

impl BrokerClient {
    /// Publish `message` as JSON. Returns `true` once the transport accepts it.
    pub async fn publish<M>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
        options: &PublishOptions,
    ) -> Result<bool, BrokerError>
    where
        M: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        let properties = options.to_properties();
        let (payload, props) = (payload.as_slice(), &properties);

        let mut waits = 0;
        loop {
            let outcome = self
                .manager
                .with_link("publish", |link| async move {
                    link.channel
                        .publish(exchange, routing_key, payload, props)
                        .await
                })
                .await?;

            let signal = match outcome {
                PublishOutcome::Accepted => {
                    tracing::debug!(
                        exchange,
                        routing_key,
                        message_id = props.message_id.as_deref().unwrap_or("unknown"),
                        "Message published"
                    );
                    metrics::record_published(exchange);
                    return Ok(true);
                }
                PublishOutcome::Backpressure(signal) => signal,
            };

            metrics::record_backpressure();
            if waits >= self.policy.max_drain_waits {
                tracing::error!(exchange, routing_key, waits, "Publish gave up on backpressure");
                return Err(BrokerError::BackpressureExhausted(waits));
            }
            waits += 1;
            tracing::warn!(exchange, routing_key, waits, "Publish backpressured, waiting for drain");

            match self.policy.drain_timeout {
                Some(limit) => tokio::time::timeout(limit, signal.wait())
                    .await
                    .map_err(|_| BrokerError::BackpressureTimeout(limit))?,
                None => signal.wait().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::options::{BrokerSettings, PublishPolicy};
    use crate::config::BrokerConfig;
    use crate::health::status::StatusRegistry;
    use crate::resilience::BackoffSchedule;
    use crate::transport::{ExchangeKind, ExchangeOptions, MemoryBroker};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn client(broker: &MemoryBroker, policy: PublishPolicy) -> BrokerClient {
        let settings = BrokerSettings::new(
            &BrokerConfig {
                url: "memory://test".to_string(),
                ..Default::default()
            },
            BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(1), 3),
        );
        let client = BrokerClient::new(
            Arc::new(broker.clone()),
            settings,
            policy,
            StatusRegistry::new(),
        );
        client.connect().await;
        client
            .create_exchange("events", ExchangeKind::Fanout, &ExchangeOptions::default())
            .await
            .unwrap();
        client
            .create_queue("audit", &Default::default())
            .await
            .unwrap();
        client.bind_queue("audit", "events", "").await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_publish_serializes_json() {
        let broker = MemoryBroker::new();
        let client = client(&broker, PublishPolicy::default()).await;

        let sent = client
            .publish("events", "", &json!({"id": 7}), &PublishOptions::default())
            .await
            .unwrap();
        assert!(sent);
        assert_eq!(broker.queue_payloads("audit"), vec![br#"{"id":7}"#.to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let broker = MemoryBroker::new();
        let policy = PublishPolicy {
            drain_timeout: Some(Duration::from_secs(2)),
            max_drain_waits: 4,
        };
        let client = client(&broker, policy).await;
        broker.backpressure_next_publishes(1);

        let err = client
            .publish("events", "", &json!("x"), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BackpressureTimeout(d) if d == Duration::from_secs(2)));
        assert_eq!(broker.queue_depth("audit"), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_exhausted() {
        let broker = MemoryBroker::new();
        let policy = PublishPolicy {
            drain_timeout: None,
            max_drain_waits: 0,
        };
        let client = client(&broker, policy).await;
        broker.backpressure_next_publishes(1);

        let err = client
            .publish("events", "", &json!("x"), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BackpressureExhausted(0)));
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_transport_error() {
        let broker = MemoryBroker::new();
        let client = client(&broker, PublishPolicy::default()).await;

        let err = client
            .publish("missing", "", &json!(1), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Transport { operation: "publish", .. }));
        // Failures while closed do not count against the breaker.
        assert_eq!(client.manager().breaker().failure_count(), 0);
    }
}
