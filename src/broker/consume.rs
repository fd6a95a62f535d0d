//! Crash-isolated message consumption.
//!
//! # Responsibilities
//! - Register a consumer on the current channel
//! - Decode each delivery as JSON and hand it to the handler
//! - Ack on success, nack without requeue on `false`, error or panic
//!
//! # Design Decisions
//! - Every delivery is decoded, handled and settled on its own task, so a
//!   slow or hung handler never holds up later deliveries
//! - The handler itself runs in a nested task; a panic becomes a nack
//! - Deliveries from a replaced link are left unsettled; the broker
//!   redelivers them once the old channel is gone

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use super::client::BrokerClient;
use super::connection::ConnectionManager;
use super::error::BrokerError;
use super::options::ConsumeSettings;
use crate::observability::metrics;
use crate::transport::{BrokerChannel, ConsumeOptions, Delivery, TransportError};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one decoded message. `Ok(true)` acknowledges it.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T, envelope: Delivery) -> Result<bool, HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: T, envelope: Delivery) -> Result<bool, HandlerError> {
        (self)(message, envelope).await
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
    Skipped,
}

impl Settlement {
    fn as_str(self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Nack => "nack",
            Settlement::Skipped => "skipped",
        }
    }
}

impl BrokerClient {
    /// Start consuming `queue`. Returns once the consumer is registered;
    /// deliveries are processed on a background task.
    pub async fn consume<T, H>(
        &self,
        queue: &str,
        handler: H,
        settings: ConsumeSettings,
    ) -> Result<(), BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let options = ConsumeOptions {
            no_ack: settings.no_ack,
            consumer_tag: None,
        };
        let options = &options;
        let (generation, channel, mut deliveries) = self
            .manager
            .with_link("consume", |link| async move {
                let stream = link.channel.consume(queue, options).await?;
                Ok::<_, TransportError>((link.generation, link.channel.clone(), stream))
            })
            .await?;

        let consumer = Arc::new(Consumer {
            queue: queue.to_string(),
            generation,
            channel,
            manager: self.manager.clone(),
            handler: Arc::new(handler),
            no_ack: settings.no_ack,
        });
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let consumer = consumer.clone();
                tokio::spawn(async move { consumer.process::<T>(delivery).await });
            }
            tracing::info!(queue = %consumer.queue, generation, "Consumer stream ended");
        });

        tracing::info!(queue, generation, no_ack = settings.no_ack, "Consumer started");
        Ok(())
    }
}

struct Consumer<H> {
    queue: String,
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    manager: Arc<ConnectionManager>,
    handler: Arc<H>,
    no_ack: bool,
}

impl<H> Consumer<H> {
    async fn process<T>(&self, delivery: Delivery)
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let tag = delivery.delivery_tag;
        if self.manager.current_generation() != Some(self.generation) {
            tracing::warn!(
                queue = %self.queue,
                delivery_tag = tag,
                "Channel gone, leaving delivery unsettled"
            );
            metrics::record_consumed(&self.queue, Settlement::Skipped.as_str());
            return;
        }

        let started = Instant::now();
        let outcome = self.run_handler::<T>(delivery.clone()).await;
        let elapsed = started.elapsed();
        metrics::record_processing_time(&self.queue, elapsed);

        let message_id = delivery.message_id.as_deref().unwrap_or("unknown");
        let settlement = match outcome {
            Ok(true) => {
                tracing::debug!(
                    queue = %self.queue,
                    message_id,
                    processing_ms = elapsed.as_millis() as u64,
                    "Message processed"
                );
                Settlement::Ack
            }
            Ok(false) => {
                tracing::warn!(queue = %self.queue, message_id, "Handler rejected message");
                Settlement::Nack
            }
            Err(e) => {
                tracing::error!(queue = %self.queue, message_id, error = %e, "Message processing failed");
                Settlement::Nack
            }
        };

        if !self.no_ack {
            self.settle(tag, settlement).await;
        }
        metrics::record_consumed(&self.queue, settlement.as_str());
    }

    async fn run_handler<T>(&self, delivery: Delivery) -> Result<bool, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let message: T = serde_json::from_slice(&delivery.payload)
            .map_err(|e| BrokerError::HandlerFailure(format!("invalid JSON payload: {}", e)))?;

        let handler = self.handler.clone();
        match tokio::spawn(async move { handler.handle(message, delivery).await }).await {
            Ok(result) => result.map_err(|e| BrokerError::HandlerFailure(e.to_string())),
            Err(join) if join.is_panic() => {
                Err(BrokerError::HandlerFailure("handler panicked".to_string()))
            }
            Err(join) => Err(BrokerError::HandlerFailure(join.to_string())),
        }
    }

    async fn settle(&self, tag: u64, settlement: Settlement) {
        let result = match settlement {
            Settlement::Ack => self.channel.ack(tag).await,
            Settlement::Nack => self.channel.nack(tag, false).await,
            Settlement::Skipped => return,
        };
        if let Err(e) = result {
            tracing::error!(
                queue = %self.queue,
                delivery_tag = tag,
                settlement = settlement.as_str(),
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::options::{BrokerSettings, PublishOptions, PublishPolicy};
    use crate::config::BrokerConfig;
    use crate::health::status::StatusRegistry;
    use crate::resilience::BackoffSchedule;
    use crate::transport::MemoryBroker;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn client(broker: &MemoryBroker) -> BrokerClient {
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
            PublishPolicy::default(),
            StatusRegistry::new(),
        );
        client.create_queue("jobs", &Default::default()).await.unwrap();
        client
    }

    async fn publish(client: &BrokerClient, message: Value) {
        client
            .publish("", "jobs", &message, &PublishOptions::default())
            .await
            .unwrap();
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_successful_handler_acks() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        client
            .consume(
                "jobs",
                move |message: Value, _envelope: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok::<_, HandlerError>(true)
                    }
                },
                ConsumeSettings::default(),
            )
            .await
            .unwrap();
        publish(&client, json!({"n": 1})).await;

        assert_eq!(rx.recv().await, Some(json!({"n": 1})));
        wait_for(|| broker.ack_count() == 1).await;
        assert_eq!(broker.nack_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_and_invalid_messages_are_nacked() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;

        client
            .consume(
                "jobs",
                |message: Value, _envelope: Delivery| async move {
                    Ok::<_, HandlerError>(message["ok"] == json!(true))
                },
                ConsumeSettings::default(),
            )
            .await
            .unwrap();

        publish(&client, json!({"ok": false})).await;
        client
            .manager()
            .current_link()
            .unwrap()
            .channel
            .publish("", "jobs", b"not json", &Default::default())
            .await
            .unwrap();
        publish(&client, json!({"ok": true})).await;

        wait_for(|| broker.nack_count() == 2 && broker.ack_count() == 1).await;
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_consumer() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;

        client
            .consume(
                "jobs",
                |message: Value, _envelope: Delivery| async move {
                    if message == json!("boom") {
                        panic!("handler exploded");
                    }
                    Ok::<_, HandlerError>(true)
                },
                ConsumeSettings::default(),
            )
            .await
            .unwrap();

        publish(&client, json!("boom")).await;
        publish(&client, json!("fine")).await;

        wait_for(|| broker.nack_count() == 1 && broker.ack_count() == 1).await;
    }

    #[tokio::test]
    async fn test_hung_handler_does_not_block_later_deliveries() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        client
            .consume(
                "jobs",
                move |message: Value, _envelope: Delivery| {
                    let tx = tx.clone();
                    async move {
                        if message == json!("slow") {
                            std::future::pending::<()>().await;
                        }
                        let _ = tx.send(message);
                        Ok::<_, HandlerError>(true)
                    }
                },
                ConsumeSettings::default(),
            )
            .await
            .unwrap();

        publish(&client, json!("slow")).await;
        publish(&client, json!("fast")).await;

        assert_eq!(rx.recv().await, Some(json!("fast")));
        wait_for(|| broker.ack_count() == 1).await;
        assert_eq!(broker.unacked(), 1);
    }

    #[tokio::test]
    async fn test_no_ack_sends_no_settlement() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        client
            .consume(
                "jobs",
                move |message: Value, _envelope: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok::<_, HandlerError>(false)
                    }
                },
                ConsumeSettings { no_ack: true },
            )
            .await
            .unwrap();
        publish(&client, json!(1)).await;

        assert_eq!(rx.recv().await, Some(json!(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.ack_count(), 0);
        assert_eq!(broker.nack_count(), 0);
        assert_eq!(broker.unacked(), 0);
    }
}
