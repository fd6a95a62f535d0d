//! Exchange, queue and binding declarations.

use super::client::BrokerClient;
use super::error::BrokerError;
use super::options::QueueOptions;
use crate::config::TopologyConfig;
use crate::transport::{ExchangeKind, ExchangeOptions};

impl BrokerClient {
    pub async fn create_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.manager
            .with_link("declare_exchange", |link| async move {
                link.channel.declare_exchange(name, kind, options).await
            })
            .await?;
        tracing::debug!(exchange = name, kind = %kind, "Exchange declared");
        Ok(())
    }

    /// Declare a queue and return the name the broker assigned.
    pub async fn create_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        let declaration = options.to_declaration();
        let declaration = &declaration;
        let queue = self
            .manager
            .with_link("declare_queue", |link| async move {
                link.channel.declare_queue(name, declaration).await
            })
            .await?;
        tracing::debug!(queue = %queue, "Queue declared");
        Ok(queue)
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.manager
            .with_link("bind_queue", |link| async move {
                link.channel.bind_queue(queue, exchange, routing_key).await
            })
            .await?;
        tracing::debug!(queue, exchange, routing_key, "Queue bound");
        Ok(())
    }

    /// Declare every exchange, then every queue, then every binding.
    /// Stops at the first failure.
    pub async fn declare_topology(&self, topology: &TopologyConfig) -> Result<(), BrokerError> {
        for exchange in &topology.exchanges {
            let options = ExchangeOptions {
                durable: exchange.durable,
            };
            self.create_exchange(&exchange.name, exchange.kind, &options)
                .await?;
        }
        for queue in &topology.queues {
            self.create_queue(&queue.name, &queue.options).await?;
        }
        for binding in &topology.bindings {
            self.bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }

        tracing::info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "Broker topology declared"
        );
        Ok(())
    }
}
