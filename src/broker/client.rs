use std::sync::Arc;

use super::connection::ConnectionManager;
use super::options::{BrokerSettings, PublishPolicy};
use crate::config::GatewayConfig;
use crate::health::status::StatusRegistry;
use crate::resilience::CircuitState;
use crate::transport::{self, Transport, TransportError};

/// Cloneable handle to the broker: lifecycle, topology, publish and consume.
#[derive(Clone)]
pub struct BrokerClient {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) policy: PublishPolicy,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: BrokerSettings,
        policy: PublishPolicy,
        statuses: StatusRegistry,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(transport, settings, statuses),
            policy,
        }
    }

    /// Build a client whose transport is chosen from the broker URL scheme.
    pub fn from_config(
        config: &GatewayConfig,
        statuses: StatusRegistry,
    ) -> Result<Self, TransportError> {
        let transport = transport::for_url(&config.broker.url)?;
        Ok(Self::new(
            transport,
            BrokerSettings::from_config(config),
            PublishPolicy::from_config(&config.publish),
            statuses,
        ))
    }

    pub async fn connect(&self) {
        self.manager.connect().await;
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.manager.circuit_state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn statuses(&self) -> &StatusRegistry {
        self.manager.statuses()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("connected", &self.is_connected())
            .field("circuit", &self.circuit_state())
            .finish()
    }
}
