//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Connect to the broker and declare the configured topology
//! - Bind the HTTP listener and serve until shutdown, then close the broker
//!
//! # Design Decisions
//! - Fail fast: a topology declaration failure is fatal
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;

use super::shutdown::Shutdown;
use super::signals::spawn_signal_handler;
use crate::broker::{BrokerClient, BrokerError};
use crate::config::GatewayConfig;
use crate::health::status::{StatusRegistry, BROKER};
use crate::http::{AppState, HttpServer};
use crate::observability::metrics;
use crate::transport::{redact_url, TransportError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("broker transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to declare broker topology: {0}")]
    Topology(#[source] BrokerError),

    #[error("invalid listen address '{0}'")]
    Address(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Run the gateway until a termination signal arrives.
pub async fn run(config: GatewayConfig) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::Address(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr);
    }

    let statuses = StatusRegistry::new();
    statuses.add_listener(BROKER, |connected| {
        tracing::info!(connected, "Broker status changed");
    });

    tracing::info!(url = %redact_url(&config.broker.url), "Connecting to broker");
    let broker = BrokerClient::from_config(&config, statuses.clone())?;
    broker.connect().await;

    if let Err(e) = broker.declare_topology(&config.topology).await {
        broker.close().await;
        return Err(StartupError::Topology(e));
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let server = HttpServer::new(
        config.server.clone(),
        AppState {
            broker: broker.clone(),
            statuses,
        },
    );

    let address = config.server.bind_address.clone();
    let served = if config.server.tls.is_some() {
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| StartupError::Address(address.clone()))?;
        server.run_tls(addr, shutdown).await
    } else {
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| StartupError::Bind {
                address: address.clone(),
                source,
            })?;
        server.run(listener, shutdown).await
    };

    broker.close().await;
    tracing::info!("Shutdown complete");
    served.map_err(StartupError::Server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindingConfig;

    fn memory_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.broker.url = "memory://startup".to_string();
        config.server.bind_address = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails_before_connecting() {
        let mut config = memory_config();
        config.broker.url = "kafka://localhost:9092".to_string();

        let err = run(config).await.unwrap_err();
        assert!(matches!(
            err,
            StartupError::Transport(TransportError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_topology_failure_is_fatal() {
        let mut config = memory_config();
        config.topology.bindings.push(BindingConfig {
            queue: "missing".to_string(),
            exchange: "email".to_string(),
            routing_key: "x".to_string(),
        });

        let err = run(config).await.unwrap_err();
        assert!(matches!(err, StartupError::Topology(_)), "{}", err);
    }
}
