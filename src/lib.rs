//! Resilient message-broker gateway library

pub mod broker;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod transport;

pub use broker::{BrokerClient, BrokerError};
pub use config::GatewayConfig;
pub use health::StatusRegistry;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use resilience::{CircuitBreaker, CircuitState};
