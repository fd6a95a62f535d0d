//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → environment overrides (.env via dotenvy, then process env)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared by value with the broker client and the HTTP server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BindingConfig, BrokerConfig, BrokerTlsConfig, ExchangeConfig, GatewayConfig,
    ListenerTlsConfig, ObservabilityConfig, PublishConfig, QueueConfig, RetryConfig,
    ServerConfig, TopologyConfig,
};
