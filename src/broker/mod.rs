//! Resilient broker client.
//!
//! # Data Flow
//! ```text
//! BrokerClient::{publish, consume, create_*, bind_queue}
//!     → ConnectionManager::with_link (guard: breaker check, lazy connect)
//!         → BrokerChannel (transport seam)
//!
//! transport events → supervisor → reconnect (backoff, breaker cooldown)
//!                              → StatusRegistry["broker"]
//! ```
//!
//! # Design Decisions
//! - One connection and one channel shared by every caller
//! - `connect()` and `close()` never return errors; everything else does
//! - Failed operations only count against the breaker while half-open

pub mod client;
pub mod connection;
pub mod consume;
pub mod error;
mod guard;
pub mod options;
pub mod publish;
pub mod topology;

pub use client::BrokerClient;
pub use connection::ConnectionManager;
pub use consume::{HandlerError, MessageHandler};
pub use error::BrokerError;
pub use options::{
    BrokerSettings, ConsumeSettings, PublishOptions, PublishPolicy, QueueOptions,
    MESSAGE_ID_HEADER,
};
