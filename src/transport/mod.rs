//! Broker transport seam.
//!
//! # Data Flow
//! ```text
//! ConnectionManager
//!     → Transport::connect (handshake, TLS)
//!         → BrokerConnection (+ event receiver: Error / Closed)
//!             → BrokerChannel (declare, bind, publish, consume, ack, nack)
//! ```
//!
//! # Design Decisions
//! - The resilience core only sees these traits, never a client library
//! - Connection events arrive over a channel instead of callbacks
//! - Backpressure is a value returned from publish, carrying its own drain signal
//! - `memory://` runs an in-process broker; `amqp://` / `amqps://` use lapin

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod tls;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;
pub use tls::TlsMaterial;
pub use types::{
    ConsumeOptions, Delivery, DrainSignal, ExchangeKind, ExchangeOptions, MessageProperties,
    PublishOutcome, QueueDeclaration,
};

/// Errors reported by a transport adapter.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("{operation} rejected by broker: {reason}")]
    Rejected { operation: &'static str, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("unsupported broker url scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Asynchronous events raised by an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Error(String),
    Closed,
}

/// Handshake parameters passed to the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub heartbeat_secs: u16,
    pub tls: Option<TlsMaterial>,
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

/// An established connection and the receiver for its events.
pub struct TransportLink {
    pub connection: Arc<dyn BrokerConnection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<TransportLink, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Declare a queue, returning the name the broker assigned.
    async fn declare_queue(
        &self,
        name: &str,
        declaration: &QueueDeclaration,
    ) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, TransportError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Pick the transport for a broker URL.
pub fn for_url(url: &str) -> Result<Arc<dyn Transport>, TransportError> {
    let parsed = url::Url::parse(url).map_err(|e| TransportError::Connect(e.to_string()))?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpTransport::new())),
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

/// Broker URL with any password replaced, for logging.
pub fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
