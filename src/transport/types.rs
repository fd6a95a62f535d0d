//! Transport-level value types shared by all adapters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

/// Queue argument key carrying the dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Queue argument key carrying the dead-letter routing key.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// Fully resolved queue declaration as sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Map<String, Value>,
}

impl Default for QueueDeclaration {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Map::new(),
        }
    }
}

impl QueueDeclaration {
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(DEAD_LETTER_EXCHANGE_ARG)
            .and_then(Value::as_str)
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.arguments
            .get(DEAD_LETTER_ROUTING_KEY_ARG)
            .and_then(Value::as_str)
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub priority: u8,
    pub expiration: Option<String>,
    pub headers: Map<String, Value>,
    pub content_type: String,
    pub message_id: Option<String>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 0,
            expiration: None,
            headers: Map::new(),
            content_type: "application/json".to_string(),
            message_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub consumer_tag: Option<String>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: Map<String, Value>,
    pub payload: Vec<u8>,
}

/// Result of handing a message to the transport.
#[derive(Debug)]
pub enum PublishOutcome {
    Accepted,
    /// Outbound buffer is full; the message was not taken.
    Backpressure(DrainSignal),
}

/// Resolves on the first drain after the backpressure report it came with.
#[derive(Debug)]
pub struct DrainSignal {
    rx: watch::Receiver<u64>,
}

impl DrainSignal {
    pub fn new(mut rx: watch::Receiver<u64>) -> Self {
        let _ = rx.borrow_and_update();
        Self { rx }
    }

    /// Wait for the next drain. Returns early if the channel goes away.
    pub async fn wait(mut self) {
        let _ = self.rx.changed().await;
    }
}
