//! Caller-facing options for broker operations.
//!
//! Every field is optional so HTTP bodies and config tables can omit it;
//! the conversions below apply the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BrokerConfig, BrokerTlsConfig, GatewayConfig, PublishConfig};
use crate::resilience::BackoffSchedule;
use crate::transport::types::DEAD_LETTER_EXCHANGE_ARG;
use crate::transport::{MessageProperties, QueueDeclaration};

/// Header consulted for a message id when none is given explicitly.
pub const MESSAGE_ID_HEADER: &str = "message-id";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,
    #[serde(alias = "autoDelete", skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    /// Shorthand for the `x-dead-letter-exchange` argument.
    #[serde(alias = "deadLetterExchange", skip_serializing_if = "Option::is_none")]
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    pub fn to_declaration(&self) -> QueueDeclaration {
        let mut arguments = self.arguments.clone();
        if let Some(dlx) = &self.dead_letter_exchange {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.to_string(),
                Value::String(dlx.clone()),
            );
        }
        QueueDeclaration {
            durable: self.durable.unwrap_or(true),
            exclusive: self.exclusive.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub persistent: Option<bool>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub headers: Map<String, Value>,
    #[serde(alias = "messageId")]
    pub message_id: Option<String>,
}

impl PublishOptions {
    /// Resolve defaults. The message id falls back to the `message-id`
    /// header, then to a fresh UUID.
    pub fn to_properties(&self) -> MessageProperties {
        let message_id = self
            .message_id
            .clone()
            .or_else(|| {
                self.headers
                    .get(MESSAGE_ID_HEADER)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        MessageProperties {
            persistent: self.persistent.unwrap_or(true),
            priority: self.priority.unwrap_or(0),
            expiration: self.expiration.clone(),
            headers: self.headers.clone(),
            message_id: Some(message_id),
            ..MessageProperties::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumeSettings {
    /// Broker settles messages on delivery; no ack or nack is sent.
    #[serde(alias = "noAck")]
    pub no_ack: bool,
}

/// Bounds on how long a publish waits for the outbound buffer to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub drain_timeout: Option<Duration>,
    pub max_drain_waits: u32,
}

impl PublishPolicy {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            drain_timeout: match config.drain_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_drain_waits: config.max_drain_waits,
        }
    }
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self::from_config(&PublishConfig::default())
    }
}

/// Everything the connection manager needs to (re)connect.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub heartbeat_secs: u16,
    pub tls: BrokerTlsConfig,
    pub backoff: BackoffSchedule,
}

impl BrokerSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.broker, BackoffSchedule::from_config(&config.retries))
    }

    pub fn new(broker: &BrokerConfig, backoff: BackoffSchedule) -> Self {
        Self {
            url: broker.url.clone(),
            heartbeat_secs: broker.heartbeat_secs,
            tls: broker.tls.clone(),
            backoff,
        }
    }
}
