//! AMQP 0-9-1 transport backed by lapin.
//!
//! Backpressure is handled inside lapin's outbound buffer, so `publish`
//! always reports `Accepted` once the frame has been handed over.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::{Map, Number, Value};
use tokio::sync::mpsc;

use super::{
    BrokerChannel, BrokerConnection, ConnectOptions, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, ExchangeOptions, MessageProperties, PublishOutcome, QueueDeclaration, Transport,
    TransportError, TransportEvent, TransportLink,
};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<TransportLink, TransportError> {
        let uri = with_heartbeat(url, options.heartbeat_secs)?;
        let properties = ConnectionProperties::default();

        let connection = match &options.tls {
            Some(material) => {
                let ca = String::from_utf8(material.ca_pem.clone())
                    .map_err(|e| TransportError::Connect(format!("CA bundle is not UTF-8: {}", e)))?;
                // lapin takes client identities as PKCS#12 only.
                tracing::warn!("Broker TLS: verifying server with CA bundle; client certificate is validated but not presented");
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(ca),
                };
                Connection::connect_with_config(&uri, properties, tls).await
            }
            None => Connection::connect(&uri, properties).await,
        }
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (tx, events) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = tx.send(TransportEvent::Error(err.to_string()));
            let _ = tx.send(TransportEvent::Closed);
        });

        Ok(TransportLink {
            connection: Arc::new(AmqpConnection { inner: connection }),
            events,
        })
    }
}

fn with_heartbeat(url: &str, heartbeat_secs: u16) -> Result<String, TransportError> {
    let mut parsed = url::Url::parse(url).map_err(|e| TransportError::Connect(e.to_string()))?;
    if !parsed.query_pairs().any(|(k, _)| k == "heartbeat") {
        parsed
            .query_pairs_mut()
            .append_pair("heartbeat", &heartbeat_secs.to_string());
    }
    Ok(parsed.to_string())
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn rejected(operation: &'static str) -> impl FnOnce(lapin::Error) -> TransportError {
    move |e| TransportError::Rejected {
        operation,
        reason: e.to_string(),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(rejected("declare_exchange"))
    }

    async fn declare_queue(
        &self,
        name: &str,
        declaration: &QueueDeclaration,
    ) -> Result<String, TransportError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    ..Default::default()
                },
                to_field_table(&declaration.arguments),
            )
            .await
            .map_err(rejected("declare_queue"))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(rejected("bind_queue"))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, TransportError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(rejected("publish"))?;
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("gateway-{}", uuid::Uuid::new_v4()));
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(rejected("consume"))?;

        let queue = queue.to_string();
        let stream = consumer.filter_map(move |item| {
            let queue = queue.clone();
            async move {
                match item {
                    Ok(delivery) => Some(from_lapin_delivery(delivery)),
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "Consumer stream error");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(rejected("ack"))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(rejected("nack"))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_content_type(ShortString::from(properties.content_type.clone()))
        .with_delivery_mode(if properties.persistent { 2 } else { 1 })
        .with_priority(properties.priority);
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        headers,
        payload: delivery.data,
    }
}

fn to_field_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(to_field_table(map)),
    }
}

fn from_field_table(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => float(f64::from(*f)),
        AMQPValue::Double(f) => float(*f),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(from_field_table(table)),
        _ => Value::Null,
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
