//! In-process broker transport (`memory://`).
//!
//! # Responsibilities
//! - Route messages through direct, fanout, topic and headers exchanges
//! - Hold queues, deliver to consumers round-robin, track unacknowledged messages
//! - Dead-letter rejected messages through `x-dead-letter-exchange`
//! - Inject faults: refused connects, connection errors, backpressure, failing operations
//!
//! # Design Decisions
//! - Headers exchanges route to every bound queue (bindings carry no arguments)
//! - Unroutable messages are dropped, as with a non-mandatory publish
//! - Closing a channel requeues its unacknowledged messages as redelivered

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use super::types::{
    ConsumeOptions, Delivery, DrainSignal, ExchangeKind, ExchangeOptions, MessageProperties,
    PublishOutcome, QueueDeclaration,
};
use super::{
    BrokerChannel, BrokerConnection, ConnectOptions, DeliveryStream, Transport, TransportError,
    TransportEvent, TransportLink,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    message_id: Option<String>,
    headers: Map<String, Value>,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    refuse_connects: usize,
    backpressure_publishes: usize,
    failing_operations: usize,
}

struct BrokerState {
    topology: Mutex<Topology>,
    faults: Mutex<Faults>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    drain_tx: watch::Sender<u64>,
    next_id: AtomicU64,
    next_tag: AtomicU64,
    connect_calls: AtomicUsize,
    publish_attempts: AtomicUsize,
    backpressure_reports: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

/// In-process broker; clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (drain_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                topology: Mutex::new(Topology::default()),
                faults: Mutex::new(Faults::default()),
                connections: Mutex::new(Vec::new()),
                drain_tx,
                next_id: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
                connect_calls: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
                backpressure_reports: AtomicUsize::new(0),
                acks: AtomicUsize::new(0),
                nacks: AtomicUsize::new(0),
            }),
        }
    }

    // --- Fault injection ---

    /// Refuse every connect while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.faults.lock().unreachable = !reachable;
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.state.faults.lock().refuse_connects = count;
    }

    /// Report backpressure for the next `count` publishes.
    pub fn backpressure_next_publishes(&self, count: usize) {
        self.state.faults.lock().backpressure_publishes = count;
    }

    /// Reject the next `count` channel operations.
    pub fn fail_next_operations(&self, count: usize) {
        self.state.faults.lock().failing_operations = count;
    }

    /// Signal that the outbound buffer drained.
    pub fn drain(&self) {
        self.state.drain_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Fail every open connection with an error followed by a close.
    pub fn emit_connection_error(&self, reason: &str) {
        for connection in self.take_connections() {
            connection.teardown();
            let _ = connection.events.send(TransportEvent::Error(reason.to_string()));
            let _ = connection.events.send(TransportEvent::Closed);
        }
    }

    /// Close every open connection from the broker side.
    pub fn close_connections(&self) {
        for connection in self.take_connections() {
            connection.teardown();
            let _ = connection.events.send(TransportEvent::Closed);
        }
    }

    fn take_connections(&self) -> Vec<Arc<MemoryConnection>> {
        std::mem::take(&mut *self.state.connections.lock())
    }

    // --- Inspection ---

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn backpressure_reports(&self) -> usize {
        self.state.backpressure_reports.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> usize {
        self.state.nacks.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.lock().len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.topology.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.topology.lock().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.topology.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<Map<String, Value>> {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.declaration.arguments.clone())
    }

    /// Payloads waiting in `queue` (not yet delivered).
    pub fn queue_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked(&self) -> usize {
        self.state.topology.lock().unacked.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    fn take_operation_fault(&self, operation: &'static str) -> Result<(), TransportError> {
        let mut faults = self.faults.lock();
        if faults.failing_operations > 0 {
            faults.failing_operations -= 1;
            return Err(TransportError::Rejected {
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
    ) -> Result<TransportLink, TransportError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.state.faults.lock();
            if faults.unreachable {
                return Err(TransportError::Connect(format!("{} unreachable", url)));
            }
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(TransportError::Connect("connection refused".to_string()));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MemoryConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            broker: self.state.clone(),
            events: events_tx,
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        });
        self.state.connections.lock().push(connection.clone());

        Ok(TransportLink {
            connection,
            events: events_rx,
        })
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
    channels: Mutex<Vec<u64>>,
}

impl MemoryConnection {
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        let mut topology = self.broker.topology.lock();
        for channel_id in channels {
            release_channel(&mut topology, channel_id);
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = self.broker.next_id.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().push(id);
        Ok(Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.teardown();
        self.broker.connections.lock().retain(|c| c.id != self.id);
        let _ = self.events.send(TransportEvent::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: Arc<BrokerState>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self, operation: &'static str) -> Result<(), TransportError> {
        let connection_open = self
            .broker
            .connections
            .lock()
            .iter()
            .any(|c| c.id == self.connection_id);
        if self.closed.load(Ordering::SeqCst) || !connection_open {
            return Err(TransportError::Closed);
        }
        self.broker.take_operation_fault(operation)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open("declare_exchange")?;
        let mut topology = self.broker.topology.lock();
        match topology.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TransportError::Rejected {
                operation: "declare_exchange",
                reason: format!(
                    "exchange '{}' already declared as {}, not {}",
                    name, existing, kind
                ),
            }),
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        declaration: &QueueDeclaration,
    ) -> Result<String, TransportError> {
        self.ensure_open("declare_queue")?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut topology = self.broker.topology.lock();
        match topology.queues.get(&name) {
            Some(existing) if existing.declaration.durable != declaration.durable => {
                Err(TransportError::Rejected {
                    operation: "declare_queue",
                    reason: format!("queue '{}' already declared with different durability", name),
                })
            }
            Some(_) => Ok(name),
            None => {
                topology.queues.insert(
                    name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        ..Default::default()
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open("bind_queue")?;
        let mut topology = self.broker.topology.lock();
        if !topology.exchanges.contains_key(exchange) {
            return Err(not_found("bind_queue", "exchange", exchange));
        }
        if !topology.queues.contains_key(queue) {
            return Err(not_found("bind_queue", "queue", queue));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome, TransportError> {
        self.broker.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open("publish")?;
        {
            let mut faults = self.broker.faults.lock();
            if faults.backpressure_publishes > 0 {
                faults.backpressure_publishes -= 1;
                self.broker.backpressure_reports.fetch_add(1, Ordering::SeqCst);
                return Ok(PublishOutcome::Backpressure(DrainSignal::new(
                    self.broker.drain_tx.subscribe(),
                )));
            }
        }

        let mut topology = self.broker.topology.lock();
        if !exchange.is_empty() && !topology.exchanges.contains_key(exchange) {
            return Err(not_found("publish", "exchange", exchange));
        }
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            message_id: properties.message_id.clone(),
            headers: properties.headers.clone(),
            redelivered: false,
        };
        route(&mut topology, &self.broker, exchange, routing_key, message);
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open("consume")?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topology = self.broker.topology.lock();
            let state = topology
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("consume", "queue", queue))?;
            state.consumers.push(ConsumerSlot {
                channel_id: self.id,
                no_ack: options.no_ack,
                sender: tx,
            });
            dispatch(&mut topology, &self.broker, queue);
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open("ack")?;
        let mut topology = self.broker.topology.lock();
        match topology.unacked.remove(&delivery_tag) {
            Some(_) => {
                self.broker.acks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(unknown_tag("ack", delivery_tag)),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open("nack")?;
        let mut topology = self.broker.topology.lock();
        let entry = topology
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_tag("nack", delivery_tag))?;
        self.broker.nacks.fetch_add(1, Ordering::SeqCst);

        let mut message = entry.message;
        if requeue {
            message.redelivered = true;
            if let Some(queue) = topology.queues.get_mut(&entry.queue) {
                queue.ready.push_front(message);
            }
            dispatch(&mut topology, &self.broker, &entry.queue);
            return Ok(());
        }

        let dead_letter = topology.queues.get(&entry.queue).and_then(|q| {
            q.declaration.dead_letter_exchange().map(|dlx| {
                let key = q
                    .declaration
                    .dead_letter_routing_key()
                    .unwrap_or(&message.routing_key)
                    .to_string();
                (dlx.to_string(), key)
            })
        });
        if let Some((dlx, key)) = dead_letter {
            message.headers.insert(
                "x-first-death-queue".to_string(),
                Value::String(entry.queue.clone()),
            );
            message.exchange = dlx.clone();
            message.routing_key = key.clone();
            message.redelivered = false;
            route(&mut topology, &self.broker, &dlx, &key, message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut topology = self.broker.topology.lock();
        release_channel(&mut topology, self.id);
        Ok(())
    }
}

fn not_found(operation: &'static str, what: &str, name: &str) -> TransportError {
    TransportError::Rejected {
        operation,
        reason: format!("no {} '{}'", what, name),
    }
}

fn unknown_tag(operation: &'static str, delivery_tag: u64) -> TransportError {
    TransportError::Rejected {
        operation,
        reason: format!("unknown delivery tag {}", delivery_tag),
    }
}

/// Drop a channel's consumers and requeue what it left unacknowledged.
fn release_channel(topology: &mut Topology, channel_id: u64) {
    for queue in topology.queues.values_mut() {
        queue.consumers.retain(|c| c.channel_id != channel_id);
    }

    let mut tags: Vec<u64> = topology
        .unacked
        .iter()
        .filter(|(_, u)| u.channel_id == channel_id)
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable();
    // Reverse so push_front restores the original order.
    for tag in tags.into_iter().rev() {
        if let Some(entry) = topology.unacked.remove(&tag) {
            if let Some(queue) = topology.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }
}

fn route(
    topology: &mut Topology,
    broker: &BrokerState,
    exchange: &str,
    routing_key: &str,
    message: StoredMessage,
) {
    let targets: Vec<String> = if exchange.is_empty() {
        if topology.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        }
    } else {
        let kind = match topology.exchanges.get(exchange) {
            Some(kind) => *kind,
            None => return,
        };
        let mut targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    };

    if targets.is_empty() {
        tracing::debug!(exchange, routing_key, "Unroutable message dropped");
        return;
    }

    for queue in targets {
        if let Some(state) = topology.queues.get_mut(&queue) {
            state.ready.push_back(message.clone());
        }
        dispatch(topology, broker, &queue);
    }
}

fn dispatch(topology: &mut Topology, broker: &BrokerState, queue_name: &str) {
    let Topology { queues, unacked, .. } = topology;
    let queue = match queues.get_mut(queue_name) {
        Some(q) => q,
        None => return,
    };

    while !queue.consumers.is_empty() {
        let message = match queue.ready.pop_front() {
            Some(m) => m,
            None => break,
        };
        let index = queue.next_consumer % queue.consumers.len();
        let tag = broker.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            message_id: message.message_id.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
        };

        let consumer = &queue.consumers[index];
        if consumer.sender.send(delivery).is_err() {
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }
        if !consumer.no_ack {
            unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    channel_id: consumer.channel_id,
                    message,
                },
            );
        }
        queue.next_consumer = index + 1;
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, tail)) if word == "*" || word == first => match_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let link = broker
            .connect("memory://test", &ConnectOptions::default())
            .await
            .unwrap();
        link.connection.create_channel().await.unwrap()
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("*.created.#", "orders.created.eu.west"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(2);
        let options = ConnectOptions::default();

        assert!(broker.connect("memory://x", &options).await.is_err());
        assert!(broker.connect("memory://x", &options).await.is_err());
        assert!(broker.connect("memory://x", &options).await.is_ok());
        assert_eq!(broker.connect_calls(), 3);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_direct_routing_and_delivery() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel
            .declare_exchange("email", ExchangeKind::Direct, &ExchangeOptions::default())
            .await
            .unwrap();
        channel
            .declare_queue("email_queue", &QueueDeclaration::default())
            .await
            .unwrap();
        channel
            .bind_queue("email_queue", "email", "confirmation")
            .await
            .unwrap();

        let props = MessageProperties::default();
        channel.publish("email", "confirmation", b"1", &props).await.unwrap();
        channel.publish("email", "other", b"2", &props).await.unwrap();
        assert_eq!(broker.queue_payloads("email_queue"), vec![b"1".to_vec()]);

        let mut stream = channel
            .consume("email_queue", &ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.payload, b"1");
        assert_eq!(broker.unacked(), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn test_nack_dead_letters() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let opts = ExchangeOptions::default();
        channel.declare_exchange("work", ExchangeKind::Direct, &opts).await.unwrap();
        channel.declare_exchange("dlx", ExchangeKind::Topic, &opts).await.unwrap();

        let mut work = QueueDeclaration::default();
        work.arguments.insert(
            super::super::types::DEAD_LETTER_EXCHANGE_ARG.to_string(),
            Value::String("dlx".into()),
        );
        channel.declare_queue("jobs", &work).await.unwrap();
        channel.declare_queue("dlq", &QueueDeclaration::default()).await.unwrap();
        channel.bind_queue("jobs", "work", "job").await.unwrap();
        channel.bind_queue("dlq", "dlx", "#").await.unwrap();

        channel
            .publish("work", "job", b"bad", &MessageProperties::default())
            .await
            .unwrap();
        let mut stream = channel.consume("jobs", &ConsumeOptions::default()).await.unwrap();
        let delivery = stream.next().await.unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_payloads("dlq"), vec![b"bad".to_vec()]);
        assert_eq!(broker.nack_count(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_until_drain() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("q", &QueueDeclaration::default()).await.unwrap();
        broker.backpressure_next_publishes(1);

        let outcome = channel
            .publish("", "q", b"x", &MessageProperties::default())
            .await
            .unwrap();
        let signal = match outcome {
            PublishOutcome::Backpressure(signal) => signal,
            PublishOutcome::Accepted => panic!("expected backpressure"),
        };
        assert_eq!(broker.queue_depth("q"), 0);

        let waiter = tokio::spawn(signal.wait());
        broker.drain();
        waiter.await.unwrap();
        assert_eq!(broker.backpressure_reports(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_requeues_unacked() {
        let broker = MemoryBroker::new();
        let mut link = broker
            .connect("memory://test", &ConnectOptions::default())
            .await
            .unwrap();
        let channel = link.connection.create_channel().await.unwrap();
        channel.declare_queue("q", &QueueDeclaration::default()).await.unwrap();
        channel
            .publish("", "q", b"m", &MessageProperties::default())
            .await
            .unwrap();
        let mut stream = channel.consume("q", &ConsumeOptions::default()).await.unwrap();
        let _ = stream.next().await.unwrap();

        broker.emit_connection_error("boom");
        assert_eq!(link.events.recv().await, Some(TransportEvent::Error("boom".into())));
        assert_eq!(link.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(matches!(
            channel.publish("", "q", b"m", &MessageProperties::default()).await,
            Err(TransportError::Closed)
        ));
    }
}
