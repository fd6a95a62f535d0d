//! Connection lifecycle: connect, event-driven reconnection, close.
//!
//! # Data Flow
//! ```text
//! connect() ──ok──▶ Link{generation, connection, channel} stored
//!     │                 │
//!     │                 └─ forwarder task: transport events → LinkEvent{generation}
//!     │                                                           │
//!     └──err──▶ breaker failure ──▶ reconnect()                   ▼
//!                                     ▲                    supervisor task
//!                                     └──── stale? ignore ◀───────┘
//! ```
//!
//! # Design Decisions
//! - The link is swapped atomically; readers never block writers
//! - Events and deliveries carry the generation they belong to, so late
//!   events from a replaced link are dropped
//! - At most one retry timer exists; `close()` aborts it
//! - `close()` is terminal: later operations fail with `ChannelUnavailable`
//! - A retry refused by an open breaker waits out the remaining cooldown

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::BrokerError;
use super::options::BrokerSettings;
use crate::health::status::{StatusRegistry, BROKER};
use crate::observability::metrics;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::transport::tls::load_tls_material;
use crate::transport::{
    redact_url, BrokerChannel, BrokerConnection, ConnectOptions, Transport, TransportEvent,
    TransportLink,
};

/// A live connection and its single channel.
pub struct Link {
    pub generation: u64,
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
}

#[derive(Debug)]
struct LinkEvent {
    generation: u64,
    event: TransportEvent,
}

/// Owns the broker link and drives its lifecycle.
pub struct ConnectionManager {
    this: Weak<ConnectionManager>,
    transport: Arc<dyn Transport>,
    settings: BrokerSettings,
    breaker: CircuitBreaker,
    statuses: StatusRegistry,
    link: ArcSwapOption<Link>,
    generations: AtomicU64,
    is_connecting: AtomicBool,
    closed: AtomicBool,
    retry_attempt: AtomicU32,
    pending_retry: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    /// Create the manager and start its supervisor. Must run inside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: BrokerSettings,
        statuses: StatusRegistry,
    ) -> Arc<Self> {
        Self::with_breaker(transport, settings, statuses, CircuitBreaker::new())
    }

    pub(crate) fn with_breaker(
        transport: Arc<dyn Transport>,
        settings: BrokerSettings,
        statuses: StatusRegistry,
        breaker: CircuitBreaker,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            settings,
            breaker,
            statuses,
            link: ArcSwapOption::empty(),
            generations: AtomicU64::new(0),
            is_connecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            retry_attempt: AtomicU32::new(0),
            pending_retry: Mutex::new(None),
            events_tx,
        });

        tokio::spawn(supervise(Arc::downgrade(&manager), events_rx));
        manager
    }

    pub fn is_connected(&self) -> bool {
        self.link.load().is_some()
    }

    /// Set by `close()` and never cleared.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn statuses(&self) -> &StatusRegistry {
        &self.statuses
    }

    /// Retry attempts scheduled since the last successful connect.
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt.load(Ordering::SeqCst)
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn current_link(&self) -> Option<Arc<Link>> {
        self.link.load_full()
    }

    pub(crate) fn current_generation(&self) -> Option<u64> {
        self.link.load().as_ref().map(|link| link.generation)
    }

    /// Establish the link if there is none. Never fails; failures are
    /// reported through the `broker` status and schedule a retry.
    pub async fn connect(&self) {
        match self.try_connect().await {
            Ok(()) => {}
            Err(BrokerError::CircuitOpen) => {
                tracing::warn!("Connect refused: circuit breaker open");
                self.set_connected(false);
                self.reconnect();
            }
            Err(e) => {
                tracing::error!(error = %e, "Broker connection failed");
                self.set_connected(false);
                self.breaker.record_failure();
                self.reconnect();
            }
        }
    }

    async fn try_connect(&self) -> Result<(), BrokerError> {
        if self.is_closed() || self.is_connected() {
            return Ok(());
        }
        if self
            .is_connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Connect already in progress");
            return Ok(());
        }
        let _connecting = FlagGuard(&self.is_connecting);

        if !self.breaker.can_attempt() {
            return Err(BrokerError::CircuitOpen);
        }

        let tls = load_tls_material(&self.settings.tls)
            .await
            .map_err(BrokerError::Tls)?;
        let options = ConnectOptions {
            heartbeat_secs: self.settings.heartbeat_secs,
            tls,
        };

        let TransportLink { connection, events } = self
            .transport
            .connect(&self.settings.url, &options)
            .await
            .map_err(|e| BrokerError::transport("connect", e))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(error = %close_err, "Closing half-open connection failed");
                }
                return Err(BrokerError::transport("create_channel", e));
            }
        };

        if self.is_closed() {
            tracing::info!("Close requested during handshake, discarding new connection");
            close_quietly(channel.as_ref(), connection.as_ref()).await;
            return Ok(());
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.store(Some(Arc::new(Link {
            generation,
            connection,
            channel,
        })));
        self.forward_events(generation, events);

        self.retry_attempt.store(0, Ordering::SeqCst);
        self.breaker.record_success();
        self.set_connected(true);

        // close() sets the flag before taking the link, so either it took
        // this link or the flag is visible here.
        if self.is_closed() {
            if let Some(link) = self.link.swap(None) {
                tracing::info!(generation, "Closed while storing link, discarding it");
                close_quietly(link.channel.as_ref(), link.connection.as_ref()).await;
            }
            self.set_connected(false);
            return Ok(());
        }

        tracing::info!(
            url = %redact_url(&self.settings.url),
            generation,
            "Connected to broker"
        );
        Ok(())
    }

    /// Schedule one reconnection attempt unless one is already pending.
    ///
    /// The delay comes from the backoff schedule, or from the breaker's
    /// remaining cooldown while the circuit is open.
    pub fn reconnect(&self) {
        if self.is_closed() || self.is_connected() || self.is_connecting.load(Ordering::SeqCst) {
            return;
        }

        let mut pending = self.pending_retry.lock();
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Reconnect already scheduled");
            return;
        }

        let delay = match self.breaker.remaining_cooldown() {
            Some(cooldown) => {
                tracing::info!(delay = ?cooldown, "Circuit open, reconnect deferred until cooldown ends");
                cooldown
            }
            None => {
                let attempt = self.retry_attempt.fetch_add(1, Ordering::SeqCst);
                let delay = self.settings.backoff.delay(attempt);
                tracing::info!(
                    attempt = attempt + 1,
                    scheduled = self.settings.backoff.len(),
                    delay = ?delay,
                    "Reconnecting to broker"
                );
                metrics::record_reconnect_attempt();
                delay
            }
        };

        let this = self.this.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.pending_retry.lock().take();
                manager.connect().await;
            }
        }));
    }

    /// Tear down the link for good. Idempotent; never fails.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(retry) = self.pending_retry.lock().take() {
            retry.abort();
        }

        if let Some(link) = self.link.swap(None) {
            close_quietly(link.channel.as_ref(), link.connection.as_ref()).await;
            tracing::info!(generation = link.generation, "Broker connection closed");
        }
        self.set_connected(false);
    }

    fn forward_events(&self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(LinkEvent { generation, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn handle_event(&self, LinkEvent { generation, event }: LinkEvent) {
        if self.is_closed() {
            tracing::debug!(generation, ?event, "Ignoring transport event after close");
            return;
        }
        if self.current_generation() != Some(generation) {
            tracing::debug!(generation, ?event, "Ignoring event from stale connection");
            return;
        }

        match &event {
            TransportEvent::Error(reason) => {
                tracing::error!(generation, reason = %reason, "Broker connection error");
                self.breaker.record_failure();
            }
            TransportEvent::Closed => {
                tracing::warn!(generation, "Broker connection closed unexpectedly");
            }
        }

        let cleared = self.link.rcu(|current| match current {
            Some(link) if link.generation == generation => None,
            other => other.clone(),
        });
        if cleared.as_ref().map(|link| link.generation) == Some(generation) {
            self.set_connected(false);
            self.reconnect();
        }
    }

    fn set_connected(&self, connected: bool) {
        self.statuses.update_status(BROKER, connected);
        metrics::record_broker_connected(connected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(retry) = self.pending_retry.get_mut().take() {
            retry.abort();
        }
    }
}

async fn supervise(manager: Weak<ConnectionManager>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match manager.upgrade() {
            Some(manager) => manager.handle_event(event),
            None => break,
        }
    }
}

async fn close_quietly(channel: &dyn BrokerChannel, connection: &dyn BrokerConnection) {
    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "Failed to close broker channel");
    }
    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::resilience::BackoffSchedule;
    use crate::transport::{MemoryBroker, TransportError};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn settings() -> BrokerSettings {
        BrokerSettings::new(
            &BrokerConfig {
                url: "memory://test".to_string(),
                ..Default::default()
            },
            BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(1), 3),
        )
    }

    fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(broker.clone()), settings(), StatusRegistry::new())
    }

    /// Holds every handshake until `release` is notified.
    struct GatedTransport {
        broker: MemoryBroker,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn connect(
            &self,
            url: &str,
            options: &ConnectOptions,
        ) -> Result<TransportLink, TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.broker.connect(url, options).await
        }
    }

    #[tokio::test]
    async fn test_connect_sets_status_and_generation() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);

        manager.connect().await;
        assert!(manager.is_connected());
        assert!(manager.statuses().get_status(BROKER));
        assert_eq!(manager.current_generation(), Some(1));

        manager.connect().await;
        assert_eq!(broker.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_schedules_single_retry() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(1);
        let manager = manager(&broker);

        manager.connect().await;
        assert!(!manager.is_connected());
        assert!(manager.has_pending_retry());
        assert_eq!(manager.breaker().failure_count(), 1);

        manager.reconnect();
        assert_eq!(manager.retry_attempt(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.is_connected());
        assert_eq!(broker.connect_calls(), 2);
        assert_eq!(manager.retry_attempt(), 0);
        assert_eq!(manager.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;

        manager.close().await;
        manager.close().await;
        assert!(!manager.is_connected());
        assert!(manager.is_closed());
        assert!(!manager.statuses().get_status(BROKER));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);

        manager.connect().await;
        assert!(manager.has_pending_retry());
        manager.close().await;
        assert!(!manager.has_pending_retry());

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.connect_calls(), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;

        broker.emit_connection_error("heartbeat timeout");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_connected());
        assert!(!manager.statuses().get_status(BROKER));
        assert_eq!(manager.breaker().failure_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_connected());
        assert_eq!(manager.current_generation(), Some(2));
        assert_eq!(manager.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_close_reconnects_without_failure() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;

        broker.close_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_connected());
        assert_eq!(manager.breaker().failure_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_client_close_event_is_ignored() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        manager.close().await;

        tokio::task::yield_now().await;
        assert!(!manager.has_pending_retry());
        assert_eq!(manager.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_close_stands_down() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        manager.close().await;

        manager.connect().await;
        manager.reconnect();
        assert!(!manager.is_connected());
        assert!(!manager.has_pending_retry());
        assert_eq!(broker.connect_calls(), 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_during_handshake_leaves_no_link() {
        let broker = MemoryBroker::new();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let transport = GatedTransport {
            broker: broker.clone(),
            entered: entered.clone(),
            release: release.clone(),
        };
        let manager = ConnectionManager::new(Arc::new(transport), settings(), StatusRegistry::new());

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        entered.notified().await;
        manager.close().await;
        release.notify_one();
        connecting.await.unwrap();

        assert!(!manager.is_connected());
        assert!(!manager.statuses().get_status(BROKER));
        assert!(!manager.has_pending_retry());
        assert_eq!(broker.connect_calls(), 1);
        assert_eq!(broker.open_connections(), 0);
    }
}
