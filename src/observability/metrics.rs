//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_broker_connected` (gauge): 1 while a broker link is up
//! - `gateway_circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `gateway_reconnect_attempts_total` (counter): scheduled reconnects
//! - `gateway_messages_published_total` (counter): by exchange
//! - `gateway_publish_backpressure_total` (counter): backpressure reports seen by publish
//! - `gateway_messages_consumed_total` (counter): by queue, outcome (ack, nack, skipped)
//! - `gateway_message_processing_seconds` (histogram): handler latency by queue
//! - `gateway_http_requests_total` (counter): by route, status

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_broker_connected(connected: bool) {
    metrics::gauge!("gateway_broker_connected").set(if connected { 1.0 } else { 0.0 });
}

pub fn record_circuit_state(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("gateway_circuit_state").set(value);
}

pub fn record_reconnect_attempt() {
    metrics::counter!("gateway_reconnect_attempts_total").increment(1);
}

pub fn record_published(exchange: &str) {
    metrics::counter!("gateway_messages_published_total", "exchange" => exchange.to_string())
        .increment(1);
}

pub fn record_backpressure() {
    metrics::counter!("gateway_publish_backpressure_total").increment(1);
}

pub fn record_consumed(queue: &str, outcome: &'static str) {
    metrics::counter!(
        "gateway_messages_consumed_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_processing_time(queue: &str, elapsed: Duration) {
    metrics::histogram!("gateway_message_processing_seconds", "queue" => queue.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_http_request(route: &str, status: u16) {
    metrics::counter!(
        "gateway_http_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
