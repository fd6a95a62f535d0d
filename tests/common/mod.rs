//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use queue_gateway::broker::{BrokerClient, BrokerSettings, PublishPolicy};
use queue_gateway::config::BrokerConfig;
use queue_gateway::health::StatusRegistry;
use queue_gateway::resilience::BackoffSchedule;
use queue_gateway::transport::MemoryBroker;

/// Backoff used by every fixture: 100ms doubling to 1s over 3 scheduled attempts.
pub fn backoff() -> BackoffSchedule {
    BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(1), 3)
}

/// Client wired to `broker` with a fresh status registry.
pub fn client(broker: &MemoryBroker) -> BrokerClient {
    client_with_policy(broker, PublishPolicy::default())
}

pub fn client_with_policy(broker: &MemoryBroker, policy: PublishPolicy) -> BrokerClient {
    let settings = BrokerSettings::new(
        &BrokerConfig {
            url: "memory://test".to_string(),
            ..Default::default()
        },
        backoff(),
    );
    BrokerClient::new(
        Arc::new(broker.clone()),
        settings,
        policy,
        StatusRegistry::new(),
    )
}

/// Poll `check` until it holds, failing the test after about a second.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
