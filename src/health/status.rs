//! Shared connection status registry.
//!
//! The broker core writes statuses, health endpoints read them. Listeners
//! registered for a key are called once immediately with the current value
//! and then on every change, in registration order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;

/// Status key published by the broker connection.
pub const BROKER: &str = "broker";

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Registry {
    statuses: DashMap<String, bool>,
    listeners: DashMap<String, Vec<Listener>>,
}

/// Cloneable handle to a shared boolean status registry.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<Registry>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `key`; unknown keys read as `false`.
    pub fn get_status(&self, key: &str) -> bool {
        self.inner.statuses.get(key).map(|v| *v).unwrap_or(false)
    }

    /// Store a status and notify listeners if the value changed.
    pub fn update_status(&self, key: &str, status: bool) {
        let previous = self.inner.statuses.insert(key.to_string(), status);
        if previous == Some(status) {
            return;
        }

        tracing::debug!(key, status, "Status updated");

        // Clone out of the map so listeners may touch the registry.
        let listeners = self
            .inner
            .listeners
            .get(key)
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            notify(key, &listener, status);
        }
    }

    /// Register a listener and call it with the current value.
    pub fn add_listener<F>(&self, key: &str, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner
            .listeners
            .entry(key.to_string())
            .or_default()
            .push(listener.clone());

        notify(key, &listener, self.get_status(key));
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.inner.listeners.get(key).map(|l| l.len()).unwrap_or(0)
    }
}

fn notify(key: &str, listener: &Listener, status: bool) {
    if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
        tracing::error!(key, status, "Status listener panicked");
    }
}

impl std::fmt::Debug for StatusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRegistry")
            .field("keys", &self.inner.statuses.len())
            .finish()
    }
}
