//! Liveness, readiness and status endpoints.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::server::AppState;
use crate::health::status::BROKER;

/// `GET /healthz`
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connected = state.statuses.get_status(BROKER);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(json!({
        "status": "ok",
        "timestamp": timestamp,
        "broker": if connected { "connected" } else { "disconnected" },
        "circuit": state.broker.circuit_state().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /healthz/ready`
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.statuses.get_status(BROKER) {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": "broker_disconnected" })),
        )
            .into_response()
    }
}

/// `GET /healthz/live`
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}
