//! Queue management API under `/api/v1`.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::error::ApiError;
use super::server::AppState;
use crate::broker::{PublishOptions, QueueOptions};
use crate::transport::{ExchangeKind, ExchangeOptions};

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub exchange: String,
    #[serde(alias = "routingKey")]
    pub routing_key: String,
    /// Required; `null` is a valid message, an absent field is not.
    #[serde(default, deserialize_with = "present")]
    pub message: Option<Value>,
    #[serde(default)]
    pub options: PublishOptions,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub options: ExchangeOptions,
}

#[derive(Debug, Deserialize)]
pub struct QueueRequest {
    pub name: String,
    #[serde(default)]
    pub options: QueueOptions,
}

#[derive(Debug, Deserialize)]
pub struct BindingRequest {
    pub queue: String,
    pub exchange: String,
    #[serde(alias = "routingKey")]
    pub routing_key: String,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// `POST /api/v1/publish`
pub async fn publish(
    State(state): State<AppState>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let message = request
        .message
        .ok_or_else(|| ApiError::BadRequest("message is required".to_string()))?;

    state
        .broker
        .publish(&request.exchange, &request.routing_key, &message, &request.options)
        .await?;

    Ok(Json(json!({ "success": true, "message": "Message published" })))
}

/// `POST /api/v1/exchanges`
pub async fn create_exchange(
    State(state): State<AppState>,
    body: Result<Json<ExchangeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    state
        .broker
        .create_exchange(&request.name, request.kind, &request.options)
        .await?;

    Ok(Json(json!({ "success": true, "exchange": request.name })))
}

/// `POST /api/v1/queues`
pub async fn create_queue(
    State(state): State<AppState>,
    body: Result<Json<QueueRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let queue = state
        .broker
        .create_queue(&request.name, &request.options)
        .await?;

    Ok(Json(json!({ "success": true, "queue": queue })))
}

/// `POST /api/v1/bindings`
pub async fn bind_queue(
    State(state): State<AppState>,
    body: Result<Json<BindingRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    state
        .broker
        .bind_queue(&request.queue, &request.exchange, &request.routing_key)
        .await?;

    Ok(Json(json!({ "success": true, "message": "Binding created" })))
}

/// `GET /api/v1/queues`
pub async fn list_queues() -> Json<Value> {
    Json(json!({
        "success": false,
        "message": "Listing queues is not supported; use the broker management API"
    }))
}
