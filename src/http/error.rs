//! Mapping from broker errors to HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::broker::BrokerError;

/// Error returned by API handlers; rendered as `{success: false, error}`.
#[derive(Debug)]
pub enum ApiError {
    Broker(BrokerError),
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Broker(e) => match e {
                BrokerError::CircuitOpen | BrokerError::ChannelUnavailable => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                BrokerError::Transport { .. }
                | BrokerError::BackpressureTimeout(_)
                | BrokerError::BackpressureExhausted(_)
                | BrokerError::Tls(_) => StatusCode::BAD_GATEWAY,
                BrokerError::Serialization(_) => StatusCode::BAD_REQUEST,
                BrokerError::HandlerFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError::Broker(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Broker(e) => write!(f, "{}", e),
            ApiError::BadRequest(msg) => f.write_str(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "API request failed");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}
