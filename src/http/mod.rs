//! HTTP facade over the broker client.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (request ID, span, request metrics)
//!     → health.rs (/healthz, reads StatusRegistry)
//!     → queue.rs (/api/v1, calls BrokerClient)
//!     → error.rs (BrokerError → status code + JSON body)
//! ```

pub mod error;
pub mod health;
pub mod queue;
pub mod request;
pub mod server;
pub mod tls;

pub use error::ApiError;
pub use request::X_REQUEST_ID;
pub use server::{build_router, AppState, HttpServer};
