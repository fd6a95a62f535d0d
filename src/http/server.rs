//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with health and queue handlers
//! - Wire up middleware (request ID, tracing, timeout, body limit, metrics)
//! - Serve plain TCP or TLS until shutdown is signalled

use std::net::SocketAddr;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::{health, queue, request, tls};
use crate::broker::BrokerClient;
use crate::config::ServerConfig;
use crate::health::status::StatusRegistry;
use crate::lifecycle::Shutdown;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerClient,
    pub statuses: StatusRegistry,
}

/// HTTP facade over the broker client.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
}

impl HttpServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        let router = build_router(&config, state);
        Self { router, config }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS using the configured certificate until `shutdown` fires.
    pub async fn run_tls(self, addr: SocketAddr, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let tls_config = match &self.config.tls {
            Some(tls) => tls.clone(),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "TLS listener requested without server.tls",
                ))
            }
        };
        let rustls = tls::load_tls_config(&tls_config).await?;
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        let grace = Duration::from_secs(self.config.request_timeout_secs);
        tokio::spawn(async move {
            shutdown.wait().await;
            drain.graceful_shutdown(Some(grace));
        });

        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(config: &ServerConfig, state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::status))
        .route("/healthz/ready", get(health::ready))
        .route("/healthz/live", get(health::live))
        .route("/api/v1/publish", post(queue::publish))
        .route("/api/v1/exchanges", post(queue::create_exchange))
        .route("/api/v1/queues", get(queue::list_queues).post(queue::create_queue))
        .route("/api/v1/bindings", post(queue::bind_queue))
        .with_state(state)
        .layer(middleware::from_fn(request::track_requests))
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(PropagateRequestIdLayer::new(request::X_REQUEST_ID))
        .layer(TraceLayer::new_for_http().make_span_with(request::make_span))
        .layer(SetRequestIdLayer::new(request::X_REQUEST_ID, MakeRequestUuid))
}
