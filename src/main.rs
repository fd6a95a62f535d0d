//! Queue gateway
//!
//! HTTP facade over a resilient broker client.
//!
//! # Architecture Overview
//!
//! ```text
//!     HTTP request ──▶ http (axum) ──▶ broker::BrokerClient ──▶ guard ──▶ transport ──▶ Broker
//!                                            │
//!                                            ├── resilience (circuit breaker, backoff)
//!                                            └── health::StatusRegistry ◀── connection events
//!
//!     config ─▶ observability ─▶ lifecycle::startup (connect, topology, serve, close)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use queue_gateway::config::load_config;
use queue_gateway::lifecycle::startup;
use queue_gateway::observability::logging;

#[derive(Parser)]
#[command(name = "queue-gateway", version)]
#[command(about = "HTTP gateway for a resilient message broker client", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.server.bind_address,
        "queue-gateway starting"
    );

    match startup::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Gateway failed");
            ExitCode::FAILURE
        }
    }
}
