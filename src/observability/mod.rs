//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! broker core, HTTP layer
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or the configured level)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Metric calls are no-ops until an exporter is installed, so tests need no setup
//! - Request ID flows through the HTTP trace span

pub mod logging;
pub mod metrics;
