//! Connection health reporting.
//!
//! # Data Flow
//! ```text
//! ConnectionManager
//!     → StatusRegistry::update_status("broker", bool)
//!         → listeners (called on change, in registration order)
//!         → /healthz, /healthz/ready (read on request)
//! ```
//!
//! # Design Decisions
//! - The registry is constructed once and handed to both sides; no global
//! - Unknown keys read as `false`

pub mod status;

pub use status::{StatusRegistry, BROKER};
