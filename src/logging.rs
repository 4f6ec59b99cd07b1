//! Tracing initialization for embedders.
//!
//! The engine logs through `tracing`; nothing appears until a
//! subscriber is installed. Call one of these once at startup, before
//! creating the [`crate::server::Server`]. The per-request audit
//! lines use the `access` target, so they can be filtered or routed
//! separately:
//!
//! ```bash
//! RUST_LOG=info,access=info vitals-agent
//! RUST_LOG=warn,access=off vitals-agent   # silence the access log
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults. The level is controlled
/// by `RUST_LOG`, falling back to `info`.
///
/// # Panics
///
/// Panics when called twice: only one global subscriber can exist.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging at a specific level, ignoring `RUST_LOG` unless
/// it is set.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
