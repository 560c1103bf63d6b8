//! Shared utilities for Tidal: signaling protocol, logging, error types.
//!
//! This crate provides common infrastructure used across all Tidal components.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod log;
pub mod protocol;

pub use error::{Error, Result};
pub use log::{LogEvent, Severity};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
