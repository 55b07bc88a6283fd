//! Structured logging infrastructure for canopy.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use crate::config::MeshConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use canopy_core::logging;
///
/// logging::init();
/// tracing::info!("Mesh node started");
/// ```
pub fn init() {
    init_with_level("info");
}

/// Initialize human-readable logging, falling back to `level` when
/// `RUST_LOG` is unset. Used with [`crate::config::MeshConfig::log_level`].
pub fn init_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize human-readable logging at the level a node is configured with
pub fn init_for(config: &MeshConfig) {
    init_with_level(&config.log_level);
}

/// Initialize the logging system with JSON output for log collectors.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use canopy_core::logging;
///
/// logging::init_json();
/// tracing::info!(node_id = 42, "Mesh node started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
