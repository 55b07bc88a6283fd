//! Core error types

use thiserror::Error;

/// Core error type for canopy
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected by validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons a [`crate::config::MeshConfig`] fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Mesh identifier must not be empty
    #[error("mesh_id must not be empty")]
    EmptyMeshId,

    /// Node identifier zero is reserved for "no node"
    #[error("node_id 0 is reserved")]
    ReservedNodeId,

    /// Jitter range is inverted
    #[error("random delay range inverted: min {min_ms}ms > max {max_ms}ms")]
    InvertedDelayRange { min_ms: u64, max_ms: u64 },

    /// Retry schedule is unusable
    #[error("connection retry settings invalid: {0}")]
    Retry(String),

    /// Offline queue capacity must be positive
    #[error("queue capacity must be greater than zero")]
    ZeroQueueCapacity,

    /// Radio channel out of range
    #[error("channel {0} outside 0..=13")]
    Channel(u8),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
