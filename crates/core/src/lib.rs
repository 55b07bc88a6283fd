//! Core functionality for the canopy mesh networking stack.
//!
//! This crate provides the configuration, logging, error and identifier
//! types used across the canopy workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    BridgeConfig, BridgeSelectionStrategy, ConnectionConfig, ElectionConfig, MeshConfig,
    QueueConfig, RouterCredentials, WifiMode,
};
pub use error::{ConfigError, CoreError, CoreResult};
pub use types::{Millis, NodeId, Rssi, RSSI_FLOOR};
