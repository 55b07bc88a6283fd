//! Configuration management for canopy.
//!
//! One structure covers every way a node can be brought up: plain mesh node,
//! node with router credentials (eligible for bridge election), or fixed root.

use crate::error::ConfigError;
#[cfg(feature = "toml")]
use crate::error::{CoreError, CoreResult};
use crate::types::{NodeId, Rssi};
use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;

/// Lowest accepted value for the isolated-bridge signal threshold.
pub const MIN_BRIDGE_RSSI_FLOOR: Rssi = -100;
/// Highest accepted value for the isolated-bridge signal threshold.
pub const MIN_BRIDGE_RSSI_CEILING: Rssi = -30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node_id: NodeId,
    pub mesh_id: String,
    pub mesh_secret: String,
    pub port: u16,
    pub mode: WifiMode,
    /// Radio channel, 0 = auto-detect by scanning for `mesh_id`
    pub channel: u8,
    pub hidden: bool,
    pub max_connections: usize,
    pub router: Option<RouterCredentials>,
    /// This node is the fixed root of the topology tree
    pub root: bool,
    /// This node expects a root to be present somewhere in the mesh
    pub contains_root: bool,
    pub log_level: String,
    pub connection: ConnectionConfig,
    pub election: ElectionConfig,
    pub bridge: BridgeConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiMode {
    Ap,
    Sta,
    ApSta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCredentials {
    pub ssid: String,
    pub password: String,
    /// 0 = use whatever channel the scan reports
    #[serde(default)]
    pub channel: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Safety delay between close and releasing the transport handle
    pub cleanup_delay_ms: u64,
    /// Minimum spacing between two deferred releases
    pub cleanup_spacing_ms: u64,
    pub sync_interval_ms: u64,
    pub node_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub enabled: bool,
    pub startup_delay_ms: u64,
    pub random_delay_min_ms: u64,
    pub random_delay_max_ms: u64,
    pub window_ms: u64,
    pub minimum_bridge_rssi: Rssi,
    pub check_interval_ms: u64,
    pub role_change_cooldown_ms: u64,
    /// Stabilization delay before announcing the bridge to a new peer
    pub announce_delay_ms: u64,
    pub history_len: usize,
    pub rng_seed: Option<u64>,
}

/// Policy used by `recommended_bridge` when more than one bridge is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeSelectionStrategy {
    /// Highest operator-assigned priority
    #[default]
    PriorityBased,
    /// Best router signal strength reported by the bridge
    BestSignal,
    /// Fewest hops from this node
    Nearest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub priority: u8,
    pub multi_bridge: bool,
    pub strategy: BridgeSelectionStrategy,
    pub status_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_known_bridges: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_age_ms: Option<u64>,
    /// Flush attempts before an undeliverable entry is dropped
    pub max_attempts: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            mesh_id: "canopy".to_string(),
            mesh_secret: String::new(),
            port: 5555,
            mode: WifiMode::ApSta,
            channel: 1,
            hidden: false,
            max_connections: 4,
            router: None,
            root: false,
            contains_root: false,
            log_level: "info".to_string(),
            connection: ConnectionConfig::default(),
            election: ElectionConfig::default(),
            bridge: BridgeConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 8000,
            cleanup_delay_ms: 1000,
            cleanup_spacing_ms: 250,
            sync_interval_ms: 10_000,
            node_timeout_ms: 30_000,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay_ms: 60_000,
            random_delay_min_ms: 1000,
            random_delay_max_ms: 3000,
            window_ms: 5000,
            minimum_bridge_rssi: -80,
            check_interval_ms: 30_000,
            role_change_cooldown_ms: 60_000,
            announce_delay_ms: 500,
            history_len: 10,
            rng_seed: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            priority: 5,
            multi_bridge: false,
            strategy: BridgeSelectionStrategy::PriorityBased,
            status_interval_ms: 30_000,
            timeout_ms: 60_000,
            max_known_bridges: 20,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            max_age_ms: None,
            max_attempts: 3,
        }
    }
}

impl MeshConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(node_id = %config.node_id, mesh_id = %config.mesh_id, "Loaded mesh configuration");
        Ok(config)
    }

    /// Parse and validate TOML configuration text.
    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: MeshConfig =
            toml::from_str(content).map_err(|e| CoreError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Config for a plain mesh node with the given identity.
    pub fn for_node(node_id: NodeId, mesh_id: &str) -> Self {
        Self {
            node_id,
            mesh_id: mesh_id.to_string(),
            ..Self::default()
        }
    }

    /// Whether this node may stand for bridge election.
    pub fn can_become_bridge(&self) -> bool {
        self.election.enabled && self.router.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_id.is_empty() {
            return Err(ConfigError::EmptyMeshId);
        }
        if self.node_id.get() == 0 {
            return Err(ConfigError::ReservedNodeId);
        }
        if self.channel > 13 {
            return Err(ConfigError::Channel(self.channel));
        }
        if self.election.random_delay_min_ms > self.election.random_delay_max_ms {
            return Err(ConfigError::InvertedDelayRange {
                min_ms: self.election.random_delay_min_ms,
                max_ms: self.election.random_delay_max_ms,
            });
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Retry("max_attempts must be at least 1".to_string()));
        }
        if self.connection.initial_retry_delay_ms > self.connection.max_retry_delay_ms {
            return Err(ConfigError::Retry(format!(
                "initial delay {}ms exceeds cap {}ms",
                self.connection.initial_retry_delay_ms, self.connection.max_retry_delay_ms
            )));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Retry("queue max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Clamp an isolated-bridge threshold into the accepted range.
pub fn clamp_bridge_rssi(value: Rssi) -> Rssi {
    value.clamp(MIN_BRIDGE_RSSI_FLOOR, MIN_BRIDGE_RSSI_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.max_attempts, 6);
        assert_eq!(config.election.startup_delay_ms, 60_000);
        assert_eq!(config.election.minimum_bridge_rssi, -80);
        assert!(!config.can_become_bridge());
    }

    #[test]
    fn test_inverted_jitter_rejected() {
        let mut config = MeshConfig::default();
        config.election.random_delay_min_ms = 5000;
        config.election.random_delay_max_ms = 1000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvertedDelayRange {
                min_ms: 5000,
                max_ms: 1000
            })
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = MeshConfig::default();
        config.queue.capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroQueueCapacity));

        let mut config = MeshConfig::default();
        assert_eq!(config.queue.max_attempts, 3);
        config.queue.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Retry(_))));
    }

    #[test]
    fn test_clamp_bridge_rssi() {
        assert_eq!(clamp_bridge_rssi(-120), -100);
        assert_eq!(clamp_bridge_rssi(-10), -30);
        assert_eq!(clamp_bridge_rssi(-75), -75);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig = serde_json::from_str(
            r#"{"node_id": 42, "mesh_id": "field", "router": {"ssid": "hq", "password": "pw"}}"#,
        )
        .unwrap();
        assert_eq!(config.node_id, NodeId(42));
        assert_eq!(config.port, 5555);
        assert!(config.can_become_bridge());
        assert_eq!(config.router.unwrap().channel, 0);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_from_toml_str_errors() {
        assert!(matches!(
            MeshConfig::from_toml_str("node_id = \"seven\""),
            Err(CoreError::Parse(_))
        ));
        assert!(matches!(
            MeshConfig::from_toml_str("mesh_id = \"\""),
            Err(CoreError::Config(ConfigError::EmptyMeshId))
        ));
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join("canopy_config_test.toml");
        std::fs::write(
            &path,
            r#"
node_id = 7
mesh_id = "orchard"
channel = 0

[election]
startup_delay_ms = 1000

[bridge]
strategy = "best_signal"
"#,
        )
        .unwrap();

        let config = MeshConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id, NodeId(7));
        assert_eq!(config.channel, 0);
        assert_eq!(config.election.startup_delay_ms, 1000);
        assert_eq!(config.bridge.strategy, BridgeSelectionStrategy::BestSignal);

        let _ = std::fs::remove_file(&path);
    }
}
