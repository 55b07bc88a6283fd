//! Core types shared by every canopy crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric identifier of a physical node, unique within a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Raw numeric value
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Derive a node id from the last four bytes of a hardware address,
    /// big endian.
    pub fn from_hw_addr(mac: [u8; 6]) -> Self {
        NodeId(u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

/// Milliseconds on the engine clock (monotonic, starts at scheduler creation).
pub type Millis = u64;

/// Received signal strength in dBm.
pub type Rssi = i8;

/// Weakest signal strength a radio can report.
pub const RSSI_FLOOR: Rssi = -127;
