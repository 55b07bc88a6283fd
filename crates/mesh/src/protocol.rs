//! Wire messages exchanged between mesh nodes.
//!
//! Frames are plain serde types. The [`Codec`] seam turns them into bytes;
//! [`JsonCodec`] is what ships by default.

use crate::error::CodecError;
use crate::queue::Priority;
use canopy_core::{NodeId, Rssi};
use serde::{Deserialize, Serialize};

/// A node and everything reachable below it, as announced by a neighbour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtree {
    /// Node at the top of this branch
    pub node_id: NodeId,
    /// Set when this node is the configured mesh root
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root: bool,
    /// Branches hanging off this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<Subtree>,
}

impl Subtree {
    /// A branch consisting of a single node
    pub fn leaf(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: false,
            subs: Vec::new(),
        }
    }

    /// Whether `node_id` appears anywhere in this branch
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.node_id == node_id || self.subs.iter().any(|sub| sub.contains(node_id))
    }

    /// Number of nodes in the branch, including the top
    pub fn size(&self) -> usize {
        1 + self.subs.iter().map(Subtree::size).sum::<usize>()
    }

    /// Every node id in the branch, depth first
    pub fn node_ids(&self, include_self: bool) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.size());
        if include_self {
            out.push(self.node_id);
        }
        for sub in &self.subs {
            sub.collect_into(&mut out);
        }
        out
    }

    fn collect_into(&self, out: &mut Vec<NodeId>) {
        out.push(self.node_id);
        for sub in &self.subs {
            sub.collect_into(out);
        }
    }
}

/// Messages on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake and periodic topology announcement
    NodeSync {
        /// Announcing node
        from: NodeId,
        /// Tree as seen by the sender, minus the receiver's branch
        subtree: Subtree,
    },
    /// Application payload for one node
    Single {
        /// Originating node
        from: NodeId,
        /// Target node
        dest: NodeId,
        /// Application bytes
        payload: Vec<u8>,
    },
    /// Application payload for every node
    Broadcast {
        /// Originating node
        from: NodeId,
        /// Application bytes
        payload: Vec<u8>,
    },
    /// Payload for the internet gateway
    Gateway {
        /// Originating node
        from: NodeId,
        /// Bridge the sender picked
        dest: NodeId,
        /// Sender-assigned priority
        priority: Priority,
        /// Application bytes
        payload: Vec<u8>,
    },
    /// Bridge heartbeat; flooded when `dest` is empty
    BridgeStatus {
        /// Reporting bridge
        from: NodeId,
        /// Single recipient for a direct announcement
        #[serde(default)]
        dest: Option<NodeId>,
        /// Router reachable
        internet: bool,
        /// Router signal seen by the bridge
        rssi: Rssi,
        /// Operator-assigned bridge priority
        priority: u8,
    },
    /// Intent to stand for bridge election
    Candidacy {
        /// Candidate node
        from: NodeId,
        /// Router signal seen by the candidate
        rssi: Rssi,
        /// Candidate uptime
        uptime_ms: u64,
        /// Free heap in bytes
        free_memory: u32,
    },
    /// Election winner taking the bridge role
    Takeover {
        /// New bridge
        from: NodeId,
        /// Bridge being replaced, if any
        #[serde(default)]
        previous: Option<NodeId>,
        /// Router signal seen by the new bridge
        rssi: Rssi,
        /// Operator-assigned bridge priority
        priority: u8,
    },
}

impl Frame {
    /// Node that originated the frame
    pub fn origin(&self) -> NodeId {
        match self {
            Frame::NodeSync { from, .. }
            | Frame::Single { from, .. }
            | Frame::Broadcast { from, .. }
            | Frame::Gateway { from, .. }
            | Frame::BridgeStatus { from, .. }
            | Frame::Candidacy { from, .. }
            | Frame::Takeover { from, .. } => *from,
        }
    }

    /// Destination of a routed frame
    pub fn destination(&self) -> Option<NodeId> {
        match self {
            Frame::Single { dest, .. } | Frame::Gateway { dest, .. } => Some(*dest),
            Frame::BridgeStatus { dest, .. } => *dest,
            _ => None,
        }
    }

    /// Frames flooded along the tree rather than routed
    pub fn is_flooded(&self) -> bool {
        match self {
            Frame::Broadcast { .. } | Frame::Candidacy { .. } | Frame::Takeover { .. } => true,
            Frame::BridgeStatus { dest, .. } => dest.is_none(),
            Frame::NodeSync { .. } | Frame::Single { .. } | Frame::Gateway { .. } => false,
        }
    }
}

/// Turns frames into bytes and back.
pub trait Codec {
    /// Serialize a frame
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError>;

    /// Parse a frame; malformed input is an error, never a panic
    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError>;
}

/// JSON wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(frame).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_subtree() -> Subtree {
        // 2 -> {3 -> {5}, 4}
        Subtree {
            node_id: NodeId(2),
            root: false,
            subs: vec![
                Subtree {
                    node_id: NodeId(3),
                    root: false,
                    subs: vec![Subtree::leaf(NodeId(5))],
                },
                Subtree::leaf(NodeId(4)),
            ],
        }
    }

    #[test]
    fn test_subtree_queries() {
        let tree = create_test_subtree();
        assert_eq!(tree.size(), 4);
        assert!(tree.contains(NodeId(5)));
        assert!(!tree.contains(NodeId(9)));
        assert_eq!(
            tree.node_ids(false),
            vec![NodeId(3), NodeId(5), NodeId(4)]
        );
        assert_eq!(tree.node_ids(true)[0], NodeId(2));
    }

    #[test]
    fn test_node_sync_wire_shape() {
        let codec = JsonCodec;
        let frame = Frame::NodeSync {
            from: NodeId(2),
            subtree: create_test_subtree(),
        };
        let bytes = codec.encode(&frame).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""type":"node_sync""#));
        assert_eq!(codec.decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_malformed_input_is_decode_error() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.decode(b"{not json"),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(
            codec.decode(br#"{"type":"warp_drive","from":1}"#),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_flooding_classification() {
        let status = Frame::BridgeStatus {
            from: NodeId(1),
            dest: None,
            internet: true,
            rssi: -60,
            priority: 5,
        };
        assert!(status.is_flooded());
        assert_eq!(status.destination(), None);

        let direct = Frame::BridgeStatus {
            from: NodeId(1),
            dest: Some(NodeId(7)),
            internet: true,
            rssi: -60,
            priority: 5,
        };
        assert!(!direct.is_flooded());
        assert_eq!(direct.destination(), Some(NodeId(7)));
        assert_eq!(direct.origin(), NodeId(1));
    }
}
