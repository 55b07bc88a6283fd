//! Notifications surfaced to the application layer.

use crate::election::RejectionReason;
use crate::queue::{Priority, QueueState};
use canopy_core::NodeId;
use serde::{Deserialize, Serialize};

/// Why a connection was reported as dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Retry budget used up without reaching the peer
    RetriesExhausted,
    /// Link closed by either side
    Closed,
    /// Nothing heard from the peer within the node timeout
    TimedOut,
}

/// Events drained by the application with `MeshEngine::drain_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A neighbour completed the handshake
    NewConnection(NodeId),
    /// A connection is gone for good. `node_id` is empty when the link
    /// never completed a handshake.
    DroppedConnection {
        /// Peer, when known
        node_id: Option<NodeId>,
        /// Why the link went away
        reason: DropReason,
    },
    /// The tree view changed; routes were recomputed
    TopologyChanged,
    /// A bridge reported a change in internet reachability
    BridgeStatusChanged {
        /// Reporting bridge
        bridge: NodeId,
        /// Whether it can reach the router
        has_internet: bool,
    },
    /// Application payload addressed to this node
    Receive {
        /// Sender
        from: NodeId,
        /// Application bytes
        payload: Vec<u8>,
    },
    /// Gateway-bound payload arrived at this node while it is the bridge
    Uplink {
        /// Originating node
        from: NodeId,
        /// Priority the sender assigned
        priority: Priority,
        /// Application bytes
        payload: Vec<u8>,
    },
    /// This node took or gave up the bridge role
    BridgeRoleChanged {
        /// Role after the change
        is_bridge: bool,
        /// Human-readable cause
        reason: String,
    },
    /// An election round ended without a winner
    ElectionRejected {
        /// Why no candidate qualified
        reason: RejectionReason,
    },
    /// A queued message was evicted or pruned
    MessageDropped {
        /// Id returned at enqueue
        id: u64,
        /// Priority of the dropped entry
        priority: Priority,
    },
    /// Offline queue crossed a fill threshold
    QueueStateChanged {
        /// New fill level
        state: QueueState,
        /// Entries queued at the transition
        len: usize,
    },
}
