//! Canopy Mesh - self-organizing mesh coordination for constrained nodes
//!
//! Keeps a tree-shaped mesh of radio nodes connected and routable, elects a
//! single internet bridge, and holds uplink traffic while no bridge is
//! reachable.
//!
//! # Core Components
//!
//! - **Connections**: link lifecycle with exponential-backoff reconnects and
//!   deferred, spaced teardown
//! - **Topology**: spanning-tree view rebuilt from neighbour announcements
//! - **Routing**: hop-count routes derived from the tree
//! - **Election**: distributed bridge election with split-brain resolution
//! - **Offline Queue**: priority-tiered store-and-forward for gateway traffic
//!
//! # Design Principles
//!
//! 1. **Single-threaded**: every entry point runs to completion on one thread;
//!    deferred work goes through a [`Scheduler`]
//! 2. **Explicit context**: all state lives in one [`MeshEngine`] value
//! 3. **Never tear down under a callback**: closes are recorded immediately,
//!    handles are released later
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use canopy_core::{MeshConfig, NodeId};
//! use canopy_mesh::{ManualScheduler, MeshEngine, NoRadio, Priority};
//! # use canopy_mesh::{LinkHandle, Transport, TransportError};
//! # struct Tcp;
//! # impl Transport for Tcp {
//! #     fn connect(&mut self, _: &str) -> Result<LinkHandle, TransportError> { Ok(LinkHandle(1)) }
//! #     fn send(&mut self, _: LinkHandle, _: &[u8]) -> Result<(), TransportError> { Ok(()) }
//! #     fn close(&mut self, _: LinkHandle) {}
//! #     fn release(&mut self, _: LinkHandle) {}
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::for_node(NodeId(7), "orchard");
//! let mut mesh = MeshEngine::init(config, Tcp, ManualScheduler::new(), NoRadio)?;
//!
//! mesh.dial("10.0.0.2:5555")?;
//! mesh.send_to_gateway(b"temp=21".to_vec(), Priority::Normal)?;
//!
//! let status = mesh.status();
//! println!("bridge: {:?}, queued: {}", status.bridge, status.queue_len);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod connection;
pub mod election;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod topology;
pub mod transport;

// Re-export main types
pub use connection::{retry_delay, ConnId, Connection, ConnectionManager, Direction, LinkState};
pub use election::{
    decide_winner, BridgeElection, BridgeInfo, BridgeRole, CandidateInfo, ElectionOutcome,
    ElectionRecord, RejectionReason,
};
pub use engine::{GatewaySend, MeshEngine, MeshStatus};
pub use error::{CodecError, MeshError, MeshResult, QueueError, RadioError, TransportError};
pub use events::{DropReason, MeshEvent};
pub use protocol::{Codec, Frame, JsonCodec, Subtree};
pub use queue::{DeliveryScope, MessageQueue, Priority, QueueState, QueuedMessage};
pub use routing::{RouteEntry, RoutingTable};
pub use scheduler::{ManualScheduler, Scheduler, Task, TaskHandle};
pub use topology::TopologyTree;
pub use transport::{LinkHandle, NoRadio, Radio, ScanRecord, Transport};
