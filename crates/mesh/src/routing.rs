//! Hop-count routing derived from the topology tree.
//!
//! The table is recomputed in full by a breadth-first walk from this node
//! whenever the tree changes. Each destination records the neighbour the
//! walk left through (`next_hop`) and the node it was reached from
//! (`previous_hop`).

use crate::topology::TopologyTree;
use canopy_core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Route entry in the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node ID
    pub destination: NodeId,
    /// Direct neighbour to hand the frame to
    pub next_hop: NodeId,
    /// Node one hop before the destination on the path
    pub previous_hop: NodeId,
    /// Number of links between this node and the destination
    pub hop_count: u32,
}

/// Routing table rebuilt from the topology view
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Local node ID
    node_id: NodeId,
    /// Routes: destination -> RouteEntry
    routes: BTreeMap<NodeId, RouteEntry>,
}

impl RoutingTable {
    /// Create an empty routing table
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            routes: BTreeMap::new(),
        }
    }

    /// Replace every route with a fresh BFS over `tree`.
    ///
    /// Deterministic: children are visited in id order, so an unchanged
    /// tree always yields the same table. Returns whether anything changed.
    pub fn recompute(&mut self, tree: &TopologyTree) -> bool {
        let mut routes = BTreeMap::new();
        let mut frontier = VecDeque::new();

        for neighbor in self.children_of(tree, self.node_id) {
            routes.insert(
                neighbor,
                RouteEntry {
                    destination: neighbor,
                    next_hop: neighbor,
                    previous_hop: self.node_id,
                    hop_count: 1,
                },
            );
            frontier.push_back(neighbor);
        }

        while let Some(current) = frontier.pop_front() {
            let Some((next_hop, hop_count)) = routes
                .get(&current)
                .map(|r: &RouteEntry| (r.next_hop, r.hop_count))
            else {
                continue;
            };
            for child in self.children_of(tree, current) {
                if child == self.node_id || routes.contains_key(&child) {
                    continue;
                }
                routes.insert(
                    child,
                    RouteEntry {
                        destination: child,
                        next_hop,
                        previous_hop: current,
                        hop_count: hop_count + 1,
                    },
                );
                frontier.push_back(child);
            }
        }

        let changed = routes != self.routes;
        if changed {
            debug!(node_id = %self.node_id, routes = routes.len(), "Routing table recomputed");
        }
        self.routes = routes;
        changed
    }

    fn children_of(&self, tree: &TopologyTree, node: NodeId) -> Vec<NodeId> {
        tree.get(node)
            .map(|n| n.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Find the next hop for a destination
    pub fn find_next_hop(&self, destination: NodeId) -> Option<NodeId> {
        self.routes.get(&destination).map(|route| route.next_hop)
    }

    /// Hops to `destination`; zero for this node, `None` if unreachable
    pub fn hop_count(&self, destination: NodeId) -> Option<u32> {
        if destination == self.node_id {
            return Some(0);
        }
        self.routes.get(&destination).map(|route| route.hop_count)
    }

    /// Route to `destination`
    pub fn get(&self, destination: NodeId) -> Option<&RouteEntry> {
        self.routes.get(&destination)
    }

    /// Get all routes, ordered by destination
    pub fn routes(&self) -> Vec<&RouteEntry> {
        self.routes.values().collect()
    }

    /// Check if a node is a direct neighbor
    pub fn is_neighbor(&self, node_id: NodeId) -> bool {
        self.routes
            .get(&node_id)
            .map(|route| route.hop_count == 1)
            .unwrap_or(false)
    }

    /// Whether `destination` can currently be reached
    pub fn is_reachable(&self, destination: NodeId) -> bool {
        destination == self.node_id || self.routes.contains_key(&destination)
    }

    /// Number of reachable destinations, self excluded
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// No destinations known
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
