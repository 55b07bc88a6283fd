//! Spanning-tree view of the mesh.
//!
//! The view is a flat registry keyed by [`NodeId`] with parent and child
//! links stored as ids. It is rebuilt from this node plus the latest
//! subtree announced by every direct neighbour. Neighbours are grafted in
//! id order and a node that is already present is skipped, so each node
//! ends up with exactly one parent and the view never contains a cycle.
//!
//! The real links can still form a loop when two segments join over two
//! links at once. [`TopologyTree::loop_through`] spots that from a
//! neighbour's announcement and [`link_to_cut`] names the one link every
//! node on the loop agrees to drop.

use crate::protocol::Subtree;
use canopy_core::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// One node of the local tree view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Node one step closer to this node's view origin; `None` for self
    pub parent: Option<NodeId>,
    /// Nodes hanging directly below
    pub children: BTreeSet<NodeId>,
    /// Configured mesh root
    pub root: bool,
}

/// Local topology tree
#[derive(Debug, Clone)]
pub struct TopologyTree {
    node_id: NodeId,
    is_root: bool,
    /// Latest announcement per direct neighbour
    neighbors: BTreeMap<NodeId, Subtree>,
    nodes: BTreeMap<NodeId, TreeNode>,
}

impl TopologyTree {
    /// A view containing only this node
    pub fn new(node_id: NodeId, is_root: bool) -> Self {
        let mut tree = Self {
            node_id,
            is_root,
            neighbors: BTreeMap::new(),
            nodes: BTreeMap::new(),
        };
        tree.rebuild();
        tree
    }

    /// Identity of the local node
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Store a neighbour's announcement. Returns whether the view changed.
    pub fn update_neighbor(&mut self, subtree: Subtree) -> bool {
        let neighbor = subtree.node_id;
        if neighbor == self.node_id {
            warn!(node_id = %neighbor, "Ignoring announcement carrying our own id");
            return false;
        }
        if self.neighbors.get(&neighbor) == Some(&subtree) {
            return false;
        }
        debug!(neighbor = %neighbor, size = subtree.size(), "Neighbour subtree updated");
        self.neighbors.insert(neighbor, subtree);
        self.rebuild_if_changed()
    }

    /// Forget a neighbour and everything reached through it
    pub fn remove_neighbor(&mut self, neighbor: NodeId) -> bool {
        if self.neighbors.remove(&neighbor).is_none() {
            return false;
        }
        debug!(neighbor = %neighbor, "Neighbour removed from topology");
        self.rebuild_if_changed()
    }

    /// Loop implied by `announced`: this node, the path from the announcing
    /// neighbour down to the first node that is this node or another direct
    /// neighbour, and back to this node. `None` when the announcement hangs
    /// off the tree cleanly.
    pub fn loop_through(&self, announced: &Subtree) -> Option<Vec<NodeId>> {
        let mut path = vec![self.node_id];
        if !self.find_closing(announced, announced.node_id, &mut path) {
            return None;
        }
        if path.last() != Some(&self.node_id) {
            path.push(self.node_id);
        }
        Some(path)
    }

    fn find_closing(&self, sub: &Subtree, via: NodeId, path: &mut Vec<NodeId>) -> bool {
        path.push(sub.node_id);
        let closes = sub.node_id == self.node_id
            || (sub.node_id != via && self.neighbors.contains_key(&sub.node_id));
        if closes || sub.subs.iter().any(|c| self.find_closing(c, via, path)) {
            return true;
        }
        path.pop();
        false
    }

    /// Whether `node` is a direct neighbour
    pub fn has_neighbor(&self, node: NodeId) -> bool {
        self.neighbors.contains_key(&node)
    }

    /// Direct neighbours in id order
    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.keys().copied()
    }

    /// Whether `node` is anywhere in the view (self included)
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Registry entry for `node`
    pub fn get(&self, node: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&node)
    }

    /// Parent of `node` in the view
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    /// Number of nodes in the view, self included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The view always holds at least this node
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every known node in id order
    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| include_self || *id != self.node_id)
            .collect()
    }

    /// The configured mesh root, if one is visible
    pub fn mesh_root(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.root)
            .map(|(id, _)| *id)
    }

    /// Neighbour through which `node` is reached
    pub fn branch_of(&self, node: NodeId) -> Option<NodeId> {
        let mut current = node;
        loop {
            let parent = self.parent_of(current)?;
            if parent == self.node_id {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Ordered path from this node to `target`, both ends included.
    /// Empty when `target` is not in the view.
    pub fn path_to(&self, target: NodeId) -> Vec<NodeId> {
        if !self.contains(target) {
            return Vec::new();
        }
        let mut path = vec![target];
        let mut current = target;
        while let Some(parent) = self.parent_of(current) {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// This node's subtree as announced to `exclude`; the branch reached
    /// through `exclude` is left out.
    pub fn subtree(&self, exclude: Option<NodeId>) -> Subtree {
        let mut sub = self.build_subtree(self.node_id);
        if let Some(excluded) = exclude {
            sub.subs.retain(|s| s.node_id != excluded);
        }
        sub
    }

    fn build_subtree(&self, node: NodeId) -> Subtree {
        let entry = self.nodes.get(&node);
        Subtree {
            node_id: node,
            root: entry.map(|n| n.root).unwrap_or(false),
            subs: entry
                .map(|n| n.children.iter().map(|c| self.build_subtree(*c)).collect())
                .unwrap_or_default(),
        }
    }

    fn rebuild_if_changed(&mut self) -> bool {
        let before = self.nodes.clone();
        self.rebuild();
        before != self.nodes
    }

    fn rebuild(&mut self) {
        self.nodes.clear();
        self.nodes.insert(
            self.node_id,
            TreeNode {
                parent: None,
                children: BTreeSet::new(),
                root: self.is_root,
            },
        );
        for sub in self.neighbors.values() {
            graft(&mut self.nodes, self.node_id, sub);
        }
    }
}

/// The link of a closed walk `cycle` to drop: highest upper endpoint,
/// then highest lower endpoint. Returned as `(higher, lower)`.
pub fn link_to_cut(cycle: &[NodeId]) -> Option<(NodeId, NodeId)> {
    cycle
        .windows(2)
        .map(|w| (w[0].max(w[1]), w[0].min(w[1])))
        .max()
}

/// Attach `sub` below `parent`, skipping nodes that are already placed.
fn graft(nodes: &mut BTreeMap<NodeId, TreeNode>, parent: NodeId, sub: &Subtree) {
    if nodes.contains_key(&sub.node_id) {
        warn!(node_id = %sub.node_id, parent = %parent, "Duplicate node in announcement, keeping first placement");
        return;
    }
    nodes.insert(
        sub.node_id,
        TreeNode {
            parent: Some(parent),
            children: BTreeSet::new(),
            root: sub.root,
        },
    );
    if let Some(p) = nodes.get_mut(&parent) {
        p.children.insert(sub.node_id);
    }
    for child in &sub.subs {
        graft(nodes, sub.node_id, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[u32]) -> Subtree {
        let mut iter = ids.iter().rev();
        let mut sub = Subtree::leaf(NodeId(*iter.next().unwrap()));
        for id in iter {
            sub = Subtree {
                node_id: NodeId(*id),
                root: false,
                subs: vec![sub],
            };
        }
        sub
    }

    #[test]
    fn test_chain_view() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        assert!(tree.update_neighbor(chain(&[2, 3])));

        assert_eq!(tree.node_list(true), vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(tree.parent_of(NodeId(3)), Some(NodeId(2)));
        assert_eq!(tree.branch_of(NodeId(3)), Some(NodeId(2)));
        assert_eq!(tree.path_to(NodeId(3)), vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(tree.path_to(NodeId(1)), vec![NodeId(1)]);
        assert!(tree.path_to(NodeId(9)).is_empty());
    }

    #[test]
    fn test_same_announcement_is_not_a_change() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        assert!(tree.update_neighbor(chain(&[2, 3])));
        assert!(!tree.update_neighbor(chain(&[2, 3])));
    }

    #[test]
    fn test_removing_neighbour_drops_branch() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(chain(&[2, 3]));
        tree.update_neighbor(chain(&[4]));
        assert_eq!(tree.len(), 4);

        assert!(tree.remove_neighbor(NodeId(2)));
        assert!(!tree.contains(NodeId(3)));
        assert!(tree.contains(NodeId(4)));
        assert!(!tree.remove_neighbor(NodeId(2)));
    }

    #[test]
    fn test_duplicate_claims_keep_single_parent() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        // Both neighbours claim node 5; lower neighbour id wins
        tree.update_neighbor(chain(&[3, 5]));
        tree.update_neighbor(chain(&[2, 5]));
        assert_eq!(tree.parent_of(NodeId(5)), Some(NodeId(2)));
        assert!(!tree.get(NodeId(3)).unwrap().children.contains(&NodeId(5)));
    }

    #[test]
    fn test_announcement_containing_self_is_cut() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(chain(&[2, 1, 7]));
        // Node 1 is already placed, so the branch below it is never grafted
        assert_eq!(tree.parent_of(NodeId(1)), None);
        assert!(!tree.contains(NodeId(7)));
    }

    #[test]
    fn test_loop_through_other_neighbour() {
        // 1 links to 2 and 3; 3 announces a branch that reaches 2 via 4
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(chain(&[2]));
        let announced = chain(&[3, 4, 2]);

        let cycle = tree.loop_through(&announced).unwrap();
        assert_eq!(cycle, vec![NodeId(1), NodeId(3), NodeId(4), NodeId(2), NodeId(1)]);
        assert_eq!(link_to_cut(&cycle), Some((NodeId(4), NodeId(3))));
    }

    #[test]
    fn test_loop_through_self() {
        let tree = TopologyTree::new(NodeId(4), false);
        let cycle = tree.loop_through(&chain(&[3, 1, 2, 4])).unwrap();
        assert_eq!(cycle, vec![NodeId(4), NodeId(3), NodeId(1), NodeId(2), NodeId(4)]);
        assert_eq!(link_to_cut(&cycle), Some((NodeId(4), NodeId(3))));
    }

    #[test]
    fn test_clean_announcement_has_no_loop() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(chain(&[2, 5]));
        assert!(tree.loop_through(&chain(&[3, 4])).is_none());
        // A neighbour re-announcing its own branch is not a loop
        assert!(tree.loop_through(&chain(&[2, 5, 6])).is_none());
    }

    #[test]
    fn test_subtree_excludes_requesting_branch() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(chain(&[2, 3]));
        tree.update_neighbor(chain(&[4]));

        let for_two = tree.subtree(Some(NodeId(2)));
        assert_eq!(for_two.node_id, NodeId(1));
        assert!(!for_two.contains(NodeId(3)));
        assert!(for_two.contains(NodeId(4)));
        assert_eq!(tree.subtree(None).size(), 4);
    }

    #[test]
    fn test_mesh_root_reported() {
        let mut tree = TopologyTree::new(NodeId(1), false);
        assert_eq!(tree.mesh_root(), None);
        tree.update_neighbor(Subtree {
            node_id: NodeId(9),
            root: true,
            subs: Vec::new(),
        });
        assert_eq!(tree.mesh_root(), Some(NodeId(9)));
        assert_eq!(tree.node_list(false), vec![NodeId(9)]);
    }
}
