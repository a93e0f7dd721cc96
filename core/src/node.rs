//! Node identity and the physical-ID bimap (spec §3, "Node").

use std::collections::HashMap;

/// A logical node index in `[0, nnodes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// A conduit-specific, possibly-sparse transport address (queue-pair id,
/// GM node id, LAPI task id, ...). Opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalId(pub u64);

/// Maps logical node indices to physical transport ids and back. Built once
/// during `init` and read-only thereafter, per spec §3 / §5 ("Shared
/// resources: Node map and segment info: published once in attach,
/// read-only thereafter").
#[derive(Debug, Clone)]
pub struct NodeMap {
    mynode: NodeId,
    physical: Vec<PhysicalId>,
    reverse: HashMap<PhysicalId, NodeId>,
}

impl NodeMap {
    /// `physical[i]` is the physical id of logical node `i`. The bootstrap
    /// spawner (out of scope) is responsible for producing a dense, ordered
    /// `physical` vector from the job's spawn mechanism.
    pub fn new(mynode: NodeId, physical: Vec<PhysicalId>) -> Self {
        assert!(
            mynode.as_usize() < physical.len(),
            "mynode index out of range of physical id table"
        );
        let reverse = physical
            .iter()
            .enumerate()
            .map(|(i, &p)| (p, NodeId(i as u32)))
            .collect();
        NodeMap {
            mynode,
            physical,
            reverse,
        }
    }

    pub fn mynode(&self) -> NodeId {
        self.mynode
    }

    pub fn nnodes(&self) -> usize {
        self.physical.len()
    }

    pub fn physical_id(&self, node: NodeId) -> Option<PhysicalId> {
        self.physical.get(node.as_usize()).copied()
    }

    pub fn node_for_physical(&self, physical: PhysicalId) -> Option<NodeId> {
        self.reverse.get(&physical).copied()
    }

    pub fn is_valid(&self, node: NodeId) -> bool {
        node.as_usize() < self.nnodes()
    }
}
