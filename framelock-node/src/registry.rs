//! Bookkeeping for the peers a node has handshaked with.

use framelock_core::{NodeId, NodeMask, NodeRole};
use std::net::SocketAddr;
use tracing::warn;

/// What one node knows about a handshaked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: NodeId,
    pub role: NodeRole,
    pub endpoint: SocketAddr,
}

/// The set of peers currently participating in the cluster.
///
/// Built during the handshake and owned by the frame synchronization
/// stage afterwards; eviction removes nodes, nothing is ever re-added
/// mid-run.
#[derive(Debug, Default)]
pub struct RemoteNodeRegistry {
    nodes: Vec<RemoteNode>,
}

impl RemoteNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer. Registering the same node id twice is a no-op; the
    /// hello rebroadcast makes duplicates routine.
    pub fn register(&mut self, node: RemoteNode) -> bool {
        if self.contains(node.id) {
            warn!(node = node.id.value(), "node already registered, ignoring");
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Removes a peer, returning its record if it was present.
    pub fn unregister(&mut self, id: NodeId) -> Option<RemoteNode> {
        let index = self.nodes.iter().position(|n| n.id == id)?;
        Some(self.nodes.swap_remove(index))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn get(&self, id: NodeId) -> Option<&RemoteNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mask of every registered peer.
    pub fn mask(&self) -> NodeMask {
        let mut mask = NodeMask::EMPTY;
        for node in &self.nodes {
            mask.set(node.id);
        }
        mask
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteNode> {
        self.nodes.iter()
    }
}
