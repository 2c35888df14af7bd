//! # Core Types
//!
//! Node identity and addressing types shared by every layer of the
//! Framelock lockstep protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest number of nodes a cluster can hold.
///
/// Node ids must fit a single bit of a 64-bit destination mask, so the
/// protocol supports ids 0 through 63.
pub const MAX_NODE_COUNT: usize = 64;

/// Unique identifier for a node in the cluster.
///
/// Node ids are assigned out-of-band by launch orchestration before the
/// protocol starts; id 0 is conventionally the emitter. An id is always in
/// the range `0..64` so that it maps onto one bit of a [`NodeMask`].
///
/// # Examples
///
/// ```rust
/// use framelock_core::NodeId;
///
/// let emitter = NodeId::new(0).unwrap();
/// assert_eq!(emitter.mask().bits(), 1);
/// assert!(NodeId::new(64).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u8);

impl NodeId {
    /// Conventional id of the emitter node.
    pub const EMITTER: NodeId = NodeId(0);

    /// Creates a node id, rejecting values that do not fit the 64-bit mask.
    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < MAX_NODE_COUNT).then_some(Self(id))
    }

    /// Returns the raw id value.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Returns the single-bit mask identifying this node.
    pub fn mask(&self) -> NodeMask {
        NodeMask(1u64 << self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node plays in the cluster.
///
/// There is exactly one emitter, statically designated; every other node is
/// a repeater following the emitter's per-frame state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Authoritative node that gathers and broadcasts per-frame state.
    Emitter,
    /// Follower node that replicates the emitter's per-frame state.
    Repeater,
}

impl NodeRole {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            NodeRole::Emitter => 0,
            NodeRole::Repeater => 1,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(NodeRole::Emitter),
            1 => Some(NodeRole::Repeater),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Emitter => write!(f, "emitter"),
            NodeRole::Repeater => write!(f, "repeater"),
        }
    }
}

/// Set of node ids encoded as one bit per id.
///
/// Used for message destinations (`DestinationIDs`), the transport's
/// known-nodes set, and the emitter's "still waiting on" tracking. The mask
/// type is unsigned everywhere; there is deliberately no signed variant.
///
/// # Examples
///
/// ```rust
/// use framelock_core::{NodeId, NodeMask};
///
/// let mut mask = NodeMask::EMPTY;
/// mask.set(NodeId::new(3).unwrap());
/// mask.set(NodeId::new(5).unwrap());
/// assert!(mask.contains(NodeId::new(3).unwrap()));
/// assert_eq!(mask.count(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMask(u64);

impl NodeMask {
    /// Mask containing no nodes.
    pub const EMPTY: NodeMask = NodeMask(0);

    /// Mask containing every possible node id (used for broadcast hellos).
    pub const ALL: NodeMask = NodeMask(u64::MAX);

    /// Builds a mask from its raw bit representation.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bit representation.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Adds a node to the mask.
    pub fn set(&mut self, id: NodeId) {
        self.0 |= id.mask().0;
    }

    /// Removes a node from the mask.
    pub fn clear(&mut self, id: NodeId) {
        self.0 &= !id.mask().0;
    }

    /// Tests whether a node is in the mask.
    pub fn contains(&self, id: NodeId) -> bool {
        self.0 & id.mask().0 != 0
    }

    /// Tests whether any of `other`'s nodes are in the mask.
    pub fn intersects(&self, other: NodeMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns this mask with `other`'s nodes removed.
    pub fn minus(&self, other: NodeMask) -> NodeMask {
        NodeMask(self.0 & !other.0)
    }

    /// True when the mask holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of nodes in the mask.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the node ids present in the mask, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0u8..MAX_NODE_COUNT as u8).filter_map(move |id| {
            (self.0 & (1u64 << id) != 0).then_some(NodeId(id))
        })
    }
}

impl fmt::Display for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::ops::BitOr for NodeMask {
    type Output = NodeMask;

    fn bitor(self, rhs: NodeMask) -> NodeMask {
        NodeMask(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_range() {
        assert!(NodeId::new(0).is_some());
        assert!(NodeId::new(63).is_some());
        assert!(NodeId::new(64).is_none());
    }

    #[test]
    fn mask_set_clear_contains() {
        let a = NodeId::new(1).unwrap();
        let b = NodeId::new(62).unwrap();

        let mut mask = NodeMask::EMPTY;
        mask.set(a);
        mask.set(b);
        assert!(mask.contains(a));
        assert!(mask.contains(b));
        assert_eq!(mask.count(), 2);

        mask.clear(a);
        assert!(!mask.contains(a));
        assert!(mask.contains(b));
    }

    #[test]
    fn mask_minus_and_iter() {
        let mut mask = NodeMask::EMPTY;
        for id in [0u8, 3, 7] {
            mask.set(NodeId::new(id).unwrap());
        }

        let without_self = mask.minus(NodeId::new(0).unwrap().mask());
        let ids: Vec<u8> = without_self.iter().map(|n| n.value()).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn role_wire_round_trip() {
        for role in [NodeRole::Emitter, NodeRole::Repeater] {
            assert_eq!(NodeRole::from_wire(role.to_wire()), Some(role));
        }
        assert_eq!(NodeRole::from_wire(9), None);
    }
}
