//! Consistent hashing ring implementation.

use std::collections::{BTreeMap, HashMap};

use scatter_types::{Address, SegmentId};
use tracing::debug;

/// A segment whose primary owner changes between two topologies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// The segment that must move.
    pub segment: SegmentId,
    /// The node that currently owns it.
    pub from: Address,
    /// The node that should own it after the change.
    pub to: Address,
}

/// Consistent hashing ring mapping segments to nodes.
///
/// Each node is mapped to `weight` virtual nodes (vnodes) on a u64 ring.
/// A segment belongs to the first vnodes found walking clockwise from the
/// segment's position.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Virtual node positions: ring position -> physical node.
    vnodes: BTreeMap<u64, Address>,
    /// Number of vnodes per node.
    weights: HashMap<Address, u16>,
    /// Vnode count used by [`Ring::add_node`].
    vnodes_per_node: u16,
}

impl Ring {
    /// Create a new empty ring.
    pub fn new(vnodes_per_node: u16) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            weights: HashMap::new(),
            vnodes_per_node,
        }
    }

    /// Build a ring holding every address in `members`.
    pub fn from_members(members: &[Address], vnodes_per_node: u16) -> Self {
        let mut ring = Self::new(vnodes_per_node);
        for member in members {
            ring.add_node(*member);
        }
        ring
    }

    /// Add a node with the default weight.
    pub fn add_node(&mut self, address: Address) {
        self.add_node_with_weight(address, self.vnodes_per_node);
    }

    /// Add a node with an explicit weight (number of vnodes).
    pub fn add_node_with_weight(&mut self, address: Address, weight: u16) {
        // Re-adding replaces the previous weight.
        self.remove_node(&address);

        for i in 0..weight {
            self.vnodes.insert(vnode_position(&address, i), address);
        }
        self.weights.insert(address, weight);
        debug!(node = %address.fmt_short(), weight, "added node to ring");
    }

    /// Remove a node from the ring.
    pub fn remove_node(&mut self, address: &Address) {
        if let Some(weight) = self.weights.remove(address) {
            for i in 0..weight {
                self.vnodes.remove(&vnode_position(address, i));
            }
            debug!(node = %address.fmt_short(), "removed node from ring");
        }
    }

    /// Determine which nodes own a segment, primary first.
    ///
    /// Collects up to `count` distinct physical nodes. If fewer nodes exist,
    /// returns all of them.
    pub fn owners(&self, segment: SegmentId, count: usize) -> Vec<Address> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let pos = segment_position(segment);
        let max_distinct = count.min(self.weights.len());
        let mut owners = Vec::with_capacity(max_distinct);

        // Everything >= pos, then wrap around.
        let after = self.vnodes.range(pos..);
        let before = self.vnodes.range(..pos);

        for (_, address) in after.chain(before) {
            if !owners.contains(address) {
                owners.push(*address);
                if owners.len() == max_distinct {
                    break;
                }
            }
        }

        owners
    }

    /// Primary owner of a segment, if the ring has any node.
    pub fn primary(&self, segment: SegmentId) -> Option<Address> {
        self.owners(segment, 1).into_iter().next()
    }

    /// Number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    /// Total number of vnodes in the ring.
    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }
}

/// A vnode's position: blake3(address ++ vnode_index) truncated to u64.
fn vnode_position(address: &Address, vnode_index: u16) -> u64 {
    let mut input = Vec::with_capacity(34);
    input.extend_from_slice(address.as_ref());
    input.extend_from_slice(&vnode_index.to_le_bytes());
    hash_prefix(&input)
}

/// A segment's position: blake3 of its index truncated to u64.
fn segment_position(segment: SegmentId) -> u64 {
    hash_prefix(&segment.to_le_bytes())
}

pub(crate) fn hash_prefix(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}
