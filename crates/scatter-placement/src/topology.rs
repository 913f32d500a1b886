//! Installed topologies: the segment-to-owner table every node routes by.

use std::collections::BTreeSet;
use std::fmt;

use scatter_types::{Address, SegmentId, TopologyId};

use crate::error::PlacementError;
use crate::ring::{Migration, Ring, hash_prefix};

/// A set of segments, ordered for stable iteration and logging.
pub type SegmentSet = BTreeSet<SegmentId>;

/// Map a key to its segment. Depends only on the segment count, so it never
/// changes across topologies.
pub fn key_segment(key: &[u8], num_segments: u32) -> SegmentId {
    (hash_prefix(key) % u64::from(num_segments)) as SegmentId
}

/// Decides which member owns each segment.
///
/// Implementations must be deterministic: every node that builds a topology
/// from the same member list must get the same table.
pub trait OwnershipOracle: Send + Sync + fmt::Debug {
    /// Number of segments in the hash space.
    fn num_segments(&self) -> u32;

    /// Return the primary owner of every segment, indexed by segment id.
    fn assign(&self, members: &[Address]) -> Vec<Address>;
}

/// [`OwnershipOracle`] backed by a consistent hashing [`Ring`].
#[derive(Debug, Clone)]
pub struct RingOracle {
    num_segments: u32,
    vnodes_per_node: u16,
}

impl RingOracle {
    /// Create an oracle over `num_segments` segments.
    pub fn new(num_segments: u32, vnodes_per_node: u16) -> Self {
        Self {
            num_segments,
            vnodes_per_node,
        }
    }
}

impl OwnershipOracle for RingOracle {
    fn num_segments(&self) -> u32 {
        self.num_segments
    }

    fn assign(&self, members: &[Address]) -> Vec<Address> {
        let ring = Ring::from_members(members, self.vnodes_per_node);
        (0..self.num_segments)
            .filter_map(|segment| ring.primary(segment))
            .collect()
    }
}

/// A numbered, immutable assignment of segments to members.
#[derive(Clone, PartialEq, Eq)]
pub struct Topology {
    id: TopologyId,
    /// Members in deterministic (sorted) order.
    members: Vec<Address>,
    /// Primary owner per segment.
    owners: Vec<Address>,
}

impl Topology {
    /// Build topology `id` for `members` using `oracle`.
    pub fn new(
        id: TopologyId,
        members: &[Address],
        oracle: &dyn OwnershipOracle,
    ) -> Result<Self, PlacementError> {
        if oracle.num_segments() == 0 {
            return Err(PlacementError::NoSegments);
        }
        if members.is_empty() {
            return Err(PlacementError::NoMembers);
        }

        let mut sorted = members.to_vec();
        sorted.sort();
        sorted.dedup();

        let owners = oracle.assign(&sorted);
        if owners.len() != oracle.num_segments() as usize {
            return Err(PlacementError::IncompleteAssignment {
                expected: oracle.num_segments(),
                actual: owners.len(),
            });
        }
        if let Some(stranger) = owners.iter().find(|o| !sorted.contains(o)) {
            return Err(PlacementError::UnknownOwner(*stranger));
        }

        Ok(Self {
            id,
            members: sorted,
            owners,
        })
    }

    /// Topology identifier.
    pub fn id(&self) -> TopologyId {
        self.id
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Members in deterministic order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Whether `address` is part of this topology.
    pub fn is_member(&self, address: &Address) -> bool {
        self.members.binary_search(address).is_ok()
    }

    /// Segment that `key` belongs to.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        key_segment(key, self.num_segments())
    }

    /// Primary owner of `segment`.
    ///
    /// # Panics
    ///
    /// Panics if `segment` is outside `0..num_segments`.
    pub fn segment_owner(&self, segment: SegmentId) -> Address {
        self.owners[segment as usize]
    }

    /// Primary owner of `key`.
    pub fn primary_owner(&self, key: &[u8]) -> Address {
        self.segment_owner(self.segment_of(key))
    }

    /// Segments whose primary owner is `address`.
    pub fn owned_segments(&self, address: &Address) -> SegmentSet {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| *owner == address)
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// The member following `address` in member order, wrapping around.
    ///
    /// `None` when `address` is the only member or not a member at all.
    pub fn next_member(&self, address: &Address) -> Option<Address> {
        if self.members.len() < 2 {
            return None;
        }
        let index = self.members.binary_search(address).ok()?;
        Some(self.members[(index + 1) % self.members.len()])
    }

    /// Segments whose primary owner differs between `self` and `next`.
    pub fn migrations(&self, next: &Topology) -> Vec<Migration> {
        self.owners
            .iter()
            .zip(next.owners.iter())
            .enumerate()
            .filter(|(_, (from, to))| from != to)
            .map(|(segment, (from, to))| Migration {
                segment: segment as SegmentId,
                from: *from,
                to: *to,
            })
            .collect()
    }

    /// Segments whose primary owner differs between `self` and `next`.
    pub fn moved_segments(&self, next: &Topology) -> SegmentSet {
        self.migrations(next).into_iter().map(|m| m.segment).collect()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("num_segments", &self.owners.len())
            .finish()
    }
}
