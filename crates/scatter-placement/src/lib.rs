//! Segment ownership for Scatter.
//!
//! Keys hash into a fixed number of segments. A [`Topology`] assigns every
//! segment to exactly one primary owner among the current members; the
//! assignment is computed by an [`OwnershipOracle`], by default the
//! consistent hashing [`RingOracle`].
//!
//! The ring uses virtual nodes (vnodes): each physical node gets multiple
//! positions on the ring, determined by `blake3(address ++ vnode_index)`.
//! More vnodes per node = more uniform distribution.

mod error;
mod ring;
mod topology;

pub use error::PlacementError;
pub use ring::{Migration, Ring};
pub use topology::{OwnershipOracle, RingOracle, SegmentSet, Topology, key_segment};
