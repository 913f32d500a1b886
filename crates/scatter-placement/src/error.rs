//! Error types for segment placement.

use scatter_types::Address;

/// Errors produced while building a topology.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    /// A topology needs at least one member.
    #[error("topology has no members")]
    NoMembers,

    /// The hash space must have at least one segment.
    #[error("topology has no segments")]
    NoSegments,

    /// The oracle did not assign every segment.
    #[error("oracle assigned {actual} segments, expected {expected}")]
    IncompleteAssignment {
        /// Segments in the hash space.
        expected: u32,
        /// Segments the oracle returned.
        actual: usize,
    },

    /// The oracle named an owner outside the member list.
    #[error("oracle assigned a segment to non-member {0}")]
    UnknownOwner(Address),
}
