//! Error types for the cluster crate.

use scatter_types::Address;

/// Errors produced by membership changes and topology publication.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The requested member was not found in the cluster state.
    #[error("member not found: {0}")]
    MemberNotFound(Address),

    /// A topology cannot be built without alive members.
    #[error("no alive members to build a topology from")]
    NoAliveMembers,

    /// The ownership oracle rejected the member list.
    #[error("placement error: {0}")]
    Placement(#[from] scatter_placement::PlacementError),
}
