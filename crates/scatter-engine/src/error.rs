//! Error types for the engine.

use std::time::Duration;

use scatter_net::{NetError, RejectReason};
use scatter_types::{Address, EntryVersion, SegmentId, TopologyId};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to access the local entry store.
    #[error("store error: {0}")]
    Store(#[from] scatter_store::StoreError),

    /// A topology could not be built.
    #[error("placement error: {0}")]
    Placement(#[from] scatter_placement::PlacementError),

    /// Cluster membership error.
    #[error("cluster error: {0}")]
    Cluster(#[from] scatter_cluster::ClusterError),

    /// Sender and receiver routed with different topologies.
    #[error("topology mismatch: local {local}, remote {remote}")]
    OutdatedTopology {
        /// Topology installed on this node.
        local: TopologyId,
        /// Topology installed on the other node.
        remote: TopologyId,
    },

    /// The segment is waiting for state transfer.
    #[error("segment {segment} is blocked for state transfer")]
    SegmentBlocked {
        /// The blocked segment.
        segment: SegmentId,
    },

    /// This node is not the segment's primary owner.
    #[error("segment {segment} is not owned by this node")]
    SegmentNotOwned {
        /// The segment.
        segment: SegmentId,
    },

    /// Another node could not be reached.
    #[error("remote communication with {target} failed: {reason}")]
    RemoteCommunication {
        /// The node we tried to reach.
        target: Address,
        /// What went wrong.
        reason: String,
    },

    /// Another node did not answer in time.
    #[error("timed out after {after:?} waiting for {target}")]
    Timeout {
        /// The silent node.
        target: Address,
        /// How long we waited.
        after: Duration,
    },

    /// An owner serving a remote write gave up revoking a lease holder.
    #[error("gave up revoking bias held by {holder} after {after:?}")]
    RevocationTimedOut {
        /// The unreachable holder.
        holder: Address,
        /// Time spent retrying.
        after: Duration,
    },

    /// The version issued for a write does not supersede the stored one.
    #[error("version conflict in segment {segment}: stored {stored}, issued {issued}")]
    VersionConflict {
        /// Segment of the key.
        segment: SegmentId,
        /// Version already stored.
        stored: EntryVersion,
        /// Version generated for the write.
        issued: EntryVersion,
    },

    /// The other node answered with a response of the wrong kind.
    #[error("unexpected {got} response from {target}")]
    UnexpectedResponse {
        /// The answering node.
        target: Address,
        /// Name of the response variant.
        got: &'static str,
    },

    /// The other node refused the request.
    #[error("rejected by {target}: {reason}")]
    Rejected {
        /// The refusing node.
        target: Address,
        /// Its reason.
        reason: RejectReason,
    },

    /// A topology was offered that does not follow the installed one.
    #[error("topology {offered} does not follow installed topology {current}")]
    TopologyRegression {
        /// Installed topology.
        current: TopologyId,
        /// Offered topology.
        offered: TopologyId,
    },

    /// Store, topology and configuration disagree on the segment count.
    #[error("segment count mismatch: configured {expected}, found {actual}")]
    SegmentCountMismatch {
        /// Configured segment count.
        expected: u32,
        /// Segment count of the offending component.
        actual: u32,
    },
}

impl EngineError {
    /// Whether re-routing with a fresher topology may succeed.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            EngineError::OutdatedTopology { .. }
                | EngineError::SegmentBlocked { .. }
                | EngineError::SegmentNotOwned { .. }
        )
    }

    pub(crate) fn from_net(target: Address, err: NetError) -> Self {
        match err {
            NetError::Timeout { after, .. } => EngineError::Timeout { target, after },
            other => EngineError::RemoteCommunication {
                target,
                reason: other.to_string(),
            },
        }
    }

    /// Translate an owner's refusal into the caller's error.
    ///
    /// An owner that timed out revoking a lease surfaces as a timeout of
    /// the whole request, exactly as if the caller had stopped waiting.
    pub(crate) fn from_rejection(
        target: Address,
        reason: RejectReason,
        local: TopologyId,
        waited: Duration,
    ) -> Self {
        match reason {
            RejectReason::OutdatedTopology { current } => EngineError::OutdatedTopology {
                local,
                remote: current,
            },
            RejectReason::SegmentBlocked { segment } => EngineError::SegmentBlocked { segment },
            RejectReason::NotOwner { segment } => EngineError::SegmentNotOwned { segment },
            RejectReason::RevocationFailed {
                timed_out: true, ..
            } => EngineError::Timeout {
                target,
                after: waited,
            },
            other => EngineError::Rejected {
                target,
                reason: other,
            },
        }
    }

    /// The reason sent back when a remote request fails with `self`.
    pub(crate) fn to_rejection(&self) -> RejectReason {
        match self {
            EngineError::OutdatedTopology { local, .. } => {
                RejectReason::OutdatedTopology { current: *local }
            }
            EngineError::SegmentBlocked { segment } => RejectReason::SegmentBlocked {
                segment: *segment,
            },
            EngineError::SegmentNotOwned { segment } => RejectReason::NotOwner { segment: *segment },
            EngineError::RevocationTimedOut { holder, .. } => RejectReason::RevocationFailed {
                holder: *holder,
                timed_out: true,
            },
            EngineError::VersionConflict { stored, issued, .. } => RejectReason::VersionConflict {
                stored: *stored,
                issued: *issued,
            },
            other => RejectReason::Internal(other.to_string()),
        }
    }
}
