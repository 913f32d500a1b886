//! Protocol messages exchanged between Scatter nodes.
//!
//! Messages travel in-process, so write commands can carry the caller's
//! compute and merge functions as shared closures.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use scatter_types::{Address, CacheEntry, EntryMetadata, EntryVersion, SegmentId, TopologyId};

/// Remapping function for the compute family: `(key, current) -> new`.
/// Returning `None` removes the key.
pub type ComputeFn = Arc<dyn Fn(&Bytes, Option<&Bytes>) -> Option<Bytes> + Send + Sync>;

/// Merge function: `(current, supplied) -> new`. Returning `None` removes
/// the key.
pub type MergeFn = Arc<dyn Fn(&Bytes, &Bytes) -> Option<Bytes> + Send + Sync>;

/// A mutation to apply at the key's primary owner.
#[derive(Clone)]
pub enum WriteOp {
    /// Unconditional store.
    Put {
        /// New value.
        value: Bytes,
        /// Expiration settings.
        metadata: EntryMetadata,
    },
    /// Store only if no live value exists.
    PutIfAbsent {
        /// New value.
        value: Bytes,
        /// Expiration settings.
        metadata: EntryMetadata,
    },
    /// Store only if a live value exists.
    Replace {
        /// New value.
        value: Bytes,
        /// Expiration settings.
        metadata: EntryMetadata,
    },
    /// Unconditional removal. Always leaves a tombstone.
    Remove,
    /// Remove only if the live value equals `expected`.
    RemoveIf {
        /// Value the caller expects to be stored.
        expected: Bytes,
    },
    /// Recompute the value from the current one, present or not.
    Compute {
        /// Remapping function.
        function: ComputeFn,
        /// Expiration settings for the stored result.
        metadata: EntryMetadata,
    },
    /// Compute a value only when none is present.
    ComputeIfAbsent {
        /// Mapping function; called with `None` as the current value.
        function: ComputeFn,
        /// Expiration settings for the stored result.
        metadata: EntryMetadata,
    },
    /// Recompute only when a live value is present.
    ComputeIfPresent {
        /// Remapping function.
        function: ComputeFn,
        /// Expiration settings for the stored result.
        metadata: EntryMetadata,
    },
    /// Store `value` if absent, otherwise merge it with the current value.
    Merge {
        /// Value to merge in.
        value: Bytes,
        /// Merge function.
        function: MergeFn,
        /// Expiration settings for the stored result.
        metadata: EntryMetadata,
    },
}

impl WriteOp {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Put { .. } => "put",
            WriteOp::PutIfAbsent { .. } => "put_if_absent",
            WriteOp::Replace { .. } => "replace",
            WriteOp::Remove => "remove",
            WriteOp::RemoveIf { .. } => "remove_if",
            WriteOp::Compute { .. } => "compute",
            WriteOp::ComputeIfAbsent { .. } => "compute_if_absent",
            WriteOp::ComputeIfPresent { .. } => "compute_if_present",
            WriteOp::Merge { .. } => "merge",
        }
    }
}

impl fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Put { value, .. }
            | WriteOp::PutIfAbsent { value, .. }
            | WriteOp::Replace { value, .. }
            | WriteOp::Merge { value, .. } => f
                .debug_struct(self.name())
                .field("value_len", &value.len())
                .finish_non_exhaustive(),
            WriteOp::RemoveIf { expected } => f
                .debug_struct(self.name())
                .field("expected_len", &expected.len())
                .finish(),
            _ => f.write_str(self.name()),
        }
    }
}

/// A write forwarded to (or executed at) the primary owner.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    /// Target key.
    pub key: Bytes,
    /// Mutation to apply.
    pub op: WriteOp,
    /// Node that issued the write.
    pub origin: Address,
}

/// One key of an invalidation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Key whose older copies must go.
    pub key: Bytes,
    /// Version committed at the owner.
    pub version: EntryVersion,
    /// Whether the committed version is a tombstone.
    pub removed: bool,
}

/// Discriminant of [`CacheMessage`], used for fault injection and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Get,
    Write,
    RevokeBias,
    RenewBias,
    InvalidateVersions,
    BackupWrite,
    SegmentEntries,
    ReleaseCopies,
    Touch,
}

/// Requests exchanged between nodes.
#[derive(Debug, Clone)]
pub enum CacheMessage {
    /// Read a key at its primary owner.
    Get {
        /// Key to read.
        key: Bytes,
        /// Topology the sender routed with.
        topology_id: TopologyId,
    },

    /// Apply a write at the primary owner.
    Write {
        /// The write.
        command: WriteCommand,
        /// Topology the sender routed with.
        topology_id: TopologyId,
    },

    /// Owner asks a holder to drop its read leases on `keys`.
    ///
    /// The holder must acknowledge only after it stopped serving the keys
    /// locally.
    RevokeBias {
        /// Keys to revoke.
        keys: Vec<Bytes>,
    },

    /// Holder asks the owner to extend its lease on `key`.
    RenewBias {
        /// Leased key.
        key: Bytes,
        /// Topology the sender routed with.
        topology_id: TopologyId,
    },

    /// Owner tells other members to drop copies older than the listed
    /// versions.
    InvalidateVersions {
        /// Keys and their committed versions.
        entries: Vec<Invalidation>,
        /// Removal rounds also purge tombstones with the exact version.
        removal: bool,
    },

    /// Owner hands a freshly committed entry to its backup.
    BackupWrite {
        /// The committed entry.
        entry: CacheEntry,
    },

    /// Owner that settled a segment after a topology change tells members
    /// other than itself and its backup to drop copies up to and including
    /// the listed versions.
    ReleaseCopies {
        /// Keys and the versions the owner and its backup now hold.
        entries: Vec<Invalidation>,
    },

    /// A lease holder read `key` locally; the owner records the access.
    Touch {
        /// Key that was read.
        key: Bytes,
        /// Topology the sender routed with.
        topology_id: TopologyId,
    },

    /// New owner pulls every copy held for segments it just gained.
    SegmentEntries {
        /// Requested segments.
        segments: Vec<SegmentId>,
        /// Topology the sender installed.
        topology_id: TopologyId,
    },
}

impl CacheMessage {
    /// The message discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            CacheMessage::Get { .. } => MessageKind::Get,
            CacheMessage::Write { .. } => MessageKind::Write,
            CacheMessage::RevokeBias { .. } => MessageKind::RevokeBias,
            CacheMessage::RenewBias { .. } => MessageKind::RenewBias,
            CacheMessage::InvalidateVersions { .. } => MessageKind::InvalidateVersions,
            CacheMessage::BackupWrite { .. } => MessageKind::BackupWrite,
            CacheMessage::SegmentEntries { .. } => MessageKind::SegmentEntries,
            CacheMessage::ReleaseCopies { .. } => MessageKind::ReleaseCopies,
            CacheMessage::Touch { .. } => MessageKind::Touch,
        }
    }
}

/// Result of a write applied at the primary owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReply {
    /// Live value before the write.
    pub previous: Option<Bytes>,
    /// Live value after the write.
    pub current: Option<Bytes>,
    /// Entry committed by the write; `None` when nothing changed.
    pub entry: Option<CacheEntry>,
    /// Read lease granted to the originator, if any.
    pub bias_lease: Option<Duration>,
}

impl WriteReply {
    /// Whether the write changed the stored entry.
    pub fn applied(&self) -> bool {
        self.entry.is_some()
    }
}

/// Why an owner refused a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// The sender routed with a different topology than the receiver's.
    #[error("receiver is at topology {current}")]
    OutdatedTopology {
        /// Receiver's topology.
        current: TopologyId,
    },

    /// The segment is still being transferred to the receiver.
    #[error("segment {segment} is blocked for state transfer")]
    SegmentBlocked {
        /// The blocked segment.
        segment: SegmentId,
    },

    /// The receiver does not own the segment.
    #[error("receiver does not own segment {segment}")]
    NotOwner {
        /// The segment.
        segment: SegmentId,
    },

    /// A lease holder could not be revoked before the write.
    #[error("could not revoke bias held by {holder}")]
    RevocationFailed {
        /// The unreachable holder.
        holder: Address,
        /// Whether the owner gave up because its remote timeout elapsed.
        timed_out: bool,
    },

    /// The owner issued a version that does not supersede the stored one.
    #[error("version conflict: stored {stored}, issued {issued}")]
    VersionConflict {
        /// Version found in the store.
        stored: EntryVersion,
        /// Version the owner generated.
        issued: EntryVersion,
    },

    /// Any other failure, rendered as text.
    #[error("{0}")]
    Internal(String),
}

/// Responses to [`CacheMessage`] requests.
#[derive(Debug, Clone)]
pub enum CacheResponse {
    /// Stored entry for a `Get`; `None` when absent.
    Entry(Option<CacheEntry>),
    /// Outcome of a `Write`.
    Written(WriteReply),
    /// Outcome of a `RenewBias`; `None` means the lease is gone.
    Renewed {
        /// Extended lease duration.
        lease: Option<Duration>,
    },
    /// Number of copies dropped by an `InvalidateVersions` or
    /// `ReleaseCopies`.
    Invalidated {
        /// Copies dropped.
        dropped: usize,
    },
    /// Copies returned for a `SegmentEntries`.
    Entries(Vec<CacheEntry>),
    /// Plain acknowledgement.
    Ack,
    /// The receiver refused the request.
    Rejected(RejectReason),
}

impl CacheResponse {
    /// Variant name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            CacheResponse::Entry(_) => "entry",
            CacheResponse::Written(_) => "written",
            CacheResponse::Renewed { .. } => "renewed",
            CacheResponse::Invalidated { .. } => "invalidated",
            CacheResponse::Entries(_) => "entries",
            CacheResponse::Ack => "ack",
            CacheResponse::Rejected(_) => "rejected",
        }
    }
}
