//! Invalidation batches and their lifecycle.

use std::collections::BTreeSet;

use bytes::Bytes;
use scatter_net::{CacheMessage, Invalidation};
use scatter_placement::Topology;
use scatter_types::{Address, EntryVersion};

/// Which kind of round a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Drops copies older than the committed versions.
    Regular,
    /// Drops tombstones once every member has seen the removal.
    Removal,
}

/// Lifecycle of a batch: `Pending -> InFlight -> Finished`, falling back to
/// `Pending` when some target failed to acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    InFlight,
    Finished,
}

/// Notified once per batch when it finishes.
pub trait BatchObserver: Send + Sync {
    /// Every member acknowledged a regular batch.
    fn regular_batch_finished(&self, _keys: &[Bytes], _versions: &[EntryVersion], _removed: &[bool]) {
    }

    /// Every member acknowledged a removal batch and the owner purged its
    /// own tombstones.
    fn removal_batch_finished(&self, _keys: &[Bytes], _versions: &[EntryVersion]) {}
}

/// A set of invalidations sent to every other member.
#[derive(Debug, Clone)]
pub struct InvalidationBatch {
    id: u64,
    kind: BatchKind,
    state: BatchState,
    entries: Vec<Invalidation>,
    /// Targets that have not acknowledged yet.
    pending: BTreeSet<Address>,
    attempts: u32,
}

impl InvalidationBatch {
    /// A new pending batch for `targets`.
    pub fn new(
        id: u64,
        kind: BatchKind,
        entries: Vec<Invalidation>,
        targets: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            id,
            kind,
            state: BatchState::Pending,
            entries,
            pending: targets.into_iter().collect(),
            attempts: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn entries(&self) -> &[Invalidation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Targets still owing an acknowledgement.
    pub fn pending_targets(&self) -> Vec<Address> {
        self.pending.iter().copied().collect()
    }

    /// Stop waiting for targets that left the topology.
    pub fn forget_leavers(&mut self, topology: &Topology) {
        self.pending.retain(|target| topology.is_member(target));
    }

    /// The message sent to every pending target.
    pub fn message(&self) -> CacheMessage {
        CacheMessage::InvalidateVersions {
            entries: self.entries.clone(),
            removal: self.kind == BatchKind::Removal,
        }
    }

    /// Mark the batch as sent.
    pub fn begin_attempt(&mut self) {
        self.state = BatchState::InFlight;
        self.attempts += 1;
    }

    /// Record an acknowledgement from `target`.
    pub fn ack(&mut self, target: &Address) {
        self.pending.remove(target);
    }

    /// Resolve the attempt: finished once nobody is pending.
    pub fn settle(&mut self) -> BatchState {
        self.state = if self.pending.is_empty() {
            BatchState::Finished
        } else {
            BatchState::Pending
        };
        self.state
    }

    pub fn keys(&self) -> Vec<Bytes> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn versions(&self) -> Vec<EntryVersion> {
        self.entries.iter().map(|e| e.version).collect()
    }

    pub fn removed_flags(&self) -> Vec<bool> {
        self.entries.iter().map(|e| e.removed).collect()
    }
}
