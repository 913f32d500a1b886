//! Core trait and types for entry storage.

use bytes::Bytes;
use scatter_types::{CacheEntry, EntryVersion, SegmentId, VersionOrdering};
use tokio::time::Instant;
use tracing::error;

use crate::error::StoreError;

/// What a [`EntryStore::compute`] callback wants done with the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    /// Leave the stored entry untouched.
    Keep,
    /// Replace (or create) the stored entry.
    Put(CacheEntry),
    /// Drop the key entirely. Used for purges, not for user removals,
    /// which store a tombstone instead.
    Purge,
}

/// Outcome of an [`EntryStore::compute`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeResult {
    /// Entry stored before the call.
    pub previous: Option<CacheEntry>,
    /// Entry stored after the call.
    pub current: Option<CacheEntry>,
    /// Whether the callback changed anything.
    pub written: bool,
}

/// Per-node storage of versioned entries, partitioned by segment.
///
/// All implementations must be `Send + Sync`. Every method is atomic with
/// respect to a single key; [`EntryStore::compute`] is the building block
/// for read-modify-write under the key's lock.
pub trait EntryStore: Send + Sync {
    /// Number of segments this store was partitioned into.
    fn num_segments(&self) -> u32;

    /// Read the entry for `key`, recording the access at `now`.
    ///
    /// Expired entries read as absent. Tombstones are returned as stored.
    fn get(
        &self,
        segment: SegmentId,
        key: &[u8],
        now: Instant,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Read the raw entry without touching access time or checking expiry.
    fn peek(&self, segment: SegmentId, key: &[u8]) -> Result<Option<CacheEntry>, StoreError>;

    /// Unconditionally store `entry`, returning what it replaced.
    fn put(&self, segment: SegmentId, entry: CacheEntry) -> Result<Option<CacheEntry>, StoreError>;

    /// Drop `key`, returning what was stored.
    fn purge(&self, segment: SegmentId, key: &[u8]) -> Result<Option<CacheEntry>, StoreError>;

    /// Atomically inspect and update `key`.
    fn compute(
        &self,
        segment: SegmentId,
        key: &Bytes,
        f: &mut dyn FnMut(Option<&CacheEntry>) -> StoreWrite,
    ) -> Result<ComputeResult, StoreError>;

    /// Snapshot every entry (tombstones included) held for `segments`.
    fn entries_in_segments(&self, segments: &[SegmentId]) -> Result<Vec<CacheEntry>, StoreError>;

    /// Drop every entry whose lifespan or idle time ran out at `now`.
    ///
    /// Tombstones are left for removal invalidation. Returns how many
    /// entries were dropped.
    fn purge_expired(&self, now: Instant) -> Result<usize, StoreError>;

    /// Number of stored entries, tombstones included.
    fn len(&self) -> usize;

    /// Whether the store holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `entry` only if it is newer than what is held.
    ///
    /// Returns `true` when the entry was committed. Equal, older or
    /// conflicting versions are ignored.
    fn commit_if_newer(&self, segment: SegmentId, entry: CacheEntry) -> Result<bool, StoreError> {
        let key = entry.key.clone();
        let result = self.compute(segment, &key, &mut |existing| match existing {
            Some(current) if !entry.version.is_newer_than(&current.version) => StoreWrite::Keep,
            _ => StoreWrite::Put(entry.clone()),
        })?;
        Ok(result.written)
    }

    /// Drop a stale copy of `key` named by an invalidation.
    ///
    /// A regular invalidation drops copies strictly older than `version`.
    /// A removal invalidation also drops a tombstone carrying exactly
    /// `version`. Returns `true` when something was dropped.
    fn invalidate(
        &self,
        segment: SegmentId,
        key: &Bytes,
        version: &EntryVersion,
        removal: bool,
    ) -> Result<bool, StoreError> {
        let result = self.compute(segment, key, &mut |existing| {
            let Some(current) = existing else {
                return StoreWrite::Keep;
            };
            match current.version.compare(version) {
                VersionOrdering::Before => StoreWrite::Purge,
                VersionOrdering::Equal if removal && current.is_tombstone() => StoreWrite::Purge,
                VersionOrdering::Conflicting => {
                    error!(
                        segment,
                        stored = %current.version,
                        invalidated = %version,
                        "conflicting versions in invalidation, keeping stored copy"
                    );
                    StoreWrite::Keep
                }
                VersionOrdering::Equal | VersionOrdering::After => StoreWrite::Keep,
            }
        })?;
        Ok(result.written)
    }

    /// Drop a copy of `key` that the owner and its backup superseded or
    /// already hold, i.e. any version up to and including `version`.
    ///
    /// Returns `true` when something was dropped.
    fn release(
        &self,
        segment: SegmentId,
        key: &Bytes,
        version: &EntryVersion,
    ) -> Result<bool, StoreError> {
        let result = self.compute(segment, key, &mut |existing| {
            let Some(current) = existing else {
                return StoreWrite::Keep;
            };
            match current.version.compare(version) {
                VersionOrdering::Before | VersionOrdering::Equal => StoreWrite::Purge,
                VersionOrdering::Conflicting => {
                    error!(
                        segment,
                        stored = %current.version,
                        released = %version,
                        "conflicting versions in release, keeping stored copy"
                    );
                    StoreWrite::Keep
                }
                VersionOrdering::After => StoreWrite::Keep,
            }
        })?;
        Ok(result.written)
    }
}
