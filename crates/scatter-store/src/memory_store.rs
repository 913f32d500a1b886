//! In-memory entry storage backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use scatter_types::{CacheEntry, SegmentId};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::traits::{ComputeResult, EntryStore, StoreWrite};

type Segment = RwLock<HashMap<Bytes, CacheEntry>>;

/// In-memory entry store: one `RwLock<HashMap>` per segment.
///
/// Tracks the number of stored entries against a configurable maximum.
pub struct MemoryStore {
    segments: Vec<Segment>,
    entries: AtomicUsize,
    max_entries: usize,
}

impl MemoryStore {
    /// Create a store with `num_segments` partitions holding at most
    /// `max_entries` entries.
    pub fn new(num_segments: u32, max_entries: usize) -> Self {
        Self {
            segments: (0..num_segments)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            entries: AtomicUsize::new(0),
            max_entries,
        }
    }

    /// Create a store without an entry limit.
    pub fn unbounded(num_segments: u32) -> Self {
        Self::new(num_segments, usize::MAX)
    }

    fn segment(&self, segment: SegmentId) -> Result<&Segment, StoreError> {
        self.segments
            .get(segment as usize)
            .ok_or(StoreError::SegmentOutOfRange {
                segment,
                num_segments: self.segments.len() as u32,
            })
    }

    fn reserve_slot(&self) -> Result<(), StoreError> {
        let reserved = self
            .entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            });
        reserved.map(|_| ()).map_err(|_| StoreError::CapacityExceeded {
            max_entries: self.max_entries,
        })
    }

    fn release_slot(&self) {
        self.entries.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EntryStore for MemoryStore {
    fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    fn get(
        &self,
        segment: SegmentId,
        key: &[u8],
        now: Instant,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let mut map = self.segment(segment)?.write().expect("lock poisoned");
        match map.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                trace!(segment, "expired entry read as absent");
                Ok(None)
            }
            Some(entry) => {
                entry.touch(now);
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    fn peek(&self, segment: SegmentId, key: &[u8]) -> Result<Option<CacheEntry>, StoreError> {
        let map = self.segment(segment)?.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn put(&self, segment: SegmentId, entry: CacheEntry) -> Result<Option<CacheEntry>, StoreError> {
        let mut map = self.segment(segment)?.write().expect("lock poisoned");
        if !map.contains_key(&entry.key) {
            self.reserve_slot()?;
        }
        Ok(map.insert(entry.key.clone(), entry))
    }

    fn purge(&self, segment: SegmentId, key: &[u8]) -> Result<Option<CacheEntry>, StoreError> {
        let mut map = self.segment(segment)?.write().expect("lock poisoned");
        let removed = map.remove(key);
        if removed.is_some() {
            self.release_slot();
            debug!(segment, "purged entry");
        }
        Ok(removed)
    }

    fn compute(
        &self,
        segment: SegmentId,
        key: &Bytes,
        f: &mut dyn FnMut(Option<&CacheEntry>) -> StoreWrite,
    ) -> Result<ComputeResult, StoreError> {
        let mut map = self.segment(segment)?.write().expect("lock poisoned");
        let previous = map.get(key).cloned();

        match f(previous.as_ref()) {
            StoreWrite::Keep => Ok(ComputeResult {
                current: previous.clone(),
                previous,
                written: false,
            }),
            StoreWrite::Put(entry) => {
                if previous.is_none() {
                    self.reserve_slot()?;
                }
                map.insert(key.clone(), entry.clone());
                Ok(ComputeResult {
                    previous,
                    current: Some(entry),
                    written: true,
                })
            }
            StoreWrite::Purge => {
                let written = map.remove(key).is_some();
                if written {
                    self.release_slot();
                }
                Ok(ComputeResult {
                    previous,
                    current: None,
                    written,
                })
            }
        }
    }

    fn entries_in_segments(&self, segments: &[SegmentId]) -> Result<Vec<CacheEntry>, StoreError> {
        let mut entries = Vec::new();
        for segment in segments {
            let map = self.segment(*segment)?.read().expect("lock poisoned");
            entries.extend(map.values().cloned());
        }
        Ok(entries)
    }

    fn purge_expired(&self, now: Instant) -> Result<usize, StoreError> {
        let mut purged = 0;
        for (segment, map) in self.segments.iter().enumerate() {
            let mut map = map.write().expect("lock poisoned");
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            let dropped = before - map.len();
            if dropped > 0 {
                self.entries.fetch_sub(dropped, Ordering::AcqRel);
                trace!(segment, dropped, "expired entries purged");
                purged += dropped;
            }
        }
        Ok(purged)
    }

    fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("segments", &self.segments.len())
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
