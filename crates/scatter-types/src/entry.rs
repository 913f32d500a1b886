//! Stored cache entries and tombstones.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::version::EntryVersion;

/// Expiration settings attached to a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry expires this long after it was written.
    pub lifespan: Option<Duration>,
    /// Entry expires when not read for this long.
    pub max_idle: Option<Duration>,
}

impl EntryMetadata {
    /// Metadata with a fixed lifespan and no idle limit.
    pub fn with_lifespan(lifespan: Duration) -> Self {
        Self {
            lifespan: Some(lifespan),
            max_idle: None,
        }
    }

    /// Metadata with an idle limit and no fixed lifespan.
    pub fn with_max_idle(max_idle: Duration) -> Self {
        Self {
            lifespan: None,
            max_idle: Some(max_idle),
        }
    }
}

/// A versioned entry held by a node, either as primary owner or as a backup.
///
/// A `value` of `None` marks a tombstone: a removal that still carries the
/// version of the removing write so that stale copies elsewhere can be
/// recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The key.
    pub key: Bytes,
    /// The value, or `None` for a tombstone.
    pub value: Option<Bytes>,
    /// Version issued by the primary owner.
    pub version: EntryVersion,
    /// Expiration settings.
    pub metadata: EntryMetadata,
    /// When this copy was committed.
    pub created: Instant,
    /// Last time this copy was read.
    pub last_used: Instant,
}

impl CacheEntry {
    /// A live entry committed at `now`.
    pub fn new(
        key: Bytes,
        value: Bytes,
        version: EntryVersion,
        metadata: EntryMetadata,
        now: Instant,
    ) -> Self {
        Self {
            key,
            value: Some(value),
            version,
            metadata,
            created: now,
            last_used: now,
        }
    }

    /// A tombstone committed at `now`.
    pub fn tombstone(key: Bytes, version: EntryVersion, now: Instant) -> Self {
        Self {
            key,
            value: None,
            version,
            metadata: EntryMetadata::default(),
            created: now,
            last_used: now,
        }
    }

    /// Whether this entry records a removal.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the entry's lifespan or idle time has run out at `now`.
    ///
    /// Tombstones never expire; they are purged by removal invalidation.
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.is_tombstone() {
            return false;
        }
        if let Some(lifespan) = self.metadata.lifespan
            && now >= self.created + lifespan
        {
            return true;
        }
        if let Some(max_idle) = self.metadata.max_idle
            && now >= self.last_used + max_idle
        {
            return true;
        }
        false
    }

    /// The value visible to readers at `now`: `None` for tombstones and
    /// expired entries.
    pub fn live_value(&self, now: Instant) -> Option<&Bytes> {
        if self.is_expired(now) {
            None
        } else {
            self.value.as_ref()
        }
    }

    /// Record a read at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }
}
