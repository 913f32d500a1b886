//! Entry versions issued by primary owners.
//!
//! A version is the pair `(topology_id, counter)` plus the address of the
//! owner that issued it. Versions from a newer topology always win. Within
//! one topology, the counter decides. Two versions with the same pair but
//! different issuers cannot be ordered and compare as
//! [`VersionOrdering::Conflicting`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Address, TopologyId};

/// Result of comparing two [`EntryVersion`]s, read as "`self` is ... `other`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Same version from the same issuer.
    Equal,
    /// Same `(topology_id, counter)` issued by two different owners.
    Conflicting,
}

/// Version stamped on every committed entry and tombstone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryVersion {
    topology_id: TopologyId,
    counter: u64,
    issuer: Address,
}

impl EntryVersion {
    /// Create a version issued by `issuer` in topology `topology_id`.
    pub fn new(topology_id: TopologyId, counter: u64, issuer: Address) -> Self {
        Self {
            topology_id,
            counter,
            issuer,
        }
    }

    /// Topology in which the version was issued.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Per-segment counter value.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Owner that issued this version.
    pub fn issuer(&self) -> Address {
        self.issuer
    }

    /// Compare `self` against `other`.
    pub fn compare(&self, other: &EntryVersion) -> VersionOrdering {
        match (self.topology_id, self.counter).cmp(&(other.topology_id, other.counter)) {
            Ordering::Less => VersionOrdering::Before,
            Ordering::Greater => VersionOrdering::After,
            Ordering::Equal if self.issuer == other.issuer => VersionOrdering::Equal,
            Ordering::Equal => VersionOrdering::Conflicting,
        }
    }

    /// Whether `self` strictly supersedes `other`.
    pub fn is_newer_than(&self, other: &EntryVersion) -> bool {
        self.compare(other) == VersionOrdering::After
    }

    /// The next version in the same topology, issued by the same owner.
    pub fn next(&self) -> Self {
        Self {
            counter: self.counter + 1,
            ..*self
        }
    }
}

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.topology_id,
            self.counter,
            self.issuer.fmt_short()
        )
    }
}

impl fmt::Debug for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryVersion({self})")
    }
}
