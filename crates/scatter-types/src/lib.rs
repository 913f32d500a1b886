//! Shared types and identifiers for Scatter.
//!
//! This crate defines the core types used across the Scatter workspace:
//! node identity ([`Address`]), ownership coordinates ([`SegmentId`],
//! [`TopologyId`]), the version model ([`EntryVersion`], [`VersionOrdering`]),
//! stored entries and tombstones ([`CacheEntry`], [`EntryMetadata`]),
//! cluster types ([`Member`], [`MemberState`], [`ClusterEvent`]) and the
//! bias acquisition mode ([`BiasAcquisition`]).

use std::fmt;

use serde::{Deserialize, Serialize};

mod entry;
mod version;

pub use entry::{CacheEntry, EntryMetadata};
pub use version::{EntryVersion, VersionOrdering};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Short hex prefix, handy in log lines.
            pub fn fmt_short(&self) -> String {
                self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.fmt_short())
            }
        }
    };
}

define_id!(
    /// Address of a cluster node. Totally ordered so members can be sorted
    /// into the deterministic order used for backup selection.
    Address
);

/// Monotonically increasing identifier of an installed topology.
pub type TopologyId = u32;

/// Index of a hash-space segment. Keys map to exactly one segment.
pub type SegmentId = u32;

// ---------------------------------------------------------------------------
// Cluster types
// ---------------------------------------------------------------------------

/// A member of the Scatter cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Address of this node.
    pub address: Address,
    /// Current membership state.
    pub state: MemberState,
    /// Incarnation number, incremented on each restart.
    pub generation: u64,
}

impl Member {
    /// A freshly joined, alive member.
    pub fn alive(address: Address) -> Self {
        Self {
            address,
            state: MemberState::Alive,
            generation: 1,
        }
    }
}

/// Membership state of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Node is healthy and participating.
    Alive,
    /// Node announced a graceful departure.
    Leaving,
    /// Node has been declared failed.
    Dead,
}

/// Events emitted by the cluster state when membership or topology changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A new node joined the cluster.
    MemberJoined(Address),
    /// A node left the cluster gracefully.
    MemberLeft(Address),
    /// A node was declared dead.
    MemberDead(Address),
    /// A new topology was computed and published.
    TopologyChanged(TopologyId),
}

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// When a writing non-owner acquires a read lease (bias) on the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasAcquisition {
    /// Never grant leases; every non-owner read is forwarded.
    Never,
    /// Grant a lease to the originator of each successful remote write.
    #[default]
    OnWrite,
}
