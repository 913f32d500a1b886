//! Versioned entry storage for Scatter.
//!
//! This crate defines the [`EntryStore`] trait used by a node to hold the
//! entries it owns and the backup copies it keeps for other owners, along
//! with the in-memory [`MemoryStore`] backend.
//!
//! Entries are partitioned by segment so ownership changes can snapshot
//! whole segments, and every mutation goes through a per-key atomic
//! [`EntryStore::compute`].

mod error;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use memory_store::MemoryStore;
pub use traits::{ComputeResult, EntryStore, StoreWrite};
