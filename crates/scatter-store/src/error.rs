//! Error types for entry storage operations.

use scatter_types::SegmentId;

/// Errors that can occur during entry storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The segment index is outside the store's partitioning.
    #[error("segment {segment} out of range (store has {num_segments} segments)")]
    SegmentOutOfRange {
        /// The requested segment.
        segment: SegmentId,
        /// Segments the store was created with.
        num_segments: u32,
    },

    /// The store has reached its entry limit.
    #[error("store capacity exceeded: limit is {max_entries} entries")]
    CapacityExceeded {
        /// Configured maximum number of entries.
        max_entries: usize,
    },
}
