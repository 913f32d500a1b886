//! Node orchestrator of a scattered in-memory cache.
//!
//! Each key has exactly one primary owner, chosen by segment. Writes are
//! executed at the owner, which versions them and hands the committed
//! entry to one backup. Stale copies left on other nodes are cleaned up by
//! background invalidation rounds, and nodes that write a key remotely get
//! a short read lease so they can serve it locally.
//!
//! Applications depend on the [`ScatterCache`] trait; [`ScatterNode`] is
//! its implementation.

pub mod bias;
pub mod config;
pub mod engine;
pub mod error;
mod handler;
pub mod node;
mod read;
pub mod rebalance;
pub mod svm;
pub mod telemetry;
mod write;

pub use bias::BiasManager;
pub use config::{CacheConfig, ScatterConfigFile};
pub use engine::ScatterCache;
pub use error::EngineError;
pub use node::ScatterNode;
pub use rebalance::{TopologyTransition, rebalance_cluster};
pub use svm::{
    BatchKind, BatchObserver, BatchState, InvalidationBatch, RoundSummary, ScatteredVersionManager,
    SegmentState,
};

#[cfg(test)]
mod tests;
