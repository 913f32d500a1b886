//! Cluster membership and topology publication.
//!
//! [`ClusterState`] tracks members and turns the alive set into numbered
//! [`Topology`](scatter_placement::Topology) values. Nodes install those
//! topologies through the engine's rebalance coordinator.

mod error;
mod state;


pub use error::ClusterError;
pub use state::ClusterState;
