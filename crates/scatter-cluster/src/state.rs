//! Cluster state: live membership view and the installed topology.
//!
//! [`ClusterState`] is the shared, read-mostly data structure that decides
//! who is in the cluster and publishes numbered topologies built from the
//! alive members.

use std::collections::HashMap;
use std::sync::Arc;

use scatter_placement::{OwnershipOracle, Topology};
use scatter_types::{Address, ClusterEvent, Member, MemberState};
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use crate::error::ClusterError;

/// Shared cluster state: members, the current topology, and a broadcast
/// channel through which other components subscribe to cluster events.
pub struct ClusterState {
    /// Current cluster members, keyed by address.
    members: RwLock<HashMap<Address, Member>>,
    /// Last published topology, `None` until the first rebalance.
    topology: RwLock<Option<Arc<Topology>>>,
    /// Computes segment ownership for new topologies.
    oracle: Arc<dyn OwnershipOracle>,
    /// Broadcast channel for cluster events.
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterState {
    /// Create an empty cluster state.
    pub fn new(oracle: Arc<dyn OwnershipOracle>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            members: RwLock::new(HashMap::new()),
            topology: RwLock::new(None),
            oracle,
            event_tx,
        })
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    /// The oracle used to build topologies.
    pub fn oracle(&self) -> &Arc<dyn OwnershipOracle> {
        &self.oracle
    }

    /// Add or update a member.
    ///
    /// Membership changes take effect on routing only after the next
    /// [`ClusterState::rebalance`].
    pub async fn add_member(&self, member: Member) {
        let address = member.address;
        self.members.write().await.insert(address, member);

        info!(node = %address.fmt_short(), "member joined cluster");
        let _ = self.event_tx.send(ClusterEvent::MemberJoined(address));
    }

    /// Remove a member (graceful departure).
    pub async fn remove_member(&self, address: &Address) -> Result<(), ClusterError> {
        self.members
            .write()
            .await
            .remove(address)
            .ok_or(ClusterError::MemberNotFound(*address))?;

        info!(node = %address.fmt_short(), "member left cluster");
        let _ = self.event_tx.send(ClusterEvent::MemberLeft(*address));
        Ok(())
    }

    /// Mark a member as dead (failure detected).
    pub async fn mark_dead(&self, address: &Address) -> Result<(), ClusterError> {
        {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(address)
                .ok_or(ClusterError::MemberNotFound(*address))?;
            member.state = MemberState::Dead;
        }

        info!(node = %address.fmt_short(), "member declared dead");
        let _ = self.event_tx.send(ClusterEvent::MemberDead(*address));
        Ok(())
    }

    /// Build and publish a new topology from the alive members.
    ///
    /// The new topology's id is one greater than the previous one.
    pub async fn rebalance(&self) -> Result<Arc<Topology>, ClusterError> {
        let alive = self.alive_addresses().await;
        if alive.is_empty() {
            return Err(ClusterError::NoAliveMembers);
        }

        let mut current = self.topology.write().await;
        let next_id = current.as_ref().map_or(1, |t| t.id() + 1);
        let topology = Arc::new(Topology::new(next_id, &alive, self.oracle.as_ref())?);
        *current = Some(topology.clone());
        drop(current);

        info!(
            topology_id = next_id,
            members = alive.len(),
            "published new topology"
        );
        let _ = self.event_tx.send(ClusterEvent::TopologyChanged(next_id));
        Ok(topology)
    }

    /// The last published topology.
    pub async fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.read().await.clone()
    }

    /// Snapshot of all current members.
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    /// A specific member by address.
    pub async fn get_member(&self, address: &Address) -> Option<Member> {
        self.members.read().await.get(address).cloned()
    }

    /// Number of members, dead ones included.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Number of alive members.
    pub async fn alive_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.state == MemberState::Alive)
            .count()
    }

    /// Addresses of alive members, sorted.
    pub async fn alive_addresses(&self) -> Vec<Address> {
        let mut alive: Vec<Address> = self
            .members
            .read()
            .await
            .values()
            .filter(|m| m.state == MemberState::Alive)
            .map(|m| m.address)
            .collect();
        alive.sort();
        alive
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("oracle", &self.oracle)
            .finish_non_exhaustive()
    }
}
