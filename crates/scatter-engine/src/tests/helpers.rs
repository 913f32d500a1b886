//! Shared test utilities for scatter-engine tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use scatter_cluster::ClusterState;
use scatter_net::{LocalNetwork, MessageHandler};
use scatter_placement::{RingOracle, Topology};
use scatter_store::MemoryStore;
use scatter_types::{Address, Member};

use crate::config::CacheConfig;
use crate::node::ScatterNode;
use crate::rebalance::rebalance_cluster;

pub fn node_address(i: u8) -> Address {
    Address::from([i; 32])
}

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Small segment count and short timeouts.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        num_segments: 16,
        vnodes_per_node: 16,
        remote_timeout: Duration::from_secs(2),
        revocation_timeout: Duration::from_millis(200),
        revocation_backoff: Duration::from_millis(20),
        routing_backoff: Duration::from_millis(20),
        ..CacheConfig::default()
    }
}

/// Build a node for `address` and register it on `network`.
pub fn spawn_node(
    network: &Arc<LocalNetwork>,
    config: &CacheConfig,
    address: Address,
    topology: Arc<Topology>,
) -> Arc<ScatterNode> {
    let store = Arc::new(MemoryStore::unbounded(config.num_segments));
    let node = ScatterNode::new(config.clone(), store, network.endpoint(address), topology).unwrap();
    let handler: Arc<dyn MessageHandler> = node.clone();
    network.register(address, &handler);
    node
}

/// N nodes over one in-process network, sharing one membership view.
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub cluster: Arc<ClusterState>,
    pub nodes: Vec<Arc<ScatterNode>>,
    pub config: CacheConfig,
}

pub async fn cluster(n: u8) -> TestCluster {
    cluster_with(n, test_config()).await
}

pub async fn cluster_with(n: u8, config: CacheConfig) -> TestCluster {
    let network = LocalNetwork::new();
    let oracle = Arc::new(RingOracle::new(config.num_segments, config.vnodes_per_node));
    let cluster = ClusterState::new(oracle);
    for i in 1..=n {
        cluster.add_member(Member::alive(node_address(i))).await;
    }
    let topology = cluster.rebalance().await.unwrap();
    let nodes = (1..=n)
        .map(|i| spawn_node(&network, &config, node_address(i), topology.clone()))
        .collect();
    TestCluster {
        network,
        cluster,
        nodes,
        config,
    }
}

impl TestCluster {
    pub fn topology(&self) -> Arc<Topology> {
        self.nodes[0].topology()
    }

    pub fn index_of(&self, address: &Address) -> usize {
        self.nodes
            .iter()
            .position(|n| n.address() == *address)
            .unwrap()
    }

    /// Index of the key's primary owner.
    pub fn owner_of(&self, key: &[u8]) -> usize {
        self.index_of(&self.topology().primary_owner(key))
    }

    /// Index of the owner's backup for owner-originated writes.
    pub fn backup_of(&self, key: &[u8]) -> usize {
        let topology = self.topology();
        let owner = topology.primary_owner(key);
        self.index_of(&topology.next_member(&owner).unwrap())
    }

    /// Indices of the nodes that do not own `key`.
    pub fn non_owners_of(&self, key: &[u8]) -> Vec<usize> {
        let owner = self.owner_of(key);
        (0..self.nodes.len()).filter(|i| *i != owner).collect()
    }

    /// A key whose primary owner is node `index`.
    pub fn key_owned_by(&self, index: usize, prefix: &str) -> Bytes {
        let target = self.nodes[index].address();
        let topology = self.topology();
        (0..10_000)
            .map(|n| b(&format!("{prefix}-{n}")))
            .find(|key| topology.primary_owner(key) == target)
            .unwrap()
    }

    /// Run a forced invalidation round on every node and wait for
    /// fire-and-forget traffic to settle.
    pub async fn flush_all(&self) {
        self.network.quiesce().await;
        for node in &self.nodes {
            node.flush_invalidations(true).await;
        }
        self.network.quiesce().await;
    }

    /// Add a fresh node and rebalance. Returns its index.
    pub async fn join(&mut self, i: u8) -> usize {
        let address = node_address(i);
        self.cluster.add_member(Member::alive(address)).await;
        let node = spawn_node(&self.network, &self.config, address, self.topology());
        self.nodes.push(node);
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
        self.nodes.len() - 1
    }

    /// Gracefully remove node `index` and rebalance.
    pub async fn leave(&mut self, index: usize) -> Arc<ScatterNode> {
        let address = self.nodes[index].address();
        self.cluster.remove_member(&address).await.unwrap();
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
        let node = self.nodes.remove(index);
        self.network.unregister(&address);
        node
    }

    /// Kill node `index` without warning and rebalance the survivors.
    pub async fn crash(&mut self, index: usize) {
        let address = self.nodes[index].address();
        self.network.set_down(address, true);
        self.nodes.remove(index);
        self.cluster.mark_dead(&address).await.unwrap();
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
    }
}
