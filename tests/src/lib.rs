//! Shared test harness for Scatter integration tests.
//!
//! Provides [`IntegrationCluster`]: N cache nodes over one in-process
//! network, sharing one membership view, with helpers to grow, shrink and
//! break the cluster the way an operator or a failure would.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use scatter_cluster::ClusterState;
use scatter_engine::{CacheConfig, ScatterNode, rebalance_cluster};
use scatter_net::{LocalNetwork, MessageHandler};
use scatter_placement::{RingOracle, Topology};
use scatter_store::MemoryStore;
use scatter_types::{Address, Member};

/// Settings with short intervals so background work is observable quickly.
pub fn fast_config() -> CacheConfig {
    CacheConfig {
        num_segments: 64,
        vnodes_per_node: 32,
        invalidation_scan_interval: Duration::from_millis(20),
        bias_scan_interval: Duration::from_millis(50),
        remote_timeout: Duration::from_secs(2),
        revocation_timeout: Duration::from_millis(200),
        revocation_backoff: Duration::from_millis(10),
        routing_backoff: Duration::from_millis(20),
        ..CacheConfig::default()
    }
}

/// Deterministic address for seed `i`.
pub fn address(i: u8) -> Address {
    Address::from_data(&[i])
}

/// A simulated N-node cache cluster.
pub struct IntegrationCluster {
    network: Arc<LocalNetwork>,
    cluster: Arc<ClusterState>,
    nodes: Vec<Arc<ScatterNode>>,
    config: CacheConfig,
    next_seed: u8,
    started: bool,
}

impl IntegrationCluster {
    /// Create an N-node cluster with [`fast_config`].
    pub async fn new(n: usize) -> Self {
        Self::with_config(n, fast_config()).await
    }

    /// Create an N-node cluster with custom settings.
    pub async fn with_config(n: usize, config: CacheConfig) -> Self {
        assert!(n >= 1, "need at least 1 node");
        assert!(n < 200, "too many nodes");
        scatter_engine::telemetry::init("warn");

        let network = LocalNetwork::new();
        let oracle = Arc::new(RingOracle::new(config.num_segments, config.vnodes_per_node));
        let cluster = ClusterState::new(oracle);
        for seed in 1..=n as u8 {
            cluster.add_member(Member::alive(address(seed))).await;
        }
        let topology = cluster.rebalance().await.unwrap();

        let mut c = Self {
            network,
            cluster,
            nodes: Vec::with_capacity(n),
            config,
            next_seed: n as u8 + 1,
            started: false,
        };
        for seed in 1..=n as u8 {
            let node = c.spawn(address(seed), topology.clone());
            c.nodes.push(node);
        }
        c
    }

    fn spawn(&self, address: Address, topology: Arc<Topology>) -> Arc<ScatterNode> {
        let store = Arc::new(MemoryStore::unbounded(self.config.num_segments));
        let node = ScatterNode::new(
            self.config.clone(),
            store,
            self.network.endpoint(address),
            topology,
        )
        .unwrap();
        let handler: Arc<dyn MessageHandler> = node.clone();
        self.network.register(address, &handler);
        if self.started {
            node.start();
        }
        node
    }

    /// Run invalidation rounds and lease scans in the background on every
    /// node, including nodes added later.
    pub fn start(&mut self) {
        self.started = true;
        for node in &self.nodes {
            node.start();
        }
    }

    /// Stop background work on every node.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }

    /// Get a reference to node `i`.
    pub fn node(&self, i: usize) -> &Arc<ScatterNode> {
        &self.nodes[i]
    }

    /// All live nodes.
    pub fn nodes(&self) -> &[Arc<ScatterNode>] {
        &self.nodes
    }

    /// Number of nodes in the cluster.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The in-process network, for fault injection and traffic counters.
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Topology installed on the first node.
    pub fn topology(&self) -> Arc<Topology> {
        self.nodes[0].topology()
    }

    /// Index of the primary owner of `key`.
    pub fn owner_of(&self, key: &[u8]) -> usize {
        let owner = self.topology().primary_owner(key);
        self.nodes
            .iter()
            .position(|n| n.address() == owner)
            .unwrap()
    }

    /// A key whose primary owner is node `i`.
    pub fn key_owned_by(&self, i: usize, prefix: &str) -> Bytes {
        let target = self.nodes[i].address();
        let topology = self.topology();
        (0..100_000)
            .map(|n| Bytes::from(format!("{prefix}-{n}")))
            .find(|key| topology.primary_owner(key) == target)
            .unwrap()
    }

    /// Nodes that hold any stored copy of `key`, tombstones included.
    pub fn holders_of(&self, key: &[u8]) -> Vec<usize> {
        let segment = self.topology().segment_of(key);
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.store().peek(segment, key).unwrap().is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Wait for fire-and-forget traffic (backups, revocations) to land.
    pub async fn quiesce(&self) {
        self.network.quiesce().await;
    }

    /// Run a forced invalidation round everywhere.
    pub async fn flush_all(&self) {
        self.quiesce().await;
        for node in &self.nodes {
            node.flush_invalidations(true).await;
        }
        self.quiesce().await;
    }

    /// Add a fresh node and rebalance. Returns its index.
    pub async fn add_node(&mut self) -> usize {
        let address = address(self.next_seed);
        self.next_seed += 1;
        self.cluster.add_member(Member::alive(address)).await;
        let node = self.spawn(address, self.topology());
        self.nodes.push(node);
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
        self.nodes.len() - 1
    }

    /// Gracefully remove node `i`: it hands its segments over before it
    /// leaves the network.
    pub async fn leave_node(&mut self, i: usize) {
        let address = self.nodes[i].address();
        self.quiesce().await;
        self.cluster.remove_member(&address).await.unwrap();
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
        let node = self.nodes.remove(i);
        node.shutdown().await;
        self.network.unregister(&address);
    }

    /// Crash node `i` without warning and rebalance the survivors.
    pub async fn kill_node(&mut self, i: usize) {
        let address = self.nodes[i].address();
        self.network.set_down(address, true);
        let node = self.nodes.remove(i);
        node.shutdown().await;
        self.cluster.mark_dead(&address).await.unwrap();
        rebalance_cluster(&self.cluster, &self.nodes).await.unwrap();
    }
}

/// Poll `check` until it holds or `deadline` passes.
pub async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= give_up {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Value written for key number `i` in generation `generation`.
pub fn value_for(i: usize, generation: u32) -> Bytes {
    Bytes::from(format!("value-{i}-gen-{generation}"))
}
