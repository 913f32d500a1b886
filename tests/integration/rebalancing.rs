//! Integration test: rebalancing.
//!
//! Grow a cluster under data, then shrink it gracefully. Every key must
//! stay readable from every node after each step.

use bytes::Bytes;
use scatter_engine::{ScatterCache, SegmentState};
use scatter_integration_tests::{IntegrationCluster, value_for};

const KEYS: usize = 200;

async fn write_all(c: &IntegrationCluster, generation: u32) {
    for i in 0..KEYS {
        let key = Bytes::from(format!("rb-{i}"));
        c.node(i % c.len())
            .put(key, value_for(i, generation))
            .await
            .unwrap();
    }
    c.quiesce().await;
}

async fn verify_all(c: &IntegrationCluster, generation: u32) {
    for (n, node) in c.nodes().iter().enumerate() {
        for i in 0..KEYS {
            let key = Bytes::from(format!("rb-{i}"));
            assert_eq!(
                node.get(&key).await.unwrap(),
                Some(value_for(i, generation)),
                "key {i} on node {n}"
            );
        }
    }
}

fn assert_two_copies(c: &IntegrationCluster) {
    for i in 0..KEYS {
        let key = Bytes::from(format!("rb-{i}"));
        let holders = c.holders_of(&key);
        assert_eq!(holders.len(), 2, "key {i} held by {holders:?}");
        assert!(holders.contains(&c.owner_of(&key)));
    }
}

fn assert_all_owned(c: &IntegrationCluster) {
    let topology = c.topology();
    for node in c.nodes() {
        assert_eq!(node.topology().id(), topology.id());
        assert!(node.version_manager().blocked_segments().is_empty());
        for segment in topology.owned_segments(&node.address()) {
            assert_eq!(
                node.version_manager().segment_state(segment),
                SegmentState::Owned
            );
        }
    }
}

/// 3 nodes, add 2 more one at a time.
#[tokio::test]
async fn test_scale_out_keeps_data() {
    let mut c = IntegrationCluster::new(3).await;
    write_all(&c, 0).await;

    c.add_node().await;
    assert_all_owned(&c);
    assert_two_copies(&c);
    verify_all(&c, 0).await;

    c.add_node().await;
    assert_all_owned(&c);
    assert_two_copies(&c);
    assert_eq!(c.topology().id(), 3);
    verify_all(&c, 0).await;

    // New writes spread over the grown cluster.
    write_all(&c, 1).await;
    verify_all(&c, 1).await;
    let newest = c.len() - 1;
    assert!(!c.topology().owned_segments(&c.node(newest).address()).is_empty());
}

/// 5 nodes, two leave gracefully.
#[tokio::test]
async fn test_scale_in_keeps_data() {
    let mut c = IntegrationCluster::new(5).await;
    write_all(&c, 0).await;

    c.leave_node(4).await;
    assert_all_owned(&c);
    verify_all(&c, 0).await;

    write_all(&c, 1).await;
    c.leave_node(0).await;
    assert_all_owned(&c);
    verify_all(&c, 1).await;
}

/// Rebalancing while background rounds run leaves no stale reads behind.
#[tokio::test]
async fn test_rebalance_with_background_rounds() {
    let mut c = IntegrationCluster::new(3).await;
    c.start();
    write_all(&c, 0).await;
    write_all(&c, 1).await;

    c.add_node().await;
    verify_all(&c, 1).await;
    c.leave_node(1).await;
    verify_all(&c, 1).await;
    c.shutdown().await;
}
