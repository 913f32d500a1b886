//! Integration test: node failure.
//!
//! Kill a node without warning. Every write acknowledged before the crash
//! has a second copy somewhere, so the survivors still serve it.

use bytes::Bytes;
use scatter_engine::{EngineError, ScatterCache};
use scatter_integration_tests::{IntegrationCluster, value_for};

/// 5 nodes, 100 keys, kill one node.
#[tokio::test]
async fn test_single_crash_loses_nothing() {
    let mut c = IntegrationCluster::new(5).await;
    for i in 0..100 {
        let key = Bytes::from(format!("crash-{i}"));
        c.node(i % 5).put(key, value_for(i, 0)).await.unwrap();
    }
    c.quiesce().await;

    c.kill_node(2).await;
    assert_eq!(c.len(), 4);
    for node in c.nodes() {
        for i in 0..100 {
            let key = Bytes::from(format!("crash-{i}"));
            assert_eq!(node.get(&key).await.unwrap(), Some(value_for(i, 0)));
        }
    }
}

/// Writes keep working after the crash, including keys whose lease holder
/// was the crashed node.
#[tokio::test]
async fn test_writes_after_holder_crash() {
    let mut c = IntegrationCluster::new(3).await;
    let key = c.key_owned_by(0, "orphan-lease");
    c.node(2).put(key.clone(), Bytes::from("held")).await.unwrap();
    assert!(c.node(2).bias().has_local_bias(&key));
    c.quiesce().await;

    c.kill_node(2).await;
    let owner = c.owner_of(&key);
    let other = 1 - owner;
    c.node(owner).put(key.clone(), Bytes::from("after")).await.unwrap();
    assert_eq!(c.node(other).get(&key).await.unwrap(), Some(Bytes::from("after")));
}

/// Before membership catches up, requests to the dead owner fail with a
/// communication error instead of hanging.
#[tokio::test]
async fn test_dead_owner_fails_fast_before_rebalance() {
    let c = IntegrationCluster::new(3).await;
    let key = c.key_owned_by(1, "unreachable");
    c.network().set_down(c.node(1).address(), true);

    let err = c.node(0).get(&key).await.unwrap_err();
    assert!(matches!(err, EngineError::RemoteCommunication { .. }), "got {err:?}");
    let err = c.node(2).put(key, Bytes::from("v")).await.unwrap_err();
    assert!(matches!(err, EngineError::RemoteCommunication { .. }), "got {err:?}");
}

/// The cluster survives a crash followed by a join.
#[tokio::test]
async fn test_crash_then_join() {
    let mut c = IntegrationCluster::new(4).await;
    for i in 0..80 {
        let key = Bytes::from(format!("cj-{i}"));
        c.node(i % 4).put(key, value_for(i, 0)).await.unwrap();
    }
    c.quiesce().await;

    c.kill_node(0).await;
    c.add_node().await;
    assert_eq!(c.len(), 4);
    for node in c.nodes() {
        for i in 0..80 {
            let key = Bytes::from(format!("cj-{i}"));
            assert_eq!(node.get(&key).await.unwrap(), Some(value_for(i, 0)));
        }
    }
}
