//! Integration test: background invalidation rounds and lease scans.
//!
//! Nodes run their background tasks; the tests only write and then wait
//! for the cluster to clean up after itself.

use std::time::Duration;

use bytes::Bytes;
use scatter_engine::{CacheConfig, ScatterCache};
use scatter_integration_tests::{IntegrationCluster, eventually, fast_config};

const WAIT: Duration = Duration::from_secs(3);

/// Older copies left on earlier writers disappear; the latest stays on the
/// owner and on the node that wrote it.
#[tokio::test]
async fn test_stale_copies_dropped_in_background() {
    let mut c = IntegrationCluster::new(4).await;
    c.start();
    let key = c.key_owned_by(0, "stale");

    for writer in 1..4 {
        c.node(writer)
            .put(key.clone(), Bytes::from(format!("from-{writer}")))
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || c.holders_of(&key) == vec![0, 3]).await);
    for node in c.nodes() {
        assert_eq!(node.get(&key).await.unwrap(), Some(Bytes::from("from-3")));
    }
    c.shutdown().await;
}

/// A removed key ends up with no tombstone anywhere.
#[tokio::test]
async fn test_removed_key_leaves_no_trace() {
    let mut c = IntegrationCluster::new(3).await;
    c.start();
    let key = c.key_owned_by(0, "gone");

    c.node(1).put(key.clone(), Bytes::from("v")).await.unwrap();
    c.node(2).remove(key.clone()).await.unwrap();

    assert!(eventually(WAIT, || c.holders_of(&key).is_empty()).await);
    assert!(eventually(WAIT, || c.node(0).version_manager().pending_invalidations() == 0).await);
    for node in c.nodes() {
        assert_eq!(node.get(&key).await.unwrap(), None);
    }
    c.shutdown().await;
}

/// Short leases are reclaimed by the owner's scanner.
#[tokio::test]
async fn test_expired_leases_reclaimed() {
    let config = CacheConfig {
        bias_lifespan: Duration::from_millis(200),
        bias_renewal_threshold: Duration::ZERO,
        ..fast_config()
    };
    let mut c = IntegrationCluster::with_config(2, config).await;
    c.start();

    let keys: Vec<Bytes> = (0..5).map(|i| c.key_owned_by(0, &format!("lease-{i}"))).collect();
    for key in &keys {
        c.node(1).put(key.clone(), Bytes::from("v")).await.unwrap();
    }
    assert_eq!(c.node(0).bias().remote_bias_count(), keys.len());

    assert!(eventually(WAIT, || c.node(0).bias().remote_bias_count() == 0).await);
    assert!(keys.iter().all(|k| !c.node(1).bias().has_local_bias(k)));

    // Reads go through the owner again and still see the data.
    for key in &keys {
        assert_eq!(c.node(1).get(key).await.unwrap(), Some(Bytes::from("v")));
    }
    c.shutdown().await;
}

/// Stopped nodes leave stale copies alone.
#[tokio::test]
async fn test_shutdown_stops_rounds() {
    let mut c = IntegrationCluster::new(3).await;
    c.start();
    c.shutdown().await;

    let key = c.key_owned_by(0, "idle");
    c.node(1).put(key.clone(), Bytes::from("a")).await.unwrap();
    c.node(2).put(key.clone(), Bytes::from("b")).await.unwrap();
    c.quiesce().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(c.holders_of(&key).contains(&1));
    assert_eq!(c.node(0).version_manager().pending_invalidations(), 1);
}
