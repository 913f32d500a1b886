//! Basic single- and multi-node reads, writes and expiration.

use std::sync::Arc;
use std::time::Duration;

use scatter_net::MessageKind;
use scatter_placement::{RingOracle, Topology};
use scatter_store::MemoryStore;
use scatter_types::EntryMetadata;

use super::helpers::{b, cluster, cluster_with, node_address, test_config};
use crate::config::CacheConfig;
use crate::engine::ScatterCache;
use crate::error::EngineError;
use crate::node::ScatterNode;

// -----------------------------------------------------------------------
// Single node
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_single_node_put_get_remove() {
    let c = cluster(1).await;
    let node = &c.nodes[0];

    assert_eq!(node.put(b("k"), b("v1")).await.unwrap(), None);
    assert_eq!(node.get(&b("k")).await.unwrap(), Some(b("v1")));
    assert_eq!(node.put(b("k"), b("v2")).await.unwrap(), Some(b("v1")));
    assert_eq!(node.remove(b("k")).await.unwrap(), Some(b("v2")));
    assert_eq!(node.get(&b("k")).await.unwrap(), None);
    assert!(!node.contains_key(&b("k")).await.unwrap());
    assert_eq!(c.network.sent_by(&node.address()), 0);
}

#[tokio::test]
async fn test_get_missing_key() {
    let c = cluster(3).await;
    for node in &c.nodes {
        assert_eq!(node.get(&b("nothing")).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_remove_of_absent_key_leaves_tombstone() {
    let c = cluster(1).await;
    let node = &c.nodes[0];

    assert_eq!(node.remove(b("ghost")).await.unwrap(), None);
    let segment = node.topology().segment_of(b"ghost");
    let stored = node.store().peek(segment, b"ghost").unwrap().unwrap();
    assert!(stored.is_tombstone());
}

#[tokio::test]
async fn test_second_remove_from_other_node_issues_newer_tombstone() {
    let c = cluster(3).await;
    let key = c.key_owned_by(0, "twice");
    let segment = c.topology().segment_of(&key);
    c.nodes[0].put(key.clone(), b("v")).await.unwrap();

    assert_eq!(c.nodes[0].remove(key.clone()).await.unwrap(), Some(b("v")));
    let first = c.nodes[0].store().peek(segment, &key).unwrap().unwrap();
    assert!(first.is_tombstone());

    assert_eq!(c.nodes[2].remove(key.clone()).await.unwrap(), None);
    let second = c.nodes[0].store().peek(segment, &key).unwrap().unwrap();
    assert!(second.is_tombstone());
    assert!(second.version.is_newer_than(&first.version));

    for node in &c.nodes {
        assert_eq!(node.get(&key).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_segment_count_mismatch_rejected() {
    let config = test_config();
    let network = scatter_net::LocalNetwork::new();
    let topology = Arc::new(
        Topology::new(1, &[node_address(1)], &RingOracle::new(config.num_segments, 4)).unwrap(),
    );
    let result = ScatterNode::new(
        config.clone(),
        Arc::new(MemoryStore::unbounded(config.num_segments * 2)),
        network.endpoint(node_address(1)),
        topology,
    );
    assert!(matches!(
        result,
        Err(EngineError::SegmentCountMismatch { expected: 16, actual: 32 })
    ));
}

// -----------------------------------------------------------------------
// Conditional writes
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_put_if_absent_and_replace() {
    let c = cluster(3).await;
    let key = c.key_owned_by(0, "cond");
    let writer = &c.nodes[1];

    assert_eq!(writer.replace(key.clone(), b("nope")).await.unwrap(), None);
    assert_eq!(writer.get(&key).await.unwrap(), None);

    assert_eq!(writer.put_if_absent(key.clone(), b("first")).await.unwrap(), None);
    assert_eq!(
        writer.put_if_absent(key.clone(), b("second")).await.unwrap(),
        Some(b("first"))
    );
    assert_eq!(
        writer.replace(key.clone(), b("third")).await.unwrap(),
        Some(b("first"))
    );
    assert_eq!(c.nodes[2].get(&key).await.unwrap(), Some(b("third")));
}

#[tokio::test]
async fn test_remove_if() {
    let c = cluster(3).await;
    let key = c.key_owned_by(2, "rmif");
    let node = &c.nodes[0];

    node.put(key.clone(), b("v")).await.unwrap();
    assert!(!node.remove_if(key.clone(), b("other")).await.unwrap());
    assert_eq!(node.get(&key).await.unwrap(), Some(b("v")));
    assert!(node.remove_if(key.clone(), b("v")).await.unwrap());
    assert_eq!(c.nodes[1].get(&key).await.unwrap(), None);
}

// -----------------------------------------------------------------------
// Multi node
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_write_anywhere_read_everywhere() {
    let c = cluster(3).await;
    for (i, writer) in c.nodes.iter().enumerate() {
        let key = b(&format!("key-{i}"));
        writer.put(key.clone(), b(&format!("value-{i}"))).await.unwrap();
    }
    for reader in &c.nodes {
        for i in 0..c.nodes.len() {
            let got = reader.get(&b(&format!("key-{i}"))).await.unwrap();
            assert_eq!(got, Some(b(&format!("value-{i}"))));
        }
    }
}

#[tokio::test]
async fn test_remote_write_leaves_backup_on_originator() {
    let c = cluster(3).await;
    let key = c.key_owned_by(0, "backup");
    let writer = &c.nodes[1];

    writer.put(key.clone(), b("v")).await.unwrap();

    let segment = c.topology().segment_of(&key);
    let owner_copy = c.nodes[0].store().peek(segment, &key).unwrap().unwrap();
    let backup = writer.store().peek(segment, &key).unwrap().unwrap();
    assert_eq!(owner_copy.version, backup.version);
    assert_eq!(backup.value, Some(b("v")));
    assert!(c.nodes[2].store().peek(segment, &key).unwrap().is_none());
}

#[tokio::test]
async fn test_owner_write_replicates_to_next_member() {
    let c = cluster(3).await;
    let key = c.key_owned_by(1, "own");
    c.nodes[1].put(key.clone(), b("v")).await.unwrap();
    c.network.quiesce().await;

    let backup = c.backup_of(&key);
    assert_ne!(backup, 1);
    let segment = c.topology().segment_of(&key);
    let copy = c.nodes[backup].store().peek(segment, &key).unwrap().unwrap();
    assert_eq!(copy.value, Some(b("v")));
    assert_eq!(
        c.network
            .sent_by_kind(&c.nodes[1].address(), MessageKind::BackupWrite),
        1
    );
}

#[tokio::test]
async fn test_versions_increase_with_each_write() {
    let c = cluster(2).await;
    let key = c.key_owned_by(0, "ver");
    let segment = c.topology().segment_of(&key);

    c.nodes[0].put(key.clone(), b("a")).await.unwrap();
    let v1 = c.nodes[0].store().peek(segment, &key).unwrap().unwrap().version;
    c.nodes[1].put(key.clone(), b("b")).await.unwrap();
    let v2 = c.nodes[0].store().peek(segment, &key).unwrap().unwrap().version;
    assert!(v2.is_newer_than(&v1));
    assert_eq!(v2.issuer(), c.nodes[0].address());
}

#[tokio::test]
async fn test_put_all_groups_by_owner() {
    let c = cluster(3).await;
    let entries: Vec<_> = (0..30)
        .map(|i| (b(&format!("bulk-{i}")), b(&format!("v{i}"))))
        .collect();
    c.nodes[0].put_all(entries.clone()).await.unwrap();

    for (key, value) in entries {
        assert_eq!(c.nodes[2].get(&key).await.unwrap(), Some(value));
    }
}

// -----------------------------------------------------------------------
// Expiration
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_lifespan_expiry() {
    let c = cluster(2).await;
    let key = c.key_owned_by(0, "ttl");
    c.nodes[1]
        .put_with_metadata(
            key.clone(),
            b("short"),
            EntryMetadata::with_lifespan(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(c.nodes[0].get(&key).await.unwrap(), Some(b("short")));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(c.nodes[0].get(&key).await.unwrap(), None);
    assert_eq!(c.nodes[1].get(&key).await.unwrap(), None);
    assert_eq!(c.nodes[0].put_if_absent(key.clone(), b("again")).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_max_idle_refreshed_by_reads() {
    let c = cluster(1).await;
    let node = &c.nodes[0];
    node.put_with_metadata(
        b("idle"),
        b("v"),
        EntryMetadata::with_max_idle(Duration::from_secs(10)),
    )
    .await
    .unwrap();

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(node.get(&b("idle")).await.unwrap(), Some(b("v")));
    }
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(node.get(&b("idle")).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_purged_from_every_copy() {
    let c = cluster(2).await;
    let key = c.key_owned_by(0, "sweep");
    c.nodes[0]
        .put_with_metadata(
            key.clone(),
            b("v"),
            EntryMetadata::with_lifespan(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    c.nodes[0].put(b("forever"), b("v")).await.unwrap();
    c.network.quiesce().await;
    let backup = c.backup_of(&key);
    let before = c.nodes[backup].store().len();

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(c.nodes[0].purge_expired_entries(), 1);
    assert_eq!(c.nodes[backup].purge_expired_entries(), 1);
    assert_eq!(c.nodes[backup].store().len(), before - 1);
    assert_eq!(c.nodes[0].get(&b("forever")).await.unwrap(), Some(b("v")));
    assert_eq!(c.nodes[0].purge_expired_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_tick_sweeps_expired_entries() {
    let config = CacheConfig {
        bias_scan_interval: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster_with(1, config).await;
    let node = &c.nodes[0];
    for i in 0..10 {
        node.put_with_metadata(
            b(&format!("short-{i}")),
            b("v"),
            EntryMetadata::with_max_idle(Duration::from_secs(3)),
        )
        .await
        .unwrap();
    }
    assert_eq!(node.store().len(), 10);

    node.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(node.store().len(), 0);
    node.shutdown().await;
}
