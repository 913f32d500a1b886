//! Integration test: write/read.
//!
//! 5-node cluster. Keys are written from every node and read back from
//! different ones.

use bytes::Bytes;
use scatter_engine::ScatterCache;
use scatter_integration_tests::{IntegrationCluster, value_for};

/// Write 100 keys round-robin across writers, read each from another node.
#[tokio::test]
async fn test_100_keys_read_from_other_nodes() {
    let c = IntegrationCluster::new(5).await;

    for i in 0..100 {
        let key = Bytes::from(format!("key-{i:03}"));
        c.node(i % 5).put(key, value_for(i, 0)).await.unwrap();
    }

    for i in 0..100 {
        let key = Bytes::from(format!("key-{i:03}"));
        let reader = (i + 2) % 5;
        assert_eq!(
            c.node(reader).get(&key).await.unwrap(),
            Some(value_for(i, 0)),
            "key {i} read from node {reader}"
        );
    }
}

/// Overwrites from rotating writers: every node sees the last one.
#[tokio::test]
async fn test_overwrites_converge_on_every_node() {
    let c = IntegrationCluster::new(4).await;

    for generation in 0..4u32 {
        for i in 0..20 {
            let key = Bytes::from(format!("over-{i}"));
            let writer = (i + generation as usize) % 4;
            c.node(writer).put(key, value_for(i, generation)).await.unwrap();
        }
    }

    for node in c.nodes() {
        for i in 0..20 {
            let key = Bytes::from(format!("over-{i}"));
            assert_eq!(node.get(&key).await.unwrap(), Some(value_for(i, 3)));
        }
    }
}

/// Conditional operations see the owner's state, whoever issues them.
#[tokio::test]
async fn test_conditional_operations_across_nodes() {
    let c = IntegrationCluster::new(3).await;
    let key = c.key_owned_by(0, "cond");
    let v = |s: &'static str| Bytes::from_static(s.as_bytes());

    assert_eq!(c.node(1).put_if_absent(key.clone(), v("first")).await.unwrap(), None);
    assert_eq!(
        c.node(2).put_if_absent(key.clone(), v("second")).await.unwrap(),
        Some(v("first"))
    );
    assert_eq!(
        c.node(2).replace(key.clone(), v("third")).await.unwrap(),
        Some(v("first"))
    );
    assert!(!c.node(1).remove_if(key.clone(), v("first")).await.unwrap());
    assert!(c.node(1).remove_if(key.clone(), v("third")).await.unwrap());
    assert!(!c.node(0).contains_key(&key).await.unwrap());
    assert_eq!(c.node(2).replace(key.clone(), v("nothing")).await.unwrap(), None);
    assert!(!c.node(2).contains_key(&key).await.unwrap());
}

/// A batch spanning every owner lands in full.
#[tokio::test]
async fn test_put_all_spans_owners() {
    let c = IntegrationCluster::new(4).await;
    let entries: Vec<(Bytes, Bytes)> = (0..64)
        .map(|i| (Bytes::from(format!("batch-{i}")), value_for(i, 0)))
        .collect();

    c.node(3).put_all(entries.clone()).await.unwrap();

    for (key, value) in &entries {
        let owner = c.owner_of(key);
        assert_eq!(c.node(owner).get(key).await.unwrap(), Some(value.clone()));
    }
}
