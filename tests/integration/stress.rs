//! Integration test: concurrent clients.
//!
//! Several tasks hammer a shared set of counters from random nodes while
//! background rounds run. No increment may be lost and every node must
//! agree on the final values.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scatter_engine::ScatterCache;
use scatter_integration_tests::IntegrationCluster;
use scatter_net::ComputeFn;

const CLIENTS: usize = 6;
const OPS_PER_CLIENT: usize = 150;
const COUNTERS: usize = 10;

fn counter_key(i: usize) -> Bytes {
    Bytes::from(format!("counter-{i}"))
}

fn increment() -> ComputeFn {
    Arc::new(|_, current| {
        let n: u64 = current
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Some(Bytes::from((n + 1).to_string()))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_from_random_nodes() {
    let mut c = IntegrationCluster::new(5).await;
    c.start();
    let c = Arc::new(c);

    let mut handles = Vec::new();
    for client in 0..CLIENTS {
        let cluster = c.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(client as u64);
            let mut done = vec![0u64; COUNTERS];
            for _ in 0..OPS_PER_CLIENT {
                let node = rng.gen_range(0..cluster.len());
                let counter = rng.gen_range(0..COUNTERS);
                cluster
                    .node(node)
                    .compute(counter_key(counter), increment())
                    .await
                    .unwrap();
                done[counter] += 1;
            }
            done
        }));
    }

    let mut expected = vec![0u64; COUNTERS];
    for handle in handles {
        for (total, n) in expected.iter_mut().zip(handle.await.unwrap()) {
            *total += n;
        }
    }

    for node in c.nodes() {
        for (i, total) in expected.iter().enumerate() {
            assert_eq!(
                node.get(&counter_key(i)).await.unwrap(),
                Some(Bytes::from(total.to_string())),
                "counter {i} on {}",
                node.address().fmt_short()
            );
        }
    }

    // At most one node may serve a counter from its own lease.
    for i in 0..COUNTERS {
        let key = counter_key(i);
        let holders = c
            .nodes()
            .iter()
            .filter(|n| n.bias().has_local_bias(&key))
            .count();
        assert!(holders <= 1, "counter {i} has {holders} lease holders");
    }
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_agree_on_last_value() {
    let c = Arc::new(IntegrationCluster::new(4).await);
    let keys: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("lww-{i}"))).collect();

    let writes = (0..c.len()).flat_map(|n| {
        let c = c.clone();
        keys.clone().into_iter().map(move |key| {
            let c = c.clone();
            tokio::spawn(async move {
                c.node(n)
                    .put(key, Bytes::from(format!("node-{n}")))
                    .await
                    .unwrap();
            })
        })
    });
    for handle in futures::future::join_all(writes).await {
        handle.unwrap();
    }

    for key in &keys {
        let owner_value = c.node(c.owner_of(key)).get(key).await.unwrap();
        assert!(owner_value.is_some());
        for node in c.nodes() {
            assert_eq!(node.get(key).await.unwrap(), owner_value);
        }
    }
}
