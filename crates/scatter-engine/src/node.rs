//! [`ScatterNode`]: one member of a scattered cache.
//!
//! A node owns its local entry store, the bias lease bookkeeping and the
//! version manager, and talks to other members through a [`Transport`].
//! The write path lives in `write.rs`, the read path in `read.rs`, message
//! dispatch in `handler.rs` and topology changes in `rebalance.rs`.

use std::sync::{Arc, Mutex};

use scatter_net::{CacheMessage, CacheResponse, Transport};
use scatter_placement::{SegmentSet, Topology};
use scatter_store::EntryStore;
use scatter_types::{Address, SegmentId, TopologyId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bias::BiasManager;
use crate::config::CacheConfig;
use crate::error::EngineError;
use crate::svm::{BatchObserver, RoundSummary, ScatteredVersionManager};

/// Work left between installing a topology and completing the rebalance.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransferPlan {
    /// Members of the previous and the installed topology, asked for
    /// entries of blocked segments and told to release settled copies.
    pub(crate) sources: Vec<Address>,
    /// Segments this node kept whose backup member changed.
    pub(crate) rebackup: SegmentSet,
}

/// A member of a scattered cache.
pub struct ScatterNode {
    pub(crate) address: Address,
    pub(crate) config: CacheConfig,
    pub(crate) store: Arc<dyn EntryStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) bias: Arc<BiasManager>,
    pub(crate) svm: Arc<ScatteredVersionManager>,
    /// Installed topology. Routing loops wait on it for changes.
    pub(crate) topology_tx: watch::Sender<Arc<Topology>>,
    /// One gate per segment. Writes at the owner and topology changes that
    /// hand the segment away are serialized through it.
    pub(crate) gates: Vec<tokio::sync::Mutex<()>>,
    /// What the last installed topology left for `complete_rebalance`.
    pub(crate) transfer: Mutex<TransferPlan>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScatterNode {
    /// Create a node for `transport`'s address with `topology` installed.
    ///
    /// Segments the node owns in `topology` start out `Owned`: this is the
    /// bootstrap topology, there is nothing to transfer.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn EntryStore>,
        transport: Arc<dyn Transport>,
        topology: Arc<Topology>,
    ) -> Result<Arc<Self>, EngineError> {
        for actual in [store.num_segments(), topology.num_segments()] {
            if actual != config.num_segments {
                return Err(EngineError::SegmentCountMismatch {
                    expected: config.num_segments,
                    actual,
                });
            }
        }

        let address = transport.local_address();
        let (topology_tx, topology_rx) = watch::channel(topology.clone());
        let svm = Arc::new(ScatteredVersionManager::new(
            address,
            config.num_segments,
            config.invalidation_batch_size,
            config.remote_timeout,
            store.clone(),
            transport.clone(),
            topology_rx,
        ));
        svm.install(
            topology.id(),
            &topology.owned_segments(&address),
            &SegmentSet::new(),
        );
        let bias = Arc::new(BiasManager::new(
            config.bias_renewal_threshold,
            config.remote_timeout,
        ));
        let gates = (0..config.num_segments)
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            node = %address.fmt_short(),
            topology_id = topology.id(),
            segments = config.num_segments,
            "scatter node created"
        );

        Ok(Arc::new(Self {
            address,
            config,
            store,
            transport,
            bias,
            svm,
            topology_tx,
            gates,
            transfer: Mutex::new(TransferPlan::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Return this node's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the local entry store.
    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Return the bias lease bookkeeping.
    pub fn bias(&self) -> &BiasManager {
        &self.bias
    }

    /// Return the version manager.
    pub fn version_manager(&self) -> &Arc<ScatteredVersionManager> {
        &self.svm
    }

    /// The installed topology.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology_tx.borrow().clone()
    }

    /// Register the observer notified when invalidation batches finish.
    pub fn set_batch_observer(&self, observer: Arc<dyn BatchObserver>) {
        self.svm.set_observer(observer);
    }

    /// Run an invalidation round now. See [`ScatteredVersionManager::flush`].
    pub async fn flush_invalidations(&self, force: bool) -> RoundSummary {
        self.svm.flush(force).await
    }

    /// Wait up to the routing backoff for a topology newer than `seen`.
    pub(crate) async fn await_newer_topology(&self, seen: TopologyId) {
        let mut rx = self.topology_tx.subscribe();
        let changed = async move { rx.wait_for(|topology| topology.id() > seen).await.is_ok() };
        let _ = tokio::time::timeout(self.config.routing_backoff, changed).await;
    }

    pub(crate) fn gate(&self, segment: SegmentId) -> &tokio::sync::Mutex<()> {
        &self.gates[segment as usize]
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Start invalidation rounds and the maintenance tick, which revokes
    /// expired leases and drops expired entries.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        if !tasks.is_empty() {
            return;
        }

        let svm = self.svm.clone();
        tasks.push(tokio::spawn(svm.run(
            self.config.invalidation_scan_interval,
            self.shutdown_tx.subscribe(),
        )));

        let node = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(node.config.bias_scan_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                node.bias.prune_local(Instant::now());
                node.scan_expired_biases().await;
                node.purge_expired_entries();
            }
        }));

        info!(node = %self.address.fmt_short(), "background tasks started");
    }

    /// Stop background tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.address.fmt_short(), "scatter node stopped");
    }

    /// Revoke leases this node granted that ran out.
    ///
    /// A lease is forgotten only once its holder acknowledged the
    /// revocation, or once the holder left the topology. Unacknowledged
    /// leases are retried on the next scan. Returns how many were revoked.
    pub async fn scan_expired_biases(&self) -> usize {
        let topology = self.topology();
        let mut revoked = 0;

        for (key, holder) in self.bias.expired_remote(Instant::now()) {
            let segment = topology.segment_of(&key);
            let _gate = self.gate(segment).lock().await;
            if !self.bias.is_expired_remote(&key, &holder, Instant::now()) {
                continue;
            }
            if !topology.is_member(&holder) {
                self.bias.revoke(&key, &holder);
                revoked += 1;
                continue;
            }

            for attempt in 1..=self.config.revocation_retries {
                let message = CacheMessage::RevokeBias {
                    keys: vec![key.clone()],
                };
                match self
                    .transport
                    .request(holder, message, self.config.revocation_timeout)
                    .await
                {
                    Ok(CacheResponse::Ack) => {
                        self.bias.revoke(&key, &holder);
                        revoked += 1;
                        break;
                    }
                    Ok(other) => warn!(
                        holder = %holder.fmt_short(),
                        got = other.name(),
                        "unexpected reply to expired bias revocation"
                    ),
                    Err(e) => warn!(
                        holder = %holder.fmt_short(),
                        attempt,
                        error = %e,
                        "expired bias revocation failed"
                    ),
                }
                if attempt < self.config.revocation_retries {
                    tokio::time::sleep(self.config.revocation_backoff).await;
                }
            }
        }

        if revoked > 0 {
            debug!(node = %self.address.fmt_short(), revoked, "expired biases revoked");
        }
        revoked
    }

    /// Drop entries whose lifespan or idle time ran out. Returns how many.
    pub fn purge_expired_entries(&self) -> usize {
        match self.store.purge_expired(Instant::now()) {
            Ok(0) => 0,
            Ok(purged) => {
                debug!(node = %self.address.fmt_short(), purged, "expired entries purged");
                purged
            }
            Err(e) => {
                warn!(node = %self.address.fmt_short(), error = %e, "expired entry sweep failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for ScatterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterNode")
            .field("address", &self.address)
            .field("topology_id", &self.topology_tx.borrow().id())
            .finish_non_exhaustive()
    }
}
