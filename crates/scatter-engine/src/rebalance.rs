//! Topology changes.
//!
//! A new topology is installed in two phases across the cluster:
//!
//! 1. [`ScatterNode::install_topology`] on every node. Each node finishes
//!    in-flight invalidations, waits for writes on segments it hands away,
//!    drops leases that no longer make sense and starts routing with the
//!    new topology. Segments it gained stay blocked.
//! 2. [`ScatterNode::complete_rebalance`] on every node. New owners pull
//!    every copy of their gained segments from all members, keep the
//!    newest version of each key, and unblock the segments. Then each owner
//!    settles the segments it gained or whose backup member changed: every
//!    entry is copied to the new backup and every other member releases
//!    its copies, so one backup remains per key.
//!
//! [`rebalance_cluster`] drives both phases from the membership state.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use scatter_cluster::ClusterState;
use scatter_net::{CacheMessage, CacheResponse, Invalidation};
use scatter_placement::{SegmentSet, Topology};
use scatter_types::{Address, CacheEntry, SegmentId, TopologyId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::node::{ScatterNode, TransferPlan};

/// Segment changes one node saw when installing a topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyTransition {
    /// The installed topology.
    pub topology_id: TopologyId,
    /// Segments this node now owns and must receive.
    pub gained: SegmentSet,
    /// Segments this node no longer owns.
    pub lost: SegmentSet,
    /// Leases this node held that were dropped.
    pub dropped_local_biases: usize,
    /// Leases this node had granted that were revoked.
    pub revoked_remote_biases: usize,
}

impl ScatterNode {
    /// Phase one: start routing with `next`.
    pub async fn install_topology(
        &self,
        next: Arc<Topology>,
    ) -> Result<TopologyTransition, EngineError> {
        let previous = self.topology();
        if next.id() <= previous.id() {
            return Err(EngineError::TopologyRegression {
                current: previous.id(),
                offered: next.id(),
            });
        }
        if next.num_segments() != self.config.num_segments {
            return Err(EngineError::SegmentCountMismatch {
                expected: self.config.num_segments,
                actual: next.num_segments(),
            });
        }

        // Versions committed under the old topology are reconciled before
        // any version of the new one is issued.
        self.svm.flush(true).await;

        let before = previous.owned_segments(&self.address);
        let after = next.owned_segments(&self.address);
        let lost: SegmentSet = before.difference(&after).copied().collect();
        let gained: SegmentSet = after.difference(&before).copied().collect();

        let mut gates = Vec::with_capacity(lost.len());
        for &segment in &lost {
            gates.push(self.gate(segment).lock().await);
        }
        self.bias.suspend_acquisition(&gained);
        self.svm.install(next.id(), &after, &gained);
        self.topology_tx.send_replace(next.clone());
        drop(gates);

        let mut sources: Vec<Address> = previous
            .members()
            .iter()
            .chain(next.members())
            .filter(|m| **m != self.address)
            .copied()
            .collect();
        sources.sort();
        sources.dedup();
        let rebackup = if previous.next_member(&self.address) == next.next_member(&self.address) {
            SegmentSet::new()
        } else {
            before.intersection(&after).copied().collect()
        };
        *self.transfer.lock().expect("lock poisoned") = TransferPlan { sources, rebackup };

        let dropped_local_biases = self.bias.revoke_local_segments(&previous.moved_segments(&next));
        let drained = self.bias.drain_remote_segments(&lost);
        let revoked_remote_biases = drained.len();
        self.notify_revoked_holders(drained).await;

        info!(
            node = %self.address.fmt_short(),
            topology_id = next.id(),
            gained = gained.len(),
            lost = lost.len(),
            dropped_local_biases,
            revoked_remote_biases,
            "topology installed"
        );

        Ok(TopologyTransition {
            topology_id: next.id(),
            gained,
            lost,
            dropped_local_biases,
            revoked_remote_biases,
        })
    }

    /// Phase two: pull state for blocked segments, unblock them and settle
    /// their backups.
    ///
    /// Entries are pulled from every member of the previous and the
    /// installed topology. Returns the number committed locally. Members
    /// that do not answer are skipped; their copies are lost with them.
    pub async fn complete_rebalance(&self) -> Result<usize, EngineError> {
        let topology = self.topology();
        let blocked = self.svm.blocked_segments();
        let plan = std::mem::take(&mut *self.transfer.lock().expect("lock poisoned"));
        if blocked.is_empty() && plan.rebackup.is_empty() {
            return Ok(0);
        }

        let mut transferred = 0;
        if !blocked.is_empty() {
            transferred = self.pull_segments(&topology, &blocked, &plan.sources).await?;
            self.svm.mark_owned(&blocked);
            self.bias.resume_acquisition(&blocked);
            info!(
                node = %self.address.fmt_short(),
                topology_id = topology.id(),
                segments = blocked.len(),
                transferred,
                "state transfer complete"
            );
        }

        let settle: SegmentSet = blocked.union(&plan.rebackup).copied().collect();
        self.settle_backups(&topology, &settle, &plan.sources).await?;
        Ok(transferred)
    }

    async fn pull_segments(
        &self,
        topology: &Topology,
        blocked: &SegmentSet,
        peers: &[Address],
    ) -> Result<usize, EngineError> {
        let segments: Vec<SegmentId> = blocked.iter().copied().collect();
        // Members that just left still hold copies; crashed ones fail fast.
        let replies = join_all(peers.iter().map(|&peer| {
            let message = CacheMessage::SegmentEntries {
                segments: segments.clone(),
                topology_id: topology.id(),
            };
            async move {
                let reply = self
                    .transport
                    .request(peer, message, self.config.remote_timeout)
                    .await;
                (peer, reply)
            }
        }))
        .await;

        let mut transferred = 0;
        for (peer, reply) in replies {
            match reply {
                Ok(CacheResponse::Entries(entries)) => {
                    debug!(peer = %peer.fmt_short(), entries = entries.len(), "segment entries received");
                    for entry in entries {
                        let segment = topology.segment_of(&entry.key);
                        if self.store.commit_if_newer(segment, entry)? {
                            transferred += 1;
                        }
                    }
                }
                Ok(other) => warn!(
                    peer = %peer.fmt_short(),
                    got = other.name(),
                    "unexpected reply to segment transfer"
                ),
                Err(e) => warn!(peer = %peer.fmt_short(), error = %e, "segment transfer failed"),
            }
        }
        Ok(transferred)
    }

    /// Copy every entry of `segments` to this node's backup, then have
    /// every other member release its copies.
    ///
    /// Tombstones are also queued for a removal round so they are purged
    /// everywhere once the removal is known cluster-wide.
    async fn settle_backups(
        &self,
        topology: &Topology,
        segments: &SegmentSet,
        peers: &[Address],
    ) -> Result<(), EngineError> {
        if segments.is_empty() {
            return Ok(());
        }
        let segments: Vec<SegmentId> = segments.iter().copied().collect();
        let now = Instant::now();
        let entries: Vec<CacheEntry> = self
            .store
            .entries_in_segments(&segments)?
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let backup = topology.next_member(&self.address);
        if let Some(backup) = backup {
            let replies = join_all(entries.iter().map(|entry| {
                let message = CacheMessage::BackupWrite {
                    entry: entry.clone(),
                };
                self.transport
                    .request(backup, message, self.config.remote_timeout)
            }))
            .await;
            let failed = replies.iter().filter(|reply| reply.is_err()).count();
            if failed > 0 {
                warn!(backup = %backup.fmt_short(), failed, "backup copies not acknowledged");
            }
        }

        let releases: Vec<Invalidation> = entries
            .iter()
            .map(|entry| Invalidation {
                key: entry.key.clone(),
                version: entry.version,
                removed: entry.is_tombstone(),
            })
            .collect();
        for release in releases.iter().filter(|r| r.removed) {
            self.svm
                .schedule_invalidation(release.key.clone(), release.version, true);
        }

        let targets = peers
            .iter()
            .copied()
            .filter(|peer| Some(*peer) != backup && *peer != self.address);
        let replies = join_all(targets.map(|peer| {
            let message = CacheMessage::ReleaseCopies {
                entries: releases.clone(),
            };
            async move {
                let reply = self
                    .transport
                    .request(peer, message, self.config.remote_timeout)
                    .await;
                (peer, reply)
            }
        }))
        .await;

        let mut released = 0;
        for (peer, reply) in replies {
            match reply {
                Ok(CacheResponse::Invalidated { dropped }) => released += dropped,
                Ok(other) => warn!(
                    peer = %peer.fmt_short(),
                    got = other.name(),
                    "unexpected reply to copy release"
                ),
                Err(e) => debug!(peer = %peer.fmt_short(), error = %e, "copy release failed"),
            }
        }

        info!(
            node = %self.address.fmt_short(),
            topology_id = topology.id(),
            segments = segments.len(),
            entries = entries.len(),
            released,
            "backups settled"
        );
        Ok(())
    }

    /// Best-effort revocation of leases on segments this node handed away.
    async fn notify_revoked_holders(&self, drained: Vec<(Bytes, Address)>) {
        let mut by_holder: BTreeMap<Address, Vec<Bytes>> = BTreeMap::new();
        for (key, holder) in drained {
            by_holder.entry(holder).or_default().push(key);
        }
        for (holder, keys) in by_holder {
            if let Err(e) = self
                .transport
                .send(holder, CacheMessage::RevokeBias { keys })
                .await
            {
                debug!(holder = %holder.fmt_short(), error = %e, "lease revocation not sent");
            }
        }
    }
}

/// Publish the next topology for `cluster` and install it on `nodes`.
///
/// Every node gets phase one before any node starts phase two, so no
/// segment is pulled while its previous owner may still accept writes.
pub async fn rebalance_cluster(
    cluster: &ClusterState,
    nodes: &[Arc<ScatterNode>],
) -> Result<Arc<Topology>, EngineError> {
    let topology = cluster.rebalance().await?;
    info!(
        topology_id = topology.id(),
        members = topology.members().len(),
        "rebalancing cluster"
    );

    for node in nodes {
        node.install_topology(topology.clone()).await?;
    }
    for node in nodes {
        node.complete_rebalance().await?;
    }
    Ok(topology)
}
