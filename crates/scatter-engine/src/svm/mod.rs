//! [`ScatteredVersionManager`]: version generation, segment states and
//! background invalidation rounds.
//!
//! Every committed write is scheduled for invalidation. A round coalesces
//! the scheduled keys into one message per other member; any member may
//! hold a copy, since remote writers keep one. Targets drop copies older
//! than the committed version. Keys whose committed version is a tombstone then go
//! through a second, removal round; once every member acknowledged it the
//! owner purges its own tombstone.
//!
//! Rounds never overlap. A round that misses an acknowledgement keeps the
//! batch and resends it to the silent targets in later rounds.

mod batch;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use scatter_net::{CacheResponse, Invalidation, Transport};
use scatter_placement::{SegmentSet, Topology};
use scatter_store::EntryStore;
use scatter_types::{Address, EntryVersion, SegmentId, TopologyId, VersionOrdering};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub use batch::{BatchKind, BatchObserver, BatchState, InvalidationBatch};

use crate::error::EngineError;

/// Ownership state of one segment on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Another node is the primary owner.
    NotOwned,
    /// Owned in the installed topology, waiting for state transfer.
    Blocked,
    /// Owned and serving.
    Owned,
}

#[derive(Debug)]
struct SegmentTable {
    topology_id: TopologyId,
    states: Vec<SegmentState>,
    counters: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Scheduled {
    version: EntryVersion,
    removed: bool,
}

/// What one invalidation round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Another round was running; nothing was done.
    pub skipped: bool,
    /// Keys sent in regular batches.
    pub regular_keys: usize,
    /// Keys sent in removal batches.
    pub removal_keys: usize,
    /// Batches every target acknowledged.
    pub finished_batches: usize,
    /// Batches kept for a later round.
    pub retained_batches: usize,
    /// Copies the targets reported dropping.
    pub dropped_copies: usize,
    /// Tombstones purged locally after removal rounds.
    pub purged_tombstones: usize,
}

impl RoundSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether the round sent anything.
    pub fn did_work(&self) -> bool {
        self.regular_keys + self.removal_keys > 0 || self.retained_batches > 0
    }
}

/// Per-node version manager.
pub struct ScatteredVersionManager {
    local: Address,
    batch_size: usize,
    remote_timeout: Duration,
    store: Arc<dyn EntryStore>,
    transport: Arc<dyn Transport>,
    topology: watch::Receiver<Arc<Topology>>,
    segments: Mutex<SegmentTable>,
    /// Keys awaiting a regular round.
    scheduled: Mutex<HashMap<Bytes, Scheduled>>,
    /// Tombstoned keys awaiting a removal round.
    removed: Mutex<HashMap<Bytes, Scheduled>>,
    /// Batches some target has not acknowledged yet.
    retries: Mutex<Vec<InvalidationBatch>>,
    next_batch: AtomicU64,
    round: tokio::sync::Mutex<()>,
    wake: Notify,
    observer: RwLock<Option<Arc<dyn BatchObserver>>>,
}

impl ScatteredVersionManager {
    /// Create a manager with every segment `NotOwned`.
    pub fn new(
        local: Address,
        num_segments: u32,
        batch_size: usize,
        remote_timeout: Duration,
        store: Arc<dyn EntryStore>,
        transport: Arc<dyn Transport>,
        topology: watch::Receiver<Arc<Topology>>,
    ) -> Self {
        let n = num_segments as usize;
        Self {
            local,
            batch_size,
            remote_timeout,
            store,
            transport,
            topology,
            segments: Mutex::new(SegmentTable {
                topology_id: 0,
                states: vec![SegmentState::NotOwned; n],
                counters: vec![0; n],
            }),
            scheduled: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashMap::new()),
            retries: Mutex::new(Vec::new()),
            next_batch: AtomicU64::new(1),
            round: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            observer: RwLock::new(None),
        }
    }

    /// Register the observer notified when batches finish.
    pub fn set_observer(&self, observer: Arc<dyn BatchObserver>) {
        *self.observer.write().expect("lock poisoned") = Some(observer);
    }

    // ------------------------------------------------------------------
    // Segment states and versions
    // ------------------------------------------------------------------

    /// Adopt `topology_id`: segments in `owned` become `Owned`, except those
    /// in `gained`, which stay `Blocked` until [`mark_owned`](Self::mark_owned).
    ///
    /// Counters restart because versions of the new topology sort after
    /// every version of the old one.
    pub fn install(&self, topology_id: TopologyId, owned: &SegmentSet, gained: &SegmentSet) {
        let mut table = self.segments.lock().expect("lock poisoned");
        table.topology_id = topology_id;
        for (segment, state) in table.states.iter_mut().enumerate() {
            let segment = segment as SegmentId;
            *state = if !owned.contains(&segment) {
                SegmentState::NotOwned
            } else if gained.contains(&segment) {
                SegmentState::Blocked
            } else {
                SegmentState::Owned
            };
        }
        table.counters.iter_mut().for_each(|c| *c = 0);
        debug!(topology_id, owned = owned.len(), blocked = gained.len(), "segment states installed");
    }

    /// Finish state transfer for `segments`.
    pub fn mark_owned(&self, segments: &SegmentSet) {
        let mut table = self.segments.lock().expect("lock poisoned");
        for &segment in segments {
            if let Some(state) = table.states.get_mut(segment as usize)
                && *state == SegmentState::Blocked
            {
                *state = SegmentState::Owned;
            }
        }
    }

    /// State of `segment`.
    pub fn segment_state(&self, segment: SegmentId) -> SegmentState {
        self.segments
            .lock()
            .expect("lock poisoned")
            .states
            .get(segment as usize)
            .copied()
            .unwrap_or(SegmentState::NotOwned)
    }

    /// Segments still waiting for state transfer.
    pub fn blocked_segments(&self) -> SegmentSet {
        let table = self.segments.lock().expect("lock poisoned");
        table
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SegmentState::Blocked)
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Topology the segment states were installed for.
    pub fn topology_id(&self) -> TopologyId {
        self.segments.lock().expect("lock poisoned").topology_id
    }

    /// Fail unless `segment` is `Owned`.
    pub fn ensure_owned(&self, segment: SegmentId) -> Result<(), EngineError> {
        match self.segment_state(segment) {
            SegmentState::Owned => Ok(()),
            SegmentState::Blocked => Err(EngineError::SegmentBlocked { segment }),
            SegmentState::NotOwned => Err(EngineError::SegmentNotOwned { segment }),
        }
    }

    /// Issue the version for a write to `segment`.
    ///
    /// `observed` is the version currently stored for the key; the counter
    /// is first raised past it so the new version always supersedes it.
    pub fn increment_version(
        &self,
        segment: SegmentId,
        observed: Option<&EntryVersion>,
    ) -> Result<EntryVersion, EngineError> {
        let mut table = self.segments.lock().expect("lock poisoned");
        match table.states.get(segment as usize) {
            Some(SegmentState::Owned) => {}
            Some(SegmentState::Blocked) => return Err(EngineError::SegmentBlocked { segment }),
            _ => return Err(EngineError::SegmentNotOwned { segment }),
        }
        let topology_id = table.topology_id;
        let counter = &mut table.counters[segment as usize];
        if let Some(observed) = observed
            && observed.topology_id() == topology_id
        {
            *counter = (*counter).max(observed.counter());
        }
        *counter += 1;
        let version = EntryVersion::new(topology_id, *counter, self.local);

        if let Some(observed) = observed
            && !version.is_newer_than(observed)
        {
            error!(segment, %observed, issued = %version, "issued version does not supersede stored version");
            return Err(EngineError::VersionConflict {
                segment,
                stored: *observed,
                issued: version,
            });
        }
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Queue `key` for the next regular round.
    ///
    /// A key already queued keeps the newer version; on a tie the removal
    /// flag wins.
    pub fn schedule_invalidation(&self, key: Bytes, version: EntryVersion, removed: bool) {
        let queued = {
            let mut scheduled = self.scheduled.lock().expect("lock poisoned");
            merge_scheduled(&mut scheduled, key, Scheduled { version, removed });
            scheduled.len()
        };
        if queued >= self.batch_size {
            self.wake.notify_one();
        }
    }

    /// Keys waiting for any round, plus keys in unacknowledged batches.
    pub fn pending_invalidations(&self) -> usize {
        let scheduled = self.scheduled.lock().expect("lock poisoned").len();
        let removed = self.removed.lock().expect("lock poisoned").len();
        let retained: usize = self
            .retries
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(InvalidationBatch::len)
            .sum();
        scheduled + removed + retained
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    /// Run one invalidation round.
    ///
    /// A forced round waits for a running round to finish; otherwise the
    /// call is skipped while another round is active.
    pub async fn flush(&self, force: bool) -> RoundSummary {
        let _round = if force {
            self.round.lock().await
        } else {
            match self.round.try_lock() {
                Ok(guard) => guard,
                Err(_) => return RoundSummary::skipped(),
            }
        };

        let topology = self.topology.borrow().clone();
        let targets: Vec<Address> = topology
            .members()
            .iter()
            .filter(|m| **m != self.local)
            .copied()
            .collect();
        let mut summary = RoundSummary::default();

        let mut batches = std::mem::take(&mut *self.retries.lock().expect("lock poisoned"));
        let scheduled = std::mem::take(&mut *self.scheduled.lock().expect("lock poisoned"));
        if !scheduled.is_empty() {
            summary.regular_keys = scheduled.len();
            batches.push(self.new_batch(BatchKind::Regular, scheduled, &targets));
        }
        self.run_batches(&topology, batches, &mut summary).await;

        // Removals finished by the regular batches above go out in the same
        // round.
        let removed = std::mem::take(&mut *self.removed.lock().expect("lock poisoned"));
        if !removed.is_empty() {
            summary.removal_keys = removed.len();
            let batch = self.new_batch(BatchKind::Removal, removed, &targets);
            self.run_batches(&topology, vec![batch], &mut summary).await;
        }

        if summary.did_work() {
            debug!(
                regular = summary.regular_keys,
                removal = summary.removal_keys,
                finished = summary.finished_batches,
                retained = summary.retained_batches,
                "invalidation round complete"
            );
        }
        summary
    }

    /// Run rounds every `interval`, or sooner when enough keys are queued,
    /// until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = %self.local.fmt_short(), ?interval, "invalidation rounds started");
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.flush(false).await;
        }
        debug!(node = %self.local.fmt_short(), "invalidation rounds stopped");
    }

    fn new_batch(
        &self,
        kind: BatchKind,
        keys: HashMap<Bytes, Scheduled>,
        targets: &[Address],
    ) -> InvalidationBatch {
        let entries = keys
            .into_iter()
            .map(|(key, scheduled)| Invalidation {
                key,
                version: scheduled.version,
                removed: scheduled.removed,
            })
            .collect();
        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        InvalidationBatch::new(id, kind, entries, targets.iter().copied())
    }

    async fn run_batches(
        &self,
        topology: &Topology,
        batches: Vec<InvalidationBatch>,
        summary: &mut RoundSummary,
    ) {
        for mut batch in batches {
            batch.forget_leavers(topology);
            batch.begin_attempt();

            let message = batch.message();
            let replies = join_all(batch.pending_targets().into_iter().map(|target| {
                let message = message.clone();
                async move {
                    let reply = self
                        .transport
                        .request(target, message, self.remote_timeout)
                        .await;
                    (target, reply)
                }
            }))
            .await;

            for (target, reply) in replies {
                match reply {
                    Ok(CacheResponse::Invalidated { dropped }) => {
                        batch.ack(&target);
                        summary.dropped_copies += dropped;
                    }
                    Ok(other) => warn!(
                        batch = batch.id(),
                        target = %target.fmt_short(),
                        got = other.name(),
                        "unexpected reply to invalidation"
                    ),
                    Err(e) => warn!(
                        batch = batch.id(),
                        target = %target.fmt_short(),
                        attempt = batch.attempts(),
                        error = %e,
                        "invalidation not acknowledged, will retry"
                    ),
                }
            }

            match batch.settle() {
                BatchState::Finished => {
                    summary.finished_batches += 1;
                    self.finish(topology, &batch, summary);
                }
                _ => {
                    summary.retained_batches += 1;
                    self.retries.lock().expect("lock poisoned").push(batch);
                }
            }
        }
    }

    fn finish(&self, topology: &Topology, batch: &InvalidationBatch, summary: &mut RoundSummary) {
        let observer = self.observer.read().expect("lock poisoned").clone();
        match batch.kind() {
            BatchKind::Regular => {
                {
                    let mut removed = self.removed.lock().expect("lock poisoned");
                    for entry in batch.entries().iter().filter(|e| e.removed) {
                        merge_scheduled(
                            &mut removed,
                            entry.key.clone(),
                            Scheduled {
                                version: entry.version,
                                removed: true,
                            },
                        );
                    }
                }
                if let Some(observer) = observer {
                    observer.regular_batch_finished(
                        &batch.keys(),
                        &batch.versions(),
                        &batch.removed_flags(),
                    );
                }
            }
            BatchKind::Removal => {
                for entry in batch.entries() {
                    let segment = topology.segment_of(&entry.key);
                    match self.store.invalidate(segment, &entry.key, &entry.version, true) {
                        Ok(true) => summary.purged_tombstones += 1,
                        Ok(false) => {}
                        Err(e) => error!(segment, error = %e, "failed to purge tombstone"),
                    }
                }
                if let Some(observer) = observer {
                    observer.removal_batch_finished(&batch.keys(), &batch.versions());
                }
            }
        }
    }
}

impl std::fmt::Debug for ScatteredVersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatteredVersionManager")
            .field("local", &self.local)
            .field("topology_id", &self.topology_id())
            .finish_non_exhaustive()
    }
}

fn merge_scheduled(map: &mut HashMap<Bytes, Scheduled>, key: Bytes, incoming: Scheduled) {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(incoming);
        }
        Entry::Occupied(mut slot) => match slot.get().version.compare(&incoming.version) {
            VersionOrdering::Before => {
                slot.insert(incoming);
            }
            VersionOrdering::Equal if incoming.removed => {
                slot.get_mut().removed = true;
            }
            _ => {}
        },
    }
}
