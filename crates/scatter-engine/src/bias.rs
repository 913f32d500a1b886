//! [`BiasManager`]: read leases ("biases") on both sides of the protocol.
//!
//! The owner side keeps a registry of which remote node holds a lease on
//! which key. The holder side keeps the leases it was granted and serves
//! reads from its local copy while a lease is valid.
//!
//! A lease reply can race with a revocation of the same key: the owner may
//! grant, then revoke, and the revocation may reach the holder before the
//! grant does. Holders therefore take a fence before sending a write and
//! refuse a lease if the key was revoked after that fence.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use scatter_placement::SegmentSet;
use scatter_types::{Address, SegmentId};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct RemoteLease {
    holder: Address,
    segment: SegmentId,
    expires: Instant,
}

#[derive(Debug, Clone, Copy)]
struct LocalLease {
    segment: SegmentId,
    expires: Instant,
}

#[derive(Debug, Clone, Copy)]
struct RevocationMark {
    epoch: u64,
    at: Instant,
}

#[derive(Debug, Default)]
struct HolderState {
    leases: HashMap<Bytes, LocalLease>,
    revoked: HashMap<Bytes, RevocationMark>,
    epoch: u64,
    renewing: HashSet<Bytes>,
}

/// Read-lease bookkeeping for one node.
#[derive(Debug)]
pub struct BiasManager {
    /// Owner side: key -> remote holder.
    remote: Mutex<HashMap<Bytes, RemoteLease>>,
    /// Owner side: segments that currently grant no leases.
    suspended: Mutex<SegmentSet>,
    /// Holder side.
    holder: Mutex<HolderState>,
    renewal_threshold: Duration,
    /// How long revocation marks are kept. No write reply can arrive
    /// later than this after its request was sent.
    fence_horizon: Duration,
}

impl BiasManager {
    /// Create a manager. A zero `renewal_threshold` disables renewal.
    pub fn new(renewal_threshold: Duration, fence_horizon: Duration) -> Self {
        Self {
            remote: Mutex::new(HashMap::new()),
            suspended: Mutex::new(SegmentSet::new()),
            holder: Mutex::new(HolderState::default()),
            renewal_threshold,
            fence_horizon,
        }
    }

    // ------------------------------------------------------------------
    // Owner side
    // ------------------------------------------------------------------

    /// Whether `segment` may grant new leases.
    pub fn acquisition_allowed(&self, segment: SegmentId) -> bool {
        !self
            .suspended
            .lock()
            .expect("lock poisoned")
            .contains(&segment)
    }

    /// Stop granting leases for `segments` until they are resumed.
    pub fn suspend_acquisition(&self, segments: &SegmentSet) {
        self.suspended
            .lock()
            .expect("lock poisoned")
            .extend(segments.iter().copied());
    }

    /// Grant leases for `segments` again.
    pub fn resume_acquisition(&self, segments: &SegmentSet) {
        self.suspended
            .lock()
            .expect("lock poisoned")
            .retain(|s| !segments.contains(s));
    }

    /// Record that `holder` holds a lease on `key` for `lifespan`.
    ///
    /// Returns the previous holder, if any.
    pub fn register_bias(
        &self,
        key: Bytes,
        segment: SegmentId,
        holder: Address,
        lifespan: Duration,
    ) -> Option<Address> {
        let lease = RemoteLease {
            holder,
            segment,
            expires: Instant::now() + lifespan,
        };
        trace!(holder = %holder.fmt_short(), segment, "bias registered");
        self.remote
            .lock()
            .expect("lock poisoned")
            .insert(key, lease)
            .map(|previous| previous.holder)
    }

    /// The node holding a lease on `key`, expired or not.
    pub fn remote_bias(&self, key: &[u8]) -> Option<Address> {
        self.remote
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|lease| lease.holder)
    }

    /// Forget `holder`'s lease on `key`. Returns `false` if someone else
    /// (or nobody) holds it.
    pub fn revoke(&self, key: &[u8], holder: &Address) -> bool {
        let mut remote = self.remote.lock().expect("lock poisoned");
        match remote.get(key) {
            Some(lease) if lease.holder == *holder => {
                remote.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Extend `holder`'s lease on `key`. Returns `false` if it no longer
    /// holds one.
    pub fn renew_remote(&self, key: &[u8], holder: &Address, lifespan: Duration) -> bool {
        let mut remote = self.remote.lock().expect("lock poisoned");
        match remote.get_mut(key) {
            Some(lease) if lease.holder == *holder => {
                lease.expires = Instant::now() + lifespan;
                true
            }
            _ => false,
        }
    }

    /// Leases that ran out by `now`.
    pub fn expired_remote(&self, now: Instant) -> Vec<(Bytes, Address)> {
        self.remote
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(key, lease)| (key.clone(), lease.holder))
            .collect()
    }

    /// Whether `holder`'s lease on `key` is still registered and expired.
    pub fn is_expired_remote(&self, key: &[u8], holder: &Address, now: Instant) -> bool {
        self.remote
            .lock()
            .expect("lock poisoned")
            .get(key)
            .is_some_and(|lease| lease.holder == *holder && lease.expires <= now)
    }

    /// Remove and return every lease registered for `segments`.
    pub fn drain_remote_segments(&self, segments: &SegmentSet) -> Vec<(Bytes, Address)> {
        let mut remote = self.remote.lock().expect("lock poisoned");
        let mut drained = Vec::new();
        remote.retain(|key, lease| {
            if segments.contains(&lease.segment) {
                drained.push((key.clone(), lease.holder));
                false
            } else {
                true
            }
        });
        drained
    }

    /// Number of leases granted to other nodes.
    pub fn remote_bias_count(&self) -> usize {
        self.remote.lock().expect("lock poisoned").len()
    }

    // ------------------------------------------------------------------
    // Holder side
    // ------------------------------------------------------------------

    /// Current revocation epoch. Take it before sending a write that may
    /// come back with a lease.
    pub fn fence(&self) -> u64 {
        self.holder.lock().expect("lock poisoned").epoch
    }

    /// Accept a lease granted by the owner.
    ///
    /// Refused when `key` was revoked after `fence` was taken: the grant is
    /// older than the revocation.
    pub fn acquire_local_bias(
        &self,
        key: Bytes,
        segment: SegmentId,
        lease: Duration,
        fence: u64,
    ) -> bool {
        let mut holder = self.holder.lock().expect("lock poisoned");
        if let Some(mark) = holder.revoked.get(&key)
            && mark.epoch > fence
        {
            debug!(fence, revoked_at = mark.epoch, "bias grant raced a revocation, refusing");
            return false;
        }
        holder.leases.insert(
            key,
            LocalLease {
                segment,
                expires: Instant::now() + lease,
            },
        );
        true
    }

    /// Whether this node holds a valid lease on `key`.
    pub fn has_local_bias(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        self.holder
            .lock()
            .expect("lock poisoned")
            .leases
            .get(key)
            .is_some_and(|lease| lease.expires > now)
    }

    /// Whether the lease on `key` is close enough to expiry to renew.
    pub fn needs_renewal(&self, key: &[u8]) -> bool {
        if self.renewal_threshold.is_zero() {
            return false;
        }
        let now = Instant::now();
        self.holder
            .lock()
            .expect("lock poisoned")
            .leases
            .get(key)
            .is_some_and(|lease| {
                lease.expires > now && lease.expires - now < self.renewal_threshold
            })
    }

    /// Claim the renewal of `key`. Returns `false` if one is already running.
    pub fn begin_renewal(&self, key: &Bytes) -> bool {
        self.holder
            .lock()
            .expect("lock poisoned")
            .renewing
            .insert(key.clone())
    }

    /// Release the renewal claim on `key`.
    pub fn end_renewal(&self, key: &[u8]) {
        self.holder
            .lock()
            .expect("lock poisoned")
            .renewing
            .remove(key);
    }

    /// Extend an existing lease. Never creates one.
    pub fn renew_local(&self, key: &[u8], lease: Duration) -> bool {
        let mut holder = self.holder.lock().expect("lock poisoned");
        match holder.leases.get_mut(key) {
            Some(local) => {
                local.expires = Instant::now() + lease;
                true
            }
            None => false,
        }
    }

    /// Drop the lease on `key` at the owner's request.
    ///
    /// Returns whether a lease was held. The revocation is remembered so a
    /// grant still in flight cannot resurrect it.
    pub fn revoke_locally(&self, key: &Bytes) -> bool {
        let now = Instant::now();
        let mut holder = self.holder.lock().expect("lock poisoned");
        holder.epoch += 1;
        let epoch = holder.epoch;
        holder
            .revoked
            .insert(key.clone(), RevocationMark { epoch, at: now });
        let horizon = self.fence_horizon;
        holder
            .revoked
            .retain(|_, mark| now.saturating_duration_since(mark.at) <= horizon);
        holder.leases.remove(key).is_some()
    }

    /// Drop every lease on keys of `segments`. Returns how many went.
    pub fn revoke_local_segments(&self, segments: &SegmentSet) -> usize {
        let mut holder = self.holder.lock().expect("lock poisoned");
        let before = holder.leases.len();
        holder
            .leases
            .retain(|_, lease| !segments.contains(&lease.segment));
        before - holder.leases.len()
    }

    /// Forget leases that ran out by `now`.
    pub fn prune_local(&self, now: Instant) -> usize {
        let mut holder = self.holder.lock().expect("lock poisoned");
        let before = holder.leases.len();
        holder.leases.retain(|_, lease| lease.expires > now);
        let horizon = self.fence_horizon;
        holder
            .revoked
            .retain(|_, mark| now.saturating_duration_since(mark.at) <= horizon);
        before - holder.leases.len()
    }

    /// Number of valid-or-expired leases this node holds.
    pub fn local_bias_count(&self) -> usize {
        self.holder.lock().expect("lock poisoned").leases.len()
    }
}
