//! In-process network connecting nodes that live in the same runtime.
//!
//! Requests run the receiver's handler on the caller's task, bounded by the
//! caller's timeout: when the caller gives up, the receiver's processing is
//! cancelled with it. Fire-and-forget sends are spawned and tracked so tests
//! can wait for them with [`LocalNetwork::quiesce`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use scatter_types::Address;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::message::{CacheMessage, CacheResponse, MessageKind};
use crate::{MessageHandler, Transport};

/// Injected failures.
#[derive(Debug, Default)]
struct Faults {
    /// Nodes that answer nothing at all.
    down: HashSet<Address>,
    /// Messages of a kind to a node that fail immediately.
    dropped: HashSet<(Address, MessageKind)>,
    /// Messages of a kind to a node that never get an answer.
    stalled: HashSet<(Address, MessageKind)>,
}

enum Verdict {
    Deliver,
    Fail(NetError),
    Stall,
}

/// Shared in-process network.
pub struct LocalNetwork {
    handlers: RwLock<HashMap<Address, Weak<dyn MessageHandler>>>,
    faults: RwLock<Faults>,
    /// Messages sent, keyed by (sender, kind).
    sent: Mutex<HashMap<(Address, MessageKind), u64>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl LocalNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            sent: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Route messages for `address` to `handler`.
    ///
    /// Only a weak reference is kept; once the handler is dropped the
    /// address becomes unreachable.
    pub fn register(&self, address: Address, handler: &Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .expect("lock poisoned")
            .insert(address, Arc::downgrade(handler));
        debug!(node = %address.fmt_short(), "registered on local network");
    }

    /// Stop routing messages to `address`.
    pub fn unregister(&self, address: &Address) {
        self.handlers
            .write()
            .expect("lock poisoned")
            .remove(address);
    }

    /// A transport sending from `address`.
    pub fn endpoint(self: &Arc<Self>, address: Address) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            address,
        })
    }

    /// Make `address` unreachable (or reachable again).
    pub fn set_down(&self, address: Address, down: bool) {
        let mut faults = self.faults.write().expect("lock poisoned");
        if down {
            faults.down.insert(address);
        } else {
            faults.down.remove(&address);
        }
    }

    /// Fail every `kind` message sent to `target`.
    pub fn drop_messages(&self, target: Address, kind: MessageKind) {
        self.faults
            .write()
            .expect("lock poisoned")
            .dropped
            .insert((target, kind));
    }

    /// Never answer `kind` messages sent to `target`.
    pub fn stall_messages(&self, target: Address, kind: MessageKind) {
        self.faults
            .write()
            .expect("lock poisoned")
            .stalled
            .insert((target, kind));
    }

    /// Remove every injected failure.
    pub fn clear_faults(&self) {
        *self.faults.write().expect("lock poisoned") = Faults::default();
    }

    /// Total messages sent by `sender`.
    pub fn sent_by(&self, sender: &Address) -> u64 {
        self.sent
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|((from, _), _)| from == sender)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Messages of `kind` sent by `sender`.
    pub fn sent_by_kind(&self, sender: &Address, kind: MessageKind) -> u64 {
        self.sent
            .lock()
            .expect("lock poisoned")
            .get(&(*sender, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Reset all message counters.
    pub fn reset_counters(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }

    /// Wait until every fire-and-forget send has been processed.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn count(&self, from: Address, kind: MessageKind) {
        *self
            .sent
            .lock()
            .expect("lock poisoned")
            .entry((from, kind))
            .or_insert(0) += 1;
    }

    fn verdict(&self, target: Address, kind: MessageKind) -> Verdict {
        let faults = self.faults.read().expect("lock poisoned");
        if faults.down.contains(&target) {
            Verdict::Fail(NetError::Unreachable(target))
        } else if faults.dropped.contains(&(target, kind)) {
            Verdict::Fail(NetError::Dropped { target, kind })
        } else if faults.stalled.contains(&(target, kind)) {
            Verdict::Stall
        } else {
            Verdict::Deliver
        }
    }

    fn handler(&self, target: &Address) -> Result<Arc<dyn MessageHandler>, NetError> {
        self.handlers
            .read()
            .expect("lock poisoned")
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or(NetError::Unreachable(*target))
    }

    async fn deliver(
        &self,
        from: Address,
        target: Address,
        message: CacheMessage,
    ) -> Result<CacheResponse, NetError> {
        match self.verdict(target, message.kind()) {
            Verdict::Fail(e) => Err(e),
            Verdict::Stall => std::future::pending().await,
            Verdict::Deliver => {
                let handler = self.handler(&target)?;
                Ok(handler.handle(from, message).await)
            }
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    address: Address,
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    fn local_address(&self) -> Address {
        self.address
    }

    async fn request(
        &self,
        target: Address,
        message: CacheMessage,
        timeout: Duration,
    ) -> Result<CacheResponse, NetError> {
        let kind = message.kind();
        self.network.count(self.address, kind);
        trace!(from = %self.address.fmt_short(), to = %target.fmt_short(), ?kind, "request");

        tokio::time::timeout(timeout, self.network.deliver(self.address, target, message))
            .await
            .map_err(|_| NetError::Timeout {
                target,
                after: timeout,
            })?
    }

    async fn send(&self, target: Address, message: CacheMessage) -> Result<(), NetError> {
        let kind = message.kind();
        self.network.count(self.address, kind);

        match self.network.verdict(target, kind) {
            Verdict::Fail(e) => return Err(e),
            Verdict::Stall => return Ok(()),
            Verdict::Deliver => {}
        }
        let handler = self.network.handler(&target)?;

        let network = self.network.clone();
        let from = self.address;
        network.in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            handler.handle(from, message).await;
            if network.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                network.idle.notify_waiters();
            }
        });
        Ok(())
    }
}
