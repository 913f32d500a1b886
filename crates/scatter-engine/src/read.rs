//! Read path.
//!
//! The primary owner always answers from its own store. Other nodes answer
//! locally only while they hold a read lease on the key and a live copy of
//! it; otherwise they ask the owner. Local reads of entries with a max-idle
//! limit are reported to the owner so its copy does not idle out.

use bytes::Bytes;
use scatter_net::{CacheMessage, CacheResponse};
use scatter_placement::Topology;
use scatter_types::{Address, CacheEntry, TopologyId};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::node::ScatterNode;

impl ScatterNode {
    /// Read the live value of `key`, re-routing while the topology is in
    /// flux.
    pub(crate) async fn read(&self, key: &Bytes) -> Result<Option<Bytes>, EngineError> {
        let mut attempt = 0;
        loop {
            let topology = self.topology();
            match self.read_once(&topology, key).await {
                Err(e) if e.is_routing() && attempt < self.config.routing_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "re-routing read");
                    self.await_newer_topology(topology.id()).await;
                }
                result => return result,
            }
        }
    }

    async fn read_once(
        &self,
        topology: &Topology,
        key: &Bytes,
    ) -> Result<Option<Bytes>, EngineError> {
        let segment = topology.segment_of(key);
        let owner = topology.segment_owner(segment);

        if owner == self.address {
            self.svm.ensure_owned(segment)?;
            let entry = self.store.get(segment, key, Instant::now())?;
            return Ok(entry.and_then(|e| e.value));
        }

        // An expired local copy falls through to the owner, whose copy may
        // have been kept alive by other readers.
        if self.bias.has_local_bias(key)
            && let Some(entry) = self.store.get(segment, key, Instant::now())?
        {
            if self.bias.needs_renewal(key) {
                self.renew_bias_in_background(owner, key.clone(), topology.id());
            }
            if entry.metadata.max_idle.is_some() {
                self.touch_at_owner(owner, key, topology.id()).await;
            }
            trace!(segment, "read served under bias");
            return Ok(entry.value);
        }

        let message = CacheMessage::Get {
            key: key.clone(),
            topology_id: topology.id(),
        };
        let response = self
            .transport
            .request(owner, message, self.config.remote_timeout)
            .await
            .map_err(|e| EngineError::from_net(owner, e))?;

        match response {
            CacheResponse::Entry(entry) => Ok(entry.and_then(|e| e.value)),
            CacheResponse::Rejected(reason) => Err(EngineError::from_rejection(
                owner,
                reason,
                topology.id(),
                self.config.remote_timeout,
            )),
            other => Err(EngineError::UnexpectedResponse {
                target: owner,
                got: other.name(),
            }),
        }
    }

    /// Serve a `Get` sent by another node.
    pub(crate) fn serve_get(
        &self,
        key: &Bytes,
        topology_id: TopologyId,
    ) -> Result<Option<CacheEntry>, EngineError> {
        let topology = self.topology();
        if topology.id() != topology_id {
            return Err(EngineError::OutdatedTopology {
                local: topology.id(),
                remote: topology_id,
            });
        }
        let segment = topology.segment_of(key);
        self.svm.ensure_owned(segment)?;
        Ok(self.store.get(segment, key, Instant::now())?)
    }

    /// Record a read served under a lease at the owner, so idle expiry
    /// there follows the holder's reads.
    async fn touch_at_owner(&self, owner: Address, key: &Bytes, topology_id: TopologyId) {
        let message = CacheMessage::Touch {
            key: key.clone(),
            topology_id,
        };
        if let Err(e) = self.transport.send(owner, message).await {
            debug!(owner = %owner.fmt_short(), error = %e, "idle touch not sent");
        }
    }

    /// Serve a `Touch`: record the access without returning the entry.
    pub(crate) fn serve_touch(
        &self,
        key: &Bytes,
        topology_id: TopologyId,
    ) -> Result<(), EngineError> {
        self.serve_get(key, topology_id).map(|_| ())
    }

    /// Extend this node's lease on `key` without blocking the read.
    ///
    /// At most one renewal per key is in flight.
    fn renew_bias_in_background(&self, owner: Address, key: Bytes, topology_id: TopologyId) {
        if !self.bias.begin_renewal(&key) {
            return;
        }
        let bias = self.bias.clone();
        let transport = self.transport.clone();
        let timeout = self.config.remote_timeout;

        tokio::spawn(async move {
            let message = CacheMessage::RenewBias {
                key: key.clone(),
                topology_id,
            };
            match transport.request(owner, message, timeout).await {
                Ok(CacheResponse::Renewed { lease: Some(lease) }) => {
                    bias.renew_local(&key, lease);
                }
                Ok(CacheResponse::Renewed { lease: None }) => {
                    bias.revoke_locally(&key);
                }
                Ok(other) => debug!(got = other.name(), "unexpected reply to bias renewal"),
                Err(e) => debug!(error = %e, "bias renewal failed"),
            }
            bias.end_renewal(&key);
        });
    }

    /// Serve a `RenewBias` from `holder`: the new lease, or `None` if
    /// `holder` no longer has one.
    pub(crate) fn serve_renewal(
        &self,
        holder: Address,
        key: &Bytes,
        topology_id: TopologyId,
    ) -> Option<std::time::Duration> {
        if self.topology().id() != topology_id {
            return None;
        }
        let lifespan = self.config.bias_lifespan;
        self.bias
            .renew_remote(key, &holder, lifespan)
            .then_some(lifespan)
    }
}
