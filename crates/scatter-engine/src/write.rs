//! Write path.
//!
//! Every write executes at the key's primary owner. The owner revokes any
//! other node's lease on the key, applies the mutation under a fresh
//! version, and replies with the committed entry. The originator stores
//! that entry as the backup copy; when the owner itself originated the
//! write it forwards the entry to the next member instead.

use bytes::Bytes;
use scatter_net::{CacheMessage, CacheResponse, WriteCommand, WriteOp, WriteReply};
use scatter_placement::Topology;
use scatter_store::StoreWrite;
use scatter_types::{Address, BiasAcquisition, CacheEntry, EntryMetadata, SegmentId, TopologyId};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::node::ScatterNode;

/// What a write operation decided to do with the key.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Mutation {
    /// Nothing changes.
    Keep,
    /// Store a new value.
    Store(Bytes, EntryMetadata),
    /// Leave a tombstone.
    Remove,
}

/// Decide what `op` does given the live value of `key`.
///
/// Compute and merge functions are invoked here, exactly once per call.
pub(crate) fn evaluate(op: &WriteOp, key: &Bytes, live: Option<&Bytes>) -> Mutation {
    match op {
        WriteOp::Put { value, metadata } => Mutation::Store(value.clone(), *metadata),
        WriteOp::PutIfAbsent { value, metadata } => match live {
            None => Mutation::Store(value.clone(), *metadata),
            Some(_) => Mutation::Keep,
        },
        WriteOp::Replace { value, metadata } => match live {
            Some(_) => Mutation::Store(value.clone(), *metadata),
            None => Mutation::Keep,
        },
        WriteOp::Remove => Mutation::Remove,
        WriteOp::RemoveIf { expected } => match live {
            Some(current) if current == expected => Mutation::Remove,
            _ => Mutation::Keep,
        },
        WriteOp::Compute { function, metadata } => match function(key, live) {
            Some(value) => Mutation::Store(value, *metadata),
            None => Mutation::Remove,
        },
        WriteOp::ComputeIfAbsent { function, metadata } => match live {
            Some(_) => Mutation::Keep,
            None => match function(key, None) {
                Some(value) => Mutation::Store(value, *metadata),
                None => Mutation::Keep,
            },
        },
        WriteOp::ComputeIfPresent { function, metadata } => match live {
            None => Mutation::Keep,
            Some(current) => match function(key, Some(current)) {
                Some(value) => Mutation::Store(value, *metadata),
                None => Mutation::Remove,
            },
        },
        WriteOp::Merge {
            value,
            function,
            metadata,
        } => match live {
            None => Mutation::Store(value.clone(), *metadata),
            Some(current) => match function(current, value) {
                Some(merged) => Mutation::Store(merged, *metadata),
                None => Mutation::Remove,
            },
        },
    }
}

impl ScatterNode {
    /// Execute a write, re-routing while the topology is in flux.
    pub(crate) async fn write(&self, key: Bytes, op: WriteOp) -> Result<WriteReply, EngineError> {
        let mut attempt = 0;
        loop {
            let topology = self.topology();
            match self.write_once(&topology, &key, &op).await {
                Err(e) if e.is_routing() && attempt < self.config.routing_retries => {
                    attempt += 1;
                    debug!(op = op.name(), attempt, error = %e, "re-routing write");
                    self.await_newer_topology(topology.id()).await;
                }
                result => return result,
            }
        }
    }

    async fn write_once(
        &self,
        topology: &Topology,
        key: &Bytes,
        op: &WriteOp,
    ) -> Result<WriteReply, EngineError> {
        let segment = topology.segment_of(key);
        let owner = topology.segment_owner(segment);
        let command = WriteCommand {
            key: key.clone(),
            op: op.clone(),
            origin: self.address,
        };

        if owner == self.address {
            let reply = self.apply_as_owner(command, topology.id()).await?;
            if let Some(entry) = &reply.entry {
                self.replicate_to_backup(topology, entry.clone()).await;
            }
            return Ok(reply);
        }

        let fence = self.bias.fence();
        let message = CacheMessage::Write {
            command,
            topology_id: topology.id(),
        };
        let response = self
            .transport
            .request(owner, message, self.config.remote_timeout)
            .await
            .map_err(|e| EngineError::from_net(owner, e))?;

        match response {
            CacheResponse::Written(reply) => {
                if let Some(entry) = &reply.entry {
                    // The originator keeps the backup copy.
                    self.store.commit_if_newer(segment, entry.clone())?;
                }
                if let Some(lease) = reply.bias_lease {
                    self.bias
                        .acquire_local_bias(key.clone(), segment, lease, fence);
                }
                Ok(reply)
            }
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

    /// Apply `command` as the key's primary owner.
    ///
    /// Runs for local writes and for writes forwarded by other nodes.
    pub(crate) async fn apply_as_owner(
        &self,
        command: WriteCommand,
        topology_id: TopologyId,
    ) -> Result<WriteReply, EngineError> {
        let topology = self.topology();
        if topology.id() != topology_id {
            return Err(EngineError::OutdatedTopology {
                local: topology.id(),
                remote: topology_id,
            });
        }
        let segment = topology.segment_of(&command.key);
        let remote_origin = command.origin != self.address;

        let _gate = self.gate(segment).lock().await;
        self.svm.ensure_owned(segment)?;

        if let Some(holder) = self.bias.remote_bias(&command.key)
            && holder != command.origin
        {
            self.revoke_for_write(&topology, &command.key, holder, remote_origin)
                .await?;
        }

        let mut reply = self.apply_locally(segment, &command)?;

        if let Some(entry) = &reply.entry {
            if remote_origin
                && self.config.bias_acquisition == BiasAcquisition::OnWrite
                && self.bias.acquisition_allowed(segment)
            {
                let lifespan = self.config.bias_lifespan;
                self.bias
                    .register_bias(command.key.clone(), segment, command.origin, lifespan);
                reply.bias_lease = Some(lifespan);
            }
            self.svm
                .schedule_invalidation(command.key.clone(), entry.version, entry.is_tombstone());
            trace!(
                op = command.op.name(),
                segment,
                version = %entry.version,
                origin = %command.origin.fmt_short(),
                "write committed"
            );
        }
        Ok(reply)
    }

    /// Evaluate and commit `command` in the local store.
    fn apply_locally(
        &self,
        segment: SegmentId,
        command: &WriteCommand,
    ) -> Result<WriteReply, EngineError> {
        let now = Instant::now();
        let mut previous = None;
        let mut current = None;
        let mut failure = None;

        let result = self.store.compute(segment, &command.key, &mut |existing| {
            let live = existing.and_then(|entry| entry.live_value(now));
            previous = live.cloned();
            let (value, metadata) = match evaluate(&command.op, &command.key, live) {
                Mutation::Keep => {
                    current = previous.clone();
                    return StoreWrite::Keep;
                }
                Mutation::Store(value, metadata) => (Some(value), metadata),
                Mutation::Remove => (None, EntryMetadata::default()),
            };

            let version = match self
                .svm
                .increment_version(segment, existing.map(|entry| &entry.version))
            {
                Ok(version) => version,
                Err(e) => {
                    failure = Some(e);
                    return StoreWrite::Keep;
                }
            };
            current = value.clone();
            StoreWrite::Put(match value {
                Some(value) => CacheEntry::new(command.key.clone(), value, version, metadata, now),
                None => CacheEntry::tombstone(command.key.clone(), version, now),
            })
        })?;

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(WriteReply {
            previous,
            current,
            entry: if result.written { result.current } else { None },
            bias_lease: None,
        })
    }

    /// Revoke `holder`'s lease on `key` before a conflicting write.
    ///
    /// Holders that left the topology are forgotten without asking. For
    /// writes this node originated, revocation is retried a bounded number
    /// of times; for forwarded writes it is retried until the remote
    /// timeout, which is how long the originator waits anyway.
    async fn revoke_for_write(
        &self,
        topology: &Topology,
        key: &Bytes,
        holder: Address,
        remote_origin: bool,
    ) -> Result<(), EngineError> {
        if !topology.is_member(&holder) {
            self.bias.revoke(key, &holder);
            return Ok(());
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let message = CacheMessage::RevokeBias {
                keys: vec![key.clone()],
            };
            let reason = match self
                .transport
                .request(holder, message, self.config.revocation_timeout)
                .await
            {
                Ok(CacheResponse::Ack) => {
                    self.bias.revoke(key, &holder);
                    trace!(holder = %holder.fmt_short(), "bias revoked for write");
                    return Ok(());
                }
                Ok(other) => format!("unexpected {} reply", other.name()),
                Err(e) => e.to_string(),
            };
            warn!(holder = %holder.fmt_short(), attempt, %reason, "bias revocation failed");

            if remote_origin {
                let elapsed = started.elapsed();
                if elapsed >= self.config.remote_timeout {
                    return Err(EngineError::RevocationTimedOut {
                        holder,
                        after: elapsed,
                    });
                }
            } else if attempt >= self.config.revocation_retries {
                return Err(EngineError::RemoteCommunication {
                    target: holder,
                    reason,
                });
            }
            tokio::time::sleep(self.config.revocation_backoff).await;
        }
    }

    /// Hand a committed entry to the owner's backup.
    async fn replicate_to_backup(&self, topology: &Topology, entry: CacheEntry) {
        let Some(backup) = topology.next_member(&self.address) else {
            return;
        };
        if let Err(e) = self
            .transport
            .send(backup, CacheMessage::BackupWrite { entry })
            .await
        {
            warn!(backup = %backup.fmt_short(), error = %e, "backup write not sent");
        }
    }
}
