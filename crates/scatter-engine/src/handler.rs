//! Dispatch of messages received from other nodes.

use scatter_net::{CacheMessage, CacheResponse, Invalidation, MessageHandler};
use scatter_types::{Address, CacheEntry};
use tracing::{debug, error, trace};

use crate::error::EngineError;
use crate::node::ScatterNode;

#[async_trait::async_trait]
impl MessageHandler for ScatterNode {
    async fn handle(&self, from: Address, message: CacheMessage) -> CacheResponse {
        let kind = message.kind();
        trace!(from = %from.fmt_short(), ?kind, "handling message");

        let result = match message {
            CacheMessage::Get { key, topology_id } => {
                self.serve_get(&key, topology_id).map(CacheResponse::Entry)
            }
            CacheMessage::Write {
                command,
                topology_id,
            } => self
                .apply_as_owner(command, topology_id)
                .await
                .map(CacheResponse::Written),
            CacheMessage::RevokeBias { keys } => {
                for key in &keys {
                    self.bias.revoke_locally(key);
                }
                Ok(CacheResponse::Ack)
            }
            CacheMessage::RenewBias { key, topology_id } => Ok(CacheResponse::Renewed {
                lease: self.serve_renewal(from, &key, topology_id),
            }),
            CacheMessage::InvalidateVersions { entries, removal } => self
                .apply_invalidations(&entries, removal)
                .map(|dropped| CacheResponse::Invalidated { dropped }),
            CacheMessage::ReleaseCopies { entries } => self
                .release_copies(&entries)
                .map(|dropped| CacheResponse::Invalidated { dropped }),
            CacheMessage::Touch { key, topology_id } => {
                self.serve_touch(&key, topology_id).map(|_| CacheResponse::Ack)
            }
            CacheMessage::BackupWrite { entry } => {
                self.store_backup(entry).map(|_| CacheResponse::Ack)
            }
            CacheMessage::SegmentEntries {
                segments,
                topology_id,
            } => {
                debug!(
                    from = %from.fmt_short(),
                    topology_id,
                    segments = segments.len(),
                    "serving segment entries"
                );
                self.store
                    .entries_in_segments(&segments)
                    .map(CacheResponse::Entries)
                    .map_err(EngineError::from)
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if !e.is_routing() {
                    error!(from = %from.fmt_short(), ?kind, error = %e, "request failed");
                }
                CacheResponse::Rejected(e.to_rejection())
            }
        }
    }
}

impl ScatterNode {
    /// Drop local copies older than the listed versions.
    pub(crate) fn apply_invalidations(
        &self,
        entries: &[Invalidation],
        removal: bool,
    ) -> Result<usize, EngineError> {
        let topology = self.topology();
        let mut dropped = 0;
        for invalidation in entries {
            let segment = topology.segment_of(&invalidation.key);
            if self.store.invalidate(
                segment,
                &invalidation.key,
                &invalidation.version,
                removal,
            )? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Drop copies a settling owner no longer needs here. Keys of segments
    /// this node owns are skipped.
    pub(crate) fn release_copies(&self, entries: &[Invalidation]) -> Result<usize, EngineError> {
        let topology = self.topology();
        let mut dropped = 0;
        for release in entries {
            let segment = topology.segment_of(&release.key);
            if topology.segment_owner(segment) == self.address {
                continue;
            }
            if self.store.release(segment, &release.key, &release.version)? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(node = %self.address.fmt_short(), dropped, "released settled copies");
        }
        Ok(dropped)
    }

    /// Keep an entry the owner committed as this node's backup copy.
    fn store_backup(&self, entry: CacheEntry) -> Result<bool, EngineError> {
        let segment = self.topology().segment_of(&entry.key);
        Ok(self.store.commit_if_newer(segment, entry)?)
    }
}
