//! [`ScatterCache`]: the key-value interface applications use.
//!
//! Callers depend on this trait rather than on [`ScatterNode`] so a cache
//! can be swapped for a test double.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::future::try_join_all;
use scatter_net::{ComputeFn, MergeFn, WriteOp};
use scatter_types::{Address, EntryMetadata};

use crate::error::EngineError;
use crate::node::ScatterNode;

/// Key-value operations of a scattered cache.
///
/// Every call can be issued on any member; it is routed to the key's
/// primary owner as needed.
#[async_trait::async_trait]
pub trait ScatterCache: Send + Sync {
    /// Read the live value of `key`.
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, EngineError>;

    /// Whether `key` has a live value.
    async fn contains_key(&self, key: &Bytes) -> Result<bool, EngineError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Store `value`, returning the previous live value.
    async fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, EngineError> {
        self.put_with_metadata(key, value, EntryMetadata::default())
            .await
    }

    /// Store `value` with expiration settings, returning the previous live
    /// value.
    async fn put_with_metadata(
        &self,
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    ) -> Result<Option<Bytes>, EngineError>;

    /// Store `value` only if `key` has no live value. Returns the existing
    /// value, or `None` if `value` was stored.
    async fn put_if_absent(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, EngineError>;

    /// Store `value` only if `key` has a live value. Returns the replaced
    /// value, or `None` if nothing was stored.
    async fn replace(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, EngineError>;

    /// Remove `key`, returning its previous live value.
    async fn remove(&self, key: Bytes) -> Result<Option<Bytes>, EngineError>;

    /// Remove `key` only if its live value equals `expected`.
    async fn remove_if(&self, key: Bytes, expected: Bytes) -> Result<bool, EngineError>;

    /// Recompute the value of `key`. Returns the new live value.
    async fn compute(&self, key: Bytes, function: ComputeFn) -> Result<Option<Bytes>, EngineError>;

    /// Compute a value for `key` if it has none. Returns the live value
    /// after the call.
    async fn compute_if_absent(
        &self,
        key: Bytes,
        function: ComputeFn,
    ) -> Result<Option<Bytes>, EngineError>;

    /// Recompute the value of `key` if it has one. Returns the live value
    /// after the call.
    async fn compute_if_present(
        &self,
        key: Bytes,
        function: ComputeFn,
    ) -> Result<Option<Bytes>, EngineError>;

    /// Store `value` if `key` has none, otherwise merge it into the current
    /// value. Returns the live value after the call.
    async fn merge(
        &self,
        key: Bytes,
        value: Bytes,
        function: MergeFn,
    ) -> Result<Option<Bytes>, EngineError>;

    /// Store every pair. Pairs are grouped by primary owner and the groups
    /// are written concurrently.
    async fn put_all(&self, entries: Vec<(Bytes, Bytes)>) -> Result<(), EngineError>;
}

#[async_trait::async_trait]
impl ScatterCache for ScatterNode {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, EngineError> {
        self.read(key).await
    }

    async fn put_with_metadata(
        &self,
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    ) -> Result<Option<Bytes>, EngineError> {
        let reply = self.write(key, WriteOp::Put { value, metadata }).await?;
        Ok(reply.previous)
    }

    async fn put_if_absent(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::PutIfAbsent {
            value,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.previous)
    }

    async fn replace(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::Replace {
            value,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.previous)
    }

    async fn remove(&self, key: Bytes) -> Result<Option<Bytes>, EngineError> {
        Ok(self.write(key, WriteOp::Remove).await?.previous)
    }

    async fn remove_if(&self, key: Bytes, expected: Bytes) -> Result<bool, EngineError> {
        let reply = self.write(key, WriteOp::RemoveIf { expected }).await?;
        Ok(reply.applied())
    }

    async fn compute(&self, key: Bytes, function: ComputeFn) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::Compute {
            function,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.current)
    }

    async fn compute_if_absent(
        &self,
        key: Bytes,
        function: ComputeFn,
    ) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::ComputeIfAbsent {
            function,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.current)
    }

    async fn compute_if_present(
        &self,
        key: Bytes,
        function: ComputeFn,
    ) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::ComputeIfPresent {
            function,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.current)
    }

    async fn merge(
        &self,
        key: Bytes,
        value: Bytes,
        function: MergeFn,
    ) -> Result<Option<Bytes>, EngineError> {
        let op = WriteOp::Merge {
            value,
            function,
            metadata: EntryMetadata::default(),
        };
        Ok(self.write(key, op).await?.current)
    }

    async fn put_all(&self, entries: Vec<(Bytes, Bytes)>) -> Result<(), EngineError> {
        let topology = self.topology();
        let mut groups: BTreeMap<Address, Vec<(Bytes, Bytes)>> = BTreeMap::new();
        for (key, value) in entries {
            groups
                .entry(topology.primary_owner(&key))
                .or_default()
                .push((key, value));
        }

        try_join_all(groups.into_values().map(|group| async move {
            for (key, value) in group {
                let op = WriteOp::Put {
                    value,
                    metadata: EntryMetadata::default(),
                };
                self.write(key, op).await?;
            }
            Ok::<(), EngineError>(())
        }))
        .await?;
        Ok(())
    }
}
