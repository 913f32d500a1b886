//! Scatter's node-to-node protocol.
//!
//! This crate defines:
//!
//! - [`CacheMessage`] / [`CacheResponse`]: the request/response protocol.
//! - [`Transport`]: what a node needs to reach other nodes.
//! - [`MessageHandler`]: what a node exposes to serve them.
//! - [`LocalNetwork`]: an in-process network wiring nodes together, with
//!   fault injection and per-node message counters.

use std::time::Duration;

use scatter_types::Address;

mod error;
mod local;
mod message;

pub use error::NetError;
pub use local::{LocalNetwork, LocalTransport};
pub use message::{
    CacheMessage, CacheResponse, ComputeFn, Invalidation, MergeFn, MessageKind, RejectReason,
    WriteCommand, WriteOp, WriteReply,
};

/// Network operations used by the engine.
///
/// Abstracted so the engine can run over the in-process [`LocalNetwork`]
/// or any other transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Address this transport sends from.
    fn local_address(&self) -> Address;

    /// Send `message` to `target` and wait up to `timeout` for the answer.
    async fn request(
        &self,
        target: Address,
        message: CacheMessage,
        timeout: Duration,
    ) -> Result<CacheResponse, NetError>;

    /// Send `message` to `target` without waiting for it to be processed.
    async fn send(&self, target: Address, message: CacheMessage) -> Result<(), NetError>;
}

/// Server side of the protocol, implemented by a node.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one request from `from`.
    async fn handle(&self, from: Address, message: CacheMessage) -> CacheResponse;
}
