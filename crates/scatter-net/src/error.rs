//! Error types for network operations.

use std::time::Duration;

use scatter_types::Address;

use crate::message::MessageKind;

/// Errors that can occur while talking to another node.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// No live endpoint is registered for the target.
    #[error("node {0} is unreachable")]
    Unreachable(Address),

    /// The target did not answer in time.
    #[error("request to {target} timed out after {after:?}")]
    Timeout {
        /// The silent node.
        target: Address,
        /// How long the sender waited.
        after: Duration,
    },

    /// The message was lost on the way.
    #[error("{kind:?} message to {target} was dropped")]
    Dropped {
        /// Intended receiver.
        target: Address,
        /// Kind of the lost message.
        kind: MessageKind,
    },
}
