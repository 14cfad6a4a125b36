//! Error type for transport operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The delivery lock expired or the delivery was already settled.
    #[error("delivery lock lost: {0}")]
    LockLost(String),
    /// A receive loop is already running on this channel.
    #[error("channel {0} is already receiving")]
    AlreadyReceiving(String),
    /// The channel or transport has been shut down.
    #[error("channel closed: {0}")]
    Closed(String),
    /// The broker rejected the operation.
    #[error("rejected: {0}")]
    Rejected(String),
}
