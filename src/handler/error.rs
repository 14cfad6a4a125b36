//! Error type for application handlers.

use std::error::Error as StdError;

use thiserror::Error;

/// Error type for handler operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload decode / deserialization failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Response encode failed.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The handler panicked. Caught at the dispatch boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    /// Wrap any error as `HandlerError::Other`.
    pub fn other(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }
}

impl From<bitcode::Error> for HandlerError {
    fn from(err: bitcode::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}
