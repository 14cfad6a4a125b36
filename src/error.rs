use std::time::Duration;

use thiserror::Error;

use crate::handler::{HandlerError, HandlerKind};
use crate::transport::{CorrelationId, TransportError};

/// A handler failure, tagged with the handler that raised it.
#[derive(Debug, Error)]
#[error("handler {handler} failed: {source}")]
pub struct HandlerFault {
    pub handler: &'static str,
    #[source]
    pub source: HandlerError,
}

/// Errors surfaced by the bus, the dispatcher and the message pump.
#[derive(Debug, Error)]
pub enum BusError {
    /// Pump misuse: starting a running pump, stopping mid-startup.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// No handler (or, for outbound messages, no registration) for the payload type.
    #[error("the type {message_type} is not a recognised {kind} type; register it with the handler registry")]
    UnregisteredType {
        message_type: String,
        kind: &'static str,
    },

    /// A single handler raised an error. Retryable through abandon.
    #[error(transparent)]
    Handler(HandlerFault),

    /// One or more handlers of a fan-out dispatch raised an error.
    #[error("{} of {total} handlers failed; first: {}", .faults.len(), first_fault(.faults))]
    MulticastHandlers { faults: Vec<HandlerFault>, total: usize },

    /// No reply arrived before the deadline.
    #[error("request {correlation_id} timed out after {timeout:?}")]
    RequestTimedOut {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// `complete` or `abandon` failed. Logged by the pump, never propagated.
    #[error("disposition failed: {0}")]
    Disposition(#[source] TransportError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A request envelope arrived without a reply-to address.
    #[error("request {envelope_id} has no reply-to address")]
    MissingReplyTo { envelope_id: String },

    /// The responder sent a fault reply instead of a response.
    ///
    /// Only external responders answer single requests with a fault; this
    /// crate's dispatcher abandons a failed request for redelivery.
    #[error("responder {responder} failed: {description}")]
    RemoteFault {
        responder: String,
        description: String,
    },

    #[error("more than one {kind} handler registered for {message_type}")]
    DuplicateHandler {
        message_type: String,
        kind: HandlerKind,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn first_fault(faults: &[HandlerFault]) -> String {
    faults
        .first()
        .map(|fault| fault.to_string())
        .unwrap_or_default()
}

impl BusError {
    /// Stable identifier for the error class, used in abandon metadata and fault events.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::IllegalState(_) => "illegal-state",
            BusError::UnregisteredType { .. } => "unregistered-type",
            BusError::Handler(_) | BusError::MulticastHandlers { .. } => "handler",
            BusError::RequestTimedOut { .. } => "request-timed-out",
            BusError::Disposition(_) => "disposition",
            BusError::Transport(_) => "transport",
            BusError::Codec(_) => "codec",
            BusError::MissingReplyTo { .. } => "missing-reply-to",
            BusError::RemoteFault { .. } => "remote-fault",
            BusError::DuplicateHandler { .. } => "duplicate-handler",
            BusError::Config(_) => "config",
        }
    }

    /// Whether redelivery could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Handler(_) | BusError::MulticastHandlers { .. } | BusError::Transport(_)
        )
    }
}

impl From<bitcode::Error> for BusError {
    fn from(err: bitcode::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}
