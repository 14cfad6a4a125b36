//! Envelope dispatch: classify a delivery, run its handlers, decide its fate.
//!
//! Dispatch never unwinds into the caller. Every outcome, handler panics
//! included, comes back as a [`Disposition`] that the pump turns into a
//! `complete` or an `abandon`.

mod dispatcher;

pub use dispatcher::Dispatcher;

use crate::error::BusError;

/// Routing class of an inbound envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Command,
    CompetingEvent,
    MulticastEvent,
    Request,
    MulticastRequest,
    Reply,
    /// No handler is registered for the payload type in this role.
    Unroutable,
}

/// Terminal decision for one delivery.
#[derive(Debug)]
pub enum Disposition {
    /// Acknowledge; the broker forgets the message.
    Complete,
    /// Hand the message back for redelivery.
    Abandon(BusError),
}

impl Disposition {
    pub fn is_complete(&self) -> bool {
        matches!(self, Disposition::Complete)
    }

    /// The abandon reason, if any.
    pub fn fault(&self) -> Option<&BusError> {
        match self {
            Disposition::Complete => None,
            Disposition::Abandon(err) => Some(err),
        }
    }
}
