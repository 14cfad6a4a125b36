//! Transport collaborator traits.
//!
//! The engine only ever talks to a broker through these traits: a `Sender`
//! for outbound envelopes, and a `Channel` per inbound queue or subscription
//! that runs a receive loop and settles each delivery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::envelope::{Envelope, SubscriptionMode};
use super::error::TransportError;

/// Callback invoked by a channel for every delivered envelope.
pub type EnvelopeCallback = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Where an outbound envelope goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point: one receiver consumes each message.
    Queue(String),
    /// Fan-out: every subscription gets a copy.
    Topic(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{}", name),
            Destination::Topic(name) => write!(f, "topic:{}", name),
        }
    }
}

/// Where inbound envelopes come from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Queue(String),
    Subscription {
        topic: String,
        name: String,
        mode: SubscriptionMode,
    },
}

impl Source {
    /// Broker entity path, e.g. `orders.place` or `orders.placed/subscriptions/billing`.
    pub fn path(&self) -> String {
        match self {
            Source::Queue(name) => name.clone(),
            Source::Subscription { topic, name, .. } => {
                format!("{}/subscriptions/{}", topic, name)
            }
        }
    }

    pub fn subscription_mode(&self) -> Option<SubscriptionMode> {
        match self {
            Source::Queue(_) => None,
            Source::Subscription { mode, .. } => Some(*mode),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Sends envelopes to queues and topics.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, destination: &Destination, envelope: Envelope)
        -> Result<(), TransportError>;
}

/// One inbound queue or subscription.
#[async_trait]
pub trait Channel: Send + Sync {
    fn source(&self) -> &Source;

    /// Begin delivering envelopes to `on_envelope`, with at most
    /// `max_concurrency` callbacks in flight.
    async fn start(
        &self,
        on_envelope: EnvelopeCallback,
        max_concurrency: usize,
    ) -> Result<(), TransportError>;

    /// Stop the receive loop. Callbacks already in flight run to completion.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Acknowledge a delivery.
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Return a delivery for redelivery, attaching diagnostic metadata.
    async fn abandon(
        &self,
        envelope: &Envelope,
        metadata: Vec<(String, String)>,
    ) -> Result<(), TransportError>;
}

/// A broker: sends envelopes and opens inbound channels.
#[async_trait]
pub trait Transport: Sender {
    async fn open(&self, source: &Source) -> Result<Arc<dyn Channel>, TransportError>;
}
