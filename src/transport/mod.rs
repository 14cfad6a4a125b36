//! Transport boundary: the broker as seen by the dispatch engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Message pumps / Bus (engine)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Sender + Channel traits                     │
//! │  Sender:  send(destination, envelope)                        │
//! │  Channel: start(callback) / stop() / complete / abandon      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌─────────────────┐  ┌──────────────┐  ┌─────────────────────┐
//! │InMemoryTransport│  │ Service Bus  │  │  AMQP / SQS+SNS     │
//! │   (included)    │  │  (external)  │  │    (external)       │
//! └─────────────────┘  └──────────────┘  └─────────────────────┘
//! ```
//!
//! Delivery is at-least-once. Every envelope a channel hands to its callback
//! must be settled exactly once, by `complete` or `abandon`.

mod channel;
mod envelope;
mod error;
mod in_memory;

pub use channel::{Channel, Destination, EnvelopeCallback, Sender, Source, Transport};
pub use envelope::{
    CorrelationId, DeliveryInfo, Envelope, MessageKind, SubscriptionMode, FAULT_HEADER,
};
pub use error::TransportError;
pub use in_memory::{AbandonRecord, InMemoryChannel, InMemoryTransport, DEFAULT_MAX_DELIVERY_COUNT};
