//! courier: message bus dispatch and correlation engine.
//!
//! Commands, competing and multicast events, request/response and multicast
//! request fan-in over an at-least-once transport. See [`Bus`] for the
//! caller API and [`transport`] for the broker boundary.

pub mod bus;
pub mod correlation;
pub mod dispatch;
pub mod handler;
pub mod pump;
pub mod transport;

mod config;
mod error;
mod message;

pub use bus::{Bus, BusBuilder};
pub use config::BusConfig;
pub use correlation::{MulticastAggregator, RequestCorrelator};
pub use dispatch::{Classification, Dispatcher, Disposition};
pub use error::{BusError, HandlerFault};
pub use handler::{
    HandleCommand, HandleEvent, HandleRequest, HandlerError, HandlerKind, HandlerRegistry,
    MessageContext,
};
pub use message::{BusCommand, BusEvent, BusMessage, BusRequest};
pub use pump::{FaultEvent, FaultStream, MessagePump, PumpState, PumpStats};
pub use transport::{InMemoryTransport, TransportError};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
