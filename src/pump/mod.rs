//! Message pump: the receive loop of one queue or subscription.
//!
//! ```text
//! Channel ──envelope──► MessagePump ──► Dispatcher ──► Disposition
//!    ▲                                                   │
//!    └──────────── complete / abandon(metadata) ◄────────┘
//!                                 │
//!                                 └──► FaultSink (one event per abandon)
//! ```
//!
//! Each delivery is dispatched as its own task. A delivery that cannot be
//! settled (expired lock, closed channel) is logged and counted, and the
//! pump carries on with the next one.

mod fault;
mod pump;

#[cfg(feature = "emitter")]
pub use fault::EmitterFaultSink;
pub use fault::{FaultEvent, FaultSink, FaultStream, DEFAULT_FAULT_STREAM_CAPACITY};
pub use pump::{
    MessagePump, MessagePumpBuilder, PumpState, PumpStats, FAULT_AT_METADATA_KEY,
    FAULT_KIND_METADATA_KEY, FAULT_METADATA_KEY,
};
