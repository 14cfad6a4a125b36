//! Correlation of replies with the requests that asked for them.
//!
//! ```text
//! caller ── send ──► [ pending map ] ──► transport
//!                      │   ▲
//!        deadline timer│   │ resolve / accept
//!                      ▼   │
//!                  caller's future ◄── dispatcher (reply envelopes)
//! ```
//!
//! Both trackers keep one map behind one mutex, held only to insert, look up
//! or remove an entry. Completing the caller's future happens after the lock
//! is released. Every entry owns exactly one timer task, aborted when the
//! entry resolves early or the caller drops its future.

mod multicast;
mod request;

pub use multicast::{MulticastAggregator, PendingMulticast, ReplyOutcome};
pub use request::{PendingReply, RequestCorrelator};
