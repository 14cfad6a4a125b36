//! Payload typing for messages carried on the bus.
//!
//! Every payload type carries a static identifier, so routing is a plain
//! lookup of `MESSAGE_TYPE` against the handler registry.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload that can travel on the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Payload type identifier. Also names the queue or topic the message travels on.
    const MESSAGE_TYPE: &'static str;
}

/// Fire-and-forget message handled by exactly one handler.
pub trait BusCommand: BusMessage {}

/// Broadcast message, consumed competitively or by every multicast handler.
pub trait BusEvent: BusMessage {}

/// Message answered by a responder.
pub trait BusRequest: BusMessage {
    type Response: BusMessage;
}

/// Implement [`BusMessage`] (and optionally a role trait) for a payload type.
///
/// # Example
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct PlaceOrder { id: String }
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: String }
/// #[derive(Serialize, Deserialize)]
/// struct Quote { sku: String }
/// #[derive(Serialize, Deserialize)]
/// struct QuoteResponse { cents: u64 }
///
/// courier::message!(PlaceOrder, "orders.place", command);
/// courier::message!(OrderPlaced, "orders.placed", event);
/// courier::message!(QuoteResponse, "pricing.quote.response");
/// courier::message!(Quote, "pricing.quote", request => QuoteResponse);
/// ```
#[macro_export]
macro_rules! message {
    ($ty:ty, $name:expr) => {
        impl $crate::BusMessage for $ty {
            const MESSAGE_TYPE: &'static str = $name;
        }
    };
    ($ty:ty, $name:expr, command) => {
        $crate::message!($ty, $name);
        impl $crate::BusCommand for $ty {}
    };
    ($ty:ty, $name:expr, event) => {
        $crate::message!($ty, $name);
        impl $crate::BusEvent for $ty {}
    };
    ($ty:ty, $name:expr, request => $response:ty) => {
        $crate::message!($ty, $name);
        impl $crate::BusRequest for $ty {
            type Response = $response;
        }
    };
}

/// Encode a payload with bitcode.
pub(crate) fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, bitcode::Error> {
    bitcode::serialize(payload)
}

/// Decode a bitcode payload.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bitcode::Error> {
    bitcode::deserialize(bytes)
}
