//! Envelope: one transport delivery plus its routing and correlation metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::{self, BusMessage};

/// Header carrying the fault description on a fault reply.
pub const FAULT_HEADER: &str = "fault";

/// Opaque token linking a request to its reply or replies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical shape of a message, stamped by the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Event,
    Request,
    MulticastRequest,
    Reply,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Request => "request",
            MessageKind::MulticastRequest => "multicast request",
            MessageKind::Reply => "reply",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a topic subscription hands out messages among its receivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// One subscription shared by every instance of an application.
    Competing,
    /// One subscription per instance; every instance sees every message.
    Multicast,
}

/// Delivery metadata stamped by the transport on every receive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub received_at: Option<DateTime<Utc>>,
    /// Number of times this envelope has been delivered, starting at 1.
    pub delivery_count: u32,
    /// Lock token identifying this particular delivery.
    pub lock_token: Option<String>,
    /// Set when the envelope was received through a topic subscription.
    pub subscription: Option<SubscriptionMode>,
}

/// An immutable unit of transport delivery.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: String,
    pub message_type: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    /// Responder identity, set on multicast replies.
    pub responder: Option<String>,
    pub headers: Vec<(String, String)>,
    pub delivery: DeliveryInfo,
}

impl Envelope {
    /// Create an envelope around an already-encoded payload.
    pub fn new(message_type: impl Into<String>, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            kind,
            payload,
            correlation_id: None,
            reply_to: None,
            responder: None,
            headers: Vec::new(),
            delivery: DeliveryInfo::default(),
        }
    }

    /// Create an envelope with a bitcode-encoded payload.
    pub fn encode<T: BusMessage>(kind: MessageKind, payload: &T) -> Result<Self, BusError> {
        let bytes = message::encode(payload)?;
        Ok(Self::new(T::MESSAGE_TYPE, kind, bytes))
    }

    /// Decode the payload.
    pub fn decode<T: BusMessage>(&self) -> Result<T, BusError> {
        Ok(message::decode(&self.payload)?)
    }

    /// Build the reply to `request`, carrying its correlation id.
    pub fn reply(
        request: &Envelope,
        response_type: impl Into<String>,
        payload: Vec<u8>,
        responder: Option<String>,
    ) -> Self {
        let mut reply = Self::new(response_type, MessageKind::Reply, payload);
        reply.correlation_id = request.correlation_id.clone();
        reply.responder = responder;
        reply
    }

    /// Build a fault reply to `request`: no payload, the description in the `fault` header.
    pub fn fault_reply(request: &Envelope, responder: Option<String>, description: &str) -> Self {
        Self::reply(request, request.message_type.clone(), Vec::new(), responder)
            .with_header(FAULT_HEADER, description)
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Get a header value by key (first match).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is a fault reply.
    pub fn is_fault(&self) -> bool {
        self.header(FAULT_HEADER).is_some()
    }
}
