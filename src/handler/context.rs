//! Context passed to handlers alongside the decoded payload.

use crate::transport::{CorrelationId, Envelope, MessageKind};

/// Delivery details of the message being handled.
///
/// ## Example
///
/// ```ignore
/// async fn handle(&self, cmd: PlaceOrder, ctx: &MessageContext) -> Result<(), HandlerError> {
///     if ctx.is_redelivery() {
///         // at-least-once: make sure the order isn't placed twice
///     }
///     let tenant = ctx.header("tenant").unwrap_or("default");
///     // ...
/// }
/// ```
#[derive(Clone, Debug)]
pub struct MessageContext {
    message_id: String,
    message_type: String,
    kind: MessageKind,
    correlation_id: Option<CorrelationId>,
    delivery_count: u32,
    headers: Vec<(String, String)>,
}

impl MessageContext {
    pub(crate) fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.id.clone(),
            message_type: envelope.message_type.clone(),
            kind: envelope.kind,
            correlation_id: envelope.correlation_id.clone(),
            delivery_count: envelope.delivery.delivery_count,
            headers: envelope.headers.clone(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Whether the transport has delivered this message before.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Get a header by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists.
    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }
}
