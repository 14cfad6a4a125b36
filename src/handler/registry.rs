//! Handler registry: payload type to handler capabilities.
//!
//! Built once at startup from explicit registrations, read-only afterwards.
//! Lookups are plain map reads, so the registry is shared behind an `Arc`
//! without any locking.
//!
//! ## Example
//!
//! ```ignore
//! let registry = HandlerRegistry::builder()
//!     .command::<PlaceOrder, _>(|| PlaceOrderHandler::new(store.clone()))
//!     .competing_event::<OrderPlaced, _>(|| SendReceipt)
//!     .multicast_event::<OrderPlaced, _>(|| InvalidateCache)
//!     .request::<Quote, _>(|| QuoteHandler)
//!     .multicast_request::<BlackBall, _>(|| VetoHandler)
//!     .known::<OrderShipped>()
//!     .build()?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::context::MessageContext;
use super::error::HandlerError;
use super::traits::{HandleCommand, HandleEvent, HandleRequest};
use crate::error::BusError;
use crate::message::{self, BusCommand, BusEvent, BusMessage, BusRequest};
use crate::transport::Envelope;

/// Capability a handler provides for its payload type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Command,
    CompetingEvent,
    MulticastEvent,
    Request,
    MulticastRequest,
}

impl HandlerKind {
    /// Kinds that allow exactly one handler per payload type.
    pub fn is_single(&self) -> bool {
        matches!(
            self,
            HandlerKind::Command | HandlerKind::CompetingEvent | HandlerKind::Request
        )
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Command => "command",
            HandlerKind::CompetingEvent => "competing event",
            HandlerKind::MulticastEvent => "multicast event",
            HandlerKind::Request => "request",
            HandlerKind::MulticastRequest => "multicast request",
        };
        f.write_str(name)
    }
}

type Invoke =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<Option<Vec<u8>>, HandlerError>> + Send + Sync>;

/// One registered handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    kind: HandlerKind,
    message_type: &'static str,
    handler_name: &'static str,
    response_type: Option<&'static str>,
    ordinal: usize,
    invoke: Invoke,
}

impl HandlerDescriptor {
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// Short type name of the handler, e.g. `PlaceOrderHandler`.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Payload type of the response, for request handlers.
    pub fn response_type(&self) -> Option<&'static str> {
        self.response_type
    }

    /// Position among the handlers of the same kind for this payload type.
    ///
    /// Stable for the lifetime of the registry, so it tells apart two
    /// registrations of one handler type across redeliveries.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Build a handler from its factory and run it against the envelope.
    ///
    /// Returns the encoded response for request handlers, `None` otherwise.
    pub fn invoke(
        &self,
        envelope: Envelope,
    ) -> BoxFuture<'static, Result<Option<Vec<u8>>, HandlerError>> {
        (self.invoke)(envelope)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .field("handler_name", &self.handler_name)
            .field("response_type", &self.response_type)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

/// `a::b::PlaceOrderHandler<x::Y>` → `PlaceOrderHandler`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn decode<T: BusMessage>(envelope: &Envelope) -> Result<T, HandlerError> {
    Ok(message::decode(&envelope.payload)?)
}

/// Read-only map from payload type to handler descriptors.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Vec<HandlerDescriptor>>,
    known: HashSet<&'static str>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// All descriptors for a payload type, in registration order.
    pub fn resolve(&self, message_type: &str) -> &[HandlerDescriptor] {
        self.handlers
            .get(message_type)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Descriptors of one kind for a payload type, in registration order.
    pub fn resolve_kind(&self, message_type: &str, kind: HandlerKind) -> Vec<&HandlerDescriptor> {
        self.resolve(message_type)
            .iter()
            .filter(|d| d.kind == kind)
            .collect()
    }

    /// Whether the payload type has been registered, by a handler or by `known`.
    pub fn is_known(&self, message_type: &str) -> bool {
        self.known.contains(message_type)
    }

    /// Every registered descriptor.
    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.values().flatten()
    }

    /// Registered payload types, sorted.
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.known.iter().copied().collect();
        types.sort_unstable();
        types
    }
}

/// Collects registrations, then validates them into a [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<&'static str, Vec<HandlerDescriptor>>,
    known: HashSet<&'static str>,
}

impl HandlerRegistryBuilder {
    fn register(mut self, mut descriptor: HandlerDescriptor) -> Self {
        self.known.insert(descriptor.message_type);
        if let Some(response_type) = descriptor.response_type {
            self.known.insert(response_type);
        }
        let registered = self.handlers.entry(descriptor.message_type).or_default();
        descriptor.ordinal = registered
            .iter()
            .filter(|d| d.kind == descriptor.kind)
            .count();
        registered.push(descriptor);
        self
    }

    /// Register the handler for a command type.
    pub fn command<C, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        C: BusCommand,
        H: HandleCommand<C>,
    {
        let invoke: Invoke = Arc::new(move |envelope: Envelope| {
            let handler = factory();
            async move {
                let command = decode::<C>(&envelope)?;
                let ctx = MessageContext::from_envelope(&envelope);
                handler.handle(command, &ctx).await?;
                Ok(None)
            }
            .boxed()
        });
        self.register(HandlerDescriptor {
            kind: HandlerKind::Command,
            message_type: C::MESSAGE_TYPE,
            handler_name: short_type_name::<H>(),
            response_type: None,
            ordinal: 0,
            invoke,
        })
    }

    /// Register the competing-consumer handler for an event type.
    pub fn competing_event<E, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        E: BusEvent,
        H: HandleEvent<E>,
    {
        self.event::<E, H>(HandlerKind::CompetingEvent, factory)
    }

    /// Register one of possibly many multicast handlers for an event type.
    pub fn multicast_event<E, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        E: BusEvent,
        H: HandleEvent<E>,
    {
        self.event::<E, H>(HandlerKind::MulticastEvent, factory)
    }

    fn event<E, H>(
        self,
        kind: HandlerKind,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> Self
    where
        E: BusEvent,
        H: HandleEvent<E>,
    {
        let invoke: Invoke = Arc::new(move |envelope: Envelope| {
            let handler = factory();
            async move {
                let event = decode::<E>(&envelope)?;
                let ctx = MessageContext::from_envelope(&envelope);
                handler.handle(event, &ctx).await?;
                Ok(None)
            }
            .boxed()
        });
        self.register(HandlerDescriptor {
            kind,
            message_type: E::MESSAGE_TYPE,
            handler_name: short_type_name::<H>(),
            response_type: None,
            ordinal: 0,
            invoke,
        })
    }

    /// Register the single responder for a request type.
    pub fn request<R, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        R: BusRequest,
        H: HandleRequest<R>,
    {
        self.responder::<R, H>(HandlerKind::Request, factory)
    }

    /// Register one of possibly many multicast responders for a request type.
    pub fn multicast_request<R, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        R: BusRequest,
        H: HandleRequest<R>,
    {
        self.responder::<R, H>(HandlerKind::MulticastRequest, factory)
    }

    fn responder<R, H>(
        self,
        kind: HandlerKind,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> Self
    where
        R: BusRequest,
        H: HandleRequest<R>,
    {
        let invoke: Invoke = Arc::new(move |envelope: Envelope| {
            let handler = factory();
            async move {
                let request = decode::<R>(&envelope)?;
                let ctx = MessageContext::from_envelope(&envelope);
                let response = handler.handle(request, &ctx).await?;
                let bytes = message::encode(&response)
                    .map_err(|e| HandlerError::EncodeFailed(e.to_string()))?;
                Ok(Some(bytes))
            }
            .boxed()
        });
        self.register(HandlerDescriptor {
            kind,
            message_type: R::MESSAGE_TYPE,
            handler_name: short_type_name::<H>(),
            response_type: Some(<R::Response as BusMessage>::MESSAGE_TYPE),
            ordinal: 0,
            invoke,
        })
    }

    /// Declare a payload type this process sends but does not handle.
    pub fn known<T: BusMessage>(mut self) -> Self {
        self.known.insert(T::MESSAGE_TYPE);
        self
    }

    /// Validate registrations: single-handler kinds allow one handler per type.
    pub fn build(self) -> Result<HandlerRegistry, BusError> {
        for (message_type, descriptors) in &self.handlers {
            let mut seen = HashSet::new();
            for descriptor in descriptors.iter().filter(|d| d.kind.is_single()) {
                if !seen.insert(descriptor.kind) {
                    return Err(BusError::DuplicateHandler {
                        message_type: message_type.to_string(),
                        kind: descriptor.kind,
                    });
                }
            }
        }

        Ok(HandlerRegistry {
            handlers: self.handlers,
            known: self.known,
        })
    }
}
