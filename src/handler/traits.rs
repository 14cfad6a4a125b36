//! Handler traits implemented by application code.

use async_trait::async_trait;

use super::context::MessageContext;
use super::error::HandlerError;
use crate::message::{BusCommand, BusEvent, BusRequest};

/// Handles a command. Exactly one handler is registered per command type.
#[async_trait]
pub trait HandleCommand<C: BusCommand>: Send + Sync + 'static {
    async fn handle(&self, command: C, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// Handles an event, either as the competing consumer or as one of many multicast handlers.
#[async_trait]
pub trait HandleEvent<E: BusEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// Answers a request, either as the single responder or as one multicast responder.
#[async_trait]
pub trait HandleRequest<R: BusRequest>: Send + Sync + 'static {
    async fn handle(&self, request: R, ctx: &MessageContext)
        -> Result<R::Response, HandlerError>;
}
