//! Test domain: orders, pricing and a black-ball vote, plus handlers that
//! record what they saw.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier::{
    Bus, BusConfig, HandleCommand, HandleEvent, HandleRequest, HandlerError, HandlerRegistry,
    InMemoryTransport, MessageContext,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub id: String,
    pub qty: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub qty: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackBall {
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackBallResponse {
    pub voter: String,
    pub veto: bool,
}

courier::message!(PlaceOrder, "orders.place", command);
courier::message!(OrderPlaced, "orders.placed", event);
courier::message!(QuoteResponse, "pricing.quote.response");
courier::message!(Quote, "pricing.quote", request => QuoteResponse);
courier::message!(BlackBallResponse, "club.blackball.response");
courier::message!(BlackBall, "club.blackball", request => BlackBallResponse);

// =============================================================================
// Probe
// =============================================================================

/// Shared record of handler invocations, as `"<handler>:<detail>"` strings.
#[derive(Clone, Default)]
pub struct Probe {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Rejects orders with zero quantity.
pub struct PlaceOrderHandler(pub Probe);

#[async_trait]
impl HandleCommand<PlaceOrder> for PlaceOrderHandler {
    async fn handle(&self, cmd: PlaceOrder, _ctx: &MessageContext) -> Result<(), HandlerError> {
        self.0.record(format!("place:{}", cmd.id));
        if cmd.qty == 0 {
            return Err(HandlerError::Rejected(format!("order {} is empty", cmd.id)));
        }
        Ok(())
    }
}

/// Competing consumer: one instance per application handles each event.
pub struct SendReceipt {
    pub instance: &'static str,
    pub probe: Probe,
}

#[async_trait]
impl HandleEvent<OrderPlaced> for SendReceipt {
    async fn handle(&self, event: OrderPlaced, _ctx: &MessageContext) -> Result<(), HandlerError> {
        self.probe.record(format!("receipt:{}:{}", self.instance, event.id));
        Ok(())
    }
}

/// Multicast consumer: every instance handles every event.
pub struct InvalidateCache {
    pub instance: &'static str,
    pub probe: Probe,
}

#[async_trait]
impl HandleEvent<OrderPlaced> for InvalidateCache {
    async fn handle(&self, event: OrderPlaced, _ctx: &MessageContext) -> Result<(), HandlerError> {
        self.probe.record(format!("cache:{}:{}", self.instance, event.id));
        Ok(())
    }
}

pub struct QuoteHandler;

#[async_trait]
impl HandleRequest<Quote> for QuoteHandler {
    async fn handle(&self, req: Quote, _ctx: &MessageContext) -> Result<QuoteResponse, HandlerError> {
        Ok(QuoteResponse {
            cents: u64::from(req.qty) * 100,
        })
    }
}

/// Votes after `delay`, vetoing nobody.
pub struct Voter {
    pub name: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl HandleRequest<BlackBall> for Voter {
    async fn handle(
        &self,
        _req: BlackBall,
        _ctx: &MessageContext,
    ) -> Result<BlackBallResponse, HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(BlackBallResponse {
            voter: self.name.to_string(),
            veto: false,
        })
    }
}

/// Fails on the first delivery, votes on redelivery.
pub struct FlakyVoter(pub Probe);

#[async_trait]
impl HandleRequest<BlackBall> for FlakyVoter {
    async fn handle(
        &self,
        req: BlackBall,
        ctx: &MessageContext,
    ) -> Result<BlackBallResponse, HandlerError> {
        self.0.record(format!("flaky:{}", ctx.delivery_count()));
        if !ctx.is_redelivery() {
            return Err(HandlerError::other("ballot box jammed"));
        }
        Ok(BlackBallResponse {
            voter: "flaky".to_string(),
            veto: req.member == "mallory",
        })
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub fn bus(
    transport: &InMemoryTransport,
    application: &str,
    instance: &str,
    registry: HandlerRegistry,
) -> Bus {
    Bus::builder()
        .with_config(
            BusConfig::new(application, instance)
                .with_default_timeout(Duration::from_secs(5))
                .with_max_concurrent_dispatches(8),
        )
        .with_registry(registry)
        .with_transport(transport.clone())
        .build()
        .unwrap()
}

/// A started bus that only sends requests and receives their replies.
pub async fn caller(transport: &InMemoryTransport) -> Bus {
    let registry = HandlerRegistry::builder()
        .known::<PlaceOrder>()
        .known::<OrderPlaced>()
        .known::<Quote>()
        .known::<BlackBall>()
        .build()
        .unwrap();
    let bus = bus(transport, "caller", "c1", registry);
    bus.start().await.unwrap();
    bus
}

/// Poll `condition` until it holds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
