//! Request/response through the correlator.

use std::time::Duration;

use courier::transport::{Destination, MessageKind, Sender};
use courier::{BusError, HandlerRegistry, InMemoryTransport};
use futures::future::join_all;
use tokio::time::Instant;

use crate::support::{bus, caller, eventually, Quote, QuoteHandler, QuoteResponse};

async fn pricing_service(transport: &InMemoryTransport) -> courier::Bus {
    let registry = HandlerRegistry::builder()
        .request::<Quote, _>(|| QuoteHandler)
        .build()
        .unwrap();
    let service = bus(transport, "pricing", "p1", registry);
    service.start().await.unwrap();
    service
}

#[tokio::test]
async fn reply_resolves_the_request() {
    let transport = InMemoryTransport::new();
    let _pricing = pricing_service(&transport).await;
    let caller = caller(&transport).await;

    let response = caller
        .send_request(&Quote { qty: 3 }, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response, QuoteResponse { cents: 300 });

    eventually(|| {
        transport.completed_of_type("pricing.quote").len() == 1
            && transport.completed_of_type("pricing.quote.response").len() == 1
    })
    .await;
    assert!(transport.abandoned().is_empty());
}

#[tokio::test]
async fn late_duplicate_reply_is_discarded() {
    let transport = InMemoryTransport::new();
    let _pricing = pricing_service(&transport).await;
    let caller = caller(&transport).await;

    let response = caller.send_request(&Quote { qty: 7 }, None).await.unwrap();
    assert_eq!(response.cents, 700);

    let (destination, reply) = transport
        .sent()
        .into_iter()
        .find(|(_, e)| e.kind == MessageKind::Reply)
        .unwrap();
    assert_eq!(destination, Destination::Queue("caller.c1.replies".into()));

    for _ in 0..3 {
        transport.send(&destination, reply.clone()).await.unwrap();
    }
    eventually(|| transport.completed_of_type("pricing.quote.response").len() == 4).await;
    assert!(transport.abandoned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_reply_times_out_at_the_deadline() {
    let transport = InMemoryTransport::new();
    let caller = caller(&transport).await;
    let timeout = Duration::from_millis(1500);

    let started = Instant::now();
    let result = caller.send_request(&Quote { qty: 1 }, Some(timeout)).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(BusError::RequestTimedOut { .. })));
    assert!(elapsed >= timeout, "resolved early: {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(100), "resolved late: {:?}", elapsed);
}

#[tokio::test]
async fn concurrent_requests_never_cross_resolve() {
    let transport = InMemoryTransport::new();
    let _pricing = pricing_service(&transport).await;
    let caller = caller(&transport).await;

    let requests = (1..=50u32).map(|qty| {
        let caller = caller.clone();
        async move {
            let response = caller.send_request(&Quote { qty }, None).await.unwrap();
            (qty, response.cents)
        }
    });

    for (qty, cents) in join_all(requests).await {
        assert_eq!(cents, u64::from(qty) * 100);
    }
}

#[tokio::test]
async fn request_to_unknown_type_fails_before_sending() {
    let transport = InMemoryTransport::new();
    let pricing = pricing_service(&transport).await;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Appraisal;
    courier::message!(Appraisal, "pricing.appraisal", request => QuoteResponse);

    let err = pricing.send_request(&Appraisal, None).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::UnregisteredType { kind: "request", .. }
    ));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn fault_reply_from_an_external_responder_is_a_remote_fault() {
    let transport = InMemoryTransport::new();
    let caller = caller(&transport).await;

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .send_request(&Quote { qty: 2 }, Some(Duration::from_secs(5)))
                .await
        })
    };

    eventually(|| !transport.sent().is_empty()).await;
    let (_, request) = transport.sent().remove(0);
    assert_eq!(request.kind, MessageKind::Request);
    let fault = courier::transport::Envelope::fault_reply(
        &request,
        Some("legacy/QuoteService".to_string()),
        "price list unavailable",
    );
    transport
        .send(&Destination::Queue("caller.c1.replies".into()), fault)
        .await
        .unwrap();

    match pending.await.unwrap() {
        Err(BusError::RemoteFault {
            responder,
            description,
        }) => {
            assert_eq!(responder, "legacy/QuoteService");
            assert_eq!(description, "price list unavailable");
        }
        other => panic!("expected a remote fault, got {:?}", other),
    }
}
