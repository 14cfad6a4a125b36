//! Commands: completion, abandon on fault, liveness after a poisoned message.

use std::time::Duration;

use courier::pump::{FAULT_AT_METADATA_KEY, FAULT_KIND_METADATA_KEY, FAULT_METADATA_KEY};
use courier::transport::{Destination, Envelope, MessageKind, Sender};
use courier::{HandlerRegistry, InMemoryTransport};

use crate::support::{bus, caller, eventually, PlaceOrder, PlaceOrderHandler, Probe};

fn order(id: &str, qty: u32) -> PlaceOrder {
    PlaceOrder {
        id: id.to_string(),
        qty,
    }
}

async fn orders_service(transport: &InMemoryTransport, probe: &Probe) -> courier::Bus {
    let probe = probe.clone();
    let registry = HandlerRegistry::builder()
        .command::<PlaceOrder, _>(move || PlaceOrderHandler(probe.clone()))
        .build()
        .unwrap();
    let service = bus(transport, "orders", "o1", registry);
    service.start().await.unwrap();
    service
}

#[tokio::test]
async fn handled_command_is_completed_once() {
    let transport = InMemoryTransport::new();
    let probe = Probe::new();
    let _service = orders_service(&transport, &probe).await;
    let caller = caller(&transport).await;

    caller.send_command(&order("o-1", 2)).await.unwrap();
    eventually(|| transport.completed_of_type("orders.place").len() == 1).await;

    assert_eq!(probe.calls(), vec!["place:o-1"]);
    assert!(transport.abandoned().is_empty());
}

#[tokio::test]
async fn handler_fault_abandons_once_and_pump_keeps_going() {
    let transport = InMemoryTransport::new().with_max_delivery_count(1);
    let probe = Probe::new();
    let service = orders_service(&transport, &probe).await;
    let mut faults = service.faults();
    let caller = caller(&transport).await;

    caller.send_command(&order("poison", 0)).await.unwrap();
    caller.send_command(&order("good", 1)).await.unwrap();
    eventually(|| {
        transport.abandoned_of_type("orders.place").len() == 1
            && transport.completed_of_type("orders.place").len() == 1
    })
    .await;

    let abandoned = &transport.abandoned_of_type("orders.place")[0];
    assert!(abandoned
        .get(FAULT_METADATA_KEY)
        .is_some_and(|fault| fault.contains("order poison is empty")));
    assert_eq!(abandoned.get(FAULT_KIND_METADATA_KEY), Some("handler"));
    assert!(abandoned.get(FAULT_AT_METADATA_KEY).is_some_and(|at| !at.is_empty()));
    assert_eq!(transport.dead_lettered().len(), 1);

    let completed = &transport.completed_of_type("orders.place")[0];
    assert_eq!(completed.decode::<PlaceOrder>().unwrap().id, "good");

    let fault = faults.recv().await.unwrap();
    assert_eq!(fault.message_type, "orders.place");
    assert_eq!(fault.fault_kind, "handler");
    assert_eq!(fault.source, "orders.place");
}

#[tokio::test]
async fn abandoned_command_is_redelivered_until_dead_lettered() {
    let transport = InMemoryTransport::new().with_max_delivery_count(3);
    let probe = Probe::new();
    let _service = orders_service(&transport, &probe).await;
    let caller = caller(&transport).await;

    caller.send_command(&order("poison", 0)).await.unwrap();
    eventually(|| transport.dead_lettered().len() == 1).await;

    assert_eq!(probe.count("place:poison"), 3);
    assert_eq!(transport.abandoned().len(), 3);
    assert!(transport.completed_of_type("orders.place").is_empty());
}

#[tokio::test]
async fn unregistered_payload_type_is_abandoned_never_completed() {
    let transport = InMemoryTransport::new().with_max_delivery_count(1);
    let probe = Probe::new();
    let _service = orders_service(&transport, &probe).await;

    let stray = Envelope::new("orders.mystery", MessageKind::Command, vec![1, 2, 3]);
    transport
        .send(&Destination::Queue("orders.place".into()), stray)
        .await
        .unwrap();
    eventually(|| transport.abandoned_of_type("orders.mystery").len() == 1).await;

    let abandoned = &transport.abandoned_of_type("orders.mystery")[0];
    assert_eq!(abandoned.get(FAULT_KIND_METADATA_KEY), Some("unregistered-type"));
    assert!(abandoned
        .get(FAULT_METADATA_KEY)
        .is_some_and(|fault| fault.contains("not a recognised command type")));
    assert!(transport.completed_of_type("orders.mystery").is_empty());
    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn expired_locks_do_not_stop_the_pump() {
    let transport = InMemoryTransport::new();
    let probe = Probe::new();
    let service = orders_service(&transport, &probe).await;
    let caller = caller(&transport).await;

    transport.expire_locks(true);
    caller.send_command(&order("o-1", 1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pumps = service.pumps().await;
            if pumps.iter().any(|(_, _, stats)| stats.disposition_faults == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("disposition fault recorded");
    assert!(transport.completed().is_empty());

    transport.expire_locks(false);
    caller.send_command(&order("o-2", 1)).await.unwrap();
    eventually(|| transport.completed_of_type("orders.place").len() == 1).await;
    assert_eq!(probe.calls(), vec!["place:o-1", "place:o-2"]);
}
