//! Events: competing consumption across instances, multicast to every instance.

use courier::{HandlerRegistry, InMemoryTransport};

use crate::support::{bus, caller, eventually, InvalidateCache, OrderPlaced, Probe, SendReceipt};

async fn billing_instance(
    transport: &InMemoryTransport,
    instance: &'static str,
    probe: &Probe,
) -> courier::Bus {
    let (receipts, caches) = (probe.clone(), probe.clone());
    let registry = HandlerRegistry::builder()
        .competing_event::<OrderPlaced, _>(move || SendReceipt {
            instance,
            probe: receipts.clone(),
        })
        .multicast_event::<OrderPlaced, _>(move || InvalidateCache {
            instance,
            probe: caches.clone(),
        })
        .build()
        .unwrap();
    let service = bus(transport, "billing", instance, registry);
    service.start().await.unwrap();
    service
}

#[tokio::test]
async fn competing_event_goes_to_one_instance_multicast_to_all() {
    let transport = InMemoryTransport::new();
    let probe = Probe::new();
    let _b1 = billing_instance(&transport, "b1", &probe).await;
    let _b2 = billing_instance(&transport, "b2", &probe).await;
    let caller = caller(&transport).await;

    for i in 0..10 {
        caller
            .publish_event(&OrderPlaced { id: format!("o-{}", i) })
            .await
            .unwrap();
    }

    eventually(|| probe.count("receipt:") == 10 && probe.count("cache:") == 20).await;

    for i in 0..10 {
        let id = format!("o-{}", i);
        let receipts = probe
            .calls()
            .iter()
            .filter(|c| c.starts_with("receipt:") && c.ends_with(&format!(":{}", id)))
            .count();
        assert_eq!(receipts, 1, "event {} handled by exactly one instance", id);
        assert_eq!(probe.count(&format!("cache:b1:{}", id)), 1);
        assert_eq!(probe.count(&format!("cache:b2:{}", id)), 1);
    }

    assert_eq!(transport.completed_of_type("orders.placed").len(), 30);
    assert!(transport.abandoned().is_empty());
}

#[tokio::test]
async fn sources_follow_registrations() {
    let transport = InMemoryTransport::new();
    let probe = Probe::new();
    let service = billing_instance(&transport, "b1", &probe).await;

    let paths: Vec<String> = service.sources().iter().map(|s| s.path()).collect();
    assert_eq!(
        paths,
        vec![
            "billing.b1.replies".to_string(),
            "orders.placed/subscriptions/billing".to_string(),
            "orders.placed/subscriptions/billing.b1".to_string(),
        ]
    );
}
