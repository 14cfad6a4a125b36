//! Multicast requests: aggregation, early completion, deadline, dedup.

use std::time::Duration;

use courier::transport::{Destination, Envelope, MessageKind, Sender};
use courier::{Bus, HandlerRegistry, InMemoryTransport};
use tokio::time::Instant;

use crate::support::{bus, caller, eventually, BlackBall, FlakyVoter, Probe, Voter};

async fn voter(transport: &InMemoryTransport, name: &'static str, delay: Duration) -> Bus {
    let registry = HandlerRegistry::builder()
        .multicast_request::<BlackBall, _>(move || Voter { name, delay })
        .build()
        .unwrap();
    let service = bus(transport, "club", name, registry);
    service.start().await.unwrap();
    service
}

fn ballot() -> BlackBall {
    BlackBall {
        member: "mallory".to_string(),
    }
}

#[tokio::test]
async fn resolves_early_once_every_expected_responder_replied() {
    let transport = InMemoryTransport::new();
    let _v1 = voter(&transport, "v1", Duration::ZERO).await;
    let _v2 = voter(&transport, "v2", Duration::ZERO).await;
    let _v3 = voter(&transport, "v3", Duration::ZERO).await;
    let caller = caller(&transport).await;

    let started = std::time::Instant::now();
    let responses = caller
        .send_multicast_request(&ballot(), Some(Duration::from_secs(30)), Some(3))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let mut voters: Vec<String> = responses.into_iter().map(|r| r.voter).collect();
    voters.sort();
    assert_eq!(voters, vec!["v1", "v2", "v3"]);
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_what_arrived_and_late_replies_are_discarded() {
    let transport = InMemoryTransport::new();
    let _fast = voter(&transport, "fast", Duration::ZERO).await;
    let _slow1 = voter(&transport, "slow1", Duration::from_secs(10)).await;
    let _slow2 = voter(&transport, "slow2", Duration::from_secs(10)).await;
    let caller = caller(&transport).await;
    let timeout = Duration::from_secs(2);

    let started = Instant::now();
    let responses = caller
        .send_multicast_request(&ballot(), Some(timeout), None)
        .await
        .unwrap();
    assert!(started.elapsed() >= timeout);

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].voter, "fast");

    tokio::time::sleep(Duration::from_secs(10)).await;
    eventually(|| transport.completed_of_type("club.blackball.response").len() == 3).await;
    assert!(transport.abandoned().is_empty());
}

#[tokio::test]
async fn redelivered_replies_are_deduplicated_by_responder() {
    let transport = InMemoryTransport::new();
    let probe = Probe::new();
    let flaky_probe = probe.clone();
    let registry = HandlerRegistry::builder()
        .multicast_request::<BlackBall, _>(|| Voter {
            name: "steady",
            delay: Duration::ZERO,
        })
        .multicast_request::<BlackBall, _>(move || FlakyVoter(flaky_probe.clone()))
        .build()
        .unwrap();
    let club = bus(&transport, "club", "k1", registry);
    club.start().await.unwrap();
    let caller = caller(&transport).await;

    let responses = caller
        .send_multicast_request(&ballot(), Some(Duration::from_secs(5)), Some(2))
        .await
        .unwrap();

    let mut votes: Vec<(String, bool)> = responses.into_iter().map(|r| (r.voter, r.veto)).collect();
    votes.sort();
    assert_eq!(
        votes,
        vec![("flaky".to_string(), true), ("steady".to_string(), false)]
    );
    assert_eq!(probe.calls(), vec!["flaky:1", "flaky:2"]);
    assert_eq!(transport.abandoned_of_type("club.blackball").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn nobody_listening_yields_an_empty_result() {
    let transport = InMemoryTransport::new();
    let caller = caller(&transport).await;

    let responses = caller
        .send_multicast_request(&ballot(), Some(Duration::from_secs(1)), Some(2))
        .await
        .unwrap();
    assert!(responses.is_empty());
}

#[tokio::test(start_paused = true)]
async fn same_handler_type_registered_twice_counts_as_two_responders() {
    let transport = InMemoryTransport::new();
    let registry = HandlerRegistry::builder()
        .multicast_request::<BlackBall, _>(|| Voter {
            name: "alice",
            delay: Duration::ZERO,
        })
        .multicast_request::<BlackBall, _>(|| Voter {
            name: "bob",
            delay: Duration::ZERO,
        })
        .build()
        .unwrap();
    let club = bus(&transport, "club", "k1", registry);
    club.start().await.unwrap();
    let caller = caller(&transport).await;
    let timeout = Duration::from_secs(10);

    let started = Instant::now();
    let responses = caller
        .send_multicast_request(&ballot(), Some(timeout), Some(2))
        .await
        .unwrap();
    assert!(started.elapsed() < timeout, "waited out the deadline");

    let mut voters: Vec<String> = responses.into_iter().map(|r| r.voter).collect();
    voters.sort();
    assert_eq!(voters, vec!["alice", "bob"]);

    let mut responders: Vec<String> = transport
        .sent()
        .into_iter()
        .filter(|(_, e)| e.kind == MessageKind::Reply)
        .filter_map(|(_, e)| e.responder)
        .collect();
    responders.sort();
    assert_eq!(responders, vec!["k1/Voter#0", "k1/Voter#1"]);
}

#[tokio::test]
async fn undecodable_reply_does_not_spoil_the_others() {
    let transport = InMemoryTransport::new();
    let _alice = voter(&transport, "alice", Duration::ZERO).await;
    let caller = caller(&transport).await;

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .send_multicast_request(&ballot(), Some(Duration::from_secs(5)), Some(2))
                .await
        })
    };

    eventually(|| {
        transport
            .sent()
            .iter()
            .any(|(_, e)| e.kind == MessageKind::MulticastRequest)
    })
    .await;
    let request = transport
        .sent()
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| e.kind == MessageKind::MulticastRequest)
        .unwrap();
    let garbage = Envelope::reply(
        &request,
        "club.blackball.response",
        vec![0xff],
        Some("k2/Rogue#0".to_string()),
    );
    transport
        .send(&Destination::Queue("caller.c1.replies".into()), garbage)
        .await
        .unwrap();

    let responses = pending.await.unwrap().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].voter, "alice");
}
