mod common;

use chat_mesh::{Airspace, ControllerState, MeshError, MeshEvent, PeerIdentity, SendOutcome};
use common::{drain_events, is_received, link, next_event, node, started_node, wait_until};
use std::time::Duration;

#[tokio::test]
async fn test_outbox_drains_in_fifo_order_once_peer_appears() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let mut b = node(&airspace, "bob#0002");

    let (m1, first) = a.controller.send_text(b.identity.clone(), "m1").await.unwrap();
    let (m2, second) = a.controller.send_text(b.identity.clone(), "m2").await.unwrap();
    assert_eq!(first, SendOutcome::Queued);
    assert_eq!(second, SendOutcome::Queued);
    assert_eq!(a.controller.pending_for(&b.identity).await, 2);

    b.controller.start().await.unwrap();
    link(&airspace, &a, &b).await;

    let mut delivered = Vec::new();
    for _ in 0..2 {
        if let MeshEvent::MessageReceived(message) = next_event(&mut b.events, is_received).await {
            delivered.push(message.id);
        }
    }
    assert_eq!(delivered, vec![m1, m2]);
    assert_eq!(a.controller.pending_outbox().await, 0);
}

#[tokio::test]
async fn test_send_during_drain_stays_behind_queued_messages() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let mut b = node(&airspace, "bob#0002");

    let (m1, _) = a.controller.send_text(b.identity.clone(), "m1").await.unwrap();
    let (m2, _) = a.controller.send_text(b.identity.clone(), "m2").await.unwrap();

    // Slow writes keep Alice's drain in flight while the next send arrives
    a.radio.set_write_delay(Duration::from_millis(40));
    b.controller.start().await.unwrap();
    link(&airspace, &a, &b).await;

    let (m3, _) = a.controller.send_text(b.identity.clone(), "m3").await.unwrap();

    let mut delivered = Vec::new();
    for _ in 0..3 {
        if let MeshEvent::MessageReceived(message) = next_event(&mut b.events, is_received).await {
            delivered.push(message.id);
        }
    }
    assert_eq!(delivered, vec![m1, m2, m3]);
    assert_eq!(a.controller.pending_outbox().await, 0);
}

#[tokio::test]
async fn test_queued_messages_for_other_recipients_use_new_neighbour() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let b = node(&airspace, "bob#0002");
    let mut c = node(&airspace, "carol#0003");

    let (id, outcome) = a.controller.send_text(c.identity.clone(), "via bob").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);

    b.controller.start().await.unwrap();
    c.controller.start().await.unwrap();
    link(&airspace, &b, &c).await;

    // Bob becoming reachable opens a flood path towards Carol
    link(&airspace, &a, &b).await;

    match next_event(&mut c.events, is_received).await {
        MeshEvent::MessageReceived(message) => assert_eq!(message.id, id),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(b.controller.relay_count(), 1);
}

#[tokio::test]
async fn test_failed_writes_requeue_instead_of_dropping() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let b = started_node(&airspace, "bob#0002").await;
    link(&airspace, &a, &b).await;

    a.radio.set_failing_writes(true);
    let (_, outcome) = a.controller.send_text(b.identity.clone(), "x").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(a.controller.pending_for(&b.identity).await, 1);

    // A later send drains the older message first
    a.radio.set_failing_writes(false);
    let (_, outcome) = a.controller.send_text(b.identity.clone(), "y").await.unwrap();
    assert_eq!(outcome, SendOutcome::Flooded { links: 1 });
    assert_eq!(a.controller.pending_outbox().await, 0);

    let texts: Vec<String> = a
        .radio
        .sent_messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["x", "y"]);
}

#[tokio::test]
async fn test_reachability_count_follows_links() {
    let airspace = Airspace::new();
    let mut a = started_node(&airspace, "alice#0001").await;
    let b = started_node(&airspace, "bob#0002").await;
    let c = started_node(&airspace, "carol#0003").await;

    link(&airspace, &a, &b).await;
    assert_eq!(
        next_event(&mut a.events, |e| matches!(e, MeshEvent::ReachabilityChanged(_))).await,
        MeshEvent::ReachabilityChanged(1)
    );

    link(&airspace, &a, &c).await;
    assert_eq!(
        next_event(&mut a.events, |e| matches!(e, MeshEvent::ReachabilityChanged(_))).await,
        MeshEvent::ReachabilityChanged(2)
    );

    airspace.sever(&a.radio, &b.radio).await;
    assert_eq!(
        next_event(&mut a.events, |e| matches!(e, MeshEvent::ReachabilityChanged(_))).await,
        MeshEvent::ReachabilityChanged(1)
    );
    assert!(!a.controller.is_reachable(&b.identity).await);
    assert!(a.controller.is_reachable(&c.identity).await);
}

#[tokio::test]
async fn test_duplicate_links_to_one_peer_count_once() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let b = started_node(&airspace, "bob#0002").await;

    // Both sides discovered each other: two links, one device
    link(&airspace, &a, &b).await;
    airspace.connect(&b.radio, &a.radio).await.unwrap();
    let controller = &a.controller;
    wait_until(|| async move {
        controller.peers().await.iter().filter(|p| p.is_identified()).count() == 2
    })
    .await;

    assert_eq!(a.controller.connected_device_count().await, 1);

    let (_, outcome) = a.controller.send_text(b.identity.clone(), "x").await.unwrap();
    assert_eq!(outcome, SendOutcome::Flooded { links: 2 });
}

#[tokio::test]
async fn test_start_fails_when_radio_is_off() {
    let airspace = Airspace::new();
    let mut a = node(&airspace, "alice#0001");
    a.radio.set_available(false);

    let result = a.controller.start().await;
    assert!(matches!(result, Err(MeshError::RadioCapabilityUnavailable(_))));
    assert_eq!(a.controller.state().await, ControllerState::Idle);
    assert!(matches!(
        next_event(&mut a.events, |e| matches!(e, MeshEvent::Failure(_))).await,
        MeshEvent::Failure(_)
    ));

    // Sends are still accepted and held for later
    let (_, outcome) = a.controller.send_text("bob#0002".into(), "x").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
}

#[tokio::test]
async fn test_reconfigure_rebuilds_links_under_new_identity() {
    let airspace = Airspace::new();
    let a = started_node(&airspace, "alice#0001").await;
    let b = started_node(&airspace, "bob#0002").await;
    let c = started_node(&airspace, "carol#0003").await;
    link(&airspace, &a, &b).await;
    link(&airspace, &a, &c).await;

    // Alice relays Bob's message towards Carol
    b.controller.send_text("dave#0004".into(), "x").await.unwrap();
    let alice = &a.controller;
    wait_until(|| async move { alice.relay_count() == 1 }).await;

    a.controller.reconfigure("alice#9999".into()).await.unwrap();
    assert_eq!(a.controller.identity().await, PeerIdentity::new("alice#9999"));
    assert_eq!(a.controller.connected_device_count().await, 0);
    assert_eq!(a.controller.state().await, ControllerState::Active);

    // The relay counter is process-wide and survives
    assert_eq!(a.controller.relay_count(), 1);

    // The peer saw the old links go away
    let bob = &b.controller;
    wait_until(|| async move { bob.connected_device_count().await == 0 }).await;

    airspace.connect(&a.radio, &b.radio).await.unwrap();
    wait_until(|| async move { bob.is_reachable(&"alice#9999".into()).await }).await;
    assert!(!bob.is_reachable(&"alice#0001".into()).await);
}

#[tokio::test]
async fn test_stop_keeps_outbox() {
    let airspace = Airspace::new();
    let mut a = started_node(&airspace, "alice#0001").await;
    a.controller.send_text("bob#0002".into(), "later").await.unwrap();

    a.controller.stop().await.unwrap();
    assert_eq!(a.controller.state().await, ControllerState::Idle);
    assert_eq!(a.controller.pending_outbox().await, 1);
    assert!(drain_events(&mut a.events).await.is_empty());
}
