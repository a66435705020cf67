#![allow(dead_code)]

use chat_mesh::{
    Airspace, ChannelObserver, MemoryRadio, MeshConfig, MeshController, MeshEvent, PeerIdentity,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

pub struct TestNode {
    pub identity: PeerIdentity,
    pub controller: MeshController,
    pub radio: MemoryRadio,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
}

/// Create a node in `airspace` without starting it
pub fn node(airspace: &Airspace, identity: &str) -> TestNode {
    let radio = airspace.radio(identity);
    let (observer, events) = ChannelObserver::new();
    let controller = MeshController::new(
        identity.into(),
        MeshConfig::default(),
        Arc::new(radio.clone()),
        Arc::new(observer),
    );

    TestNode {
        identity: identity.into(),
        controller,
        radio,
        events,
    }
}

/// Create and start a node
pub async fn started_node(airspace: &Airspace, identity: &str) -> TestNode {
    let node = node(airspace, identity);
    node.controller.start().await.unwrap();
    node
}

/// Link two started nodes and wait until each has identified the other
pub async fn link(airspace: &Airspace, a: &TestNode, b: &TestNode) {
    airspace.connect(&a.radio, &b.radio).await.unwrap();

    wait_until(|| async move {
        a.controller.is_reachable(&b.identity).await && b.controller.is_reachable(&a.identity).await
    })
    .await;
}

/// Poll `condition` until it holds, failing the test after a timeout
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {:?}", WAIT);
}

/// Wait for the next event matching `predicate`, skipping others
pub async fn next_event<P>(events: &mut mpsc::UnboundedReceiver<MeshEvent>, predicate: P) -> MeshEvent
where
    P: Fn(&MeshEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("no matching event within {:?}", WAIT),
    }
}

/// Let in-flight frames settle, then return every event still queued
pub async fn drain_events(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn is_received(event: &MeshEvent) -> bool {
    matches!(event, MeshEvent::MessageReceived(_))
}
