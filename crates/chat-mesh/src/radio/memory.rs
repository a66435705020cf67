//! In-process radio for simulations and tests
//!
//! An [`Airspace`] hands out [`MemoryRadio`]s and wires them together. Links
//! are created explicitly with [`Airspace::connect`], so a test decides the
//! topology instead of the radio discovering it.

use super::{LinkId, PeerRadio, RadioEvent, RadioEventSender};
use crate::error::{MeshError, MeshResult};
use crate::message::{Frame, Message, PeerIdentity};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Far end of a simulated link
#[derive(Clone)]
struct RemoteEnd {
    node: Weak<MemoryNode>,
    link: LinkId,
}

struct MemoryNode {
    name: String,
    sink: RwLock<Option<RadioEventSender>>,
    links: DashMap<LinkId, RemoteEnd>,
    advertised: RwLock<Option<PeerIdentity>>,
    scanning: AtomicBool,
    available: AtomicBool,
    failing_writes: AtomicBool,
    advertising_supported: AtomicBool,
    write_delay_ms: AtomicU64,
    sent: Mutex<Vec<(LinkId, Vec<u8>)>>,
}

impl MemoryNode {
    async fn emit(&self, event: RadioEvent) {
        match self.sink.read().await.as_ref() {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!("Radio {} event sink closed", self.name);
                }
            }
            None => debug!("Radio {} has no sink attached, dropping {:?}", self.name, event),
        }
    }

    fn require_available(&self) -> MeshResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::RadioCapabilityUnavailable(format!(
                "radio {} is powered off",
                self.name
            )))
        }
    }
}

/// A radio that lives entirely in memory
#[derive(Clone)]
pub struct MemoryRadio {
    node: Arc<MemoryNode>,
}

impl MemoryRadio {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: Arc::new(MemoryNode {
                name: name.into(),
                sink: RwLock::new(None),
                links: DashMap::new(),
                advertised: RwLock::new(None),
                scanning: AtomicBool::new(false),
                available: AtomicBool::new(true),
                failing_writes: AtomicBool::new(false),
                advertising_supported: AtomicBool::new(true),
                write_delay_ms: AtomicU64::new(0),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Toggle whether the radio hardware is usable
    ///
    /// Turning it off makes later start calls fail. Use
    /// [`MemoryRadio::revoke_capability`] to report the loss while running.
    pub fn set_available(&self, available: bool) {
        self.node.available.store(available, Ordering::SeqCst);
    }

    /// Simulate the radio being switched off mid-session
    pub async fn revoke_capability(&self, reason: &str) {
        self.set_available(false);
        self.node
            .emit(RadioEvent::CapabilityLost(reason.to_string()))
            .await;
    }

    /// Make every write fail as if the link had just dropped
    pub fn set_failing_writes(&self, failing: bool) {
        self.node.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Model a platform where the radio can only scan
    pub fn set_advertising_supported(&self, supported: bool) {
        self.node.advertising_supported.store(supported, Ordering::SeqCst);
    }

    /// Hold every write for `delay` before it reaches the far end
    pub fn set_write_delay(&self, delay: Duration) {
        self.node
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn advertised_identity(&self) -> Option<PeerIdentity> {
        self.node.advertised.read().await.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.node.scanning.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.node.links.iter().map(|entry| *entry.key()).collect()
    }

    pub fn link_count(&self) -> usize {
        self.node.links.len()
    }

    /// Every frame written by this radio, in write order
    pub async fn sent_frames(&self) -> Vec<(LinkId, Vec<u8>)> {
        self.node.sent.lock().await.clone()
    }

    /// Messages carried by the frames this radio wrote
    pub async fn sent_messages(&self) -> Vec<Message> {
        self.node
            .sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, data)| match Frame::decode(data) {
                Ok(Frame::Message(message)) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.node.sent.lock().await.clear();
    }

    fn same_node(&self, other: &MemoryRadio) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    async fn drop_link(&self, link: LinkId) -> MeshResult<()> {
        let (_, remote) = self
            .node
            .links
            .remove(&link)
            .ok_or_else(|| MeshError::LinkUnavailable(format!("{} not connected", link)))?;

        self.node.emit(RadioEvent::LinkLost(link)).await;

        if let Some(peer) = remote.node.upgrade() {
            if peer.links.remove(&remote.link).is_some() {
                peer.emit(RadioEvent::LinkLost(remote.link)).await;
            }
        }

        debug!("Radio {} dropped {}", self.node.name, link);
        Ok(())
    }
}

#[async_trait]
impl PeerRadio for MemoryRadio {
    async fn attach(&self, sink: RadioEventSender) {
        *self.node.sink.write().await = Some(sink);
    }

    async fn start_advertising(&self, identity: &PeerIdentity) -> MeshResult<()> {
        self.node.require_available()?;
        if !self.node.advertising_supported.load(Ordering::SeqCst) {
            return Err(MeshError::Unsupported(format!(
                "radio {} has no peripheral role",
                self.node.name
            )));
        }
        *self.node.advertised.write().await = Some(identity.clone());
        debug!("Radio {} advertising as {}", self.node.name, identity);
        Ok(())
    }

    async fn start_scanning(&self) -> MeshResult<()> {
        self.node.require_available()?;
        self.node.scanning.store(true, Ordering::SeqCst);
        debug!("Radio {} scanning", self.node.name);
        Ok(())
    }

    async fn send(&self, link: LinkId, frame: &[u8]) -> MeshResult<()> {
        let remote = self
            .node
            .links
            .get(&link)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::LinkUnavailable(format!("{} not connected", link)))?;

        if self.node.failing_writes.load(Ordering::SeqCst) {
            return Err(MeshError::LinkUnavailable(format!("write to {} failed", link)));
        }

        let peer = remote
            .node
            .upgrade()
            .ok_or_else(|| MeshError::LinkUnavailable(format!("peer behind {} is gone", link)))?;

        let delay = self.node.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.node.sent.lock().await.push((link, frame.to_vec()));
        peer.emit(RadioEvent::FrameReceived {
            link: remote.link,
            data: frame.to_vec(),
        })
        .await;

        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> MeshResult<()> {
        self.drop_link(link).await
    }

    async fn shutdown(&self) -> MeshResult<()> {
        for link in self.links() {
            if let Err(e) = self.drop_link(link).await {
                debug!("Link {} already gone during shutdown: {}", link, e);
            }
        }

        *self.node.advertised.write().await = None;
        self.node.scanning.store(false, Ordering::SeqCst);
        info!("Radio {} shut down", self.node.name);
        Ok(())
    }
}

/// Shared medium connecting memory radios by name
#[derive(Clone, Default)]
pub struct Airspace {
    radios: Arc<DashMap<String, MemoryRadio>>,
}

impl Airspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a radio registered under `name`, or return the existing one
    pub fn radio(&self, name: &str) -> MemoryRadio {
        self.radios
            .entry(name.to_string())
            .or_insert_with(|| MemoryRadio::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<MemoryRadio> {
        self.radios.get(name).map(|entry| entry.value().clone())
    }

    /// Bring up a link between two radios
    ///
    /// Both ends see `LinkEstablished`. Returns the link handles as seen by
    /// `a` and by `b`.
    pub async fn connect(&self, a: &MemoryRadio, b: &MemoryRadio) -> MeshResult<(LinkId, LinkId)> {
        if a.same_node(b) {
            return Err(MeshError::ConnectionFailed(format!(
                "radio {} cannot link to itself",
                a.name()
            )));
        }
        a.node.require_available()?;
        b.node.require_available()?;

        let a_link = LinkId::next();
        let b_link = LinkId::next();

        a.node.links.insert(
            a_link,
            RemoteEnd {
                node: Arc::downgrade(&b.node),
                link: b_link,
            },
        );
        b.node.links.insert(
            b_link,
            RemoteEnd {
                node: Arc::downgrade(&a.node),
                link: a_link,
            },
        );

        a.node.emit(RadioEvent::LinkEstablished(a_link)).await;
        b.node.emit(RadioEvent::LinkEstablished(b_link)).await;

        info!(
            "Linked {} ({}) <-> {} ({})",
            a.name(),
            a_link,
            b.name(),
            b_link
        );
        Ok((a_link, b_link))
    }

    /// Tear down every link between two radios
    pub async fn sever(&self, a: &MemoryRadio, b: &MemoryRadio) -> usize {
        let between: Vec<LinkId> = a
            .node
            .links
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .node
                    .upgrade()
                    .map(|node| Arc::ptr_eq(&node, &b.node))
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut severed = 0;
        for link in between {
            match a.drop_link(link).await {
                Ok(()) => severed += 1,
                Err(e) => warn!("Failed to sever {}: {}", link, e),
            }
        }
        severed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_connect_notifies_both_ends() {
        let airspace = Airspace::new();
        let alice = airspace.radio("alice");
        let bob = airspace.radio("bob");

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        alice.attach(alice_tx).await;
        bob.attach(bob_tx).await;

        let (a_link, b_link) = airspace.connect(&alice, &bob).await.unwrap();

        assert_eq!(alice_rx.recv().await, Some(RadioEvent::LinkEstablished(a_link)));
        assert_eq!(bob_rx.recv().await, Some(RadioEvent::LinkEstablished(b_link)));
        assert_eq!(alice.link_count(), 1);
    }

    #[tokio::test]
    async fn test_send_arrives_on_remote_link() {
        let airspace = Airspace::new();
        let alice = airspace.radio("alice");
        let bob = airspace.radio("bob");
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        bob.attach(bob_tx).await;

        let (a_link, b_link) = airspace.connect(&alice, &bob).await.unwrap();
        bob_rx.recv().await;

        alice.send(a_link, b"frame").await.unwrap();

        assert_eq!(
            bob_rx.recv().await,
            Some(RadioEvent::FrameReceived {
                link: b_link,
                data: b"frame".to_vec()
            })
        );
        assert_eq!(alice.sent_frames().await, vec![(a_link, b"frame".to_vec())]);
    }

    #[tokio::test]
    async fn test_send_on_unknown_link_fails() {
        let radio = MemoryRadio::new("solo");
        let result = radio.send(LinkId::next(), b"x").await;
        assert!(matches!(result, Err(MeshError::LinkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_sever_reports_loss_on_both_ends() {
        let airspace = Airspace::new();
        let alice = airspace.radio("alice");
        let bob = airspace.radio("bob");
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        bob.attach(bob_tx).await;

        let (_, b_link) = airspace.connect(&alice, &bob).await.unwrap();
        bob_rx.recv().await;

        assert_eq!(airspace.sever(&alice, &bob).await, 1);
        assert_eq!(bob_rx.recv().await, Some(RadioEvent::LinkLost(b_link)));
        assert_eq!(alice.link_count(), 0);
        assert_eq!(bob.link_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_radio_refuses_to_start() {
        let radio = MemoryRadio::new("off");
        radio.set_available(false);

        let result = radio.start_scanning().await;
        assert!(matches!(result, Err(MeshError::RadioCapabilityUnavailable(_))));

        let result = radio.start_advertising(&"me#1".into()).await;
        assert!(result.unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let airspace = Airspace::new();
        let alice = airspace.radio("alice");
        let bob = airspace.radio("bob");
        let (a_link, _) = airspace.connect(&alice, &bob).await.unwrap();

        alice.set_failing_writes(true);
        assert!(alice.send(a_link, b"x").await.is_err());
        assert!(alice.sent_frames().await.is_empty());
    }

    #[tokio::test]
    async fn test_airspace_reuses_named_radio() {
        let airspace = Airspace::new();
        let first = airspace.radio("alice");
        let again = airspace.radio("alice");
        assert!(first.same_node(&again));
        assert!(airspace.get("nobody").is_none());

        let result = airspace.connect(&first, &again).await;
        assert!(matches!(result, Err(MeshError::ConnectionFailed(_))));
    }
}
