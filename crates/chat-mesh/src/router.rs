//! Flooding relay with duplicate suppression

use crate::connection::ConnectionManager;
use crate::error::{MeshError, MeshResult};
use crate::message::{Frame, Message, MessageId, PeerIdentity};
use crate::radio::{LinkId, PeerRadio};
use crate::seen_cache::SeenMessageCache;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Why an inbound frame was not acted upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The frame did not decode
    Malformed(String),
    /// The id was already handled within the retention window
    Duplicate(MessageId),
    /// This node originated the message; it came back around the mesh
    OwnMessage(MessageId),
    /// Addressed elsewhere but there is no other link to flood it to
    NoFloodTargets(MessageId),
}

/// Result of routing one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The neighbour announced its identity
    Handshake { identity: PeerIdentity },
    /// The message is addressed to this node; propagation stops here
    Delivered(Message),
    /// The message was forwarded on behalf of others
    Relayed { message_id: MessageId, links: usize },
    Dropped(DropReason),
}

/// Protocol core: decides for every inbound frame whether to deliver, relay or drop
///
/// There is no routing table. Anything not addressed to this node is flooded
/// to every link except the one it arrived on, and the seen cache stops the
/// flood from looping.
pub struct MessageRouter {
    identity: RwLock<PeerIdentity>,
    seen: Arc<SeenMessageCache>,
    connections: Arc<ConnectionManager>,
    radio: Arc<dyn PeerRadio>,
    relayed: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        identity: PeerIdentity,
        seen: Arc<SeenMessageCache>,
        connections: Arc<ConnectionManager>,
        radio: Arc<dyn PeerRadio>,
    ) -> Self {
        info!("MessageRouter initialized for {}", identity);

        Self {
            identity: RwLock::new(identity),
            seen,
            connections,
            radio,
            relayed: AtomicU64::new(0),
        }
    }

    pub async fn identity(&self) -> PeerIdentity {
        self.identity.read().await.clone()
    }

    pub async fn set_identity(&self, identity: PeerIdentity) {
        info!("Router identity changed to {}", identity);
        *self.identity.write().await = identity;
    }

    /// Messages forwarded on behalf of others since the process started
    pub fn relay_count(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Route one frame received on `link`
    ///
    /// Never fails: undecodable, duplicate and looping frames come back as
    /// [`Inbound::Dropped`].
    pub async fn handle_frame(&self, link: LinkId, data: &[u8]) -> Inbound {
        let message = match Frame::decode(data) {
            Ok(Frame::Hello { identity }) => {
                debug!(link = %link, identity = %identity, "Handshake frame");
                return Inbound::Handshake { identity };
            }
            Ok(Frame::Message(message)) => message,
            Err(e) => {
                debug!(link = %link, bytes = data.len(), "Dropping malformed frame: {}", e);
                return Inbound::Dropped(DropReason::Malformed(e.to_string()));
            }
        };

        if !self.seen.observe(message.id).await {
            debug!(link = %link, message_id = message.id, "Duplicate, dropping");
            return Inbound::Dropped(DropReason::Duplicate(message.id));
        }

        let identity = self.identity().await;

        if message.sender == identity {
            debug!(link = %link, message_id = message.id, "Own message came back, dropping");
            return Inbound::Dropped(DropReason::OwnMessage(message.id));
        }

        if message.receiver == identity {
            debug!(
                link = %link,
                message_id = message.id,
                kind = ?message.kind,
                sender = %message.sender,
                "Delivering locally"
            );
            return Inbound::Delivered(message);
        }

        let targets = self.connections.links_except(Some(link)).await;
        if targets.is_empty() {
            debug!(link = %link, message_id = message.id, "No other links to flood to");
            return Inbound::Dropped(DropReason::NoFloodTargets(message.id));
        }

        let written = self.flood(data, &targets).await;
        let total = self.relayed.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            link = %link,
            message_id = message.id,
            receiver = %message.receiver,
            targets = targets.len(),
            written,
            relay_count = total,
            "Relayed message"
        );

        Inbound::Relayed {
            message_id: message.id,
            links: written,
        }
    }

    /// Flood a message this node originated to every live link
    ///
    /// The id is recorded in the seen cache without gating, so the copies
    /// neighbours echo back are dropped. Returns the number of links written.
    /// Fails with [`MeshError::NoConnectedDevices`] when there are no links and
    /// [`MeshError::LinkUnavailable`] when every write failed.
    pub async fn originate(&self, message: &Message) -> MeshResult<usize> {
        let targets = self.connections.links().await;
        if targets.is_empty() {
            return Err(MeshError::NoConnectedDevices);
        }

        self.seen.observe(message.id).await;

        let frame = Frame::Message(message.clone()).encode()?;
        let written = self.flood(&frame, &targets).await;

        if written == 0 {
            return Err(MeshError::LinkUnavailable(format!(
                "no link accepted message {}",
                message.id
            )));
        }

        debug!(
            message_id = message.id,
            receiver = %message.receiver,
            kind = ?message.kind,
            written,
            "Originated message"
        );
        Ok(written)
    }

    /// Announce this node's identity on a freshly established link
    pub async fn send_hello(&self, link: LinkId) -> MeshResult<()> {
        let identity = self.identity().await;
        let frame = Frame::Hello { identity }.encode()?;
        self.radio.send(link, &frame).await
    }

    async fn flood(&self, frame: &[u8], targets: &[LinkId]) -> usize {
        let writes = targets.iter().map(|link| async move {
            match self.radio.send(*link, frame).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(link = %link, "Link write failed: {}", e);
                    false
                }
            }
        });

        join_all(writes).await.into_iter().filter(|ok| *ok).count()
    }
}
