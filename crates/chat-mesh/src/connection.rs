//! Connection manager - turns raw link events into peer reachability

use crate::error::{MeshError, MeshResult};
use crate::message::PeerIdentity;
use crate::radio::LinkId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One live connection to a neighbour
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub link: LinkId,
    /// Known once the neighbour's hello frame arrives
    pub identity: Option<PeerIdentity>,
    pub connected_since: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            identity: None,
            connected_since: Utc::now(),
        }
    }

    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }
}

/// Per-identity reachability transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReachabilityChange {
    Gained(PeerIdentity),
    Lost(PeerIdentity),
}

/// Tracks the set of live links and who sits behind them
///
/// Several links may lead to the same identity; all of them stay valid flood
/// targets, while reachability is reported once per identity.
pub struct ConnectionManager {
    links: RwLock<HashMap<LinkId, PeerLink>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly established link; it is anonymous until identified
    ///
    /// Returns false if the link was already known.
    pub async fn link_established(&self, link: LinkId) -> bool {
        let mut links = self.links.write().await;
        if links.contains_key(&link) {
            debug!("Link {} already registered", link);
            return false;
        }

        links.insert(link, PeerLink::new(link));
        info!("Link {} established ({} live)", link, links.len());
        true
    }

    /// Attach the identity announced in a hello frame to a link
    ///
    /// Returns the reachability transitions caused by the handshake: a gain
    /// when this is the first link to `identity`, plus a loss if the link had
    /// previously announced another identity that is now unreachable.
    pub async fn identify(
        &self,
        link: LinkId,
        identity: PeerIdentity,
    ) -> MeshResult<Vec<ReachabilityChange>> {
        let mut links = self.links.write().await;

        let previous = match links.get(&link) {
            Some(peer_link) => peer_link.identity.clone(),
            None => {
                return Err(MeshError::LinkUnavailable(format!(
                    "hello from unknown link {}",
                    link
                )))
            }
        };

        if previous.as_ref() == Some(&identity) {
            return Ok(Vec::new());
        }

        let already_reachable = links
            .values()
            .any(|peer_link| peer_link.identity.as_ref() == Some(&identity));

        if let Some(peer_link) = links.get_mut(&link) {
            peer_link.identity = Some(identity.clone());
        }

        let mut changes = Vec::new();

        if let Some(previous) = previous {
            warn!("Link {} changed identity from {} to {}", link, previous, identity);
            if !links.values().any(|peer_link| peer_link.identity.as_ref() == Some(&previous)) {
                changes.push(ReachabilityChange::Lost(previous));
            }
        }

        if !already_reachable {
            info!("Peer {} reachable via link {}", identity, link);
            changes.push(ReachabilityChange::Gained(identity));
        } else {
            debug!("Additional link {} to peer {}", link, identity);
        }

        Ok(changes)
    }

    /// Remove a link
    ///
    /// Returns a loss event when it was the last link to its identity.
    pub async fn link_lost(&self, link: LinkId) -> Option<ReachabilityChange> {
        let mut links = self.links.write().await;

        let removed = match links.remove(&link) {
            Some(removed) => removed,
            None => {
                debug!("Lost unknown link {}", link);
                return None;
            }
        };

        info!("Link {} lost ({} live)", link, links.len());

        let identity = removed.identity?;
        let still_reachable = links
            .values()
            .any(|peer_link| peer_link.identity.as_ref() == Some(&identity));

        if still_reachable {
            debug!("Peer {} still reachable over other links", identity);
            None
        } else {
            info!("Peer {} no longer reachable", identity);
            Some(ReachabilityChange::Lost(identity))
        }
    }

    /// Number of connected devices: distinct identities plus anonymous links
    pub async fn connected_device_count(&self) -> usize {
        let links = self.links.read().await;
        let mut identities = BTreeSet::new();
        let mut anonymous = 0;

        for peer_link in links.values() {
            match &peer_link.identity {
                Some(identity) => {
                    identities.insert(identity);
                }
                None => anonymous += 1,
            }
        }

        identities.len() + anonymous
    }

    /// Whether at least one live link leads directly to `identity`
    pub async fn is_reachable(&self, identity: &PeerIdentity) -> bool {
        self.links
            .read()
            .await
            .values()
            .any(|peer_link| peer_link.identity.as_ref() == Some(identity))
    }

    pub async fn has_links(&self) -> bool {
        !self.links.read().await.is_empty()
    }

    /// Every live link, identified or not
    pub async fn links(&self) -> Vec<LinkId> {
        self.links.read().await.keys().copied().collect()
    }

    /// Flood targets: every live link except the one a frame arrived on
    pub async fn links_except(&self, inbound: Option<LinkId>) -> Vec<LinkId> {
        self.links
            .read()
            .await
            .keys()
            .filter(|link| Some(**link) != inbound)
            .copied()
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerLink> {
        self.links.read().await.values().cloned().collect()
    }

    /// Drop every link, returning how many there were
    pub async fn clear(&self) -> usize {
        let mut links = self.links.write().await;
        let count = links.len();
        links.clear();
        count
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
