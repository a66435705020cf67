//! Radio abstraction for the dual advertise + scan transport

pub mod ble;
pub mod framing;
pub mod memory;

use crate::error::MeshResult;
use crate::message::PeerIdentity;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use ble::BleRadio;
pub use memory::{Airspace, MemoryRadio};

/// Well-known service UUID advertised by every node
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xD6B52A44_E586_4502_9F98_4799C8B95C86);

/// Well-known characteristic UUID carrying mesh frames
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x54C89B72_F7EE_4A0A_8382_7367C3E151A5);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to one live link, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate a fresh link handle
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Events a radio reports upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    LinkEstablished(LinkId),
    LinkLost(LinkId),
    FrameReceived { link: LinkId, data: Vec<u8> },
    /// The radio can no longer operate (hardware off, permission revoked)
    CapabilityLost(String),
}

/// Sink the radio pushes its events into
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Platform-agnostic radio operations
#[async_trait]
pub trait PeerRadio: Send + Sync {
    /// Route future events into `sink`, replacing any previous sink
    async fn attach(&self, sink: RadioEventSender);

    /// Start broadcasting presence under `identity`; idempotent
    ///
    /// A radio without a peripheral role returns [`MeshError::Unsupported`]
    /// and the node runs as a scanner only.
    ///
    /// [`MeshError::Unsupported`]: crate::error::MeshError::Unsupported
    async fn start_advertising(&self, identity: &PeerIdentity) -> MeshResult<()>;

    /// Start discovering advertisers and connecting to them automatically
    async fn start_scanning(&self) -> MeshResult<()>;

    /// Best-effort write of one encoded frame to one link
    async fn send(&self, link: LinkId, frame: &[u8]) -> MeshResult<()>;

    /// Close one link
    async fn disconnect(&self, link: LinkId) -> MeshResult<()>;

    /// Stop advertising and scanning and close every link
    async fn shutdown(&self) -> MeshResult<()>;
}
