//! Offline chat relay over a Bluetooth LE mesh
//!
//! Nearby devices discover each other, exchange identities and flood messages
//! hop by hop with duplicate suppression. Messages for peers that cannot be
//! reached yet wait in a store-and-forward outbox. Delivery acknowledgements
//! and read receipts ride the same path as ordinary messages.
//!
//! [`MeshController`] is the entry point; the application observes it through
//! a [`MeshObserver`].

pub mod config;
pub mod connection;
pub mod control;
pub mod controller;
pub mod error;
pub mod logging;
pub mod message;
pub mod observer;
pub mod outbox;
pub mod radio;
pub mod retry;
pub mod router;
pub mod seen_cache;

// Re-export main types
pub use config::MeshConfig;
pub use connection::{ConnectionManager, PeerLink, ReachabilityChange};
pub use control::ControlPayload;
pub use controller::{ControllerState, MeshController, SendOutcome};
pub use error::{MeshError, MeshResult};
pub use message::{Frame, Message, MessageId, MessageKind, PeerIdentity};
pub use observer::{ChannelObserver, LoggingObserver, MeshEvent, MeshObserver};
pub use outbox::{OutboxQueue, PendingMessage};
pub use radio::{Airspace, BleRadio, LinkId, MemoryRadio, PeerRadio, RadioEvent};
pub use router::{DropReason, Inbound, MessageRouter};
pub use seen_cache::SeenMessageCache;
