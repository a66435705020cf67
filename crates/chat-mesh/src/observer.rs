//! Event surface the surrounding application depends on

use crate::error::MeshError;
use crate::message::Message;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Receiver of the six mesh events
///
/// Callbacks run on the controller's event loop and must not block. Every
/// method has an empty default so an observer only implements what it uses.
pub trait MeshObserver: Send + Sync {
    /// The number of connected devices changed
    fn on_reachability_changed(&self, _connected_devices: usize) {}

    /// This node forwarded a message on behalf of others
    fn on_message_relayed(&self) {}

    /// A regular message addressed to this node arrived
    fn on_message_received(&self, _message: Message) {}

    /// An `ACK/<id>` addressed to this node arrived
    fn on_acknowledgement_received(&self, _message: Message) {}

    /// A `READ/<id>/.../` addressed to this node arrived
    fn on_read_receipt_received(&self, _message: Message) {}

    /// The mesh layer can no longer operate
    fn on_failure(&self, _error: &MeshError) {}
}

/// Owned form of an observer callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    ReachabilityChanged(usize),
    MessageRelayed,
    MessageReceived(Message),
    AcknowledgementReceived(Message),
    ReadReceiptReceived(Message),
    Failure(String),
}

/// Publishes every callback as a [`MeshEvent`] on an unbounded channel
#[derive(Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn publish(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            debug!("Mesh event receiver dropped");
        }
    }
}

impl MeshObserver for ChannelObserver {
    fn on_reachability_changed(&self, connected_devices: usize) {
        self.publish(MeshEvent::ReachabilityChanged(connected_devices));
    }

    fn on_message_relayed(&self) {
        self.publish(MeshEvent::MessageRelayed);
    }

    fn on_message_received(&self, message: Message) {
        self.publish(MeshEvent::MessageReceived(message));
    }

    fn on_acknowledgement_received(&self, message: Message) {
        self.publish(MeshEvent::AcknowledgementReceived(message));
    }

    fn on_read_receipt_received(&self, message: Message) {
        self.publish(MeshEvent::ReadReceiptReceived(message));
    }

    fn on_failure(&self, error: &MeshError) {
        self.publish(MeshEvent::Failure(error.to_string()));
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl MeshObserver for LoggingObserver {
    fn on_reachability_changed(&self, connected_devices: usize) {
        info!(connected_devices, "Reachability changed");
    }

    fn on_message_relayed(&self) {
        info!("Relayed a message");
    }

    fn on_message_received(&self, message: Message) {
        info!(
            message_id = message.id,
            sender = %message.sender,
            bytes = message.text.len(),
            "Message received"
        );
    }

    fn on_acknowledgement_received(&self, message: Message) {
        info!(message_id = message.id, sender = %message.sender, text = %message.text, "Acknowledgement received");
    }

    fn on_read_receipt_received(&self, message: Message) {
        info!(message_id = message.id, sender = %message.sender, text = %message.text, "Read receipt received");
    }

    fn on_failure(&self, error: &MeshError) {
        error!(error = %error, "Mesh failure");
    }
}
