//! Mesh message envelope and wire frames

use crate::control::ControlPayload;
use crate::error::{MeshError, MeshResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message identifier, drawn at random by the originator
pub type MessageId = u32;

/// Largest id an originator will pick (ids stay within the non-negative i32 range)
pub const MAX_MESSAGE_ID: MessageId = i32::MAX as MessageId;

/// Stable identity of a user on the mesh (username plus disambiguating digits)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of message carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User content, already encrypted for the receiver
    Regular,
    /// `ACK/<id>` delivery confirmation
    Acknowledgement,
    /// `READ/<id>/.../` read receipt
    Read,
}

/// An immutable mesh message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub sender: PeerIdentity,
    pub receiver: PeerIdentity,
    pub text: String,
}

impl Message {
    /// Create a regular message carrying an opaque ciphertext
    pub fn regular(sender: PeerIdentity, receiver: PeerIdentity, ciphertext: impl Into<String>) -> Self {
        Self {
            id: random_message_id(),
            kind: MessageKind::Regular,
            sender,
            receiver,
            text: ciphertext.into(),
        }
    }

    /// Create a control message (acknowledgement or read receipt)
    pub fn control(sender: PeerIdentity, receiver: PeerIdentity, payload: &ControlPayload) -> Self {
        Self {
            id: random_message_id(),
            kind: payload.kind(),
            sender,
            receiver,
            text: payload.to_text(),
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self.kind, MessageKind::Regular)
    }

    /// Parse the control payload carried by an acknowledgement or read message
    pub fn control_payload(&self) -> MeshResult<ControlPayload> {
        ControlPayload::parse(self.kind, &self.text)
    }
}

/// Pick a fresh message id uniformly at random
pub fn random_message_id() -> MessageId {
    rand::thread_rng().gen_range(0..=MAX_MESSAGE_ID)
}

/// A single frame exchanged over a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Identity handshake, sent by both ends right after a link comes up
    Hello { identity: PeerIdentity },
    /// A routed message
    Message(Message),
}

impl Frame {
    /// Encode to the JSON wire representation (without the frame delimiter)
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a frame received from a peer
    ///
    /// Input from the mesh is untrusted; anything that does not parse is
    /// reported as [`MeshError::MalformedFrame`].
    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        serde_json::from_slice(data).map_err(|e| MeshError::MalformedFrame(e.to_string()))
    }
}
