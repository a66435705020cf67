//! Control payload syntax for acknowledgements and read receipts
//!
//! Acknowledgements carry `ACK/<id>`. Read receipts carry `READ/` followed by
//! one `<id>/` per message that has been read, so the payload always ends in
//! a slash and splitting yields an empty last field.

use crate::error::{MeshError, MeshResult};
use crate::message::{MessageId, MessageKind};

const ACK_TOKEN: &str = "ACK";
const READ_TOKEN: &str = "READ";
const SEPARATOR: char = '/';

/// Parsed body of a control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    Acknowledgement(MessageId),
    Read(Vec<MessageId>),
}

impl ControlPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlPayload::Acknowledgement(_) => MessageKind::Acknowledgement,
            ControlPayload::Read(_) => MessageKind::Read,
        }
    }

    /// Render the payload in wire syntax
    pub fn to_text(&self) -> String {
        match self {
            ControlPayload::Acknowledgement(id) => format!("{}{}{}", ACK_TOKEN, SEPARATOR, id),
            ControlPayload::Read(ids) => {
                let mut text = format!("{}{}", READ_TOKEN, SEPARATOR);
                for id in ids {
                    text.push_str(&id.to_string());
                    text.push(SEPARATOR);
                }
                text
            }
        }
    }

    /// Parse the text of a control message of the given kind
    pub fn parse(kind: MessageKind, text: &str) -> MeshResult<Self> {
        match kind {
            MessageKind::Acknowledgement => parse_acknowledgement(text).map(ControlPayload::Acknowledgement),
            MessageKind::Read => parse_read_receipt(text).map(ControlPayload::Read),
            MessageKind::Regular => Err(MeshError::MalformedFrame(
                "regular messages carry no control payload".to_string(),
            )),
        }
    }
}

/// Parse `ACK/<id>`; exactly two fields are accepted
pub fn parse_acknowledgement(text: &str) -> MeshResult<MessageId> {
    let fields: Vec<&str> = text.split(SEPARATOR).collect();

    match fields.as_slice() {
        [token, id] if *token == ACK_TOKEN => parse_id(id),
        _ => Err(MeshError::MalformedFrame(format!("not an acknowledgement: {:?}", text))),
    }
}

/// Parse `READ/<id1>/<id2>/.../` into the ids it lists
///
/// `READ/` yields an empty list, while a bare `READ` is malformed. The
/// trailing empty field is discarded; an empty field anywhere else is
/// malformed.
pub fn parse_read_receipt(text: &str) -> MeshResult<Vec<MessageId>> {
    let mut fields: Vec<&str> = text.split(SEPARATOR).collect();

    match fields.first() {
        Some(token) if *token == READ_TOKEN && fields.len() > 1 => {}
        _ => return Err(MeshError::MalformedFrame(format!("not a read receipt: {:?}", text))),
    }

    if fields.last() == Some(&"") {
        fields.pop();
    }

    fields.into_iter().skip(1).map(parse_id).collect()
}

/// Decimal digits only; signs and whitespace are rejected
fn parse_id(field: &str) -> MeshResult<MessageId> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MeshError::MalformedFrame(format!("invalid message id: {:?}", field)));
    }

    field
        .parse::<MessageId>()
        .map_err(|_| MeshError::MalformedFrame(format!("message id out of range: {:?}", field)))
}
