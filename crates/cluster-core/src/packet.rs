//! Wire envelope for cluster traffic.
//!
//! Every frame on a link is one compact JSON object followed by a single
//! `\n` byte:
//!
//! ```text
//! {"name":"node-a","datatype":"chat","datamessage":"{\"message\":\"hi\"}","time":"2024-05-01T12:00:00Z"}
//! ```
//!
//! The payload is encoded on its own and embedded as a string, so the
//! envelope can be parsed and routed without knowing the payload's shape.
//! Receivers decode the payload lazily with [`Packet::message`].

use crate::control::{ControlMessage, ControlTag};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Maximum size of a single frame (16MB) to bound memory use per link.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Errors from encoding or decoding packets.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode packet: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Tag {0:?} is reserved for cluster control messages")]
    ReservedTag(String),
    #[error("Message tag cannot be empty")]
    EmptyTag,
    #[error("Expected {expected} packet, got {found:?}")]
    UnexpectedTag { expected: ControlTag, found: String },
    #[error("Packet exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },
}

/// How the dispatcher should treat a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Internal protocol traffic, never handed to the application
    Control(ControlTag),
    /// Opaque application payload
    Application,
}

/// The envelope exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    name: String,
    #[serde(rename = "datatype")]
    data_type: String,
    #[serde(rename = "datamessage")]
    data_message: String,
    time: DateTime<Utc>,
}

impl Packet {
    /// Build a packet from a sender name, an explicit tag and a payload.
    pub fn new<T: Serialize + ?Sized>(
        sender: &str,
        tag: &str,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let data_message = serde_json::to_string(payload).map_err(CodecError::Encode)?;
        Ok(Self::from_parts(sender, tag, data_message))
    }

    /// Build a control packet; the tag comes from the message type.
    pub fn control<M: ControlMessage>(sender: &str, message: &M) -> Result<Self, CodecError> {
        Self::new(sender, M::TAG.as_str(), message)
    }

    fn from_parts(sender: &str, tag: &str, data_message: String) -> Self {
        Self {
            name: sender.to_string(),
            data_type: tag.to_string(),
            data_message,
            time: Utc::now(),
        }
    }

    /// Name of the node that sent this packet.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type tag of the embedded payload.
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// The embedded, still-encoded payload.
    pub fn data_message(&self) -> &str {
        &self.data_message
    }

    /// Sender's clock when the packet was built.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn kind(&self) -> PacketKind {
        match ControlTag::from_tag(&self.data_type) {
            Some(tag) => PacketKind::Control(tag),
            None => PacketKind::Application,
        }
    }

    /// Serialize to a newline-terminated frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut data = serde_json::to_vec(self).map_err(CodecError::Encode)?;
        data.push(DELIMITER);
        Ok(data)
    }

    /// Parse one envelope from `data`, up to the first newline.
    ///
    /// Anything after the first newline is ignored. Input without a newline
    /// is parsed whole.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let line = match data.iter().position(|b| *b == DELIMITER) {
            Some(end) => &data[..end],
            None => data,
        };
        if line.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge {
                size: line.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        serde_json::from_slice(line).map_err(CodecError::Decode)
    }

    /// Decode the embedded payload into the caller's expected shape.
    pub fn message<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_str(&self.data_message).map_err(CodecError::Decode)
    }

    /// Decode the payload as a specific control message, checking the tag.
    pub fn control_message<M: ControlMessage>(&self) -> Result<M, CodecError> {
        if self.data_type != M::TAG.as_str() {
            return Err(CodecError::UnexpectedTag {
                expected: M::TAG,
                found: self.data_type.clone(),
            });
        }
        self.message()
    }
}

/// An application payload, encoded up front and tagged by the caller.
///
/// Reserved control tags are rejected so application traffic can never be
/// mistaken for protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    tag: String,
    body: String,
}

impl OutboundMessage {
    pub fn new<T: Serialize + ?Sized>(
        tag: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CodecError::EmptyTag);
        }
        if ControlTag::from_tag(&tag).is_some() {
            return Err(CodecError::ReservedTag(tag));
        }
        let body = serde_json::to_string(payload).map_err(CodecError::Encode)?;
        Ok(Self { tag, body })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Wrap in an envelope stamped with the sender's name and the current time.
    pub fn to_packet(&self, sender: &str) -> Packet {
        Packet::from_parts(sender, &self.tag, self.body.clone())
    }
}
