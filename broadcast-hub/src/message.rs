//! Wire format for chat events.
//!
//! A frame is the `bincode` (standard config, varint integers) encoding of
//! three fields in order: `kind` as an unsigned integer, `sender` and
//! `content` as length-prefixed UTF-8 strings. Every frame is sent as a
//! single write, so on the stream transport one read normally carries one
//! whole frame.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the bytes a single decode may claim; guards against
/// length prefixes in garbage input asking for huge allocations.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>()
}

/// What a [`Message`] announces.
///
/// Unknown wire values decode to [`MessageKind::Text`] so that a newer peer
/// never gets disconnected for sending a kind this build does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Join,
    Leave,
}

impl MessageKind {
    pub fn to_wire(self) -> u64 {
        match self {
            MessageKind::Text => 0,
            MessageKind::Join => 1,
            MessageKind::Leave => 2,
        }
    }

    pub fn from_wire(value: u64) -> Self {
        match value {
            1 => MessageKind::Join,
            2 => MessageKind::Leave,
            _ => MessageKind::Text,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Text => "TEXT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl CodecError {
    /// True when decoding ran out of input, i.e. more bytes of the same
    /// frame may still be on their way.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            CodecError::Decode(bincode::error::DecodeError::UnexpectedEnd { .. })
        )
    }
}

/// One chat event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    sender: String,
    content: String,
}

#[derive(Serialize)]
struct WireRef<'a> {
    kind: u64,
    sender: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireOwned {
    kind: u64,
    sender: String,
    content: String,
}

impl Message {
    pub fn new(kind: MessageKind, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            content: content.into(),
        }
    }

    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, sender, content)
    }

    pub fn join(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Join, sender, String::new())
    }

    pub fn leave(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Leave, sender, String::new())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Serializes the message into one frame.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let wire = WireRef {
            kind: self.kind.to_wire(),
            sender: &self.sender,
            content: &self.content,
        };
        let encoded = bincode::serde::encode_to_vec(&wire, wire_config())?;
        Ok(Bytes::from(encoded))
    }

    /// Parses exactly one frame, ignoring anything after it.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode_prefix(bytes).map(|(message, _)| message)
    }

    /// Parses the frame at the start of `bytes` and reports how many bytes
    /// it occupied, so callers can walk a buffer holding several frames.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), CodecError> {
        let (wire, consumed): (WireOwned, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())?;
        let message = Message {
            kind: MessageKind::from_wire(wire.kind),
            sender: wire.sender,
            content: wire.content,
        };
        Ok((message, consumed))
    }
}
