//! Codec boundary between the wire and the router.
//!
//! The core only depends on [`Codec`]; the wire format itself lives behind
//! it. [`JsonCodec`] is the reference implementation used by the default
//! pipeline and by the tests.

use super::types::{ClientMessage, ServerMessage};

/// Errors raised while decoding or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be parsed into a message
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The message could not be serialized
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// The peer speaks a protocol version this codec does not support
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

/// Converts between frames and messages.
pub trait Codec: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<ClientMessage, CodecError>;

    fn encode(&self, message: &ServerMessage, protocol_version: u32) -> Result<Vec<u8>, CodecError>;
}

/// Highest protocol version the JSON codec understands.
pub const JSON_PROTOCOL_VERSION: u32 = 2;

/// `type`-tagged JSON frames.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, frame: &[u8]) -> Result<ClientMessage, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode(&self, message: &ServerMessage, protocol_version: u32) -> Result<Vec<u8>, CodecError> {
        if protocol_version > JSON_PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(protocol_version));
        }
        serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
    }
}
