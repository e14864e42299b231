//! Message types, the codec boundary and frame compression.
//!
//! This module defines the structure of messages exchanged between clients
//! and the server and the narrow interface the pipeline uses to turn frames
//! into messages and back.

pub mod codec;
pub mod compression;
pub mod types;

pub use codec::{Codec, CodecError, JsonCodec};
pub use types::{ClientMessage, Envelope, FlightInfo, Outbound, Position, ServerMessage};
