//! hostlink Protocol - Wire protocol for bridge communication
//!
//! This crate provides the JSON message types exchanged between an
//! automation client and the bridge daemon over the WebSocket channel.

pub mod message;
pub mod version;

pub use message::{ClientMessage, ErrorBody, RequestEnvelope, ResponseEnvelope, ServerMessage};
pub use version::{ProtocolVersion, VersionError, VERSION_HEADER};
