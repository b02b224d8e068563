//! Codec seam between the engine and the external XML/WbXML implementation.
//!
//! The engine never touches markup. It hands an [`OutgoingMessage`] to the
//! codec and receives opaque bytes plus a content type; inbound it hands
//! bytes and receives a [`ParsedMessage`]. Device-info payloads go through
//! the same seam because their format is owned by the wire layer, not the
//! engine.

use thiserror::Error;

use crate::device_info::DeviceInfoPayload;
use crate::wire::{OutgoingMessage, ParsedMessage};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid message: {0}")]
    Parse(String),
    #[error("could not encode message: {0}")]
    Encode(String),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("message truncated or incomplete")]
    Incomplete,
}

/// An encoded outbound message ready for the transport.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Parse and serialize adapter over the external SyncML codec.
///
/// Implementations must be deterministic and stateless across messages; the
/// engine may encode a message more than once when a package is resent.
pub trait MessageCodec: Send + Sync {
    /// Decode one complete wire message.
    fn decode(&self, data: &[u8], content_type: &str) -> Result<ParsedMessage, CodecError>;

    /// Encode one outbound message. `use_wbxml` selects the binary form when
    /// the transport negotiated it.
    fn encode(&self, message: &OutgoingMessage, use_wbxml: bool) -> Result<EncodedMessage, CodecError>;

    /// Decode a device-info document carried as an item payload.
    fn decode_devinf(&self, data: &[u8]) -> Result<DeviceInfoPayload, CodecError>;

    /// Encode a device-info document for carrying as an item payload.
    fn encode_devinf(&self, payload: &DeviceInfoPayload) -> Result<Vec<u8>, CodecError>;
}
