//! JSON stand-in for the XML/WbXML codec.
//!
//! Serializes the engine's message model directly, so tests exercise the
//! codec seam without depending on markup details. Round-trips are exact.

use tether_core::device_info::DeviceInfoPayload;
use tether_core::wire::codec::{CodecError, EncodedMessage, MessageCodec};
use tether_core::wire::{Fragment, OutgoingMessage, ParsedMessage};

const CONTTYPE_JSON: &str = "application/vnd.syncml+json";

/// Pass-through codec encoding messages as JSON.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        JsonCodec
    }
}

impl MessageCodec for JsonCodec {
    fn decode(&self, data: &[u8], _content_type: &str) -> Result<ParsedMessage, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Parse(e.to_string()))
    }

    fn encode(
        &self,
        message: &OutgoingMessage,
        _use_wbxml: bool,
    ) -> Result<EncodedMessage, CodecError> {
        // Flatten into the inbound representation so the peer's decode sees
        // exactly what a real parser would produce.
        let mut fragments = Vec::with_capacity(message.body.len() + 2);
        fragments.push(Fragment::Header(message.header.clone()));
        fragments.extend(message.body.iter().cloned());
        if message.final_marker {
            fragments.push(Fragment::Final);
        }

        let parsed = ParsedMessage { fragments };
        let bytes =
            serde_json::to_vec(&parsed).map_err(|e| CodecError::Encode(e.to_string()))?;

        Ok(EncodedMessage { bytes, content_type: CONTTYPE_JSON.to_string() })
    }

    fn decode_devinf(&self, data: &[u8]) -> Result<DeviceInfoPayload, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Parse(e.to_string()))
    }

    fn encode_devinf(&self, payload: &DeviceInfoPayload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }
}
