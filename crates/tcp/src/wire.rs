//! Wire form of one message: type headers plus the JSON body.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use rill_core::{Message, MessageTypeRegistry};

use crate::framing::TransportError;

/// One frame's payload. `full_type_name` is the legacy qualified header kept
/// for cross-version decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePacket {
    pub type_name: String,
    pub full_type_name: String,
    pub body: JsonValue,
}

pub fn encode_message(
    registry: &MessageTypeRegistry,
    message: &dyn Message,
) -> Result<Vec<u8>, TransportError> {
    let encoded = registry
        .encode(message)
        .map_err(|e| TransportError::Codec(e.to_string()))?;
    let packet = WirePacket {
        type_name: encoded.type_name,
        full_type_name: encoded.full_type_name,
        body: encoded.body,
    };
    serde_json::to_vec(&packet).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode one frame payload. `Ok(None)` means the type is unknown to this
/// process (and the registry is lenient); callers drop the frame with a log.
pub fn decode_message(
    registry: &MessageTypeRegistry,
    payload: &[u8],
) -> Result<Option<Arc<dyn Message>>, TransportError> {
    let packet: WirePacket =
        serde_json::from_slice(payload).map_err(|e| TransportError::Codec(e.to_string()))?;
    registry
        .decode(&packet.type_name, Some(&packet.full_type_name), packet.body)
        .map_err(|e| TransportError::Codec(e.to_string()))
}
