//! # Frame Decoder
//!
//! Every binary frame on the status socket has the layout `[tag][payload]`:
//!
//! 1. **Tag**: one byte, stripped before decoding. It is kept on the [`DecodedFrame`] for
//!    diagnostics but never used to pick a message type.
//! 2. **Payload**: the Protobuf encoding of the configured message type
//!    (`message.WSDeviceStatus` by default).
//!
//! The payload is decoded into a `DynamicMessage` and converted into a `serde_json::Value`,
//! the same plain-data shape protobuf.js prints.
use crate::schema::{SchemaError, SchemaRegistry};
use prost_reflect::{DynamicMessage, MessageDescriptor};

/// Fully qualified name of the message carried by the status socket.
pub const DEVICE_STATUS_MESSAGE: &str = "message.WSDeviceStatus";

/// Errors that can occur while decoding a single frame.
///
/// They only concern that frame, the socket stays usable.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame is empty, expected at least a tag byte")]
    Empty,
    #[error("Failed to decode '{message}' payload: '{source}'")]
    Decode {
        message: String,
        #[source]
        source: prost::DecodeError,
    },
    #[error("Failed to map decoded message to JSON: '{0}'")]
    Json(#[from] serde_json::Error),
}

/// A frame decoded into plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// The stripped tag byte.
    pub tag: u8,
    /// The decoded payload.
    pub message: serde_json::Value,
}

/// Decodes frames against one message type of a [`SchemaRegistry`].
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    descriptor: MessageDescriptor,
}

impl FrameDecoder {
    /// Creates a decoder for the message type named `message`.
    ///
    /// # Returns
    ///
    /// * `Ok(FrameDecoder)` - Ready to decode frames.
    /// * `Err(SchemaError::MessageNotFound)` - If the registry has no such message type.
    pub fn new(registry: &SchemaRegistry, message: &str) -> Result<Self, SchemaError> {
        let descriptor = registry.lookup_message(message)?;
        Ok(Self { descriptor })
    }

    /// Creates a decoder for `message.WSDeviceStatus`.
    pub fn device_status(registry: &SchemaRegistry) -> Result<Self, SchemaError> {
        Self::new(registry, DEVICE_STATUS_MESSAGE)
    }

    /// The message type this decoder produces.
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Decodes a full frame: tag byte followed by the payload.
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, FrameError> {
        let (&tag, payload) = frame.split_first().ok_or(FrameError::Empty)?;
        let message = self.decode_payload(payload)?;
        Ok(DecodedFrame { tag, message })
    }

    /// Decodes a payload that has no tag byte in front of it.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<serde_json::Value, FrameError> {
        // 1. Bytes -> DynamicMessage
        let message = DynamicMessage::decode(self.descriptor.clone(), payload).map_err(|source| {
            FrameError::Decode {
                message: self.descriptor.full_name().to_string(),
                source,
            }
        })?;

        // 2. DynamicMessage -> serde_json::Value
        Ok(serde_json::to_value(&message)?)
    }
}
