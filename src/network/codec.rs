//! Message Codec
//!
//! The framer only knows "opcode + length-prefixed payload". Turning typed
//! messages into payload bytes goes through the [`Codec`] trait so the
//! encoding can be swapped without touching the session layer.

use serde::{de::DeserializeOwned, Serialize};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The caller's buffer cannot hold the encoded message.
    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required for the encoded message.
        required: usize,
        /// Bytes available in the buffer.
        available: usize,
    },

    /// Payload bytes do not decode into the requested message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Encode/decode contract used by the framer.
pub trait Codec: Send + Sync {
    /// Encode `message` into `buf`, returning the number of bytes written.
    ///
    /// Returns [`CodecError::BufferTooSmall`] without writing when `buf`
    /// cannot hold the message.
    fn encode<T: Serialize>(&self, message: &T, buf: &mut [u8]) -> Result<usize, CodecError>;

    /// Decode a message from a full payload.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;
}

/// Bincode 1.x codec with default options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, message: &T, buf: &mut [u8]) -> Result<usize, CodecError> {
        let required = bincode::serialized_size(message)
            .map_err(|e| CodecError::InvalidMessage(e.to_string()))? as usize;
        if required > buf.len() {
            return Err(CodecError::BufferTooSmall {
                required,
                available: buf.len(),
            });
        }

        let mut cursor = &mut buf[..required];
        bincode::serialize_into(&mut cursor, message)
            .map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
        Ok(required)
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(payload).map_err(|e| CodecError::InvalidMessage(e.to_string()))
    }
}
