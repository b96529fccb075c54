//! Wire messages of the class-loading channel
//!
//! Frames are a little-endian `u32` payload length followed by a bincode
//! encoded [`ClassMessage`].

use crate::channel::resource::{RequestId, ResourceKey};
use crate::core::error::{NetworkError, Result, SerializationError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length prefix size in bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// Message exchanged with a resource provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassMessage {
    /// Ask the provider for a resource
    Request {
        /// Requested resource
        key: ResourceKey,
        /// Correlation id
        id: RequestId,
    },
    /// Provider answer; `None` when the resource does not exist
    Response {
        /// Resource answered
        key: ResourceKey,
        /// Correlation id of the request being answered
        id: RequestId,
        /// Resource definition
        definition: Option<Vec<u8>>,
    },
}

impl ClassMessage {
    /// Encode into a length-prefixed frame, rejecting payloads above `max_size`
    pub fn encode_frame(&self, max_size: usize) -> Result<Bytes> {
        let payload = bincode::serialize(self).map_err(SerializationError::from)?;
        check_frame_len(payload.len(), max_size)?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode a frame payload (without its length prefix)
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload).map_err(SerializationError::from)?)
    }
}

/// Reject frame payloads larger than `max_size` or than a `u32` can describe
pub fn check_frame_len(len: usize, max_size: usize) -> Result<()> {
    if len > max_size || len > u32::MAX as usize {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max_size,
        }
        .into());
    }
    Ok(())
}
