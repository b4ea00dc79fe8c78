//! Length-prefixed framing for machine messages
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)                    │
//! │ Big-endian u32   │ JSON {"event": ..., "payload": ...}   │
//! └──────────────────┴───────────────────────────────────────┘
//! ```
//!
//! - **Maximum payload size**: 1MB (1,048,576 bytes)
//! - A frame is only parsed once all of its bytes are buffered
//! - A payload that fails to parse consumes exactly its own frame, so the
//!   stream stays aligned and the connection may continue
//! - An oversized length prefix is unrecoverable: the connection must close

use crate::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Largest accepted payload
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not enough bytes buffered yet, keep reading
    #[error("incomplete frame: {needed} more bytes required")]
    Incomplete { needed: usize },

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(usize),

    /// Frame fully received but the payload is not a valid message
    #[error("malformed payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode {event}: {source}")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Oversized(_) | CodecError::Io(_))
    }
}

/// Serializes a message into a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut dst = BytesMut::new();
    encode_into(message, &mut dst)?;
    Ok(dst.to_vec())
}

fn encode_into(message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(message).map_err(|source| CodecError::Encode {
        event: message.event_name(),
        source,
    })?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::Oversized(payload.len()));
    }
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(&payload);
    Ok(())
}

/// Locates the payload of the first frame in `buf`.
fn frame_payload(buf: &[u8]) -> Result<&[u8], CodecError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Err(CodecError::Incomplete {
            needed: LENGTH_PREFIX_LEN - buf.len(),
        });
    }
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::Oversized(len));
    }
    let end = LENGTH_PREFIX_LEN + len;
    if buf.len() < end {
        return Err(CodecError::Incomplete {
            needed: end - buf.len(),
        });
    }
    Ok(&buf[LENGTH_PREFIX_LEN..end])
}

/// Decodes the first frame in `buf`, returning the message and the number
/// of bytes it occupied. The caller keeps `buf[consumed..]` as remainder.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), CodecError> {
    let payload = frame_payload(buf)?;
    let consumed = LENGTH_PREFIX_LEN + payload.len();
    let message = serde_json::from_slice(payload).map_err(CodecError::Decode)?;
    Ok((message, consumed))
}

/// Streaming codec, one instance (and therefore one buffer) per connection.
///
/// Items are `Result<Message, CodecError>`: an inner `Err` is a malformed
/// frame that was skipped, the outer `Err` ends the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineCodec;

impl Decoder for MachineCodec {
    type Item = Result<Message, CodecError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let payload_len = match frame_payload(src) {
            Ok(payload) => payload.len(),
            Err(CodecError::Incomplete { needed }) => {
                src.reserve(needed);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(payload_len);
        Ok(Some(serde_json::from_slice(&payload).map_err(CodecError::Decode)))
    }
}

impl Encoder<Message> for MachineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst)
    }
}
