//! Binary envelope framing for WebSocket transport.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: payload_len][payload_len bytes: JSON message body]
//! ```
//!
//! The codec is stateless; encode and decode are free functions safe to call
//! from any task.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Length of the payload-size prefix.
const PREFIX_LEN: usize = 4;

/// Errors produced by the envelope codec.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("message does not fit in a frame: {0} bytes")]
    Oversized(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a message into a length-prefixed binary frame.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, EnvelopeError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > u32::MAX as usize {
        return Err(EnvelopeError::Oversized(body.len()));
    }

    let mut frame = Vec::with_capacity(PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a length-prefixed binary frame into a message.
///
/// Fails with [`EnvelopeError::MalformedFrame`] when the prefix is
/// unparseable, the payload is truncated, or trailing bytes follow it.
pub fn decode_message<T: DeserializeOwned>(frame: &[u8]) -> Result<T, EnvelopeError> {
    if frame.len() < PREFIX_LEN {
        return Err(EnvelopeError::MalformedFrame(format!(
            "frame too short for length prefix: {} bytes",
            frame.len()
        )));
    }

    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[PREFIX_LEN..];
    if body.len() < declared {
        return Err(EnvelopeError::MalformedFrame(format!(
            "payload truncated: expected {declared} bytes, got {}",
            body.len()
        )));
    }
    if body.len() > declared {
        return Err(EnvelopeError::MalformedFrame(format!(
            "{} trailing bytes after payload",
            body.len() - declared
        )));
    }

    serde_json::from_slice(body)
        .map_err(|e| EnvelopeError::MalformedFrame(format!("invalid payload: {e}")))
}
