//! Wire framing
//!
//! ## Handshake phase
//! Messages are UTF-8 JSON terminated by a single NUL byte. The very first
//! client message is prefixed by the 4-byte little-endian protocol version.
//!
//! ## Steady state
//! ```text
//! ┌──────────────┬───────────────┬────────────┬──────────────────────┐
//! │ token lo (4) │ token hi (4)  │ length (4) │ JSON payload (length)│
//! └──────────────┴───────────────┴────────────┴──────────────────────┘
//! ```
//! All integers are little-endian. Requests and responses share the layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{ReqlError, ReqlResult};

/// token (8) + length (4)
pub const HEADER_SIZE: usize = 12;

/// One decoded steady-state frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub token: u64,
    pub payload: Value,
}

/// Accumulates raw socket bytes and slices them into protocol messages.
///
/// The buffer only ever holds whole or partial messages; every extraction
/// trusts the NUL terminator or the length prefix to resynchronise.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Extract the next NUL-terminated handshake message, if complete.
    pub fn next_handshake_message(&mut self) -> ReqlResult<Option<Value>> {
        let Some(end) = self.buffer.iter().position(|b| *b == 0) else {
            return Ok(None);
        };

        let message = self.buffer.split_to(end);
        self.buffer.advance(1);

        serde_json::from_slice(&message).map(Some).map_err(|e| {
            let text = String::from_utf8_lossy(&message).into_owned();
            ReqlError::driver(format!(
                "Could not parse the handshake message \"{}\": {}",
                text, e
            ))
        })
    }

    /// Extract the next length-prefixed frame, if complete.
    ///
    /// A payload that is not valid JSON is consumed and reported as an error;
    /// callers treat it as fatal for the whole connection.
    pub fn next_frame(&mut self) -> ReqlResult<Option<Frame>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (token, length) = decode_header(&self.buffer[..HEADER_SIZE]);
        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(length).freeze();

        let payload = serde_json::from_slice(&payload).map_err(|e| {
            ReqlError::driver(format!(
                "Could not parse the response for token {}: {}",
                token, e
            ))
        })?;

        Ok(Some(Frame { token, payload }))
    }

    /// Drain every frame already available in the buffer.
    pub fn drain_frames(&mut self) -> ReqlResult<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn decode_header(header: &[u8]) -> (u64, usize) {
    let mut header = header;
    let low = header.get_u32_le() as u64;
    let high = header.get_u32_le() as u64;
    let length = header.get_u32_le() as usize;
    ((high << 32) | low, length)
}

/// Frame an already-serialized JSON payload for `token`.
pub fn encode_frame(token: u64, payload: &[u8]) -> ReqlResult<Bytes> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ReqlError::driver(format!("Query of {} bytes is too large", payload.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32_le((token & 0xFFFF_FFFF) as u32);
    buf.put_u32_le((token >> 32) as u32);
    buf.put_u32_le(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Serialize `query` and frame it for `token`.
pub fn encode_query(token: u64, query: &Value) -> ReqlResult<Bytes> {
    let payload = serde_json::to_vec(query)?;
    encode_frame(token, &payload)
}

/// JSON + NUL, as exchanged during the handshake.
pub fn encode_handshake_message(message: &Value) -> ReqlResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(0);
    Ok(buf)
}

/// Protocol version prefix followed by the first handshake message.
pub fn encode_handshake_start(version: u32, message: &Value) -> ReqlResult<Vec<u8>> {
    let body = encode_handshake_message(message)?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}
