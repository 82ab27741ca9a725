//! WebSocket boundary: the `Upgrade` handshake token and a pure frame
//! codec.
//!
//! The core never runs WebSocket traffic itself. A connector answers the
//! handshake with `101 Switching Protocols`, calls
//! [`Message::lock`](crate::Message::lock) and takes the socket over via
//! [`HandlerCtx::take_socket`](crate::HandlerCtx::take_socket); from then
//! on it frames bytes with this module.

use crate::errors::Outcome;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

/// RFC 6455 handshake GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(client_key.trim().as_bytes());
    digest.update(WS_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One decoded frame; the payload is unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: Vec::new(),
        }
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload,
        }
    }
}

/// Serializes a frame. Client-sent frames must carry a mask; servers
/// send unmasked (`mask: None`).
pub fn encode(frame: &Frame, mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    out.push((frame.fin as u8) << 7 | frame.opcode as u8);

    let masked = (mask.is_some() as u8) << 7;
    let len = frame.payload.len();
    if len < 126 {
        out.push(masked | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(masked | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(masked | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(
                frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ key[i % 4]),
            );
        }
        None => out.extend_from_slice(&frame.payload),
    }
}

/// Decodes the frame at the front of `input`.
///
/// Returns the frame and the number of bytes consumed;
/// `Err(Outcome::Incomplete)` when more bytes are needed and
/// `Err(Outcome::Reject)` on a malformed frame.
pub fn decode(input: &[u8]) -> Result<(Frame, usize), Outcome> {
    if input.len() < 2 {
        return Err(Outcome::Incomplete);
    }
    let fin = input[0] & 0x80 != 0;
    if input[0] & 0x70 != 0 {
        // reserved bits are never negotiated here
        return Err(Outcome::Reject);
    }
    let opcode = Opcode::from_bits(input[0] & 0x0f).ok_or(Outcome::Reject)?;
    let masked = input[1] & 0x80 != 0;

    let mut at = 2usize;
    let len = match input[1] & 0x7f {
        126 => {
            if input.len() < at + 2 {
                return Err(Outcome::Incomplete);
            }
            let len = u16::from_be_bytes([input[at], input[at + 1]]) as u64;
            at += 2;
            len
        }
        127 => {
            if input.len() < at + 8 {
                return Err(Outcome::Incomplete);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&input[at..at + 8]);
            at += 8;
            u64::from_be_bytes(bytes)
        }
        len => len as u64,
    };
    if opcode.is_control() && (len > 125 || !fin) {
        return Err(Outcome::Reject);
    }

    let mask = if masked {
        if input.len() < at + 4 {
            return Err(Outcome::Incomplete);
        }
        let key = [input[at], input[at + 1], input[at + 2], input[at + 3]];
        at += 4;
        Some(key)
    } else {
        None
    };

    let len = usize::try_from(len).map_err(|_| Outcome::Reject)?;
    if input.len() < at + len {
        return Err(Outcome::Incomplete);
    }
    let mut payload = input[at..at + len].to_vec();
    if let Some(key) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    Ok((
        Frame {
            fin,
            opcode,
            payload,
        },
        at + len,
    ))
}
