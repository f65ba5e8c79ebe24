//! WebSocket framing as seen by the guest.
//!
//! The guest speaks raw WebSocket over what it believes is a TCP socket.
//! Frames it writes are decoded here before being sent on a real
//! connection, and messages from that connection are re-framed for it.

use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::error::{Error, Result};

/// Largest payload accepted from the guest in a single frame.
pub const MAX_FRAME_LEN: usize = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

/// Encode one unfragmented frame.
///
/// The mask bit is set with an all-zero key, so the payload is copied
/// unchanged.
pub fn encode_frame(payload: &[u8], binary: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(if binary { 0x82 } else { 0x81 });

    let len = payload.len();
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len <= 0xFFFF {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Decode the frame at the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a complete frame. A declared length above
/// [`MAX_FRAME_LEN`] is an error rather than a wait for more bytes.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some(header) = parse_header(buf)? else {
        return Ok(None);
    };
    let Some(end) = header.pos.checked_add(header.len) else {
        return Err(Error::FrameTooLarge(header.len as u64));
    };
    let Some(payload) = buf.get(header.pos..end) else {
        return Ok(None);
    };

    let mut payload = payload.to_vec();
    if let Some(key) = header.mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    Ok(Some((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        },
        end,
    )))
}

struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    len: usize,
    /// Offset of the payload.
    pos: usize,
}

fn parse_header(buf: &[u8]) -> Result<Option<Header>> {
    let (Some(&first), Some(&second)) = (buf.first(), buf.get(1)) else {
        return Ok(None);
    };

    let fin = first & 0x80 != 0;
    let opcode = Opcode::from_bits(first & 0x0F);
    let masked = second & 0x80 != 0;

    let (len, mut pos) = match second & 0x7F {
        126 => match buf.get(2..4) {
            Some(bytes) => (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4),
            None => return Ok(None),
        },
        127 => match buf.get(2..10).and_then(|b| <[u8; 8]>::try_from(b).ok()) {
            Some(bytes) => (u64::from_be_bytes(bytes), 10),
            None => return Ok(None),
        },
        short => (short as u64, 2),
    };
    let len = match usize::try_from(len) {
        Ok(len) if len <= MAX_FRAME_LEN => len,
        _ => return Err(Error::FrameTooLarge(len)),
    };

    let mask = if masked {
        match buf.get(pos..pos + 4).and_then(|b| <[u8; 4]>::try_from(b).ok()) {
            Some(key) => {
                pos += 4;
                Some(key)
            }
            None => return Ok(None),
        }
    } else {
        None
    };

    Ok(Some(Header {
        fin,
        opcode,
        mask,
        len,
        pos,
    }))
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.trim().as_bytes())
}

/// Upgrade response handed to the guest once the real connection is open.
pub fn handshake_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}
