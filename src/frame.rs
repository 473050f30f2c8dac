//! # Frame Codec
//!
//! RFC 6455 frame encoding and decoding, written from scratch.
//!
//! WHY FROM SCRATCH:
//! - RFC 6455 hasn't changed since 2011. Won't change.
//! - A few hundred lines vs an external library's thousands
//! - No dependency that can break or change
//!
//! Decoding is incremental: TCP does not promise frame-aligned reads, so
//! [`FrameParser`] buffers whatever bytes arrive and emits zero or more
//! complete frames per `feed`. Every length field is validated against the
//! bytes actually buffered before anything is read; a truncated frame means
//! "wait for more", never an out-of-bounds slice.
//!
//! Encoding covers what the server sends: unmasked text frames carrying a
//! JSON envelope, plus close and pong control replies. Client frames must
//! be masked, server frames never are, per the RFC.

use thiserror::Error;

/// Largest payload the server will buffer for a single frame. A hostile
/// peer can declare a 64-bit length; cap it before allocating.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Close status code for a protocol error (RFC 6455 section 7.4.1).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Frame opcodes, as a tagged variant so every kind gets an explicit
/// branch downstream. Unknown opcodes fail decoding instead of being
/// silently treated as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameKind {
    fn from_opcode(opcode: u8) -> Result<Self, FrameError> {
        match opcode {
            OPCODE_CONTINUATION => Ok(Self::Continuation),
            OPCODE_TEXT => Ok(Self::Text),
            OPCODE_BINARY => Ok(Self::Binary),
            OPCODE_CLOSE => Ok(Self::Close),
            OPCODE_PING => Ok(Self::Ping),
            OPCODE_PONG => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One decoded frame. Payload is already unmasked.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Decode failures. Any of these means the peer violated the protocol;
/// the connection layer answers with a 1002 close frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),
    #[error("client frame is not masked")]
    UnmaskedClientFrame,
    #[error("declared payload length {0} exceeds limit {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(u64),
}

/// XOR the payload in place with `key[i mod 4]`. Masking is an involution:
/// applying it twice restores the original bytes, so the same routine
/// serves both directions.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Bounds-checked reader over the buffered bytes. Every accessor checks the
/// remaining length first and returns `None` when the buffer is short,
/// which the parser reports as "frame not complete yet".
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn read_u16_be(&mut self) -> Option<u16> {
        let b = self.read_bytes(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u64_be(&mut self) -> Option<u64> {
        let b = self.read_bytes(8)?;
        Some(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Incremental parser for client frames.
///
/// Feed it raw socket bytes as they arrive, then drain complete frames:
///
/// ```
/// # use wirepush::frame::FrameParser;
/// let mut parser = FrameParser::new();
/// parser.feed(&[0x81, 0x85, 1, 2, 3, 4]); // header arrives first...
/// assert!(parser.next().unwrap().is_none()); // ...payload still missing
/// ```
#[derive(Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read socket bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame. `Ok(None)` means more bytes
    /// are needed; call again after the next `feed`. Errors are protocol
    /// violations and leave the buffer unusable for further parsing.
    pub fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut cursor = Cursor::new(&self.buf);

        let (byte0, byte1) = match (cursor.read_u8(), cursor.read_u8()) {
            (Some(b0), Some(b1)) => (b0, b1),
            _ => return Ok(None),
        };

        let fin = byte0 & 0x80 != 0;
        let kind = FrameKind::from_opcode(byte0 & 0x0F)?;
        let masked = byte1 & 0x80 != 0;

        let declared_len: u64 = match byte1 & 0x7F {
            126 => match cursor.read_u16_be() {
                Some(len) => u64::from(len),
                None => return Ok(None),
            },
            127 => match cursor.read_u64_be() {
                Some(len) => len,
                None => return Ok(None),
            },
            len => u64::from(len),
        };

        // Reject hostile lengths before waiting for (or allocating) the
        // payload. This check must precede the mask check so a huge
        // declared length fails fast regardless of framing.
        if declared_len > MAX_PAYLOAD_LEN as u64 {
            return Err(FrameError::PayloadTooLarge(declared_len));
        }
        let payload_len = declared_len as usize;

        // Client frames are always masked per the RFC.
        if !masked {
            return Err(FrameError::UnmaskedClientFrame);
        }

        let key: [u8; 4] = match cursor.read_bytes(4) {
            Some(k) => [k[0], k[1], k[2], k[3]],
            None => return Ok(None),
        };

        let mut payload = match cursor.read_bytes(payload_len) {
            Some(p) => p.to_vec(),
            None => return Ok(None),
        };
        apply_mask(&mut payload, key);

        // Frame complete. Drop the consumed bytes, keep the rest for the
        // next frame (several frames can share one TCP segment).
        let consumed = cursor.pos;
        self.buf.drain(..consumed);

        Ok(Some(Frame { fin, kind, payload }))
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Build one server frame: FIN set, unmasked, length encoded per the RFC
/// (7-bit, then 16-bit past 125 bytes, then 64-bit past 65535).
fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(10 + len);

    frame.push(0x80 | opcode);

    if len <= 125 {
        frame.push(len as u8);
    } else if len <= 65535 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Encode a text frame around a UTF-8 payload (the JSON envelope).
pub fn encode_text(payload: &[u8]) -> Vec<u8> {
    encode_frame(OPCODE_TEXT, payload)
}

/// Encode a close frame carrying a status code.
pub fn encode_close(code: u16) -> Vec<u8> {
    encode_frame(OPCODE_CLOSE, &code.to_be_bytes())
}

/// Encode a pong frame echoing the ping payload.
pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(OPCODE_PONG, payload)
}
