//! RFC 6455 frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! byte 0: FIN(1) RSV(3) opcode(4)
//! byte 1: MASK(1) len7(7)
//! len7 == 126 -> 2 more bytes of big-endian length
//! len7 == 127 -> 8 more bytes of big-endian length
//! MASK set    -> 4-byte masking key
//! payload
//! ```
//!
//! The server never fragments and never masks what it sends. Client frames
//! are unmasked while they are read.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// ── Constants ────────────────────────────────────────────────────────

/// Default receive buffer capacity for one client frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 8192;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Close status codes the server sends (RFC 6455 §7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_TOO_BIG: u16 = 1009;

// ── Opcode ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse the low nibble of the first header byte. Reserved codes yield `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FrameError {
    /// The peer closed or reset the stream before a whole frame arrived.
    #[error("connection closed mid-frame")]
    Closed,

    #[error("frame payload of {declared} bytes exceeds the {max}-byte receive buffer")]
    TooLarge { declared: u64, max: usize },

    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("{0:?} frame is fragmented or carries more than 125 bytes")]
    InvalidControl(OpCode),

    #[error("socket read failed: {0}")]
    Io(#[source] io::Error),
}

impl FrameError {
    /// Close status to report to the peer before dropping it, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            FrameError::TooLarge { .. } => Some(CLOSE_TOO_BIG),
            FrameError::ReservedOpcode(_) | FrameError::InvalidControl(_) => {
                Some(CLOSE_PROTOCOL_ERROR)
            }
            FrameError::Closed | FrameError::Io(_) => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => FrameError::Closed,
            _ => FrameError::Io(err),
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────────

/// One decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Status code carried by a close frame, if it has one.
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (OpCode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

/// XOR `payload` in place with the 4-byte masking key. Applying it twice is a no-op.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ── Encoding ─────────────────────────────────────────────────────────

/// Length of the header `encode_frame` emits for a payload of `len` bytes.
pub fn header_len(len: usize) -> usize {
    if len < LEN_16 as usize {
        2
    } else if len <= u16::MAX as usize {
        4
    } else {
        10
    }
}

/// Encode one unmasked, final server-to-client frame with the shortest length field.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(header_len(len) + len);
    frame.push(FIN | opcode.as_u8());
    if len < LEN_16 as usize {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(LEN_16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(LEN_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Encode a close frame carrying `code` and no reason text.
pub fn encode_close(code: u16) -> Vec<u8> {
    encode_frame(OpCode::Close, &code.to_be_bytes())
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Socket bytes pulled in per read while a frame is incomplete.
const READ_CHUNK: usize = 4096;

/// Largest payload a control frame may carry (RFC 6455 §5.5).
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Incremental reader of client frames.
///
/// Bytes pulled off the socket stay in the decoder until they add up to a
/// whole frame, so a pending `read_frame` can be dropped (as a losing
/// `select!` arm) without losing input.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Bytes received that are not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Return the next frame, reading from `reader` only when the buffer
    /// does not already hold one. Cancel-safe.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Frame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(frame);
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Split one complete frame off the front of the buffer.
    ///
    /// Header problems are reported as soon as the header bytes are in, so an
    /// oversized frame is refused before its payload is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let buf = &self.buf;
        let Some(&b0) = buf.first() else {
            return Ok(None);
        };
        let raw_opcode = b0 & 0x0F;
        let opcode = OpCode::from_u8(raw_opcode).ok_or(FrameError::ReservedOpcode(raw_opcode))?;
        let fin = b0 & FIN != 0;

        let Some(&b1) = buf.get(1) else {
            return Ok(None);
        };
        let masked = b1 & MASK != 0;

        let (declared, mut pos) = match b1 & 0x7F {
            LEN_16 => match buf.get(2..4) {
                Some(ext) => (u16::from_be_bytes([ext[0], ext[1]]) as u64, 4),
                None => return Ok(None),
            },
            LEN_64 => match buf.get(2..10) {
                Some(ext) => {
                    let mut be = [0u8; 8];
                    be.copy_from_slice(ext);
                    (u64::from_be_bytes(be), 10)
                }
                None => return Ok(None),
            },
            short => (short as u64, 2),
        };

        if opcode.is_control() && (!fin || declared > MAX_CONTROL_PAYLOAD) {
            return Err(FrameError::InvalidControl(opcode));
        }
        if declared > self.max_payload as u64 {
            return Err(FrameError::TooLarge {
                declared,
                max: self.max_payload,
            });
        }

        let mut key = None;
        if masked {
            match buf.get(pos..pos + 4) {
                Some(k) => key = Some([k[0], k[1], k[2], k[3]]),
                None => return Ok(None),
            }
            pos += 4;
        }

        let end = pos + declared as usize;
        let Some(body) = buf.get(pos..end) else {
            return Ok(None);
        };
        let mut payload = body.to_vec();
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }
        self.buf.drain(..end);

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}
