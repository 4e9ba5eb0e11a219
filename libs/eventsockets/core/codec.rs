//! WebSocket frame codec (RFC 6455 section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The codec holds configuration only. `decode` never keeps partial state
//! between calls: it either consumes one whole frame from the front of the
//! buffer or leaves the buffer untouched and asks for more data.

use crate::error::{Result, WsError};
use crate::message::{CloseFrame, WsMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame type indicator (4 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, Ping and Pong
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::protocol(format!("invalid opcode 0x{:X}", other))),
        }
    }
}

/// One wire-level frame
///
/// `payload` is always held unmasked. `mask` records the key the frame
/// carried (decode) or should carry (encode); the codec fills in a random
/// key for client-role frames that do not specify one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Pong, payload)
    }

    pub fn close(close: Option<&CloseFrame>) -> Self {
        let payload = close.map(CloseFrame::to_payload).unwrap_or_default();
        Self::new(true, Opcode::Close, payload)
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

/// Which end of the connection the codec speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Masks outgoing frames, rejects masked incoming frames
    Client,
    /// Never masks, requires masked incoming frames
    Server,
}

/// Frame encoder/decoder for one role
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
    max_payload_size: usize,
}

impl FrameCodec {
    /// Outgoing messages larger than this are fragmented (16 KiB)
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;
    /// Incoming frames larger than this are rejected (16 MiB)
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Set the fragmentation threshold for outgoing messages
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(1);
        self
    }

    /// Set the largest accepted incoming frame payload
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a logical message into its complete frame sequence
    ///
    /// Messages up to `max_frame_size` go out as a single final frame.
    /// Larger ones are split: the first fragment carries the message
    /// opcode, the rest are continuations, and only the last sets FIN.
    pub fn encode(&self, message: &WsMessage) -> BytesMut {
        let opcode = match message {
            WsMessage::Text(_) => Opcode::Text,
            WsMessage::Binary(_) => Opcode::Binary,
        };
        let payload = message.payload();

        let mut dst = BytesMut::with_capacity(payload.len() + 14);
        if payload.len() <= self.max_frame_size {
            self.encode_parts(true, opcode, None, payload, &mut dst);
            return dst;
        }

        let chunk_count = payload.len().div_ceil(self.max_frame_size);
        for (index, chunk) in payload.chunks(self.max_frame_size).enumerate() {
            let fin = index + 1 == chunk_count;
            let frame_opcode = if index == 0 { opcode } else { Opcode::Continuation };
            self.encode_parts(fin, frame_opcode, None, chunk, &mut dst);
        }
        dst
    }

    /// Append a single frame to `dst`
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) {
        self.encode_parts(frame.fin, frame.opcode, frame.mask, &frame.payload, dst);
    }

    fn encode_parts(
        &self,
        fin: bool,
        opcode: Opcode,
        mask: Option<[u8; 4]>,
        payload: &[u8],
        dst: &mut BytesMut,
    ) {
        let mask = match self.role {
            Role::Client => Some(mask.unwrap_or_else(rand::random)),
            Role::Server => None,
        };
        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        let len = payload.len();

        dst.reserve(len + 14);
        dst.put_u8(if fin { 0x80 } else { 0x00 } | opcode as u8);
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(payload),
        }
    }

    /// Decode one frame from the front of `src`
    ///
    /// Returns `Ok(None)` without consuming anything when `src` holds only
    /// part of a header or payload. Call repeatedly to drain every
    /// complete frame in the buffer.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(WsError::protocol("reserved bits set without extension"));
        }
        let opcode = Opcode::from_u8(first & 0x0F)?;
        let masked = second & 0x80 != 0;

        match self.role {
            Role::Client if masked => {
                return Err(WsError::protocol("server frames must not be masked"))
            }
            Role::Server if !masked => return Err(WsError::protocol("client frames must be masked")),
            _ => {}
        }

        let len7 = second & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol("control frame cannot be fragmented"));
            }
            if usize::from(len7) > MAX_CONTROL_PAYLOAD {
                return Err(WsError::protocol("control frame payload exceeds 125 bytes"));
            }
        }

        let (payload_len, mut header_len) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WsError::protocol("payload length has its high bit set"));
                }
                (len, 10)
            }
            n => (u64::from(n), 2),
        };

        if payload_len > self.max_payload_size as u64 {
            return Err(WsError::MessageTooBig(format!(
                "frame payload of {} bytes exceeds limit of {}",
                payload_len, self.max_payload_size
            )));
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < header_len + payload_len {
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

/// XOR `buf` with the 4-byte masking key; applying it twice restores the input
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
