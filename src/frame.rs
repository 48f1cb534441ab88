//! RFC 6455 frame parsing and serialization
//!
//! The parser works directly against the connection's read buffer: it peeks
//! at the buffered bytes and only consumes them once an entire frame is
//! present, so no payload allocation happens before the full header (and
//! payload) has arrived. Partial input simply reports that more bytes are
//! needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_PAYLOAD_THRESHOLD, SMALL_PAYLOAD_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from byte; reserved opcodes return `None`
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (reserved, must be zero without a negotiated extension)
    pub rsv1: bool,
    /// RSV2 (reserved)
    pub rsv2: bool,
    /// RSV3 (reserved)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (true for client-to-server frames)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

/// A complete WebSocket frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame carrying a code and reason
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create a close frame with no body
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Parse a Close frame payload into a code and reason
    ///
    /// Returns `Ok(None)` for an empty payload. A one-byte payload and an
    /// out-of-table code are protocol errors; an undecodable reason is an
    /// [`Error::InvalidUtf8`].
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        if self.payload.len() == 1 {
            return Err(Error::Protocol("close payload must be at least 2 bytes"));
        }

        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }

        let reason = if self.payload.len() > 2 {
            let text = &self.payload[2..];
            if !crate::utf8::validate_utf8(text) {
                return Err(Error::InvalidUtf8);
            }
            String::from_utf8_lossy(text).into_owned()
        } else {
            String::new()
        };

        Ok(Some(CloseReason::new(code, reason)))
    }
}

/// Incremental frame parser
///
/// Holds the masking policy and the frame size cap; the parse itself is a
/// pure function of the buffered bytes. Call [`FrameParser::parse`] in a
/// loop until it reports that more input is needed.
pub struct FrameParser {
    /// Maximum accepted payload length per frame
    max_frame_size: usize,
    /// Whether incoming frames must be masked (server role)
    expect_masked: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            max_frame_size,
            expect_masked,
        }
    }

    /// Parse one frame from the front of `buf`
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was consumed
    /// - `Ok(None)` if more bytes are needed (`buf` is left untouched)
    /// - `Err(e)` on a protocol violation
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;

        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol("reserved bits must be zero"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidFrame("invalid opcode"))?;

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        let len_byte = b1 & 0x7F;
        let (payload_len, len_size) = match len_byte {
            0..=125 => (len_byte as u64, 0),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len < 126 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                (len, 2)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be zero"));
                }
                if len <= 0xFFFF {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                (len, 8)
            }
        };

        if opcode.is_control() && payload_len > 125 {
            return Err(Error::Protocol("control frame too large"));
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let header_size = 2 + len_size + if masked { 4 } else { 0 };
        let total = header_size + payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mask = if masked {
            Some([
                buf[2 + len_size],
                buf[2 + len_size + 1],
                buf[2 + len_size + 2],
                buf[2 + len_size + 3],
            ])
        } else {
            None
        };

        buf.advance(header_size);
        let mut payload = buf.split_to(payload_len as usize);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header: FrameHeader {
                fin,
                rsv1,
                rsv2,
                rsv3,
                opcode,
                masked,
                payload_len,
                mask,
            },
            payload: payload.freeze(),
        }))
    }
}

/// Encode a frame into a buffer
///
/// With a mask the payload is copied in and XORed in place; without one the
/// payload follows the header verbatim.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_PAYLOAD_THRESHOLD {
            8
        } else if payload_len > SMALL_PAYLOAD_THRESHOLD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}
