//! WebSocket frame codec (RFC 6455 Section 5.2).
//!
//! Pure functions between payload buffers and wire frames; no I/O happens
//! here. Decoding an incomplete buffer yields [`Error::ShortBuffer`], which
//! callers treat as "keep the bytes and retry", never as a malformed frame.

use crate::config::Limits;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::mask::{MaskGenerator, apply_mask_fast};
use crate::protocol::validation::FrameValidator;

/// Maximum payload size for control frames.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Decoded fixed part of a frame: everything before the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Declared payload length, as sent on the wire.
    pub payload_len: u64,
    /// Header length in bytes, including extended length and mask key.
    pub header_len: usize,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// The mask key is extracted before the payload offset is computed, so
    /// `header_len` always points at the first payload byte.
    ///
    /// # Errors
    ///
    /// - `Error::ShortBuffer` if the header is not complete yet
    /// - `Error::ReservedOpcode` for reserved opcodes
    #[inline]
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::ShortBuffer {
                needed: 2 - buf.len(),
            });
        }

        let byte0 = buf[0];
        let byte1 = buf[1];
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = (byte1 & 0x80) != 0;

        let (payload_len, len_end) = match byte1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Err(Error::ShortBuffer {
                        needed: 4 - buf.len(),
                    });
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Err(Error::ShortBuffer {
                        needed: 10 - buf.len(),
                    });
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            short => (u64::from(short), 2),
        };

        let header_len = if masked { len_end + 4 } else { len_end };
        if buf.len() < header_len {
            return Err(Error::ShortBuffer {
                needed: header_len - buf.len(),
            });
        }

        let mask = masked.then(|| {
            [
                buf[len_end],
                buf[len_end + 1],
                buf[len_end + 2],
                buf[len_end + 3],
            ]
        });

        Ok(Self {
            fin: (byte0 & 0x80) != 0,
            rsv1: (byte0 & 0x40) != 0,
            rsv2: (byte0 & 0x20) != 0,
            rsv3: (byte0 & 0x10) != 0,
            opcode,
            mask,
            payload_len,
            header_len,
        })
    }

    /// Total frame size on the wire.
    ///
    /// # Errors
    ///
    /// `Error::FrameTooLarge` if the frame cannot be addressed on this platform.
    fn frame_len(&self) -> Result<usize> {
        usize::try_from(self.payload_len)
            .ok()
            .and_then(|len| len.checked_add(self.header_len))
            .ok_or(Error::FrameTooLarge {
                size: self.payload_len,
                max: usize::MAX,
            })
    }
}

/// One decoded WebSocket frame, possibly a fragment of a larger message.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                     Masking key (if MASK set)                 |
/// +---------------------------------------------------------------+
/// |                          Payload data                         |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1. Must be 0 without a negotiated extension.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Key the frame arrived masked with, if any.
    pub mask: Option<[u8; 4]>,
    payload: Vec<u8>,
}

impl Frame {
    /// Create an unmasked frame.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload,
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Create a close frame with an optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = code.to_be_bytes().to_vec();
                data.extend_from_slice(reason.as_bytes());
                data
            }
            None => Vec::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Unmasked payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the unmasked payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Check the frame-local RFC 6455 rules.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` if RSV bits are set
    /// - `Error::FragmentedControlFrame` if a control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if a control payload exceeds 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }
        Ok(())
    }

    /// Size of this frame on the wire.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        header_size(self.payload.len(), masked) + self.payload.len()
    }

    /// Serialize into `buf`, masking the payload with `mask` if given.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFrame` if the buffer is too small.
    pub fn write(&self, buf: &mut [u8], mask: Option<[u8; 4]>) -> Result<usize> {
        let payload_len = self.payload.len();
        let total = self.wire_size(mask.is_some());
        if buf.len() < total {
            return Err(Error::InvalidFrame(format!(
                "Buffer too small: need {} bytes, have {}",
                total,
                buf.len()
            )));
        }

        let byte0 = (u8::from(self.fin) << 7)
            | (u8::from(self.rsv1) << 6)
            | (u8::from(self.rsv2) << 5)
            | (u8::from(self.rsv3) << 4)
            | self.opcode.as_u8();
        let offset = write_header(buf, byte0, payload_len, mask);

        let body = &mut buf[offset..offset + payload_len];
        body.copy_from_slice(&self.payload);
        if let Some(key) = mask {
            apply_mask_fast(body, key);
        }

        Ok(total)
    }

    /// Serialize into a freshly allocated buffer.
    #[must_use]
    pub fn to_bytes(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_size(mask.is_some())];
        // The buffer is sized by wire_size, so write cannot run short.
        let written = self.write(&mut buf, mask).unwrap_or(0);
        buf.truncate(written);
        buf
    }
}

fn header_size(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len <= 125 {
        0
    } else if payload_len <= usize::from(u16::MAX) {
        2
    } else {
        8
    };
    2 + extended + if masked { 4 } else { 0 }
}

/// Write the header for a frame with `payload_len` bytes of payload.
///
/// Returns the offset of the first payload byte. `buf` must hold at least
/// `header_size(payload_len, mask.is_some())` bytes.
fn write_header(buf: &mut [u8], byte0: u8, payload_len: usize, mask: Option<[u8; 4]>) -> usize {
    buf[0] = byte0;
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let mut offset = 2;
    if payload_len <= 125 {
        buf[1] = mask_bit | payload_len as u8;
    } else if payload_len <= usize::from(u16::MAX) {
        buf[1] = mask_bit | 126;
        buf[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        offset = 4;
    } else {
        buf[1] = mask_bit | 127;
        buf[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        offset = 10;
    }
    if let Some(key) = mask {
        buf[offset..offset + 4].copy_from_slice(&key);
        offset += 4;
    }
    offset
}

/// Build one wire frame around `payload`.
///
/// When `masked` is set a random key follows the length field and every
/// payload byte is XORed with `key[i % 4]`.
#[must_use]
pub fn encode(payload: &[u8], opcode: OpCode, masked: bool, fin: bool) -> Vec<u8> {
    let mask = masked.then(|| MaskGenerator::new().next_key());
    encode_with_mask(payload, opcode, mask, fin)
}

/// Like [`encode`] with a caller-chosen masking key.
#[must_use]
pub fn encode_with_mask(
    payload: &[u8],
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    fin: bool,
) -> Vec<u8> {
    let mut buf = vec![0u8; header_size(payload.len(), mask.is_some()) + payload.len()];
    let byte0 = (u8::from(fin) << 7) | opcode.as_u8();
    let offset = write_header(&mut buf, byte0, payload.len(), mask);
    let body = &mut buf[offset..];
    body.copy_from_slice(payload);
    if let Some(key) = mask {
        apply_mask_fast(body, key);
    }
    buf
}

/// Decode the frame at the start of `buf`.
///
/// Returns the frame with its payload unmasked, and the number of bytes it
/// occupied.
///
/// # Errors
///
/// - `Error::ShortBuffer` if the buffer does not yet hold the whole frame
/// - `Error::ReservedOpcode` / `Error::InvalidOpcode` for bad opcodes
/// - `Error::FrameTooLarge` if the length cannot be addressed
#[inline]
pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
    let header = FrameHeader::parse(buf)?;
    decode_payload(buf, header)
}

fn decode_payload(buf: &[u8], header: FrameHeader) -> Result<(Frame, usize)> {
    let total = header.frame_len()?;
    if buf.len() < total {
        return Err(Error::ShortBuffer {
            needed: total - buf.len(),
        });
    }

    let mut payload = buf[header.header_len..total].to_vec();
    if let Some(key) = header.mask {
        apply_mask_fast(&mut payload, key);
    }

    let frame = Frame {
        fin: header.fin,
        rsv1: header.rsv1,
        rsv2: header.rsv2,
        rsv3: header.rsv3,
        opcode: header.opcode,
        mask: header.mask,
        payload,
    };
    Ok((frame, total))
}

/// Role-aware decoder that validates each header before waiting for its
/// payload.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    validator: FrameValidator,
}

impl FrameDecoder {
    /// Create a decoder for frames received by `role`.
    #[must_use]
    pub fn new(role: Role, limits: Limits, accept_unmasked: bool) -> Self {
        Self {
            validator: FrameValidator::new(role, limits).with_accept_unmasked(accept_unmasked),
        }
    }

    /// Decode and validate the frame at the start of `buf`.
    ///
    /// # Errors
    ///
    /// `Error::ShortBuffer` while incomplete, otherwise any validation error.
    pub fn decode(&self, buf: &[u8]) -> Result<(Frame, usize)> {
        let header = FrameHeader::parse(buf)?;
        self.validator.validate(&header)?;
        decode_payload(buf, header)
    }
}
