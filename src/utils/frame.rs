//! Binary protocol frame codec
//!
//! Every request and response shares a fixed 24-byte header:
//!
//! ```text
//!  0      1       2..3        4          5          6..7            8..11       12..15   16..23
//! magic opcode key-length extras-len data-type vbucket/status total-body-len  opaque    cas
//! ```
//!
//! followed by `extras`, `key` and `value`. Responses using the alternative
//! framing (magic 0x18) carry framing extras before the regular extras and
//! encode the key length in a single byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 24;

/// Upper bound on a single frame body (server item limit plus headroom)
pub const MAX_BODY_LEN: usize = 32 * 1024 * 1024;

/// Frame magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
    AltRequest = 0x08,
    AltResponse = 0x18,
}

impl Magic {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x80 => Ok(Magic::Request),
            0x81 => Ok(Magic::Response),
            0x08 => Ok(Magic::AltRequest),
            0x18 => Ok(Magic::AltResponse),
            other => Err(ProtocolError::InvalidMagic(other)),
        }
    }

    /// Whether the header uses the flexible-framing layout
    pub fn is_alt(self) -> bool {
        matches!(self, Magic::AltRequest | Magic::AltResponse)
    }

    pub fn is_response(self) -> bool {
        matches!(self, Magic::Response | Magic::AltResponse)
    }
}

/// Data type bits
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// A decoded (or to-be-encoded) protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: Magic,
    pub opcode: u8,
    pub data_type: u8,
    /// vbucket id on requests, status on responses
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    /// Create an empty request frame for an opcode
    pub fn request(opcode: u8) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            data_type: datatype::RAW,
            vbucket_or_status: 0,
            opaque: 0,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Create an empty response frame (used by tests and the mock server)
    pub fn response(opcode: u8, status: u16, opaque: u32) -> Self {
        Self {
            magic: Magic::Response,
            vbucket_or_status: status,
            opaque,
            ..Self::request(opcode)
        }
    }

    /// Status code (meaningful on responses only)
    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Total body length as written to the header
    pub fn body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Serialize the frame into `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body_len = self.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        if self.extras.len() > u8::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "extras length {} exceeds 255",
                self.extras.len()
            )));
        }

        if self.magic.is_alt() {
            if self.framing_extras.len() > u8::MAX as usize || self.key.len() > u8::MAX as usize {
                return Err(ProtocolError::Malformed(
                    "alt framing limits framing extras and key to 255 bytes".to_string(),
                ));
            }
        } else {
            if !self.framing_extras.is_empty() {
                return Err(ProtocolError::Malformed(
                    "framing extras require alt magic".to_string(),
                ));
            }
            if self.key.len() > u16::MAX as usize {
                return Err(ProtocolError::Malformed(format!(
                    "key length {} exceeds 65535",
                    self.key.len()
                )));
            }
        }

        // nothing is written until every length fits
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(self.magic as u8);
        dst.put_u8(self.opcode);
        if self.magic.is_alt() {
            dst.put_u8(self.framing_extras.len() as u8);
            dst.put_u8(self.key.len() as u8);
        } else {
            dst.put_u16(self.key.len() as u16);
        }
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.data_type);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(body_len as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.extend_from_slice(&self.framing_extras);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.value);
        Ok(())
    }

    /// Try to decode one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only when a whole frame is available.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = Magic::from_u8(src[0])?;
        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(HEADER_LEN + body_len).freeze();
        buf.advance(1);
        let opcode = buf.get_u8();
        let (framing_len, key_len) = if magic.is_alt() {
            let framing = buf.get_u8() as usize;
            let key = buf.get_u8() as usize;
            (framing, key)
        } else {
            (0, buf.get_u16() as usize)
        };
        let extras_len = buf.get_u8() as usize;
        let data_type = buf.get_u8();
        let vbucket_or_status = buf.get_u16();
        buf.advance(4);
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        if framing_len + extras_len + key_len > body_len {
            return Err(ProtocolError::Malformed(format!(
                "framing {} + extras {} + key {} exceeds body {}",
                framing_len, extras_len, key_len, body_len
            )));
        }

        let framing_extras = buf.split_to(framing_len);
        let extras = buf.split_to(extras_len);
        let key = buf.split_to(key_len);
        let value = buf;

        Ok(Some(Self {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            framing_extras,
            extras,
            key,
            value,
        }))
    }
}

/// `tokio_util` codec for protocol frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_from(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.encode_into(dst)
    }
}

/// Append an unsigned LEB128 encoding of `value` (collection id key prefix)
pub fn write_leb128(mut value: u32, dst: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode an unsigned LEB128 prefix, returning the value and bytes consumed
pub fn read_leb128(src: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().enumerate().take(5) {
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
