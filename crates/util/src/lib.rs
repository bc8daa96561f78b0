//! Bit-packed reader/writer primitives for the master orchestrator's wire protocol.
//!
//! Every protocol message is little-endian. Fixed-width strings are
//! NUL-padded byte buffers of a known length; length-prefixed strings carry
//! a `u32` byte count ahead of their UTF-8 bytes. Neither encoding nests or
//! recurses, so a flat cursor over a borrowed slice is enough to decode, and
//! a growable `BytesMut` is enough to encode.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Errors produced while decoding a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before a fixed-size field could be read.
    #[error("unexpected end of buffer: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },
    /// A length-prefixed string was not valid UTF-8.
    #[error("string field was not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    /// A length-prefixed field claimed a length that would exceed `max_len`.
    #[error("string length {len} exceeds maximum of {max_len}")]
    LengthOverflow { len: u32, max_len: u32 },
}

/// An upper bound on attacker-controlled length prefixes, chosen generously
/// above any legitimate username or password in this protocol.
pub const MAX_PREFIXED_LEN: u32 = 4096;

/// Cursor for decoding a message payload out of a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Wraps `buf` for sequential decoding.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn require(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            Err(WireError::Truncated { needed, remaining: self.buf.remaining() })
        } else {
            Ok(())
        }
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.require(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.require(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.require(4)?;
        Ok(self.buf.get_i32_le())
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.require(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a NUL-padded fixed-width string field of exactly `width` bytes.
    /// Trailing NUL bytes are stripped.
    pub fn read_fixed_string(&mut self, width: usize) -> Result<String, WireError> {
        self.require(width)?;
        let mut raw = vec![0u8; width];
        self.buf.copy_to_slice(&mut raw);

        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(std::str::from_utf8(&raw[..end])?.to_owned())
    }

    /// Reads a `len: u32` followed by `len` UTF-8 bytes.
    pub fn read_len_prefixed_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()?;
        if len > MAX_PREFIXED_LEN {
            return Err(WireError::LengthOverflow { len, max_len: MAX_PREFIXED_LEN });
        }

        self.require(len as usize)?;
        let mut raw = vec![0u8; len as usize];
        self.buf.copy_to_slice(&mut raw);

        Ok(std::str::from_utf8(&raw)?.to_owned())
    }
}

/// Growable buffer for encoding a message payload.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer, returning the encoded bytes.
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Writes `s` into a NUL-padded fixed-width field of exactly `width` bytes,
    /// truncating if `s` is too long to fit.
    pub fn write_fixed_string(&mut self, s: &str, width: usize) -> &mut Self {
        let bytes = s.as_bytes();
        let copy_len = bytes.len().min(width);

        self.buf.extend_from_slice(&bytes[..copy_len]);
        self.buf.extend(std::iter::repeat(0u8).take(width - copy_len));
        self
    }

    /// Writes a `len: u32` followed by `s`'s UTF-8 bytes.
    pub fn write_len_prefixed_string(&mut self, s: &str) -> &mut Self {
        let bytes = s.as_bytes();
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }
}
