//! Endian-aware field readers shared by the header parsers.

use crate::{Error, Result};

/// Byte order of multi-byte header fields.
///
/// Some formats (cramfs, BSD symbol tables) select the byte order per image,
/// so parsers carry a `ByteOrder` instead of hard-coding one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Reads a `u16` at `off`.
    ///
    /// # Panics
    ///
    /// Panics if `b` is shorter than `off + 2`; callers check lengths first.
    pub fn u16(self, b: &[u8], off: usize) -> u16 {
        let raw = [b[off], b[off + 1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    /// Reads a `u32` at `off`.
    pub fn u32(self, b: &[u8], off: usize) -> u32 {
        let raw = [b[off], b[off + 1], b[off + 2], b[off + 3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    /// Reads a `u64` at `off`.
    pub fn u64(self, b: &[u8], off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[off..off + 8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        }
    }
}

pub(crate) fn le_u16(b: &[u8], off: usize) -> u16 {
    ByteOrder::Little.u16(b, off)
}

pub(crate) fn le_u32(b: &[u8], off: usize) -> u32 {
    ByteOrder::Little.u32(b, off)
}

pub(crate) fn le_u64(b: &[u8], off: usize) -> u64 {
    ByteOrder::Little.u64(b, off)
}

pub(crate) fn be_u16(b: &[u8], off: usize) -> u16 {
    ByteOrder::Big.u16(b, off)
}

pub(crate) fn be_u32(b: &[u8], off: usize) -> u32 {
    ByteOrder::Big.u32(b, off)
}

pub(crate) fn be_u64(b: &[u8], off: usize) -> u64 {
    ByteOrder::Big.u64(b, off)
}

/// Returns the bytes of `field` up to the first NUL.
pub(crate) fn trim_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&c| c == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

/// Decodes bytes as UTF-8, replacing invalid sequences.
pub(crate) fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

/// A bounds-checked cursor over an in-memory header record.
///
/// Every read past the end fails with [`Error::CorruptHeader`] positioned at
/// `base + pos`, so variable-length records can never index out of bounds.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
    order: ByteOrder,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], base: u64, order: ByteOrder) -> Self {
        Self {
            buf,
            pos: 0,
            base,
            order,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn truncated(&self) -> Error {
        Error::corrupt_header(self.base + self.pos as u64, "record truncated")
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.truncated());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(self.truncated());
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(self.order.u16(b, 0))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(self.order.u32(b, 0))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(self.order.u64(b, 0))
    }

    /// Reads a little-endian base-128 integer of at most 10 bytes.
    pub(crate) fn vint(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut value = 0u64;
        for i in 0..10 {
            let b = self.u8()?;
            value |= u64::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::corrupt_header(
            self.base + start as u64,
            "variable-length integer too long",
        ))
    }
}
