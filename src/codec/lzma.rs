//! LZMA codec implementation.
//!
//! Two framings occur in the supported containers:
//!
//! - **prefixed**: 5 property bytes (lc/lp/pb byte + LE dictionary size)
//!   and a LE `u32` decoded size, followed by the range-coded data (cramfs
//!   blocks).
//! - **alone**: the legacy 13-byte `.lzma` header, which adds a LE `u64`
//!   decoded size (`u64::MAX` when unknown) after the properties
//!   (squashfs blocks).

use std::io::{self, Read};

use super::{Decoder, Method};
use crate::{Error, Result};

/// Length of the LZMA properties header.
pub const PROPS_LEN: usize = 5;

/// Length of the properties plus the `u32` size of a prefixed block.
pub const PREFIXED_HEADER_LEN: usize = PROPS_LEN + 4;

/// Length of the legacy `.lzma` header.
pub const ALONE_HEADER_LEN: usize = 13;

/// LZMA decoder.
pub struct LzmaDecoder<R> {
    inner: lzma_rust2::LzmaReader<R>,
    method: Method,
}

impl<R> std::fmt::Debug for LzmaDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LzmaDecoder").finish_non_exhaustive()
    }
}

impl<R: Read> LzmaDecoder<R> {
    /// Creates a new LZMA decoder.
    ///
    /// # Arguments
    ///
    /// * `input` - The compressed data source
    /// * `properties` - LZMA properties (5 bytes: 1 byte props + 4 byte dict size)
    /// * `uncompressed_size` - Expected uncompressed size, `u64::MAX` if unknown
    ///
    /// # Errors
    ///
    /// Returns an error if properties are invalid.
    pub fn new(input: R, properties: &[u8], uncompressed_size: u64) -> Result<Self> {
        if properties.len() < PROPS_LEN {
            return Err(Error::data("LZMA properties too short (need 5 bytes)"));
        }

        let props_byte = properties[0];
        let dict_size =
            u32::from_le_bytes([properties[1], properties[2], properties[3], properties[4]]);

        let reader = lzma_rust2::LzmaReader::new_with_props(
            input,
            uncompressed_size,
            props_byte,
            dict_size,
            None,
        )
        .map_err(|e| Error::data(format!("LZMA: {}", e)))?;

        Ok(Self {
            inner: reader,
            method: Method::Lzma,
        })
    }

    /// Creates a decoder for data that starts with its 5 property bytes and
    /// a `u32` decoded size.
    ///
    /// A declared `size` takes precedence over the stored one.
    pub fn from_prefixed(mut input: R, size: Option<u64>) -> Result<Self> {
        let mut header = [0u8; PREFIXED_HEADER_LEN];
        input.read_exact(&mut header)?;
        let stored = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        Self::new(input, &header[..PROPS_LEN], size.unwrap_or(u64::from(stored)))
    }

    /// Creates a decoder for data that starts with a 13-byte `.lzma` header.
    pub fn from_alone_header(mut input: R) -> Result<Self> {
        let mut header = [0u8; ALONE_HEADER_LEN];
        input.read_exact(&mut header)?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&header[PROPS_LEN..]);
        let mut decoder = Self::new(input, &header[..PROPS_LEN], u64::from_le_bytes(size))?;
        decoder.method = Method::LzmaAlone;
        Ok(decoder)
    }
}

impl<R: Read> Read for LzmaDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read> Decoder for LzmaDecoder<R> {
    fn method(&self) -> Method {
        self.method
    }
}

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn drain(decoder: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(1 << 20));
    decoder.take(limit as u64).read_to_end(&mut out)?;
    Ok(out)
}

pub(crate) fn decode_prefixed_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let stored = input
        .get(PROPS_LEN..PREFIXED_HEADER_LEN)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "LZMA header truncated"))?;
    if stored > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("LZMA block declares {} bytes, at most {} expected", stored, limit),
        ));
    }
    let decoder = LzmaDecoder::from_prefixed(input, Some(stored as u64)).map_err(to_io)?;
    drain(decoder, stored)
}

pub(crate) fn decode_alone_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let decoder = LzmaDecoder::from_alone_header(input).map_err(to_io)?;
    drain(decoder, limit)
}
