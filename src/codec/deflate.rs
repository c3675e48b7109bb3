//! Deflate, zlib and MSZIP codec implementations.

use std::io::{self, BufRead, Read};

use flate2::bufread::{DeflateDecoder as FlateDecoder, ZlibDecoder as FlateZlibDecoder};

use super::{Decoder, Method};
use crate::{Error, Result};

/// Size of the deflate history window carried between MSZIP blocks.
pub const MSZIP_WINDOW: usize = 32 * 1024;

/// Largest decoded size of a single MSZIP block.
pub const MSZIP_BLOCK_MAX: usize = 32 * 1024;

/// Raw deflate decoder.
pub struct DeflateDecoder<R> {
    inner: FlateDecoder<R>,
}

impl<R> std::fmt::Debug for DeflateDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateDecoder").finish_non_exhaustive()
    }
}

impl<R: BufRead> DeflateDecoder<R> {
    /// Creates a new Deflate decoder.
    ///
    /// # Arguments
    ///
    /// * `input` - The compressed data source (must implement BufRead)
    pub fn new(input: R) -> Self {
        Self {
            inner: FlateDecoder::new(input),
        }
    }
}

impl<R: BufRead> Read for DeflateDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: BufRead> Decoder for DeflateDecoder<R> {
    fn method(&self) -> Method {
        Method::Deflate
    }
}

/// Zlib-wrapped deflate decoder.
pub struct ZlibDecoder<R> {
    inner: FlateZlibDecoder<R>,
}

impl<R> std::fmt::Debug for ZlibDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDecoder").finish_non_exhaustive()
    }
}

impl<R: BufRead> ZlibDecoder<R> {
    /// Creates a new zlib decoder.
    pub fn new(input: R) -> Self {
        Self {
            inner: FlateZlibDecoder::new(input),
        }
    }
}

impl<R: BufRead> Read for ZlibDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: BufRead> Decoder for ZlibDecoder<R> {
    fn method(&self) -> Method {
        Method::Zlib
    }
}

fn read_limited(mut reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(1 << 20));
    reader.by_ref().take(limit as u64).read_to_end(&mut out)?;
    Ok(out)
}

pub(crate) fn decode_raw_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(FlateDecoder::new(input), limit)
}

pub(crate) fn decode_zlib_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(FlateZlibDecoder::new(input), limit)
}

/// Decodes a lone MSZIP block that does not depend on earlier history.
pub(crate) fn decode_mszip_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    match input.strip_prefix(b"CK") {
        Some(body) => decode_raw_block(body, limit),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "MSZIP block signature missing",
        )),
    }
}

/// Stateful MSZIP decoder for one cabinet folder.
///
/// Every `CK` block is a complete deflate stream that may reference the
/// previous 32 KiB of folder output. The history is replayed ahead of each
/// block as a stored deflate block, so any inflate backend can resolve the
/// back-references; the replayed bytes are dropped from the output.
#[derive(Default)]
pub struct MsZipDecoder {
    window: Vec<u8>,
}

impl std::fmt::Debug for MsZipDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsZipDecoder")
            .field("window", &self.window.len())
            .finish()
    }
}

impl MsZipDecoder {
    /// Creates a decoder with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the history, as at the start of a folder.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Decodes one `CK` block expected to produce exactly `unpacked` bytes.
    pub fn decode_block(&mut self, packed: &[u8], unpacked: usize) -> Result<Vec<u8>> {
        if unpacked > MSZIP_BLOCK_MAX {
            return Err(Error::data(format!(
                "MSZIP block of {} bytes exceeds {}",
                unpacked, MSZIP_BLOCK_MAX
            )));
        }
        let body = packed
            .strip_prefix(b"CK")
            .ok_or_else(|| Error::data("MSZIP block signature missing"))?;

        let history = self.window.len();
        let mut stream = Vec::with_capacity(history + 5 + body.len());
        if history > 0 {
            // Non-final stored block: header bits pad to a byte boundary.
            let len = history as u16;
            stream.push(0x00);
            stream.extend_from_slice(&len.to_le_bytes());
            stream.extend_from_slice(&(!len).to_le_bytes());
            stream.extend_from_slice(&self.window);
        }
        stream.extend_from_slice(body);

        let out = read_limited(FlateDecoder::new(&stream[..]), history + unpacked)
            .map_err(|e| Error::data(format!("MSZIP: {}", e)))?;
        if out.len() != history + unpacked {
            return Err(Error::data(format!(
                "MSZIP block produced {} bytes, expected {}",
                out.len().saturating_sub(history),
                unpacked
            )));
        }

        let block = out[history..].to_vec();
        let mut window = out;
        if window.len() > MSZIP_WINDOW {
            window.drain(..window.len() - MSZIP_WINDOW);
        }
        self.window = window;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{DeflateEncoder, ZlibEncoder};
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_deflate_stream() {
        let data = b"Hello, World! This is a test of Deflate decompression.";
        let compressed = deflate(data);
        let mut decoder = DeflateDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(decoder.method(), Method::Deflate);
    }

    #[test]
    fn test_zlib_block_limit() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&[7u8; 1000]).unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(decode_zlib_block(&compressed, 100).unwrap().len(), 100);
        assert_eq!(decode_zlib_block(&compressed, 5000).unwrap().len(), 1000);
    }

    #[test]
    fn test_mszip_without_history() {
        let mut packed = b"CK".to_vec();
        packed.extend(deflate(b"cabinet payload"));
        let mut decoder = MsZipDecoder::new();
        let out = decoder.decode_block(&packed, 15).unwrap();
        assert_eq!(out, b"cabinet payload");
    }

    #[test]
    fn test_mszip_missing_signature() {
        let mut decoder = MsZipDecoder::new();
        let err = decoder.decode_block(b"XX\x03\x00", 0).unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }

    #[test]
    fn test_mszip_wrong_length() {
        let mut packed = b"CK".to_vec();
        packed.extend(deflate(b"short"));
        let mut decoder = MsZipDecoder::new();
        assert!(decoder.decode_block(&packed, 10).is_err());
    }

    #[test]
    fn test_mszip_history_is_kept() {
        let mut decoder = MsZipDecoder::new();
        let mut packed = b"CK".to_vec();
        packed.extend(deflate(b"first"));
        decoder.decode_block(&packed, 5).unwrap();

        let mut packed = b"CK".to_vec();
        packed.extend(deflate(b"second"));
        let out = decoder.decode_block(&packed, 6).unwrap();
        assert_eq!(out, b"second");
        assert_eq!(decoder.window, b"firstsecond");
    }
}
