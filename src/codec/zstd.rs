//! Zstandard codec implementation.

use std::io::{self, BufRead, Read};

use zstd::stream::read::Decoder as ZstdDecoder;

use super::{Decoder, Method};

/// ZSTD decoder.
pub struct ZstdStreamDecoder<R: BufRead> {
    inner: ZstdDecoder<'static, R>,
}

impl<R: BufRead> std::fmt::Debug for ZstdStreamDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdStreamDecoder").finish_non_exhaustive()
    }
}

impl<R: BufRead> ZstdStreamDecoder<R> {
    /// Creates a new ZSTD decoder over a buffered source.
    pub fn new(input: R) -> io::Result<Self> {
        let decoder = ZstdDecoder::with_buffer(input)?;
        Ok(Self { inner: decoder })
    }
}

impl<R: BufRead> Read for ZstdStreamDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: BufRead> Decoder for ZstdStreamDecoder<R> {
    fn method(&self) -> Method {
        Method::Zstd
    }
}

pub(crate) fn decode_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(1 << 20));
    ZstdDecoder::with_buffer(input)?
        .take(limit as u64)
        .read_to_end(&mut out)?;
    Ok(out)
}
