//! Copy codec (no compression).

use std::io::{self, Read};

use super::{Decoder, Method};

/// A decoder that passes data through unchanged, up to a declared size.
pub struct CopyDecoder<R> {
    inner: R,
    remaining: u64,
}

impl<R> std::fmt::Debug for CopyDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyDecoder")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl<R: Read> CopyDecoder<R> {
    /// Creates a new copy decoder.
    ///
    /// # Arguments
    ///
    /// * `inner` - The data source
    /// * `size` - Number of bytes to pass through
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for CopyDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let max_read = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max_read])?;
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}

impl<R: Read> Decoder for CopyDecoder<R> {
    fn method(&self) -> Method {
        Method::Copy
    }
}

pub(super) fn decode_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    Ok(input[..input.len().min(limit)].to_vec())
}
