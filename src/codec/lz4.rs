//! LZ4 raw block codec.
//!
//! Filesystem images store LZ4 blocks without the frame format, so only the
//! block decoder is exposed here.

use std::io;

pub(crate) fn decode_block(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    lz4_flex::block::decompress(input, limit)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
