//! Decompression codec infrastructure.
//!
//! This module provides two decode primitives behind one immutable,
//! statically constructed [`Registry`]:
//!
//! - **block decode**: a whole compressed span in, at most `limit` decoded
//!   bytes out ([`Registry::decode_block`]). Used by the block cache for
//!   formats that compress fixed-size blocks independently.
//! - **stream decode**: a [`Decoder`] wrapping a buffered reader
//!   ([`stream_decoder`]). Used for items that are one long compressed run.
//!
//! Methods without an entry (or whose feature is disabled) are recognized by
//! name but report [`Error::UnsupportedMethod`].

#[cfg(feature = "bzip2")]
pub mod bzip2;
mod copy;
#[cfg(feature = "deflate")]
pub mod deflate;
#[cfg(feature = "lz4")]
pub mod lz4;
#[cfg(feature = "lzma")]
pub mod lzma;
#[cfg(feature = "zstd")]
pub mod zstd;

use std::fmt;
use std::io::{self, BufRead, Read};

use crate::{Error, Result};

pub use copy::CopyDecoder;

#[cfg(feature = "bzip2")]
pub use self::bzip2::Bzip2Decoder;
#[cfg(feature = "deflate")]
pub use deflate::{DeflateDecoder, MsZipDecoder, ZlibDecoder};
#[cfg(feature = "lzma")]
pub use lzma::LzmaDecoder;
#[cfg(feature = "zstd")]
pub use self::zstd::ZstdStreamDecoder;

/// A decoder that reads compressed data and produces uncompressed output.
pub trait Decoder: Read {
    /// Returns the method this decoder implements.
    fn method(&self) -> Method;
}

/// Compression methods found across the supported containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Method {
    /// Stored bytes.
    #[default]
    Copy,
    /// Defined-zero content (sparse blocks, unallocated disk ranges).
    Zero,
    /// Raw deflate.
    Deflate,
    /// Deflate with a zlib wrapper.
    Zlib,
    /// Microsoft cabinet deflate: `CK` blocks sharing a 32 KiB history.
    MsZip,
    /// LZMA with the 5 property bytes prefixed to the data.
    Lzma,
    /// LZMA with the 13-byte legacy `.lzma` header.
    LzmaAlone,
    /// bzip2.
    Bzip2,
    /// Zstandard frames.
    Zstd,
    /// LZ4 raw block format.
    Lz4,
    /// XZ container.
    Xz,
    /// LZO.
    Lzo,
    /// LZX (cabinet).
    Lzx,
    /// Quantum (cabinet).
    Quantum,
    /// Apple Data Compression.
    Adc,
    /// Apple LZFSE.
    Lzfse,
    /// A RAR 5 compression level (1-5).
    Rar(u8),
    /// A method id the format defines but this crate does not name.
    Unknown(u32),
}

impl Method {
    /// Returns the short display name used in item properties.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Copy => "Copy",
            Method::Zero => "Zero",
            Method::Deflate => "Deflate",
            Method::Zlib => "Zlib",
            Method::MsZip => "MSZip",
            Method::Lzma => "LZMA",
            Method::LzmaAlone => "LZMA",
            Method::Bzip2 => "BZip2",
            Method::Zstd => "ZSTD",
            Method::Lz4 => "LZ4",
            Method::Xz => "XZ",
            Method::Lzo => "LZO",
            Method::Lzx => "LZX",
            Method::Quantum => "Quantum",
            Method::Adc => "ADC",
            Method::Lzfse => "LZFSE",
            Method::Rar(_) => "RAR",
            Method::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Rar(level) => write!(f, "RAR:m{}", level),
            Method::Unknown(id) => write!(f, "Unknown:{:#x}", id),
            other => f.write_str(other.name()),
        }
    }
}

/// Decodes one compressed block, producing at most `limit` bytes.
pub type BlockFn = fn(input: &[u8], limit: usize) -> io::Result<Vec<u8>>;

/// One registry row: a method and its block decoder, if compiled in.
#[derive(Debug, Clone, Copy)]
pub struct CodecEntry {
    /// The method this row describes.
    pub method: Method,
    block: Option<BlockFn>,
}

impl CodecEntry {
    /// Returns `true` if the block decoder is available in this build.
    pub fn is_available(&self) -> bool {
        self.block.is_some()
    }
}

/// Immutable method table consulted by the block cache and the pipeline.
///
/// The crate-wide instance is [`REGISTRY`]; handlers receive it by
/// reference and never mutate it.
#[derive(Debug)]
pub struct Registry {
    entries: &'static [CodecEntry],
}

#[cfg(feature = "deflate")]
const DEFLATE: Option<BlockFn> = Some(deflate::decode_raw_block);
#[cfg(feature = "deflate")]
const ZLIB: Option<BlockFn> = Some(deflate::decode_zlib_block);
#[cfg(feature = "deflate")]
const MSZIP: Option<BlockFn> = Some(deflate::decode_mszip_block);
#[cfg(not(feature = "deflate"))]
const DEFLATE: Option<BlockFn> = None;
#[cfg(not(feature = "deflate"))]
const ZLIB: Option<BlockFn> = None;
#[cfg(not(feature = "deflate"))]
const MSZIP: Option<BlockFn> = None;

#[cfg(feature = "lzma")]
const LZMA: Option<BlockFn> = Some(lzma::decode_prefixed_block);
#[cfg(feature = "lzma")]
const LZMA_ALONE: Option<BlockFn> = Some(lzma::decode_alone_block);
#[cfg(not(feature = "lzma"))]
const LZMA: Option<BlockFn> = None;
#[cfg(not(feature = "lzma"))]
const LZMA_ALONE: Option<BlockFn> = None;

#[cfg(feature = "bzip2")]
const BZIP2: Option<BlockFn> = Some(self::bzip2::decode_block);
#[cfg(not(feature = "bzip2"))]
const BZIP2: Option<BlockFn> = None;

#[cfg(feature = "zstd")]
const ZSTD: Option<BlockFn> = Some(self::zstd::decode_block);
#[cfg(not(feature = "zstd"))]
const ZSTD: Option<BlockFn> = None;

#[cfg(feature = "lz4")]
const LZ4: Option<BlockFn> = Some(lz4::decode_block);
#[cfg(not(feature = "lz4"))]
const LZ4: Option<BlockFn> = None;

/// The crate-wide codec registry.
pub static REGISTRY: Registry = Registry {
    entries: &[
        CodecEntry {
            method: Method::Copy,
            block: Some(copy::decode_block),
        },
        CodecEntry {
            method: Method::Zero,
            block: Some(zero_block),
        },
        CodecEntry {
            method: Method::Deflate,
            block: DEFLATE,
        },
        CodecEntry {
            method: Method::Zlib,
            block: ZLIB,
        },
        CodecEntry {
            method: Method::MsZip,
            block: MSZIP,
        },
        CodecEntry {
            method: Method::Lzma,
            block: LZMA,
        },
        CodecEntry {
            method: Method::LzmaAlone,
            block: LZMA_ALONE,
        },
        CodecEntry {
            method: Method::Bzip2,
            block: BZIP2,
        },
        CodecEntry {
            method: Method::Zstd,
            block: ZSTD,
        },
        CodecEntry {
            method: Method::Lz4,
            block: LZ4,
        },
    ],
};

fn zero_block(_input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    Ok(vec![0u8; limit])
}

impl Registry {
    /// Looks up the row for `method`.
    pub fn get(&self, method: Method) -> Option<&CodecEntry> {
        self.entries.iter().find(|e| e.method == method)
    }

    /// Returns `true` if `method` can be block-decoded in this build.
    pub fn supports(&self, method: Method) -> bool {
        self.get(method).is_some_and(CodecEntry::is_available)
    }

    /// Decodes one independently compressed block.
    ///
    /// The output holds at most `limit` bytes; callers compare its length
    /// against the size they expect. Codec failures surface as
    /// [`Error::DataError`], unknown methods as [`Error::UnsupportedMethod`].
    pub fn decode_block(&self, method: Method, input: &[u8], limit: usize) -> Result<Vec<u8>> {
        let decode = self
            .get(method)
            .and_then(|e| e.block)
            .ok_or(Error::UnsupportedMethod { method })?;
        log::trace!(
            "decoding {} block: {} -> at most {} bytes",
            method,
            input.len(),
            limit
        );
        decode(input, limit).map_err(|e| Error::data(format!("{}: {}", method, e)))
    }
}

/// Builds a streaming decoder for `method` over a buffered input.
///
/// `size` is the declared decoded size when the format stores one; stored
/// data is cut off there and LZMA uses it to find the stream end.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMethod`] for methods without a stream
/// decoder in this build.
pub fn stream_decoder<'a, R: BufRead + 'a>(
    method: Method,
    input: R,
    size: Option<u64>,
) -> Result<Box<dyn Decoder + 'a>> {
    match method {
        Method::Copy => Ok(Box::new(CopyDecoder::new(input, size.unwrap_or(u64::MAX)))),
        #[cfg(feature = "deflate")]
        Method::Deflate => Ok(Box::new(DeflateDecoder::new(input))),
        #[cfg(feature = "deflate")]
        Method::Zlib => Ok(Box::new(ZlibDecoder::new(input))),
        #[cfg(feature = "bzip2")]
        Method::Bzip2 => Ok(Box::new(Bzip2Decoder::new(input))),
        #[cfg(feature = "zstd")]
        Method::Zstd => Ok(Box::new(ZstdStreamDecoder::new(input)?)),
        #[cfg(feature = "lzma")]
        Method::Lzma => Ok(Box::new(LzmaDecoder::from_prefixed(input, size)?)),
        #[cfg(feature = "lzma")]
        Method::LzmaAlone => Ok(Box::new(LzmaDecoder::from_alone_header(input)?)),
        other => Err(Error::UnsupportedMethod { method: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Lzx.to_string(), "LZX");
        assert_eq!(Method::Rar(3).to_string(), "RAR:m3");
        assert_eq!(Method::Unknown(0x80000007).to_string(), "Unknown:0x80000007");
    }

    #[test]
    fn test_registry_copy_and_zero() {
        let out = REGISTRY.decode_block(Method::Copy, b"abcdef", 4).unwrap();
        assert_eq!(out, b"abcd");
        let out = REGISTRY.decode_block(Method::Zero, b"", 16).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn test_registry_unknown_method() {
        let err = REGISTRY.decode_block(Method::Quantum, b"xx", 10).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedMethod {
                method: Method::Quantum
            }
        ));
        assert!(!REGISTRY.supports(Method::Adc));
        assert!(REGISTRY.get(Method::Lzfse).is_none());
    }

    #[test]
    fn test_stream_decoder_unsupported() {
        let result = stream_decoder(Method::Lzx, &b"data"[..], None);
        assert!(matches!(result, Err(Error::UnsupportedMethod { .. })));
    }

    #[test]
    fn test_stream_decoder_copy_respects_size() {
        let mut decoder = stream_decoder(Method::Copy, &b"0123456789"[..], Some(4)).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123");
        assert_eq!(decoder.method(), Method::Copy);
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_registry_corrupt_block_is_data_error() {
        let err = REGISTRY
            .decode_block(Method::Zlib, b"\x78\x9c\xff\xff\xff", 100)
            .unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }
}
