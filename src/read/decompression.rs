//! Per-item decoding shared by [`Archive::get_stream`] and bulk extraction.

use std::io::{self, BufReader, Cursor, Read, Seek, Write};

use crate::cache::BlockReader;
use crate::codec::{self, Method, REGISTRY};
use crate::crypto::PasswordProvider;
#[cfg(feature = "aes")]
use crate::crypto::{Aes256Decoder, KeyCache, Rar5Keys};
use crate::format::cab::FolderCursor;
use crate::format::{Encryption, FormatState, ItemSource};
use crate::item::Item;
use crate::volume::{Extent, ExtentReader, VolumeSet};
use crate::{Error, Result};

use super::{Archive, ItemOutcome};

/// Chunk size for streamed copies; also the granularity of progress and
/// cancellation polling for range items.
pub(crate) const COPY_CHUNK: usize = 64 * 1024;

/// A readable and seekable view of one item.
pub trait ItemStream: Read + Seek {}

impl<T: Read + Seek + ?Sized> ItemStream for T {}

impl<R: Read + Seek> Archive<R> {
    /// Returns a seekable reader over the decoded content of item `index`.
    ///
    /// Stored ranges and block-cache formats are read lazily; items that can
    /// only be decoded sequentially (compressed ranges, CAB folders) are
    /// decoded into memory first, bounded by
    /// [`Limits::max_item_size`](crate::Limits::max_item_size).
    ///
    /// # Errors
    ///
    /// - [`Error::IndexOutOfRange`] past the end of the table
    /// - the error matching the item's outcome when its content cannot be
    ///   produced ([`Error::UnsupportedMethod`], [`Error::PasswordRequired`],
    ///   ...)
    pub fn get_stream(&mut self, index: usize) -> Result<Box<dyn ItemStream + '_>> {
        let len = self.items.len();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if !self.reads_lazily(index) {
            return self.buffered_stream(index);
        }

        let item = &self.items[index];
        match &self.sources[index] {
            ItemSource::Empty => Ok(Box::new(Cursor::new(Vec::new()))),
            ItemSource::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
            ItemSource::Unavailable(outcome) => Err(outcome_error(*outcome, index, item)),
            ItemSource::Blocks(map) => Ok(Box::new(BlockReader::new(
                &mut self.cache,
                self.volumes.primary_mut(),
                map,
                index,
            ))),
            ItemSource::Range { extents, .. } => {
                Ok(Box::new(ExtentReader::new(&mut self.volumes, extents)))
            }
            ItemSource::Folder { .. } => Err(Error::data(format!(
                "item {} has no direct reader",
                index
            ))),
        }
    }

    /// Whether item `index` can be read in place without decoding it first.
    fn reads_lazily(&self, index: usize) -> bool {
        match &self.sources[index] {
            ItemSource::Range {
                extents,
                method: Method::Copy,
                crypto: None,
            } => self.items[index]
                .size
                .is_none_or(|s| s == extents.iter().map(|e| e.len).sum()),
            ItemSource::Range { .. } | ItemSource::Folder { .. } => false,
            ItemSource::Empty
            | ItemSource::Bytes(_)
            | ItemSource::Unavailable(_)
            | ItemSource::Blocks(_) => true,
        }
    }

    /// Decodes item `index` into memory and returns a reader over the result.
    fn buffered_stream(&mut self, index: usize) -> Result<Box<dyn ItemStream + '_>> {
        let declared = self.items[index].size.unwrap_or(0);
        self.limits.check_item_size(declared)?;
        let mut data = Vec::with_capacity(declared.min(COPY_CHUNK as u64 * 16) as usize);
        let mut out = LimitedWriter {
            inner: &mut data,
            remaining: self.limits.max_item_size,
        };
        self.write_item(index, &mut out, &mut None, &mut |_| Ok(()))
            .map_err(|e| attach_index(e, index, &self.items[index]))?;
        Ok(Box::new(Cursor::new(data)))
    }

    /// Decodes item `index` into `out` and returns the byte count.
    ///
    /// `folder` carries a CAB folder decoder across calls so consecutive
    /// items of one folder decode it once; pass `&mut None` for a one-off
    /// read.
    pub(crate) fn write_item(
        &mut self,
        index: usize,
        out: &mut dyn Write,
        folder: &mut Option<FolderCursor>,
        between_blocks: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<u64> {
        let Archive {
            volumes,
            items,
            sources,
            state,
            cache,
            verify_checksums,
            password,
            #[cfg(feature = "aes")]
            keys,
            ..
        } = self;
        let item = &items[index];
        match &sources[index] {
            ItemSource::Empty => Ok(0),
            ItemSource::Bytes(bytes) => {
                out.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            ItemSource::Unavailable(outcome) => Err(outcome_error(*outcome, index, item)),
            ItemSource::Blocks(map) => {
                cache.copy_item(volumes.primary_mut(), index, map, out, between_blocks)
            }
            ItemSource::Range {
                extents,
                method,
                crypto,
            } => {
                let key = match crypto {
                    Some(encryption) => {
                        if !REGISTRY.supports(*method) {
                            return Err(Error::unsupported(*method));
                        }
                        #[cfg(feature = "aes")]
                        let key = Some(item_keys(password, keys, index, encryption)?);
                        #[cfg(not(feature = "aes"))]
                        let key = item_keys(password, index, encryption)?;
                        key
                    }
                    None => None,
                };
                copy_range(
                    volumes,
                    extents,
                    *method,
                    item.size,
                    key,
                    crypto.as_deref(),
                    out,
                    between_blocks,
                )
            }
            ItemSource::Folder { folder: number, offset } => {
                let FormatState::Cab(state) = &*state else {
                    return Err(Error::corrupt_header(
                        item.header_offset,
                        "folder item without folder table",
                    ));
                };
                let reusable = folder
                    .as_ref()
                    .is_some_and(|c| c.folder() == *number && c.position() <= *offset);
                if !reusable {
                    log::trace!("starting decoder for cab folder {}", number);
                    *folder = Some(FolderCursor::new(*number));
                }
                let Some(cursor) = folder.as_mut() else {
                    return Ok(0);
                };
                let len = item.size.unwrap_or(0);
                let copied = cursor
                    .skip_to(state, volumes, *verify_checksums, *offset)
                    .and_then(|()| {
                        cursor.copy(state, volumes, *verify_checksums, len, out, between_blocks)
                    });
                if copied.is_err() {
                    *folder = None;
                }
                copied
            }
        }
    }

    /// Compares a computed CRC with the one stored for item `index`.
    ///
    /// RAR 5 archives that authenticate checksums store a keyed MAC of the
    /// CRC; the comparison then goes through the item's derived keys.
    pub(crate) fn crc_matches(&mut self, index: usize, stored: u32, actual: u32) -> Result<bool> {
        match &self.sources[index] {
            ItemSource::Range {
                crypto: Some(encryption),
                ..
            } if encryption.use_mac => {
                #[cfg(feature = "aes")]
                {
                    let keys = item_keys(&mut self.password, &mut self.keys, index, encryption)?;
                    Ok(keys.convert_crc(actual)? == stored)
                }
                #[cfg(not(feature = "aes"))]
                {
                    Err(no_aes())
                }
            }
            _ => Ok(stored == actual),
        }
    }
}

#[cfg(feature = "aes")]
type ItemKey = Rar5Keys;
#[cfg(not(feature = "aes"))]
type ItemKey = std::convert::Infallible;

#[allow(clippy::too_many_arguments)]
fn copy_range<R: Read + Seek>(
    volumes: &mut VolumeSet<R>,
    extents: &[Extent],
    method: Method,
    size: Option<u64>,
    key: Option<ItemKey>,
    crypto: Option<&Encryption>,
    out: &mut dyn Write,
    between_blocks: &mut dyn FnMut(u64) -> Result<()>,
) -> Result<u64> {
    let raw = ExtentReader::new(volumes, extents);
    let input: Box<dyn Read + '_> = match (key, crypto) {
        #[cfg(feature = "aes")]
        (Some(keys), Some(encryption)) => {
            let plain = Aes256Decoder::new(raw, *keys.key(), encryption.iv);
            match size {
                Some(size) if method == Method::Copy => Box::new(plain.take(size)),
                _ => Box::new(plain),
            }
        }
        _ => Box::new(raw),
    };
    let buffered = BufReader::with_capacity(COPY_CHUNK, input);
    let mut decoder = codec::stream_decoder(method, buffered, size)?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written = 0u64;
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_io(e)),
        };
        out.write_all(&buf[..n])?;
        written += n as u64;
        between_blocks(written)?;
    }
    Ok(written)
}

/// Derives (or fetches) the AES keys for an encrypted item and checks the
/// password against the stored check value.
#[cfg(feature = "aes")]
fn item_keys(
    password: &mut Option<Box<dyn PasswordProvider>>,
    keys: &mut KeyCache,
    index: usize,
    encryption: &Encryption,
) -> Result<Rar5Keys> {
    let password = password
        .as_mut()
        .and_then(|p| p.password())
        .ok_or(Error::PasswordRequired)?;
    let derived = keys.derive(&password, &encryption.salt, encryption.iterations_log)?;
    if let Some(check) = &encryption.check {
        if !derived.matches(check) {
            log::debug!("password check failed for item {}", index);
            return Err(Error::WrongPassword {
                item_index: Some(index),
            });
        }
    }
    Ok(derived)
}

#[cfg(not(feature = "aes"))]
fn item_keys(
    _password: &mut Option<Box<dyn PasswordProvider>>,
    _index: usize,
    _encryption: &Encryption,
) -> Result<Option<ItemKey>> {
    Err(no_aes())
}

#[cfg(not(feature = "aes"))]
fn no_aes() -> Error {
    Error::UnsupportedFeature {
        feature: "AES decryption (build with the `aes` feature)",
    }
}

/// Builds the error that matches an item outcome recorded at parse time.
pub(crate) fn outcome_error(outcome: ItemOutcome, index: usize, item: &Item) -> Error {
    match outcome {
        ItemOutcome::UnsupportedMethod => Error::unsupported(item.method),
        ItemOutcome::HeadersError => Error::corrupt_header(
            item.header_offset,
            format!("item {} headers are inconsistent", index),
        ),
        ItemOutcome::UnexpectedEnd => Error::UnexpectedEnd {
            offset: item.payload_offset.saturating_add(item.packed_size),
        },
        ItemOutcome::Unavailable => Error::VolumeUnavailable {
            volume: item.volume,
            name: item.name.clone(),
        },
        ItemOutcome::PasswordRequired => Error::PasswordRequired,
        ItemOutcome::WrongPassword => Error::WrongPassword {
            item_index: Some(index),
        },
        ItemOutcome::CrcError | ItemOutcome::DataError | ItemOutcome::Ok => {
            Error::data(format!("item {} cannot be decoded", index))
        }
    }
}

/// Points item-scoped errors raised below the item level at `index`.
pub(crate) fn attach_index(err: Error, index: usize, item: &Item) -> Error {
    match err {
        Error::CrcMismatch {
            expected, actual, ..
        } => Error::CrcMismatch {
            item_index: index,
            item_name: Some(item.name.clone()),
            expected,
            actual,
        },
        Error::WrongPassword { item_index: None } => Error::WrongPassword {
            item_index: Some(index),
        },
        other => other,
    }
}

/// Refuses to buffer more than `remaining` bytes.
struct LimitedWriter<'a> {
    inner: &'a mut Vec<u8>,
    remaining: u64,
}

impl Write for LimitedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() as u64 > self.remaining {
            return Err(Error::ResourceLimitExceeded(format!(
                "decoded item exceeds {} bytes",
                self.inner.len() as u64 + self.remaining
            ))
            .into());
        }
        self.remaining -= buf.len() as u64;
        self.inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
