//! Opening containers and extracting their items.
//!
//! [`Archive`] is the single entry point for every supported format: it
//! probes the stream, keeps the parsed item table and the volume streams,
//! and decodes items on demand, either one at a time through
//! [`Archive::get_stream`] or in bulk through [`Archive::extract`].
//!
//! # Example
//!
//! ```rust,no_run
//! use arkiv::{Archive, ExtractOptions, MemorySink, OpenOptions, Selection};
//!
//! let mut archive = Archive::open_path("image.squashfs", OpenOptions::new())?;
//! for item in archive.items() {
//!     println!("{} ({:?} bytes)", item.name, item.size);
//! }
//!
//! let mut sink = MemorySink::new();
//! let report = archive.extract(Selection::All, ExtractOptions::new(), &mut sink)?;
//! assert!(report.is_ok());
//! # Ok::<(), arkiv::Error>(())
//! ```

mod archive_open;
mod archive_query;
mod decompression;
mod destination;
mod extraction;
mod options;
mod path_safety;

use std::fmt;

pub use archive_query::{ArchivePropId, PropId, PropValue};
pub use decompression::ItemStream;
pub use destination::{ExtractSink, FilesystemSink, MemoryFile, MemorySink, NullSink};
pub use extraction::ExtractReport;
pub use options::{ExtractMode, ExtractOptions, Limits, OpenOptions, Selection};

use crate::cache::BlockCache;
#[cfg(feature = "aes")]
use crate::crypto::KeyCache;
use crate::crypto::PasswordProvider;
use crate::format::{ArchiveInfo, FormatState, ItemSource};
use crate::item::ItemTable;
use crate::volume::VolumeSet;

/// Result of extracting or testing one item.
///
/// Every requested item ends with exactly one outcome; a failed item never
/// stops the rest of a bulk extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemOutcome {
    /// Decoded completely and verified where a checksum exists.
    Ok,
    /// The codec failed or produced the wrong number of bytes.
    DataError,
    /// The method is not available in this build.
    UnsupportedMethod,
    /// The decoded bytes do not match the stored CRC.
    CrcError,
    /// The item's headers are inconsistent.
    HeadersError,
    /// The payload runs past the end of the stream.
    UnexpectedEnd,
    /// The payload lives in a volume that could not be opened.
    Unavailable,
    /// The item is encrypted and no password was supplied.
    PasswordRequired,
    /// The supplied password does not match the item.
    WrongPassword,
}

impl ItemOutcome {
    /// Returns `true` for [`ItemOutcome::Ok`].
    pub fn is_ok(self) -> bool {
        self == ItemOutcome::Ok
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            ItemOutcome::Ok => "OK",
            ItemOutcome::DataError => "Data error",
            ItemOutcome::UnsupportedMethod => "Unsupported method",
            ItemOutcome::CrcError => "CRC error",
            ItemOutcome::HeadersError => "Headers error",
            ItemOutcome::UnexpectedEnd => "Unexpected end of data",
            ItemOutcome::Unavailable => "Unavailable data",
            ItemOutcome::PasswordRequired => "Password required",
            ItemOutcome::WrongPassword => "Wrong password",
        }
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opened container.
///
/// The archive owns the primary stream, every additional volume, the item
/// table and the block cache. All of it is released by
/// [`close`](Archive::close) or on drop.
pub struct Archive<R> {
    pub(crate) volumes: VolumeSet<R>,
    pub(crate) items: ItemTable,
    pub(crate) sources: Vec<ItemSource>,
    pub(crate) info: ArchiveInfo,
    pub(crate) state: FormatState,
    pub(crate) cache: BlockCache,
    pub(crate) limits: Limits,
    pub(crate) verify_checksums: bool,
    pub(crate) password: Option<Box<dyn PasswordProvider>>,
    #[cfg(feature = "aes")]
    pub(crate) keys: KeyCache,
}

impl<R> fmt::Debug for Archive<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("kind", &self.info.kind)
            .field("items", &self.items.len())
            .field("volumes", &self.volumes.len())
            .field("headers_error", &self.info.headers_error)
            .field("unexpected_end", &self.info.unexpected_end)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    use crate::{Error, FormatKind};

    fn ar(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = b"!<arch>\n".to_vec();
        for (name, data) in members {
            let header = format!(
                "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
                format!("{}/", name),
                0,
                0,
                0,
                "100644",
                data.len()
            );
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn test_outcome_names() {
        assert!(ItemOutcome::Ok.is_ok());
        assert!(!ItemOutcome::CrcError.is_ok());
        assert_eq!(ItemOutcome::CrcError.to_string(), "CRC error");
        assert_eq!(ItemOutcome::Unavailable.name(), "Unavailable data");
    }

    #[test]
    fn test_open_and_read_ar() {
        let data = ar(&[("a.txt", b"alpha"), ("b.txt", b"bravo!")]);
        let mut archive = Archive::open(Cursor::new(data), OpenOptions::new()).unwrap();
        assert_eq!(archive.info().kind, FormatKind::Ar);
        assert_eq!(archive.len(), 2);

        let mut out = String::new();
        archive.get_stream(1).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "bravo!");

        let mut sink = MemorySink::new();
        let report = archive
            .extract(Selection::All, ExtractOptions::new(), &mut sink)
            .unwrap();
        assert!(report.is_ok());
        assert_eq!(sink.get("a.txt"), Some(&b"alpha"[..]));
    }

    #[test]
    fn test_unknown_bytes_are_not_this_format() {
        let err = Archive::open(Cursor::new(vec![0x5Au8; 300]), OpenOptions::new()).unwrap_err();
        assert!(matches!(err, Error::NotThisFormat));
        let err = Archive::open(Cursor::new(Vec::new()), OpenOptions::new()).unwrap_err();
        assert!(matches!(err, Error::NotThisFormat));
    }

    #[test]
    fn test_close_returns_primary_stream() {
        let data = ar(&[("x", b"1")]);
        let archive = Archive::open(Cursor::new(data.clone()), OpenOptions::new()).unwrap();
        let debug = format!("{:?}", archive);
        assert!(debug.contains("Ar"));
        let stream = archive.close();
        assert_eq!(stream.into_inner(), data);
    }
}
