//! # arkiv
//!
//! A pure-Rust reader for archive, disk image and executable container
//! formats.
//!
//! One [`Archive`] handle covers every supported format. Opening a stream
//! probes the format table, parses the headers into a flat item table and
//! keeps the streams open; items are then decoded on demand, either one at
//! a time through [`Archive::get_stream`] or in bulk through
//! [`Archive::extract`] into an [`ExtractSink`].
//!
//! ## Supported formats
//!
//! | Format | Items | Payload |
//! |--------|-------|---------|
//! | `ar` (Unix, GNU, BSD, Debian) | members, symbol tables | stored |
//! | CAB | files in folders, multi-cabinet sets | stored, MSZIP |
//! | cramfs | directory tree | zlib blocks |
//! | DMG (UDIF) | partitions | stored, zero, ADC, zlib, bzip2, LZFSE, LZMA |
//! | PE / TE | sections, headers, overlay | stored |
//! | PyInstaller | bundled files | stored, zlib |
//! | RAR 5 | files, multi-volume sets | stored, optionally AES-256 |
//! | SquashFS | directory tree | gzip, LZMA, XZ, LZO, LZ4, zstd blocks |
//! | tar (ustar, GNU, PAX) | files, links, devices | stored |
//! | VHD | disk image | fixed and dynamic |
//!
//! Codecs that are not compiled in, or not implemented, report
//! [`ItemOutcome::UnsupportedMethod`] per item; listing still works.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use arkiv::{Archive, ExtractOptions, FilesystemSink, OpenOptions, Result, Selection};
//!
//! fn main() -> Result<()> {
//!     let mut archive = Archive::open_path("rootfs.squashfs", OpenOptions::new())?;
//!     println!("{}: {} items", archive.kind(), archive.len());
//!
//!     let mut sink = FilesystemSink::new("./output")?;
//!     let report = archive.extract(Selection::All, ExtractOptions::new(), &mut sink)?;
//!     for (index, outcome) in report.failures() {
//!         eprintln!("{}: {}", archive.item(index)?.name, outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Reading one item
//!
//! ```rust
//! use std::io::{Cursor, Read};
//! use arkiv::{Archive, OpenOptions};
//!
//! let mut data = b"!<arch>\n".to_vec();
//! data.extend_from_slice(b"hello.txt/      0           0     0     100644  5         `\n");
//! data.extend_from_slice(b"hello\n");
//!
//! let mut archive = Archive::open(Cursor::new(data), OpenOptions::new())?;
//! let index = archive.find("hello.txt").unwrap();
//! let mut text = String::new();
//! archive.get_stream(index)?.read_to_string(&mut text)?;
//! assert_eq!(text, "hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `lzma` | Yes | LZMA and XZ blocks |
//! | `deflate` | Yes | Deflate, zlib and MSZIP |
//! | `bzip2` | Yes | BZip2 blocks |
//! | `lz4` | Yes | LZ4 blocks |
//! | `zstd` | Yes | Zstandard blocks |
//! | `aes` | Yes | RAR 5 AES-256 decryption |
//!
//! ## Errors and item outcomes
//!
//! Archive-level operations return [`Result<T>`]. Per-item failures during
//! extraction never abort the batch; each item ends with one
//! [`ItemOutcome`] in the [`ExtractReport`]:
//!
//! ```rust,no_run
//! use arkiv::{Archive, Error, OpenOptions};
//!
//! match Archive::open_path("unknown.bin", OpenOptions::new()) {
//!     Ok(archive) => println!("{} items", archive.len()),
//!     Err(Error::NotThisFormat) => eprintln!("not a supported container"),
//!     Err(e) if e.is_corruption() => eprintln!("damaged: {}", e),
//!     Err(e) => eprintln!("error: {}", e),
//! }
//! ```
//!
//! ## Safety and resource limits
//!
//! Every declared count and size is checked against [`Limits`] before it
//! is used to allocate. Decompression output is bounded by the declared
//! size, the block cache by [`CacheConfig`], and [`FilesystemSink`] refuses
//! names that would leave its root.
//!
//! ## Minimum supported Rust version
//!
//! This crate requires **Rust 1.85** or later.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod cache;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod format;
pub mod item;
pub mod progress;
pub mod read;
pub mod timestamp;
pub mod volume;
pub mod window;

pub use cache::{CacheConfig, CacheStats};
pub use codec::Method;
pub use crypto::{Password, PasswordProvider};
pub use error::{Error, Result};
pub use format::{ArchiveInfo, FormatKind};
pub use item::{Item, ItemFlags, ItemKind, ItemTable};
pub use progress::{
    CancellationToken, NoProgress, ProgressReporter, StatisticsProgress, WithCancellation,
};
pub use read::{
    Archive, ArchivePropId, ExtractMode, ExtractOptions, ExtractReport, ExtractSink,
    FilesystemSink, ItemOutcome, ItemStream, Limits, MemoryFile, MemorySink, NullSink,
    OpenOptions, PropId, PropValue, Selection,
};
pub use timestamp::Timestamp;
pub use volume::{DirectoryVolumes, MemoryVolumes, NoVolumes, VolumeProvider};
