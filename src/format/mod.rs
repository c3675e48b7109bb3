//! Format detection and the per-container header parsers.
//!
//! Each supported container has one parser module exposing a cheap
//! [`Probe`] over the first and last bytes of the stream and a full `parse`
//! that turns headers into an [`ItemTable`](crate::ItemTable). Dispatch goes
//! through the static [`HANDLERS`] table in probe order, so more specific
//! signatures win over looser ones (tar, whose only signature is a header
//! checksum, is tried last).

pub(crate) mod bytes;

pub(crate) mod ar;
pub(crate) mod cab;
pub(crate) mod cramfs;
pub(crate) mod dmg;
pub(crate) mod pe;
pub(crate) mod pyinstaller;
pub(crate) mod rar5;
pub(crate) mod squashfs;
pub(crate) mod tar;
pub(crate) mod vhd;

use std::fmt;

use crate::cache::BlockMap;
use crate::codec::Method;
use crate::crypto::{Password, PasswordProvider};
use crate::item::ItemTable;
use crate::read::{ItemOutcome, Limits};
use crate::volume::{Extent, VolumeProvider, VolumeSet};
use crate::window::{ReadSeek, read_exact_at};
use crate::Result;

/// Bytes from the start of the stream handed to probes.
pub const PROBE_HEAD: usize = 4096;

/// Bytes from the end of the stream handed to probes.
pub const PROBE_TAIL: usize = 8192;

/// The container kinds this crate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FormatKind {
    /// Unix `ar` archive / static library.
    Ar,
    /// Microsoft cabinet.
    Cab,
    /// Compressed ROM filesystem.
    Cramfs,
    /// Apple disk image.
    Dmg,
    /// Portable Executable sections.
    Pe,
    /// Terse Executable sections.
    Te,
    /// PyInstaller CArchive.
    PyInstaller,
    /// RAR 5.
    Rar5,
    /// SquashFS 4.0.
    Squashfs,
    /// tar.
    Tar,
    /// Virtual PC / Hyper-V virtual disk.
    Vhd,
}

impl FormatKind {
    /// Every kind, in probe order.
    pub const ALL: [FormatKind; 11] = [
        FormatKind::Ar,
        FormatKind::Cab,
        FormatKind::Cramfs,
        FormatKind::Rar5,
        FormatKind::Squashfs,
        FormatKind::Vhd,
        FormatKind::Dmg,
        FormatKind::PyInstaller,
        FormatKind::Pe,
        FormatKind::Te,
        FormatKind::Tar,
    ];

    /// Short format name.
    pub fn name(self) -> &'static str {
        match self {
            FormatKind::Ar => "Ar",
            FormatKind::Cab => "Cab",
            FormatKind::Cramfs => "CramFS",
            FormatKind::Dmg => "Dmg",
            FormatKind::Pe => "PE",
            FormatKind::Te => "TE",
            FormatKind::PyInstaller => "PyInstaller",
            FormatKind::Rar5 => "Rar5",
            FormatKind::Squashfs => "SquashFS",
            FormatKind::Tar => "tar",
            FormatKind::Vhd => "VHD",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a signature probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The bytes cannot start this format.
    NotThisFormat,
    /// The stream is a prefix of a valid signature but too short.
    NeedMoreBytes(u64),
    /// The signature matches; a full parse should be attempted.
    Match,
}

impl Probe {
    /// Probe helper for formats with a fixed signature at offset 0.
    pub(crate) fn signature(head: &[u8], signature: &[u8]) -> Probe {
        if head.len() >= signature.len() {
            if head.starts_with(signature) {
                Probe::Match
            } else {
                Probe::NotThisFormat
            }
        } else if !head.is_empty() && signature.starts_with(head) {
            Probe::NeedMoreBytes(signature.len() as u64)
        } else {
            Probe::NotThisFormat
        }
    }
}

/// The bytes a probe may inspect.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInput<'a> {
    /// Up to [`PROBE_HEAD`] bytes from offset 0.
    pub head: &'a [u8],
    /// Up to [`PROBE_TAIL`] bytes ending at the end of the stream.
    pub tail: &'a [u8],
    /// Length of the stream.
    pub size: u64,
}

impl ProbeInput<'_> {
    /// Offset of `tail[0]` in the stream.
    pub fn tail_offset(&self) -> u64 {
        self.size - self.tail.len() as u64
    }
}

/// One row of the format table.
pub(crate) struct FormatHandler {
    pub kind: FormatKind,
    pub probe: fn(&ProbeInput<'_>) -> Probe,
    pub parse: fn(&mut ParseContext<'_>) -> Result<Parsed>,
}

impl fmt::Debug for FormatHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatHandler")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// The format table, in probe order.
pub(crate) static HANDLERS: &[FormatHandler] = &[
    FormatHandler {
        kind: FormatKind::Ar,
        probe: ar::probe,
        parse: ar::parse,
    },
    FormatHandler {
        kind: FormatKind::Cab,
        probe: cab::probe,
        parse: cab::parse,
    },
    FormatHandler {
        kind: FormatKind::Cramfs,
        probe: cramfs::probe,
        parse: cramfs::parse,
    },
    FormatHandler {
        kind: FormatKind::Rar5,
        probe: rar5::probe,
        parse: rar5::parse,
    },
    FormatHandler {
        kind: FormatKind::Squashfs,
        probe: squashfs::probe,
        parse: squashfs::parse,
    },
    FormatHandler {
        kind: FormatKind::Vhd,
        probe: vhd::probe,
        parse: vhd::parse,
    },
    FormatHandler {
        kind: FormatKind::Dmg,
        probe: dmg::probe,
        parse: dmg::parse,
    },
    FormatHandler {
        kind: FormatKind::PyInstaller,
        probe: pyinstaller::probe,
        parse: pyinstaller::parse,
    },
    FormatHandler {
        kind: FormatKind::Pe,
        probe: pe::probe_pe,
        parse: pe::parse_pe,
    },
    FormatHandler {
        kind: FormatKind::Te,
        probe: pe::probe_te,
        parse: pe::parse_te,
    },
    FormatHandler {
        kind: FormatKind::Tar,
        probe: tar::probe,
        parse: tar::parse,
    },
];

/// Returns the table row for `kind`.
pub(crate) fn handler(kind: FormatKind) -> Option<&'static FormatHandler> {
    HANDLERS.iter().find(|h| h.kind == kind)
}

/// Runs every probe and returns the kinds that matched, in probe order.
///
/// `needed` receives the largest byte count any probe asked for.
pub fn detect(input: &ProbeInput<'_>, needed: &mut Option<u64>) -> Vec<FormatKind> {
    let mut matches = Vec::new();
    for handler in HANDLERS {
        match (handler.probe)(input) {
            Probe::Match => matches.push(handler.kind),
            Probe::NeedMoreBytes(n) => *needed = Some(needed.map_or(n, |m| m.max(n))),
            Probe::NotThisFormat => {}
        }
    }
    matches
}

/// Everything a parser may touch while reading headers.
pub(crate) struct ParseContext<'a> {
    pub volumes: VolumeSet<&'a mut dyn ReadSeek>,
    pub limits: Limits,
    pub allow_tail: bool,
    pub verify_checksums: bool,
    pub provider: &'a mut dyn VolumeProvider,
    pub password: &'a mut Option<Box<dyn PasswordProvider>>,
    pub warnings: Vec<String>,
}

impl<'a> ParseContext<'a> {
    /// Length of the primary stream.
    pub fn size(&self) -> u64 {
        self.volumes.size(0).unwrap_or(0)
    }

    /// Reads exactly `buf.len()` bytes of the primary stream at `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(self.volumes.primary_mut(), offset, buf)
    }

    /// Reads a header region of `len` bytes after checking it against the limits.
    pub fn read_vec_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let len = self.limits.check_header(len)?;
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads up to `len` bytes at `offset`, stopping at the end of the stream.
    pub fn read_up_to(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let len = len.min(self.size().saturating_sub(offset));
        self.read_vec_at(offset, len)
    }

    /// Records a non-fatal parse warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    /// Asks the password provider for a password.
    pub fn password(&mut self) -> Option<Password> {
        self.password.as_mut().and_then(|p| p.password())
    }
}

/// Archive-level facts recorded by a parser.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ArchiveInfo {
    /// The format that accepted the stream.
    pub kind: FormatKind,
    /// Format variant (`deb`, `gnu`, `pax`, `dynamic`, ...).
    pub subtype: Option<String>,
    /// Bytes of the primary stream that belong to the container.
    pub physical_size: u64,
    /// Some header failed a consistency check.
    pub headers_error: bool,
    /// Declared sizes run past the end of the stream.
    pub unexpected_end: bool,
    /// A header checksum did not match.
    pub checksum_error: bool,
    /// Non-fatal parse warnings.
    pub warnings: Vec<String>,
    /// Number of volumes that make up the archive.
    pub volumes: u32,
    /// Items share compressed streams.
    pub solid: bool,
    /// Some content is encrypted.
    pub encrypted: bool,
    /// Archive comment.
    pub comment: Option<String>,
    /// Methods used, for display.
    pub method: Option<String>,
    /// Cluster or block size.
    pub block_size: Option<u64>,
    /// Offset of the container inside the stream.
    pub offset: u64,
    /// Volume or image name stored in the headers.
    pub name: Option<String>,
    /// Creation or modification time.
    pub mtime: Option<i64>,
}

impl ArchiveInfo {
    pub(crate) fn new(kind: FormatKind, physical_size: u64) -> Self {
        Self {
            kind,
            subtype: None,
            physical_size,
            headers_error: false,
            unexpected_end: false,
            checksum_error: false,
            warnings: Vec::new(),
            volumes: 1,
            solid: false,
            encrypted: false,
            comment: None,
            method: None,
            block_size: None,
            offset: 0,
            name: None,
            mtime: None,
        }
    }
}

/// AES parameters of an encrypted RAR 5 item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Encryption {
    pub iterations_log: u8,
    pub salt: [u8; 16],
    pub iv: [u8; 16],
    pub check: Option<[u8; 8]>,
    pub use_mac: bool,
}

/// Where an item's decoded bytes come from.
#[derive(Debug, Clone)]
pub(crate) enum ItemSource {
    /// No content.
    Empty,
    /// Packed bytes at one or more physical extents, decoded as one stream.
    Range {
        extents: Vec<Extent>,
        method: Method,
        crypto: Option<Box<Encryption>>,
    },
    /// Independently decodable blocks through the block cache.
    Blocks(BlockMap),
    /// Bytes synthesized during parsing.
    Bytes(Vec<u8>),
    /// A slice of a sequentially decoded CAB folder.
    Folder { folder: usize, offset: u64 },
    /// Content that cannot be produced; extraction reports the outcome.
    Unavailable(ItemOutcome),
}

impl ItemSource {
    /// A single stored extent in the primary volume.
    pub fn stored(offset: u64, len: u64) -> Self {
        if len == 0 {
            return ItemSource::Empty;
        }
        ItemSource::Range {
            extents: vec![Extent::new(0, offset, len)],
            method: Method::Copy,
            crypto: None,
        }
    }

    /// A single packed extent in the primary volume.
    pub fn packed(offset: u64, len: u64, method: Method) -> Self {
        ItemSource::Range {
            extents: vec![Extent::new(0, offset, len)],
            method,
            crypto: None,
        }
    }
}

/// Parser-specific state the extraction pipeline needs.
#[derive(Debug, Clone, Default)]
pub(crate) enum FormatState {
    #[default]
    None,
    Cab(cab::CabState),
}

/// The output of a successful parse.
#[derive(Debug)]
pub(crate) struct Parsed {
    pub items: ItemTable,
    pub sources: Vec<ItemSource>,
    pub info: ArchiveInfo,
    pub state: FormatState,
}

impl Parsed {
    pub fn new(info: ArchiveInfo) -> Self {
        Self {
            items: ItemTable::new(),
            sources: Vec::new(),
            info,
            state: FormatState::None,
        }
    }

    /// Appends an item with its source.
    pub fn push(&mut self, item: crate::Item, source: ItemSource) -> usize {
        self.sources.push(source);
        self.items.push(item)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers to run one parser over an in-memory stream.

    use std::io::Cursor;

    use super::*;
    use crate::volume::NoVolumes;

    pub(crate) fn parse_with(
        parse: fn(&mut ParseContext<'_>) -> Result<Parsed>,
        data: &[u8],
        password: Option<&str>,
    ) -> Result<Parsed> {
        parse_with_volumes(parse, data, password, &mut NoVolumes)
    }

    pub(crate) fn parse_with_volumes(
        parse: fn(&mut ParseContext<'_>) -> Result<Parsed>,
        data: &[u8],
        password: Option<&str>,
        provider: &mut dyn VolumeProvider,
    ) -> Result<Parsed> {
        let mut cursor = Cursor::new(data.to_vec());
        let mut password: Option<Box<dyn PasswordProvider>> =
            password.map(|p| Box::new(Password::new(p)) as Box<dyn PasswordProvider>);
        let mut ctx = ParseContext {
            volumes: VolumeSet::new(&mut cursor as &mut dyn ReadSeek, None)?,
            limits: Limits::default(),
            allow_tail: false,
            verify_checksums: true,
            provider,
            password: &mut password,
            warnings: Vec::new(),
        };
        let mut parsed = parse(&mut ctx)?;
        parsed.info.warnings.extend(ctx.warnings);
        Ok(parsed)
    }

    pub(crate) fn probe_with(probe: fn(&ProbeInput<'_>) -> Probe, data: &[u8]) -> Probe {
        let head = &data[..data.len().min(PROBE_HEAD)];
        let tail = &data[data.len().saturating_sub(PROBE_TAIL)..];
        probe(&ProbeInput {
            head,
            tail,
            size: data.len() as u64,
        })
    }
}
