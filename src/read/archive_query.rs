//! Read-only views of the item table and archive properties.

use std::fmt;

use crate::cache::CacheStats;
use crate::format::{ArchiveInfo, FormatKind};
use crate::item::{Item, ItemKind};
use crate::{Error, Result};

use super::Archive;

/// Per-item properties exposed by [`Archive::property`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PropId {
    /// Stored path.
    Path,
    /// Item is a directory.
    IsDir,
    /// Decoded size.
    Size,
    /// Bytes occupied in the container.
    PackedSize,
    /// Modification time, Unix seconds.
    MTime,
    /// Windows attribute bits.
    Attributes,
    /// POSIX mode bits.
    Mode,
    /// Owner id.
    Uid,
    /// Group id.
    Gid,
    /// Compression method name.
    Method,
    /// Stored CRC-32.
    Crc,
    /// Payload is encrypted.
    Encrypted,
    /// Symbolic or hard link target.
    LinkTarget,
    /// Volume holding the first payload byte.
    Volume,
    /// Offset of the item's header record.
    HeaderOffset,
    /// Offset of the first payload byte.
    Offset,
    /// Item continues from the previous volume.
    SplitBefore,
    /// Item continues in the next volume.
    SplitAfter,
    /// Item headers failed a consistency check.
    HeadersError,
}

/// Archive-level properties exposed by [`Archive::archive_property`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ArchivePropId {
    /// Format name.
    Format,
    /// Format variant.
    Subtype,
    /// Bytes of the primary stream that belong to the container.
    PhysicalSize,
    /// Offset of the container in the stream.
    Offset,
    /// Some header failed a consistency check.
    HeadersError,
    /// Declared sizes run past the end of the stream.
    UnexpectedEnd,
    /// A header checksum did not match.
    ChecksumError,
    /// Parse warnings, one per line.
    Warnings,
    /// Number of volumes.
    Volumes,
    /// Items share compressed streams.
    Solid,
    /// Some content is encrypted.
    Encrypted,
    /// Archive comment.
    Comment,
    /// Methods used.
    Method,
    /// Cluster or block size.
    BlockSize,
    /// Name stored in the headers.
    Name,
    /// Creation or modification time, Unix seconds.
    MTime,
    /// Number of items.
    ItemCount,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    /// A flag.
    Bool(bool),
    /// An unsigned number.
    U64(u64),
    /// A signed number (timestamps).
    I64(i64),
    /// Text.
    Str(String),
}

impl PropValue {
    /// Returns the value as an unsigned number, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a flag, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(b) => write!(f, "{}", if *b { "+" } else { "-" }),
            PropValue::U64(v) => write!(f, "{}", v),
            PropValue::I64(v) => write!(f, "{}", v),
            PropValue::Str(s) => f.write_str(s),
        }
    }
}

impl<R> Archive<R> {
    /// Returns the archive-level facts recorded while parsing.
    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    /// Returns the format that accepted the stream.
    pub fn kind(&self) -> FormatKind {
        self.info.kind
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the archive has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hit and miss counters of the decoded-block cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Returns the item at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] past the end of the table.
    pub fn item(&self, index: usize) -> Result<&Item> {
        self.items.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.items.len(),
        })
    }

    /// Iterates the items in table order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    /// Finds the first item with the given path.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|i| i.name == name)
    }

    /// Returns the non-fatal warnings recorded while parsing.
    pub fn warnings(&self) -> &[String] {
        &self.info.warnings
    }

    /// Returns an item property, or `None` when the item does not have it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] past the end of the table.
    pub fn property(&self, index: usize, prop: PropId) -> Result<Option<PropValue>> {
        let item = self.item(index)?;
        let value = match prop {
            PropId::Path => Some(PropValue::Str(item.name.clone())),
            PropId::IsDir => Some(PropValue::Bool(item.kind == ItemKind::Directory)),
            PropId::Size => item.size.map(PropValue::U64),
            PropId::PackedSize => Some(PropValue::U64(item.packed_size)),
            PropId::MTime => item.mtime.map(PropValue::I64),
            PropId::Attributes => item.attributes.map(|a| PropValue::U64(a.into())),
            PropId::Mode => item.mode.map(|m| PropValue::U64(m.into())),
            PropId::Uid => item.uid.map(|u| PropValue::U64(u.into())),
            PropId::Gid => item.gid.map(|g| PropValue::U64(g.into())),
            PropId::Method => Some(PropValue::Str(item.method.to_string())),
            PropId::Crc => item.crc.map(|c| PropValue::U64(c.into())),
            PropId::Encrypted => Some(PropValue::Bool(item.flags.encrypted)),
            PropId::LinkTarget => item.link_target.clone().map(PropValue::Str),
            PropId::Volume => Some(PropValue::U64(item.volume.into())),
            PropId::HeaderOffset => Some(PropValue::U64(item.header_offset)),
            PropId::Offset => Some(PropValue::U64(item.payload_offset)),
            PropId::SplitBefore => Some(PropValue::Bool(item.flags.split_before)),
            PropId::SplitAfter => Some(PropValue::Bool(item.flags.split_after)),
            PropId::HeadersError => Some(PropValue::Bool(item.flags.headers_error)),
        };
        Ok(value)
    }

    /// Returns an archive property, or `None` when the format does not
    /// record it.
    pub fn archive_property(&self, prop: ArchivePropId) -> Option<PropValue> {
        let info = &self.info;
        match prop {
            ArchivePropId::Format => Some(PropValue::Str(info.kind.name().to_string())),
            ArchivePropId::Subtype => info.subtype.clone().map(PropValue::Str),
            ArchivePropId::PhysicalSize => Some(PropValue::U64(info.physical_size)),
            ArchivePropId::Offset => Some(PropValue::U64(info.offset)),
            ArchivePropId::HeadersError => Some(PropValue::Bool(info.headers_error)),
            ArchivePropId::UnexpectedEnd => Some(PropValue::Bool(info.unexpected_end)),
            ArchivePropId::ChecksumError => Some(PropValue::Bool(info.checksum_error)),
            ArchivePropId::Warnings => {
                (!info.warnings.is_empty()).then(|| PropValue::Str(info.warnings.join("\n")))
            }
            ArchivePropId::Volumes => Some(PropValue::U64(info.volumes.into())),
            ArchivePropId::Solid => Some(PropValue::Bool(info.solid)),
            ArchivePropId::Encrypted => Some(PropValue::Bool(info.encrypted)),
            ArchivePropId::Comment => info.comment.clone().map(PropValue::Str),
            ArchivePropId::Method => info.method.clone().map(PropValue::Str),
            ArchivePropId::BlockSize => info.block_size.map(PropValue::U64),
            ArchivePropId::Name => info.name.clone().map(PropValue::Str),
            ArchivePropId::MTime => info.mtime.map(PropValue::I64),
            ArchivePropId::ItemCount => Some(PropValue::U64(self.items.len() as u64)),
        }
    }
}
