//! Item model shared by every format parser.
//!
//! An [`Item`] is one logical entry described by a container's metadata. The
//! [`ItemTable`] keeps items in on-disk header order and resolves
//! back-references by header offset through an [`OffsetIndex`].

use crate::codec::Method;

/// The kind of filesystem object an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemKind {
    /// A regular file.
    #[default]
    File,
    /// A directory.
    Directory,
    /// A symbolic link; the target is in [`Item::link_target`].
    Symlink,
    /// A hard link to an earlier item.
    HardLink,
    /// A character or block device.
    Device,
    /// A named pipe.
    Fifo,
    /// A socket or anything else without payload.
    Other,
}

impl ItemKind {
    /// Classifies POSIX `st_mode` file type bits.
    pub fn from_unix_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => ItemKind::Directory,
            0o120000 => ItemKind::Symlink,
            0o020000 | 0o060000 => ItemKind::Device,
            0o010000 => ItemKind::Fifo,
            0o140000 => ItemKind::Other,
            _ => ItemKind::File,
        }
    }
}

/// Per-item diagnostic flags recorded during parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFlags {
    /// The item's placement failed a consistency check.
    pub headers_error: bool,
    /// The declared payload runs past the end of the stream.
    pub unexpected_end: bool,
    /// The payload is encrypted.
    pub encrypted: bool,
    /// The item continues from a previous volume.
    pub split_before: bool,
    /// The item continues in the next volume.
    pub split_after: bool,
}

/// One logical entry of a container.
#[derive(Debug, Clone, Default)]
pub struct Item {
    /// Path inside the container, `/` separated.
    pub name: String,
    /// Index of the parent directory item, when the format has a tree.
    pub parent: Option<usize>,
    /// Object kind.
    pub kind: ItemKind,
    /// Position of the item's header record.
    pub header_offset: u64,
    /// Position of the first payload byte.
    pub payload_offset: u64,
    /// Bytes the payload occupies in the container.
    pub packed_size: u64,
    /// Decoded size; `None` until decoding finishes for streamed items.
    pub size: Option<u64>,
    /// Modification time as seconds since the Unix epoch.
    pub mtime: Option<i64>,
    /// Owner id.
    pub uid: Option<u32>,
    /// Group id.
    pub gid: Option<u32>,
    /// Permission bits (and file type bits where the format stores them).
    pub mode: Option<u32>,
    /// Windows/DOS attribute bits.
    pub attributes: Option<u32>,
    /// Compression method of the payload.
    pub method: Method,
    /// Stored CRC-32 of the decoded payload.
    pub crc: Option<u32>,
    /// Whether [`crc`](Self::crc) covers the whole item or only a part.
    pub crc_covers_item: bool,
    /// Target of a symbolic or hard link.
    pub link_target: Option<String>,
    /// Index of the volume holding the first payload byte.
    pub volume: u32,
    /// Diagnostic flags.
    pub flags: ItemFlags,
}

impl Item {
    /// Creates a file item with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if this item is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    /// Returns the decoded size, or 0 when unknown.
    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Checks `payload_offset + packed_size <= physical_size`.
    ///
    /// A violation sets [`ItemFlags::headers_error`] and returns `false`.
    pub fn check_placement(&mut self, physical_size: u64) -> bool {
        let ok = self
            .payload_offset
            .checked_add(self.packed_size)
            .is_some_and(|end| end <= physical_size);
        if !ok {
            self.flags.headers_error = true;
        }
        ok
    }
}

/// Items in on-disk header order.
#[derive(Debug, Clone, Default)]
pub struct ItemTable {
    items: Vec<Item>,
}

impl ItemTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item and returns its index.
    pub fn push(&mut self, item: Item) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the item at `index`.
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    /// Returns a mutable reference to the item at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Item> {
        self.items.get_mut(index)
    }

    /// Iterates items in table order.
    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    /// Builds the header-offset index for back-reference resolution.
    pub fn offset_index(&self) -> OffsetIndex {
        OffsetIndex::build(&self.items)
    }

    /// Consumes the table and returns the items.
    pub fn into_vec(self) -> Vec<Item> {
        self.items
    }
}

impl From<Vec<Item>> for ItemTable {
    fn from(items: Vec<Item>) -> Self {
        Self { items }
    }
}

impl std::ops::Index<usize> for ItemTable {
    type Output = Item;

    fn index(&self, index: usize) -> &Item {
        &self.items[index]
    }
}

impl<'a> IntoIterator for &'a ItemTable {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Sorted `header_offset -> item index` map, built once per table.
#[derive(Debug, Clone, Default)]
pub struct OffsetIndex {
    entries: Vec<(u64, usize)>,
}

impl OffsetIndex {
    /// Builds the index from items.
    pub fn build(items: &[Item]) -> Self {
        let mut entries: Vec<(u64, usize)> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.header_offset, i))
            .collect();
        entries.sort_unstable();
        Self { entries }
    }

    /// Returns the index of the item whose header starts exactly at `offset`.
    pub fn find(&self, offset: u64) -> Option<usize> {
        self.entries
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|pos| self.entries[pos].1)
    }

    /// Number of indexed items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
