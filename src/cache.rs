//! Block-cache decompression engine.
//!
//! Random-access formats (cramfs, squashfs, DMG, VHD) compress an item as a
//! sequence of independent blocks. A [`BlockMap`] maps each block's virtual
//! range to its physical span; [`BlockCache`] decodes blocks lazily and keeps
//! a bounded set of decoded buffers for reuse.
//!
//! # Guarantees
//!
//! - A block is decoded at most once while it stays resident; repeated and
//!   overlapping reads are served from the cache.
//! - Resident entries never exceed [`CacheConfig::max_entries`] nor
//!   [`CacheConfig::max_bytes`]; the least recently used entry is evicted
//!   first.
//! - A block larger than the byte budget is decoded, served and dropped.
//! - Sparse blocks (declared packed size 0) read as zeros without any codec
//!   call.
//!
//! # Example
//!
//! ```rust
//! use arkiv::cache::{BlockCache, BlockMap, CacheConfig};
//! use std::io::Cursor;
//!
//! let mut map = BlockMap::new();
//! map.push_stored(0, 4);
//! map.push_packed(0, 0, arkiv::codec::Method::Zlib, 4); // sparse
//!
//! let mut source = Cursor::new(b"data".to_vec());
//! let mut cache = BlockCache::new(CacheConfig::default());
//! let mut buf = [0xFFu8; 4];
//! cache.read(&mut source, 0, &map, 4, &mut buf).unwrap();
//! assert_eq!(buf, [0, 0, 0, 0]);
//! assert_eq!(cache.stats().decodes, 0);
//! ```

use std::io::{self, Read, Seek, SeekFrom, Write};

use lru::LruCache;

use crate::codec::{Method, REGISTRY, Registry};
use crate::window::{ReadSeek, read_exact_at};
use crate::{Error, Result};

/// Largest compressed span the cache will read for one block.
pub const MAX_PACKED_BLOCK: u64 = 64 * 1024 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// Bounds for the decoded-block cache.
///
/// # Defaults
///
/// | Setting | Default | Low memory |
/// |---------|---------|------------|
/// | `max_entries` | 64 | 8 |
/// | `max_bytes` | 32 MiB | 4 MiB |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of resident decoded blocks.
    pub max_entries: usize,
    /// Maximum total size of resident decoded blocks.
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            max_bytes: 32 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration for memory-constrained environments.
    pub fn low_memory() -> Self {
        Self {
            max_entries: 8,
            max_bytes: 4 * 1024 * 1024,
        }
    }

    /// Disables caching: every block read decodes.
    pub fn disabled() -> Self {
        Self {
            max_entries: 0,
            max_bytes: 0,
        }
    }

    /// Sets the entry-count ceiling.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Sets the byte ceiling.
    pub fn max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }
}

/// Counters describing cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a resident block.
    pub hits: u64,
    /// Reads that had to decode.
    pub misses: u64,
    /// Blocks evicted to respect the ceilings.
    pub evictions: u64,
    /// Codec invocations.
    pub decodes: u64,
    /// Decodes whose result was too large to keep.
    pub uncached_decodes: u64,
}

impl CacheStats {
    /// Returns the cache hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Identity of a decoded block in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    /// Block `index` of item `item`.
    Item {
        /// Item index.
        item: usize,
        /// Block index within the item.
        index: usize,
    },
    /// A block shared by several items, keyed by its physical offset.
    Shared {
        /// Physical offset of the compressed span.
        offset: u64,
    },
}

/// Where a block's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    /// Defined-zero content.
    Zero,
    /// Uncompressed bytes at a physical offset.
    Stored {
        /// Physical offset.
        offset: u64,
    },
    /// A compressed span.
    Packed {
        /// Physical offset of the compressed span.
        offset: u64,
        /// Length of the compressed span.
        packed: u64,
        /// Codec.
        method: Method,
        /// Decoded size of the whole span.
        unpacked: u64,
        /// Offset of this block's bytes inside the decoded span.
        slice: u64,
        /// Whether other items reference the same span.
        shared: bool,
    },
}

/// One block: a virtual range of the item and its physical source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpan {
    /// Virtual offset of the first byte.
    pub start: u64,
    /// Number of virtual bytes.
    pub len: u64,
    /// Physical source.
    pub source: BlockSource,
}

impl BlockSpan {
    /// Virtual offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Physical end of the span, if it reads from the container.
    pub fn physical_end(&self) -> Option<u64> {
        match self.source {
            BlockSource::Zero => None,
            BlockSource::Stored { offset } => offset.checked_add(self.len),
            BlockSource::Packed { offset, packed, .. } => offset.checked_add(packed),
        }
    }
}

/// Ordered, contiguous blocks covering an item's decoded content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    spans: Vec<BlockSpan>,
    size: u64,
}

impl BlockMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, len: u64, source: BlockSource) {
        if len == 0 {
            return;
        }
        self.spans.push(BlockSpan {
            start: self.size,
            len,
            source,
        });
        self.size += len;
    }

    /// Appends `len` zero bytes.
    pub fn push_zero(&mut self, len: u64) {
        self.push(len, BlockSource::Zero);
    }

    /// Appends `len` uncompressed bytes stored at `offset`.
    pub fn push_stored(&mut self, offset: u64, len: u64) {
        self.push(len, BlockSource::Stored { offset });
    }

    /// Appends a block compressed independently with `method`.
    ///
    /// A zero `packed` length makes the block sparse.
    pub fn push_packed(&mut self, offset: u64, packed: u64, method: Method, len: u64) {
        if packed == 0 || method == Method::Zero {
            self.push_zero(len);
        } else if method == Method::Copy {
            self.push_stored(offset, len);
        } else {
            self.push(
                len,
                BlockSource::Packed {
                    offset,
                    packed,
                    method,
                    unpacked: len,
                    slice: 0,
                    shared: false,
                },
            );
        }
    }

    /// Appends `len` bytes taken at `slice` from a span shared with other items.
    ///
    /// `unpacked` bounds the decoded size of the span.
    pub fn push_shared(
        &mut self,
        offset: u64,
        packed: u64,
        method: Method,
        unpacked: u64,
        slice: u64,
        len: u64,
    ) {
        self.push(
            len,
            BlockSource::Packed {
                offset,
                packed,
                method,
                unpacked,
                slice,
                shared: true,
            },
        );
    }

    /// Total decoded size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns `true` if the map has no blocks.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns the blocks.
    pub fn spans(&self) -> &[BlockSpan] {
        &self.spans
    }

    /// Finds the block covering virtual `offset` by binary search.
    pub fn locate(&self, offset: u64) -> Option<usize> {
        if offset >= self.size {
            return None;
        }
        let idx = self.spans.partition_point(|s| s.start <= offset);
        idx.checked_sub(1)
    }

    /// Returns `true` if every physical span ends within `physical_size`.
    pub fn fits_within(&self, physical_size: u64) -> bool {
        self.spans
            .iter()
            .all(|s| s.physical_end().is_none_or(|end| end <= physical_size))
    }

    /// Sum of the physical bytes the blocks occupy.
    pub fn packed_size(&self) -> u64 {
        self.spans
            .iter()
            .map(|s| match s.source {
                BlockSource::Zero => 0,
                BlockSource::Stored { .. } => s.len,
                BlockSource::Packed { packed, shared, .. } => {
                    if shared {
                        0
                    } else {
                        packed
                    }
                }
            })
            .sum()
    }
}

/// Bounded LRU cache of decoded blocks.
pub struct BlockCache {
    entries: LruCache<BlockKey, Vec<u8>>,
    bytes: usize,
    config: CacheConfig,
    stats: CacheStats,
    registry: &'static Registry,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("entries", &self.entries.len())
            .field("bytes", &self.bytes)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl BlockCache {
    /// Creates a cache using the crate-wide codec registry.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_registry(config, &REGISTRY)
    }

    /// Creates a cache that decodes through `registry`.
    pub fn with_registry(config: CacheConfig, registry: &'static Registry) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            config,
            stats: CacheStats::default(),
            registry,
        }
    }

    /// Returns the configured ceilings.
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Returns the counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no block is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of resident blocks.
    pub fn resident_bytes(&self) -> usize {
        self.bytes
    }

    /// Drops every resident block.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Reads from item `item` at virtual `offset`, within a single block.
    ///
    /// Returns the number of bytes copied: at most `buf.len()`, and never
    /// past the end of the covering block. Returns 0 at or past the item end.
    pub fn read<R: ReadSeek + ?Sized>(
        &mut self,
        source: &mut R,
        item: usize,
        map: &BlockMap,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let Some(index) = map.locate(offset) else {
            return Ok(0);
        };
        let span = &map.spans[index];
        let within = offset - span.start;
        let n = (span.len - within).min(buf.len() as u64) as usize;
        let out = &mut buf[..n];

        match span.source {
            BlockSource::Zero => out.fill(0),
            BlockSource::Stored { offset } => read_exact_at(source, offset + within, out)?,
            BlockSource::Packed {
                offset,
                packed,
                method,
                unpacked,
                slice,
                shared,
            } => {
                let key = if shared {
                    BlockKey::Shared { offset }
                } else {
                    BlockKey::Item { item, index }
                };
                let start = slice + within;
                if let Some(data) = self.entries.get(&key) {
                    self.stats.hits += 1;
                    copy_out(data, start, out)?;
                } else {
                    self.stats.misses += 1;
                    let data = self.decode(source, offset, packed, method, unpacked, !shared)?;
                    copy_out(&data, start, out)?;
                    self.insert(key, data);
                }
            }
        }
        Ok(n)
    }

    fn decode<R: ReadSeek + ?Sized>(
        &mut self,
        source: &mut R,
        offset: u64,
        packed: u64,
        method: Method,
        unpacked: u64,
        exact: bool,
    ) -> Result<Vec<u8>> {
        if packed > MAX_PACKED_BLOCK || unpacked > MAX_PACKED_BLOCK {
            return Err(Error::limit("block size", packed.max(unpacked), MAX_PACKED_BLOCK));
        }
        let mut input = vec![0u8; packed as usize];
        read_exact_at(source, offset, &mut input)?;
        self.stats.decodes += 1;
        let data = self
            .registry
            .decode_block(method, &input, unpacked as usize)?;
        // Shared spans only bound their size; slices are checked on copy.
        if exact && data.len() as u64 != unpacked {
            return Err(Error::data(format!(
                "block at {:#x} decoded to {} bytes, expected {}",
                offset,
                data.len(),
                unpacked
            )));
        }
        Ok(data)
    }

    fn insert(&mut self, key: BlockKey, data: Vec<u8>) {
        if self.config.max_entries == 0 || data.len() > self.config.max_bytes {
            self.stats.uncached_decodes += 1;
            return;
        }
        self.bytes += data.len();
        self.entries.put(key, data);
        while self.entries.len() > self.config.max_entries || self.bytes > self.config.max_bytes {
            match self.entries.pop_lru() {
                Some((evicted, block)) => {
                    log::trace!("evicting block {:?} ({} bytes)", evicted, block.len());
                    self.bytes -= block.len();
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Streams a whole item into `out`, block by block.
    ///
    /// `between_blocks` runs after each block with the bytes written so far;
    /// returning an error (typically [`Error::Cancelled`]) stops the copy.
    pub fn copy_item<R: ReadSeek + ?Sized>(
        &mut self,
        source: &mut R,
        item: usize,
        map: &BlockMap,
        out: &mut dyn Write,
        mut between_blocks: impl FnMut(u64) -> Result<()>,
    ) -> Result<u64> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        for span in map.spans() {
            let mut pos = span.start;
            while pos < span.end() {
                let n = self.read(source, item, map, pos, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                pos += n as u64;
                written += n as u64;
            }
            between_blocks(written)?;
        }
        Ok(written)
    }
}

fn copy_out(data: &[u8], start: u64, out: &mut [u8]) -> Result<()> {
    let start = usize::try_from(start).map_err(|_| Error::data("block slice offset overflow"))?;
    let end = start + out.len();
    if end > data.len() {
        return Err(Error::data(format!(
            "block holds {} bytes, read needs {}",
            data.len(),
            end
        )));
    }
    out.copy_from_slice(&data[start..end]);
    Ok(())
}

/// A seekable reader over one item's decoded content.
pub struct BlockReader<'a, R: ?Sized> {
    cache: &'a mut BlockCache,
    source: &'a mut R,
    map: &'a BlockMap,
    item: usize,
    pos: u64,
}

impl<R: ?Sized> std::fmt::Debug for BlockReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("item", &self.item)
            .field("pos", &self.pos)
            .field("size", &self.map.size())
            .finish_non_exhaustive()
    }
}

impl<'a, R: ReadSeek + ?Sized> BlockReader<'a, R> {
    /// Creates a reader over item `item` described by `map`.
    pub fn new(cache: &'a mut BlockCache, source: &'a mut R, map: &'a BlockMap, item: usize) -> Self {
        Self {
            cache,
            source,
            map,
            item,
            pos: 0,
        }
    }

    /// Decoded size of the item.
    pub fn size(&self) -> u64 {
        self.map.size()
    }
}

impl<R: ReadSeek + ?Sized> Read for BlockReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .cache
            .read(self.source, self.item, self.map, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: ReadSeek + ?Sized> Seek for BlockReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.map.size().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek position")
        })?;
        self.pos = target;
        Ok(target)
    }
}
