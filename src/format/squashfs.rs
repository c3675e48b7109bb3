//! SquashFS 4.0 images.
//!
//! Inodes and directory listings live in tables of 8 KiB metadata blocks,
//! each optionally compressed. A reference `block << 16 | offset` points at
//! `offset` bytes into the decoded block that starts `block` bytes into its
//! table. File contents are a run of data blocks plus an optional tail
//! packed into a shared fragment block.

use std::collections::{HashSet, VecDeque};

use crate::cache::BlockMap;
use crate::codec::{Method, REGISTRY};
use crate::format::bytes::{ByteOrder, ByteReader, le_u16, le_u32, le_u64, lossy};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::{Item, ItemKind};
use crate::read::ItemOutcome;
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"hsqs";
const SUPERBLOCK_SIZE: usize = 96;
const METADATA_SIZE: usize = 1 << 13;
const METADATA_STORED: u16 = 1 << 15;
const DATA_STORED: u32 = 1 << 24;
const NO_FRAGMENT: u32 = u32::MAX;
const ABSENT: u64 = u64::MAX;
const FRAGMENTS_PER_BLOCK: u64 = (METADATA_SIZE / 16) as u64;
const IDS_PER_BLOCK: u64 = (METADATA_SIZE / 4) as u64;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    match Probe::signature(input.head, MAGIC) {
        Probe::Match => {}
        Probe::NeedMoreBytes(_) => return Probe::NeedMoreBytes(SUPERBLOCK_SIZE as u64),
        other => return other,
    }
    match input.head.get(..SUPERBLOCK_SIZE) {
        Some(h) if Superblock::parse(h).is_some() => Probe::Match,
        Some(_) => Probe::NotThisFormat,
        None => Probe::NeedMoreBytes(SUPERBLOCK_SIZE as u64),
    }
}

fn method_of(id: u16) -> Method {
    match id {
        1 => Method::Zlib,
        2 => Method::LzmaAlone,
        3 => Method::Lzo,
        4 => Method::Xz,
        5 => Method::Lz4,
        6 => Method::Zstd,
        other => Method::Unknown(u32::from(other)),
    }
}

#[derive(Debug, Clone)]
struct Superblock {
    inode_count: u32,
    mtime: u32,
    block_size: u32,
    fragment_count: u32,
    compression: u16,
    id_count: u16,
    major: u16,
    minor: u16,
    root_inode: u64,
    bytes_used: u64,
    id_table: u64,
    xattr_table: u64,
    inode_table: u64,
    directory_table: u64,
    fragment_table: u64,
    export_table: u64,
}

impl Superblock {
    fn parse(h: &[u8]) -> Option<Superblock> {
        if h.len() < SUPERBLOCK_SIZE || &h[..4] != MAGIC {
            return None;
        }
        let block_size = le_u32(h, 12);
        let block_log = le_u16(h, 22);
        if !(12..=20).contains(&block_log) || block_size != 1 << block_log {
            return None;
        }
        Some(Superblock {
            inode_count: le_u32(h, 4),
            mtime: le_u32(h, 8),
            block_size,
            fragment_count: le_u32(h, 16),
            compression: le_u16(h, 20),
            id_count: le_u16(h, 26),
            major: le_u16(h, 28),
            minor: le_u16(h, 30),
            root_inode: le_u64(h, 32),
            bytes_used: le_u64(h, 40),
            id_table: le_u64(h, 48),
            xattr_table: le_u64(h, 56),
            inode_table: le_u64(h, 64),
            directory_table: le_u64(h, 72),
            fragment_table: le_u64(h, 80),
            export_table: le_u64(h, 88),
        })
    }
}

/// A run of metadata blocks decoded back to back.
#[derive(Debug, Default)]
struct MetadataTable {
    data: Vec<u8>,
    /// (block position relative to the table start, decoded start)
    blocks: Vec<(u64, usize)>,
}

impl MetadataTable {
    /// Decoded position of `offset` bytes into the block at relative `block`.
    fn locate(&self, block: u64, offset: usize) -> Option<usize> {
        let i = self.blocks.binary_search_by_key(&block, |&(b, _)| b).ok()?;
        let pos = self.blocks[i].1 + offset;
        (pos <= self.data.len()).then_some(pos)
    }

    fn reader_at(&self, reference: u64) -> Option<ByteReader<'_>> {
        let pos = self.locate(reference >> 16, (reference & 0xFFFF) as usize)?;
        Some(ByteReader::new(&self.data[pos..], pos as u64, ByteOrder::Little))
    }
}

/// Reads one metadata block at `pos`; returns the decoded bytes and the
/// position of the next block.
fn read_metadata_block(ctx: &mut ParseContext<'_>, method: Method, pos: u64) -> Result<(Vec<u8>, u64)> {
    let mut header = [0u8; 2];
    ctx.read_exact_at(pos, &mut header)?;
    let header = u16::from_le_bytes(header);
    let size = usize::from(header & !METADATA_STORED);
    if size == 0 || size > METADATA_SIZE + METADATA_SIZE / 2 {
        return Err(Error::corrupt_header(pos, "bad metadata block size"));
    }
    let packed = ctx.read_vec_at(pos + 2, size as u64)?;
    let data = if header & METADATA_STORED != 0 {
        packed
    } else {
        REGISTRY.decode_block(method, &packed, METADATA_SIZE)?
    };
    if data.len() > METADATA_SIZE {
        return Err(Error::corrupt_header(pos, "metadata block exceeds 8 KiB"));
    }
    Ok((data, pos + 2 + size as u64))
}

fn read_table(ctx: &mut ParseContext<'_>, method: Method, start: u64, end: u64) -> Result<MetadataTable> {
    let mut table = MetadataTable::default();
    let mut pos = start;
    while pos < end {
        let (data, next) = read_metadata_block(ctx, method, pos)?;
        table.blocks.push((pos - start, table.data.len()));
        ctx.limits.check_header((table.data.len() + data.len()) as u64)?;
        table.data.extend(data);
        pos = next;
    }
    Ok(table)
}

/// Reads a lookup array of metadata block positions and the `count` fixed
/// `entry_size` records they hold.
fn read_indexed(
    ctx: &mut ParseContext<'_>,
    method: Method,
    lookup: u64,
    count: u64,
    per_block: u64,
    entry_size: usize,
) -> Result<Vec<u8>> {
    if count == 0 || lookup == ABSENT {
        return Ok(Vec::new());
    }
    let blocks = count.div_ceil(per_block);
    let index = ctx.read_vec_at(lookup, blocks * 8)?;
    let want = ctx.limits.check_header(count * entry_size as u64)?;
    let mut out = Vec::with_capacity(want);
    for ptr in index.chunks_exact(8) {
        let (data, _) = read_metadata_block(ctx, method, le_u64(ptr, 0))?;
        out.extend(data);
    }
    if out.len() < want {
        return Err(Error::corrupt_header(lookup, "lookup table shorter than declared"));
    }
    out.truncate(want);
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
struct Fragment {
    start: u64,
    size: u32,
}

#[derive(Debug)]
enum Body {
    Dir {
        start_block: u32,
        offset: u16,
        size: u32,
    },
    File {
        blocks_start: u64,
        size: u64,
        fragment: u32,
        fragment_offset: u32,
        block_sizes: Vec<u32>,
    },
    Symlink(String),
    Other,
}

#[derive(Debug)]
struct Inode {
    kind: ItemKind,
    mode: u32,
    uid: u16,
    gid: u16,
    mtime: u32,
    body: Body,
}

fn type_bits(kind: u16) -> Option<(ItemKind, u32)> {
    Some(match kind {
        1 | 8 => (ItemKind::Directory, 0o040000),
        2 | 9 => (ItemKind::File, 0o100000),
        3 | 10 => (ItemKind::Symlink, 0o120000),
        4 | 11 => (ItemKind::Device, 0o060000),
        5 | 12 => (ItemKind::Device, 0o020000),
        6 | 13 => (ItemKind::Fifo, 0o010000),
        7 | 14 => (ItemKind::Other, 0o140000),
        _ => return None,
    })
}

struct Image<'c, 'a> {
    ctx: &'c mut ParseContext<'a>,
    sb: Superblock,
    method: Method,
    inodes: MetadataTable,
    dirs: MetadataTable,
    fragments: Vec<Fragment>,
    ids: Vec<u32>,
    parsed: Parsed,
}

impl Image<'_, '_> {
    fn block_count(&self, size: u64, fragment: u32) -> u64 {
        let log = self.sb.block_size.trailing_zeros();
        if fragment == NO_FRAGMENT {
            size.div_ceil(u64::from(self.sb.block_size))
        } else {
            size >> log
        }
    }

    fn inode(&self, reference: u64) -> Option<Inode> {
        let mut r = self.inodes.reader_at(reference)?;
        let kind = r.u16().ok()?;
        let (item_kind, type_mode) = type_bits(kind)?;
        let permissions = r.u16().ok()?;
        let uid = r.u16().ok()?;
        let gid = r.u16().ok()?;
        let mtime = r.u32().ok()?;
        let _number = r.u32().ok()?;
        let body = match kind {
            1 => {
                let start_block = r.u32().ok()?;
                let _links = r.u32().ok()?;
                let size = u32::from(r.u16().ok()?);
                let offset = r.u16().ok()?;
                Body::Dir {
                    start_block,
                    offset,
                    size,
                }
            }
            8 => {
                let _links = r.u32().ok()?;
                let size = r.u32().ok()?;
                let start_block = r.u32().ok()?;
                let _parent = r.u32().ok()?;
                let _index_count = r.u16().ok()?;
                let offset = r.u16().ok()?;
                Body::Dir {
                    start_block,
                    offset,
                    size,
                }
            }
            2 | 9 => {
                let (blocks_start, fragment, fragment_offset, size) = if kind == 2 {
                    let start = u64::from(r.u32().ok()?);
                    let fragment = r.u32().ok()?;
                    let offset = r.u32().ok()?;
                    (start, fragment, offset, u64::from(r.u32().ok()?))
                } else {
                    let start = r.u64().ok()?;
                    let size = r.u64().ok()?;
                    let _sparse = r.u64().ok()?;
                    let _links = r.u32().ok()?;
                    let fragment = r.u32().ok()?;
                    let offset = r.u32().ok()?;
                    let _xattr = r.u32().ok()?;
                    (start, fragment, offset, size)
                };
                let count = self.block_count(size, fragment);
                if count > r.remaining() as u64 / 4 {
                    return None;
                }
                let block_sizes = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>().ok()?;
                Body::File {
                    blocks_start,
                    size,
                    fragment,
                    fragment_offset,
                    block_sizes,
                }
            }
            3 | 10 => {
                let _links = r.u32().ok()?;
                let len = r.u32().ok()? as usize;
                Body::Symlink(lossy(r.bytes(len).ok()?))
            }
            _ => Body::Other,
        };
        Some(Inode {
            kind: item_kind,
            mode: type_mode | u32::from(permissions & 0o7777),
            uid,
            gid,
            mtime,
            body,
        })
    }

    /// Entries of a directory as (name, inode reference).
    fn listing(&self, start_block: u32, offset: u16, size: u32) -> Option<Vec<(String, u64)>> {
        let mut entries = Vec::new();
        if size <= 3 {
            return Some(entries);
        }
        let pos = self.dirs.locate(u64::from(start_block), usize::from(offset))?;
        let len = size as usize - 3;
        let data = self.dirs.data.get(pos..pos + len)?;
        let mut r = ByteReader::new(data, pos as u64, ByteOrder::Little);
        while !r.is_empty() {
            let count = r.u32().ok()? as usize + 1;
            let start = r.u32().ok()?;
            let _inode_number = r.u32().ok()?;
            if count > 256 {
                return None;
            }
            for _ in 0..count {
                let entry_offset = r.u16().ok()?;
                let _delta = r.u16().ok()?;
                let _kind = r.u16().ok()?;
                let name_len = usize::from(r.u16().ok()?) + 1;
                let name = lossy(r.bytes(name_len).ok()?);
                entries.push((name, u64::from(start) << 16 | u64::from(entry_offset)));
            }
        }
        Some(entries)
    }

    fn file_source(&self, body: &Body) -> ItemSource {
        let Body::File {
            blocks_start,
            size,
            fragment,
            fragment_offset,
            block_sizes,
        } = body
        else {
            return ItemSource::Empty;
        };
        let block_size = u64::from(self.sb.block_size);
        let mut map = BlockMap::new();
        let mut remaining = *size;
        let mut pos = *blocks_start;
        for &raw in block_sizes {
            let len = remaining.min(block_size);
            let packed = u64::from(raw & !DATA_STORED);
            if packed == 0 {
                map.push_zero(len);
            } else if raw & DATA_STORED != 0 {
                map.push_stored(pos, len);
            } else {
                map.push_packed(pos, packed, self.method, len);
            }
            pos += packed;
            remaining -= len;
        }
        if *fragment != NO_FRAGMENT && remaining > 0 {
            let Some(frag) = self.fragments.get(*fragment as usize) else {
                return ItemSource::Unavailable(ItemOutcome::HeadersError);
            };
            let packed = u64::from(frag.size & !DATA_STORED);
            let method = if frag.size & DATA_STORED != 0 {
                Method::Copy
            } else {
                self.method
            };
            map.push_shared(
                frag.start,
                packed,
                method,
                block_size,
                u64::from(*fragment_offset),
                remaining,
            );
        } else if remaining > 0 {
            return ItemSource::Unavailable(ItemOutcome::HeadersError);
        }
        if map.is_empty() {
            ItemSource::Empty
        } else {
            ItemSource::Blocks(map)
        }
    }

    fn walk(&mut self) -> Result<()> {
        let root = self
            .inode(self.sb.root_inode)
            .ok_or_else(|| Error::corrupt_header(self.sb.inode_table, "root inode unreadable"))?;
        let Body::Dir {
            start_block,
            offset,
            size,
        } = root.body
        else {
            return Err(Error::corrupt_header(self.sb.inode_table, "root inode is not a directory"));
        };

        let mut visited = HashSet::from([self.sb.root_inode]);
        let mut queue = VecDeque::from([(start_block, offset, size, None::<usize>, String::new(), 0usize)]);
        while let Some((start_block, offset, size, parent, prefix, depth)) = queue.pop_front() {
            self.ctx.limits.check_depth(depth)?;
            let Some(entries) = self.listing(start_block, offset, size) else {
                self.ctx.warn(format!("squashfs directory listing at block {:#x} is damaged", start_block));
                self.parsed.info.headers_error = true;
                continue;
            };
            for (name, reference) in entries {
                self.ctx.limits.check_items(self.parsed.items.len() as u64 + 1)?;
                self.ctx.limits.check_name(name.len() as u64)?;
                if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                    self.parsed.info.headers_error = true;
                    continue;
                }
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let header_offset = self.sb.inode_table + (reference >> 16);
                let Some(inode) = self.inode(reference) else {
                    let item = Item {
                        parent,
                        header_offset,
                        flags: crate::item::ItemFlags {
                            headers_error: true,
                            ..Default::default()
                        },
                        ..Item::new(path)
                    };
                    self.parsed.info.headers_error = true;
                    self.parsed
                        .push(item, ItemSource::Unavailable(ItemOutcome::HeadersError));
                    continue;
                };
                let mut item = Item {
                    parent,
                    kind: inode.kind,
                    header_offset,
                    mtime: Some(i64::from(inode.mtime)),
                    uid: self.ids.get(usize::from(inode.uid)).copied(),
                    gid: self.ids.get(usize::from(inode.gid)).copied(),
                    mode: Some(inode.mode),
                    ..Item::new(path.clone())
                };
                let source = match &inode.body {
                    Body::File {
                        size, blocks_start, ..
                    } => {
                        item.size = Some(*size);
                        item.method = self.method;
                        item.payload_offset = *blocks_start;
                        let source = self.file_source(&inode.body);
                        if let ItemSource::Blocks(map) = &source {
                            item.packed_size = map.packed_size();
                        }
                        if matches!(source, ItemSource::Unavailable(_)) {
                            item.flags.headers_error = true;
                            self.parsed.info.headers_error = true;
                        }
                        source
                    }
                    Body::Symlink(target) => {
                        item.size = Some(target.len() as u64);
                        item.link_target = Some(target.clone());
                        ItemSource::Bytes(target.clone().into_bytes())
                    }
                    Body::Dir { .. } => ItemSource::Empty,
                    Body::Other => {
                        item.size = Some(0);
                        ItemSource::Empty
                    }
                };
                let index = self.parsed.push(item, source);
                if let Body::Dir {
                    start_block,
                    offset,
                    size,
                } = inode.body
                {
                    if visited.insert(reference) {
                        queue.push_back((start_block, offset, size, Some(index), path, depth + 1));
                    } else {
                        log::warn!("squashfs directory {} revisited", path);
                        self.parsed.info.headers_error = true;
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let mut raw = [0u8; SUPERBLOCK_SIZE];
    ctx.read_exact_at(0, &mut raw).map_err(|e| match e {
        Error::UnexpectedEnd { .. } => Error::NotThisFormat,
        other => other,
    })?;
    let sb = Superblock::parse(&raw).ok_or(Error::NotThisFormat)?;
    if sb.major != 4 {
        return Err(Error::UnsupportedFeature {
            feature: "SquashFS before 4.0",
        });
    }
    let method = method_of(sb.compression);
    let size = ctx.size();

    let mut info = ArchiveInfo::new(FormatKind::Squashfs, sb.bytes_used);
    info.unexpected_end = sb.bytes_used > size;
    info.block_size = Some(u64::from(sb.block_size));
    info.method = Some(method.name().to_string());
    info.mtime = Some(i64::from(sb.mtime));
    info.subtype = Some(format!("{}.{}", sb.major, sb.minor));

    let limit = sb.bytes_used.min(size);
    if sb.inode_table >= sb.directory_table || sb.directory_table > limit {
        return Err(Error::corrupt_header(64, "inode and directory tables out of order"));
    }
    let fragments_raw = read_indexed(
        ctx,
        method,
        sb.fragment_table,
        u64::from(sb.fragment_count),
        FRAGMENTS_PER_BLOCK,
        16,
    )?;
    let ids_raw = read_indexed(ctx, method, sb.id_table, u64::from(sb.id_count), IDS_PER_BLOCK, 4)?;

    // The directory table runs until whichever table follows it.
    let mut dir_end = limit;
    let mut candidates = vec![sb.fragment_table, sb.export_table, sb.id_table, sb.xattr_table];
    for lookup in [sb.fragment_table, sb.id_table] {
        if lookup != ABSENT && lookup + 8 <= size {
            let mut first = [0u8; 8];
            ctx.read_exact_at(lookup, &mut first)?;
            candidates.push(u64::from_le_bytes(first));
        }
    }
    for candidate in candidates {
        if candidate > sb.directory_table && candidate < dir_end {
            dir_end = candidate;
        }
    }

    let inodes = read_table(ctx, method, sb.inode_table, sb.directory_table)?;
    let dirs = read_table(ctx, method, sb.directory_table, dir_end)?;
    let fragments = fragments_raw
        .chunks_exact(16)
        .map(|e| Fragment {
            start: le_u64(e, 0),
            size: le_u32(e, 8),
        })
        .collect();
    let ids = ids_raw.chunks_exact(4).map(|e| le_u32(e, 0)).collect();

    let mut image = Image {
        ctx: &mut *ctx,
        sb,
        method,
        inodes,
        dirs,
        fragments,
        ids,
        parsed: Parsed::new(info),
    };
    image.walk()?;
    let inode_count = image.sb.inode_count;
    let parsed = image.parsed;
    log::debug!(
        "squashfs: {} items from {} inodes, method {}",
        parsed.items.len(),
        inode_count,
        method
    );
    Ok(parsed)
}
