//! cramfs compressed ROM filesystem images, either byte order.
//!
//! The superblock magic decides the byte order of every later field. Each
//! file's data is a table of block-end pointers followed by independently
//! compressed blocks, so files map directly onto a [`BlockMap`].

use std::collections::VecDeque;

use crate::cache::BlockMap;
use crate::codec::{Method, REGISTRY};
use crate::format::bytes::{ByteOrder, lossy, trim_nul};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::{Item, ItemKind};
use crate::read::ItemOutcome;
use crate::{Error, Result};

const MAGIC_LE: [u8; 4] = [0x45, 0x3D, 0xCD, 0x28];
const MAGIC_BE: [u8; 4] = [0x28, 0xCD, 0x3D, 0x45];
const SIGNATURE: &[u8; 16] = b"Compressed ROMFS";

const HEADER_SIZE: u64 = 0x40;
const NODE_SIZE: usize = 12;
const MAX_IMAGE: u64 = (256 + 16) << 20;
const MAX_FILES: u64 = 1 << 19;
const MAX_LEVELS: usize = 1 << 8;
const BLOCK_LOG: u32 = 12;
const TAIL_ALIGN: u64 = 1 << 12;

const FLAG_VERSION2: u32 = 1;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    let head = input.head;
    if head.len() < 4 {
        return match (Probe::signature(head, &MAGIC_LE), Probe::signature(head, &MAGIC_BE)) {
            (Probe::NeedMoreBytes(_), _) | (_, Probe::NeedMoreBytes(_)) => {
                Probe::NeedMoreBytes(HEADER_SIZE)
            }
            _ => Probe::NotThisFormat,
        };
    }
    if head[..4] != MAGIC_LE && head[..4] != MAGIC_BE {
        return Probe::NotThisFormat;
    }
    match head.get(16..32) {
        Some(sig) if sig == SIGNATURE => Probe::Match,
        Some(_) => Probe::NotThisFormat,
        None => Probe::NeedMoreBytes(HEADER_SIZE),
    }
}

/// One 12-byte inode.
#[derive(Debug, Clone, Copy)]
struct Node {
    mode: u16,
    uid: u16,
    size: u32,
    gid: u8,
    name_len: usize,
    offset: u64,
}

impl Node {
    fn parse(b: &[u8], order: ByteOrder) -> Node {
        let (size, name_len, offset) = match order {
            ByteOrder::Little => {
                let word = order.u32(b, 8);
                (
                    order.u32(b, 4) & 0x00FF_FFFF,
                    usize::from(b[8] & 0x3F) << 2,
                    u64::from(word >> 6) << 2,
                )
            }
            ByteOrder::Big => (
                order.u32(b, 4) >> 8,
                usize::from(b[8] & 0xFC),
                u64::from(order.u32(b, 8) & 0x03FF_FFFF) << 2,
            ),
        };
        Node {
            mode: order.u16(b, 0),
            uid: order.u16(b, 2),
            size,
            gid: b[7],
            name_len,
            offset,
        }
    }

    fn kind(&self) -> ItemKind {
        ItemKind::from_unix_mode(u32::from(self.mode))
    }
}

#[derive(Debug)]
struct Superblock {
    order: ByteOrder,
    size: u64,
    flags: u32,
    crc: u32,
    blocks: u32,
    files: u32,
    name: String,
}

impl Superblock {
    fn parse(h: &[u8]) -> Option<Superblock> {
        let order = match h.get(..4)? {
            m if m == MAGIC_LE => ByteOrder::Little,
            m if m == MAGIC_BE => ByteOrder::Big,
            _ => return None,
        };
        if h.get(16..32)? != SIGNATURE {
            return None;
        }
        Some(Superblock {
            order,
            size: u64::from(order.u32(h, 4)),
            flags: order.u32(h, 8),
            crc: order.u32(h, 0x20),
            blocks: order.u32(h, 0x28),
            files: order.u32(h, 0x2C),
            name: lossy(trim_nul(&h[0x30..0x40])),
        })
    }

    fn is_version2(&self) -> bool {
        self.flags & FLAG_VERSION2 != 0
    }
}

struct Walker<'c, 'a> {
    ctx: &'c mut ParseContext<'a>,
    order: ByteOrder,
    image_size: u64,
    block_log: u32,
    method: Method,
    physical_end: u64,
    parsed: Parsed,
}

impl Walker<'_, '_> {
    fn block_count(&self, size: u32) -> u64 {
        (u64::from(size) + (1 << self.block_log) - 1) >> self.block_log
    }

    /// Lists one directory, returning its entries as (node, name, inode offset).
    fn list(&mut self, dir: &Node) -> Result<Option<Vec<(Node, String, u64)>>> {
        if dir.offset == 0 && dir.size == 0 {
            return Ok(Some(Vec::new()));
        }
        let end = dir.offset + u64::from(dir.size);
        if dir.offset < HEADER_SIZE || end > self.image_size {
            return Ok(None);
        }
        self.physical_end = self.physical_end.max(end);
        let data = self.ctx.read_vec_at(dir.offset, u64::from(dir.size))?;
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if data.len() - pos < NODE_SIZE {
                return Ok(None);
            }
            let node = Node::parse(&data[pos..], self.order);
            let name_end = pos + NODE_SIZE + node.name_len;
            let Some(raw) = data.get(pos + NODE_SIZE..name_end) else {
                return Ok(None);
            };
            let name = lossy(trim_nul(raw));
            self.ctx.limits.check_name(name.len() as u64)?;
            entries.push((node, name, dir.offset + pos as u64));
            pos = name_end;
        }
        Ok(Some(entries))
    }

    /// Maps a file's block-pointer table onto a block map.
    fn file_source(&mut self, node: &Node) -> Result<(ItemSource, u64, u64)> {
        if node.offset < HEADER_SIZE {
            return Ok(if node.offset == 0 {
                (ItemSource::Empty, 0, 0)
            } else {
                (ItemSource::Unavailable(ItemOutcome::HeadersError), 0, 0)
            });
        }
        let count = self.block_count(node.size);
        if count == 0 {
            return Ok((ItemSource::Empty, 0, 0));
        }
        let table_end = node.offset + count * 4;
        if table_end > self.image_size {
            return Ok((ItemSource::Unavailable(ItemOutcome::HeadersError), 0, 0));
        }
        let table = self.ctx.read_vec_at(node.offset, count * 4)?;
        let block_size = 1u64 << self.block_log;
        let mut map = BlockMap::new();
        let mut remaining = u64::from(node.size);
        let mut start = table_end;
        for ptr in table.chunks_exact(4) {
            let end = u64::from(self.order.u32(ptr, 0));
            if end < start || end > self.image_size {
                return Ok((ItemSource::Unavailable(ItemOutcome::HeadersError), 0, 0));
            }
            let len = remaining.min(block_size);
            map.push_packed(start, end - start, self.method, len);
            remaining -= len;
            start = end;
        }
        self.physical_end = self.physical_end.max(start);
        Ok((ItemSource::Blocks(map), table_end, start - table_end))
    }

    /// Decodes a short symlink body to recover the target.
    fn link_target(&mut self, source: &ItemSource) -> Option<String> {
        let ItemSource::Blocks(map) = source else {
            return None;
        };
        let [span] = map.spans() else {
            return None;
        };
        let crate::cache::BlockSource::Packed {
            offset,
            packed,
            method,
            unpacked,
            ..
        } = span.source
        else {
            return None;
        };
        let input = self.ctx.read_vec_at(offset, packed).ok()?;
        let out = REGISTRY
            .decode_block(method, &input, unpacked as usize)
            .ok()?;
        Some(String::from_utf8_lossy(&out).into_owned())
    }

    fn walk(&mut self, root: Node) -> Result<()> {
        // (directory node, parent item, path prefix, depth)
        let mut queue = VecDeque::from([(root, None::<usize>, String::new(), 0usize)]);
        while let Some((dir, parent, prefix, depth)) = queue.pop_front() {
            if depth > MAX_LEVELS {
                self.parsed.info.headers_error = true;
                continue;
            }
            self.ctx.limits.check_depth(depth)?;
            let Some(entries) = self.list(&dir)? else {
                log::warn!("cramfs directory at {:#x} is out of range", dir.offset);
                self.parsed.info.headers_error = true;
                continue;
            };
            for (node, name, header_offset) in entries {
                let count = self.parsed.items.len() as u64 + 1;
                if count > MAX_FILES {
                    return Err(Error::limit("cramfs files", count, MAX_FILES));
                }
                self.ctx.limits.check_items(count)?;
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let kind = node.kind();
                let mut item = Item {
                    parent,
                    kind,
                    header_offset,
                    uid: Some(u32::from(node.uid)),
                    gid: Some(u32::from(node.gid)),
                    mode: Some(u32::from(node.mode)),
                    ..Item::new(path.clone())
                };
                let source = match kind {
                    ItemKind::Directory => ItemSource::Empty,
                    ItemKind::File | ItemKind::Symlink => {
                        let (source, payload, packed) = self.file_source(&node)?;
                        item.size = Some(u64::from(node.size));
                        item.method = self.method;
                        item.payload_offset = payload;
                        item.packed_size = packed;
                        if matches!(source, ItemSource::Unavailable(_)) {
                            item.flags.headers_error = true;
                            self.parsed.info.headers_error = true;
                        } else if kind == ItemKind::Symlink {
                            item.link_target = self.link_target(&source);
                        }
                        source
                    }
                    _ => {
                        item.size = Some(0);
                        ItemSource::Empty
                    }
                };
                let index = self.parsed.push(item, source);
                if kind == ItemKind::Directory {
                    queue.push_back((node, Some(index), path, depth + 1));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let mut header = [0u8; HEADER_SIZE as usize];
    ctx.read_exact_at(0, &mut header).map_err(|e| match e {
        Error::UnexpectedEnd { .. } => Error::NotThisFormat,
        other => other,
    })?;
    let sb = Superblock::parse(&header).ok_or(Error::NotThisFormat)?;
    let stream_size = ctx.size();

    let mut method = Method::Zlib;
    let mut block_log = BLOCK_LOG;
    let image_size;
    let mut info;
    if sb.is_version2() {
        method = match (sb.flags >> 14) & 3 {
            0 | 1 => Method::Zlib,
            2 => Method::Lzma,
            other => Method::Unknown(other),
        };
        block_log += (sb.flags >> 11) & 7;
        if sb.size < HEADER_SIZE || sb.size > MAX_IMAGE || u64::from(sb.files) > MAX_FILES {
            return Err(Error::NotThisFormat);
        }
        image_size = sb.size.min(stream_size);
        info = ArchiveInfo::new(FormatKind::Cramfs, sb.size);
        if stream_size < sb.size {
            info.unexpected_end = true;
        } else if ctx.verify_checksums {
            let actual = image_crc(ctx, sb.size)?;
            if actual != sb.crc {
                log::warn!(
                    "cramfs image CRC {:08x} does not match stored {:08x}",
                    actual,
                    sb.crc
                );
                info.headers_error = true;
                info.checksum_error = true;
            }
        }
    } else {
        image_size = stream_size.min(MAX_IMAGE);
        info = ArchiveInfo::new(FormatKind::Cramfs, HEADER_SIZE);
    }
    info.block_size = Some(1 << block_log);
    info.method = Some(method.name().to_string());
    info.name = Some(sb.name.clone());
    if sb.order == ByteOrder::Big {
        info.subtype = Some("BE".to_string());
    }

    let mut root_raw = [0u8; NODE_SIZE];
    ctx.read_exact_at(HEADER_SIZE, &mut root_raw)?;
    let root = Node::parse(&root_raw, sb.order);
    if root.kind() != ItemKind::Directory {
        return Err(Error::NotThisFormat);
    }

    let mut walker = Walker {
        ctx: &mut *ctx,
        order: sb.order,
        image_size,
        block_log,
        method,
        physical_end: HEADER_SIZE,
        parsed: Parsed::new(info),
    };
    walker.walk(root)?;
    let physical_end = walker.physical_end;
    let mut parsed = walker.parsed;

    if !sb.is_version2() {
        parsed.info.physical_size = trailing_zero_end(ctx, physical_end, image_size)?;
    }
    log::debug!(
        "cramfs: {} items, {} blocks declared, {} files declared",
        parsed.items.len(),
        sb.blocks,
        sb.files
    );
    Ok(parsed)
}

/// CRC-32 of the image with the stored CRC field read as zero.
fn image_crc(ctx: &mut ParseContext<'_>, size: u64) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut pos = 0u64;
    while pos < size {
        let n = (size - pos).min(buf.len() as u64) as usize;
        ctx.read_exact_at(pos, &mut buf[..n])?;
        if pos == 0 && n >= 0x24 {
            buf[0x20..0x24].fill(0);
        }
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    Ok(hasher.finalize())
}

/// Extends `end` over zero padding up to the next 4 KiB boundary.
fn trailing_zero_end(ctx: &mut ParseContext<'_>, end: u64, image_size: u64) -> Result<u64> {
    let aligned = end.div_ceil(TAIL_ALIGN) * TAIL_ALIGN;
    let limit = aligned.min(image_size);
    if limit <= end {
        return Ok(end);
    }
    let tail = ctx.read_up_to(end, limit - end)?;
    Ok(if tail.iter().all(|&b| b == 0) { limit } else { end })
}
