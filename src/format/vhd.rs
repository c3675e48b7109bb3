//! Microsoft Virtual Hard Disk images (fixed, dynamic and differencing).
//!
//! The disk is exposed as a single `disk.img` item. Fixed disks are raw
//! sectors followed by the footer; dynamic disks map fixed-size blocks
//! through a block allocation table, with unallocated blocks reading as
//! zeros.

use crate::cache::BlockMap;
use crate::format::bytes::{be_u16, be_u32, be_u64};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::Item;
use crate::read::ItemOutcome;
use crate::{Error, Result};

const SIGNATURE: &[u8; 10] = b"conectix\0\0";
const DYNAMIC_SIGNATURE: &[u8; 8] = b"cxsparse";
const FOOTER_SIZE: u64 = 512;
const DYNAMIC_SIZE: u64 = 1024;
const SECTOR_LOG: u32 = 9;
const UNUSED_BLOCK: u32 = u32::MAX;
/// Seconds between 1970-01-01 and 2000-01-01.
const VHD_EPOCH: i64 = 946_684_800;

const TYPE_FIXED: u32 = 2;
const TYPE_DYNAMIC: u32 = 3;
const TYPE_DIFFERENCING: u32 = 4;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    let tail = input.tail;
    if tail.len() >= FOOTER_SIZE as usize
        && tail[tail.len() - FOOTER_SIZE as usize..].starts_with(SIGNATURE)
    {
        return Probe::Match;
    }
    match Probe::signature(input.head, SIGNATURE) {
        Probe::NeedMoreBytes(_) => Probe::NeedMoreBytes(FOOTER_SIZE),
        Probe::Match if input.size < FOOTER_SIZE => Probe::NeedMoreBytes(FOOTER_SIZE),
        other => other,
    }
}

/// One's complement of the byte sum, skipping the checksum field.
fn block_checksum(block: &[u8], field: usize) -> u32 {
    let sum = block
        .iter()
        .enumerate()
        .filter(|(i, _)| !(field..field + 4).contains(i))
        .fold(0u32, |acc, (_, &b)| acc.wrapping_add(u32::from(b)));
    !sum
}

#[derive(Debug, Clone)]
struct Footer {
    data_offset: u64,
    ctime: u32,
    creator: [u8; 4],
    current_size: u64,
    geometry: u32,
    disk_type: u32,
    saved_state: bool,
    checksum_ok: bool,
}

impl Footer {
    fn parse(p: &[u8]) -> Option<Footer> {
        if !p.starts_with(SIGNATURE) {
            return None;
        }
        let disk_type = be_u32(p, 0x3C);
        if !(TYPE_FIXED..=TYPE_DIFFERENCING).contains(&disk_type) {
            return None;
        }
        if p[0x55..FOOTER_SIZE as usize].iter().any(|&b| b != 0) {
            return None;
        }
        let mut creator = [0u8; 4];
        creator.copy_from_slice(&p[0x1C..0x20]);
        Some(Footer {
            data_offset: be_u64(p, 0x10),
            ctime: be_u32(p, 0x18),
            creator,
            current_size: be_u64(p, 0x30),
            geometry: be_u32(p, 0x38),
            disk_type,
            saved_state: p[0x54] != 0,
            checksum_ok: block_checksum(&p[..FOOTER_SIZE as usize], 0x40) == be_u32(p, 0x40),
        })
    }

    fn is_dynamic(&self) -> bool {
        self.disk_type != TYPE_FIXED
    }

    fn type_name(&self) -> &'static str {
        match self.disk_type {
            TYPE_FIXED => "Fixed",
            TYPE_DYNAMIC => "Dynamic",
            _ => "Differencing",
        }
    }
}

#[derive(Debug)]
struct DynamicHeader {
    table_offset: u64,
    max_entries: u32,
    block_log: u32,
    parent_name: String,
    locator_ends: Vec<u64>,
    checksum_ok: bool,
}

impl DynamicHeader {
    fn parse(p: &[u8]) -> Option<DynamicHeader> {
        if !p.starts_with(DYNAMIC_SIGNATURE) || be_u32(p, 0x3C) != 0 {
            return None;
        }
        let block_size = be_u32(p, 0x20);
        if !block_size.is_power_of_two() || block_size < 1 << SECTOR_LOG {
            return None;
        }
        let units: Vec<u16> = (0..256)
            .map(|i| be_u16(p, 0x40 + i * 2))
            .take_while(|&c| c != 0)
            .collect();
        let mut locator_ends = Vec::new();
        for i in 0..8 {
            let l = &p[0x240 + i * 24..0x240 + (i + 1) * 24];
            if be_u32(l, 0x0C) != 0 {
                return None;
            }
            let len = be_u32(l, 0x08);
            if len != 0 {
                locator_ends.push(be_u64(l, 0x10).saturating_add(u64::from(len)));
            }
        }
        Some(DynamicHeader {
            table_offset: be_u64(p, 0x10),
            max_entries: be_u32(p, 0x1C),
            block_log: block_size.trailing_zeros(),
            parent_name: String::from_utf16_lossy(&units),
            locator_ends,
            checksum_ok: block_checksum(&p[..DYNAMIC_SIZE as usize], 0x24) == be_u32(p, 0x24),
        })
    }

    /// Bytes of sector bitmap ahead of each block's data.
    fn bitmap_size(&self) -> u64 {
        let sectors = 1u64 << (self.block_log - SECTOR_LOG);
        sectors.div_ceil(8 << SECTOR_LOG) << SECTOR_LOG
    }
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let size = ctx.size();
    if size < FOOTER_SIZE {
        return Err(Error::NotThisFormat);
    }
    let mut head = [0u8; FOOTER_SIZE as usize];
    let mut tail = [0u8; FOOTER_SIZE as usize];
    ctx.read_exact_at(0, &mut head)?;
    ctx.read_exact_at(size - FOOTER_SIZE, &mut tail)?;

    let (footer, footer_at_end) = match (Footer::parse(&tail), Footer::parse(&head)) {
        (Some(f), _) => (f, true),
        (None, Some(f)) if f.is_dynamic() => (f, false),
        _ => return Err(Error::NotThisFormat),
    };

    let mut info = ArchiveInfo::new(FormatKind::Vhd, 0);
    info.subtype = Some(footer.type_name().to_string());
    info.mtime = Some(VHD_EPOCH + i64::from(footer.ctime));
    if !footer.checksum_ok {
        ctx.warn("VHD footer checksum mismatch");
        info.checksum_error = true;
        info.headers_error = true;
    }
    if !footer_at_end {
        ctx.warn("VHD footer is missing; using the header copy");
        info.unexpected_end = true;
    }
    if footer.saved_state {
        ctx.warn("VHD is in a saved state");
    }
    log::debug!(
        "vhd: {} disk of {} bytes, creator {:?}, geometry {:#x}",
        footer.type_name(),
        footer.current_size,
        String::from_utf8_lossy(&footer.creator),
        footer.geometry
    );

    let mut item = Item {
        size: Some(footer.current_size),
        mtime: info.mtime,
        ..Item::new("disk.img")
    };

    let source = if !footer.is_dynamic() {
        let start = (size - FOOTER_SIZE).saturating_sub(footer.current_size);
        if size - FOOTER_SIZE < footer.current_size {
            info.unexpected_end = true;
        }
        info.offset = start;
        info.physical_size = footer.current_size + FOOTER_SIZE;
        item.payload_offset = start;
        item.packed_size = footer.current_size;
        ItemSource::stored(start, footer.current_size)
    } else {
        let mut raw = [0u8; DYNAMIC_SIZE as usize];
        ctx.read_exact_at(footer.data_offset, &mut raw)?;
        let dynamic = DynamicHeader::parse(&raw)
            .ok_or_else(|| Error::corrupt_header(footer.data_offset, "bad dynamic disk header"))?;
        if !dynamic.checksum_ok {
            ctx.warn("VHD dynamic header checksum mismatch");
            info.checksum_error = true;
            info.headers_error = true;
        }
        let block_size = 1u64 << dynamic.block_log;
        let expected = footer.current_size.div_ceil(block_size);
        if dynamic.max_entries >= 1 << 31 || u64::from(dynamic.max_entries) != expected {
            return Err(Error::corrupt_header(
                footer.data_offset + 0x1C,
                format!(
                    "{} table entries for a disk of {} bytes",
                    dynamic.max_entries, footer.current_size
                ),
            ));
        }
        info.block_size = Some(block_size);
        if footer.disk_type == TYPE_DIFFERENCING && !dynamic.parent_name.is_empty() {
            info.comment = Some(format!("parent: {}", dynamic.parent_name));
        }

        let table_len = u64::from(dynamic.max_entries) * 4;
        let table = ctx.read_vec_at(dynamic.table_offset, table_len)?;
        let mut end = (footer.data_offset + DYNAMIC_SIZE)
            .max(dynamic.table_offset + table_len.max(1 << SECTOR_LOG));
        for &locator_end in &dynamic.locator_ends {
            end = end.max(locator_end);
        }

        let bitmap = dynamic.bitmap_size();
        let mut map = BlockMap::new();
        let mut remaining = footer.current_size;
        let mut used = 0u64;
        for entry in table.chunks_exact(4) {
            let len = remaining.min(block_size);
            match be_u32(entry, 0) {
                UNUSED_BLOCK => map.push_zero(len),
                sector => {
                    let data = (u64::from(sector) << SECTOR_LOG) + bitmap;
                    map.push_stored(data, len);
                    end = end.max(data + block_size);
                    used += 1;
                }
            }
            remaining -= len;
        }
        item.packed_size = used << dynamic.block_log;
        info.physical_size = if footer_at_end && head == tail {
            size
        } else {
            end + FOOTER_SIZE
        };
        if footer.disk_type == TYPE_DIFFERENCING {
            ctx.warn("differencing disk needs its parent image");
            ItemSource::Unavailable(ItemOutcome::UnsupportedMethod)
        } else {
            ItemSource::Blocks(map)
        }
    };
    info.method = Some(footer.type_name().to_string());

    let mut parsed = Parsed::new(info);
    parsed.push(item, source);
    Ok(parsed)
}
