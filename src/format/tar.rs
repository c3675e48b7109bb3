//! tar streams: v7, POSIX ustar, GNU and pax.
//!
//! Every header is a 512-byte block guarded by a byte-sum checksum, which is
//! also the only signature tar has. Data follows each header, padded to the
//! next block boundary, and the archive ends with two zero blocks.

use std::collections::HashMap;

use crate::format::bytes::{lossy, trim_nul};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::{Item, ItemKind};
use crate::read::ItemOutcome;
use crate::{Error, Result};

const BLOCK: u64 = 512;
const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    let Some(block) = input.head.get(..BLOCK as usize) else {
        return Probe::NotThisFormat;
    };
    if block.iter().all(|&b| b == 0) {
        return Probe::NotThisFormat;
    }
    if checksum_matches(block) {
        Probe::Match
    } else {
        Probe::NotThisFormat
    }
}

/// Parses an octal field, or a base-256 one when the high bit is set.
fn numeric(field: &[u8]) -> Option<u64> {
    if let Some((&first, rest)) = field.split_first() {
        if first & 0x80 != 0 {
            if first & 0x40 != 0 {
                return None;
            }
            let mut value = u64::from(first & 0x3F);
            for &b in rest {
                value = value.checked_mul(256)?.checked_add(u64::from(b))?;
            }
            return Some(value);
        }
    }
    let text = trim_nul(field);
    let text = match text.iter().position(|&b| b != b' ') {
        Some(start) => &text[start..],
        None => return Some(0),
    };
    let end = text
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(text.len());
    let digits = &text[..end];
    if digits.is_empty() {
        return Some(0);
    }
    if !digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return None;
    }
    digits
        .iter()
        .try_fold(0u64, |acc, &b| acc.checked_mul(8)?.checked_add(u64::from(b - b'0')))
}

fn checksum_matches(block: &[u8]) -> bool {
    let Some(stored) = numeric(&block[CHECKSUM_FIELD]) else {
        return false;
    };
    let mut unsigned = 0u64;
    let mut signed = 0i64;
    for (i, &b) in block.iter().enumerate() {
        let b = if CHECKSUM_FIELD.contains(&i) { b' ' } else { b };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }
    stored == unsigned || stored as i64 == signed
}

#[derive(Debug, Default, Clone)]
struct PaxOverrides {
    path: Option<String>,
    linkpath: Option<String>,
    size: Option<u64>,
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<i64>,
}

impl PaxOverrides {
    fn apply(&mut self, records: &HashMap<String, String>) {
        for (key, value) in records {
            match key.as_str() {
                "path" => self.path = Some(value.clone()),
                "linkpath" => self.linkpath = Some(value.clone()),
                "size" => self.size = value.parse().ok(),
                "uid" => self.uid = value.parse().ok(),
                "gid" => self.gid = value.parse().ok(),
                "mtime" => {
                    let whole = value.split('.').next().unwrap_or(value);
                    self.mtime = whole.parse().ok();
                }
                _ => {}
            }
        }
    }

    fn merged(&self, global: &PaxOverrides) -> PaxOverrides {
        PaxOverrides {
            path: self.path.clone().or_else(|| global.path.clone()),
            linkpath: self.linkpath.clone().or_else(|| global.linkpath.clone()),
            size: self.size.or(global.size),
            uid: self.uid.or(global.uid),
            gid: self.gid.or(global.gid),
            mtime: self.mtime.or(global.mtime),
        }
    }
}

/// Splits `"<len> <key>=<value>\n"` records. Malformed records end the list.
fn pax_records(data: &[u8]) -> HashMap<String, String> {
    let mut records = HashMap::new();
    let mut rest = data;
    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let Some(len) = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        else {
            break;
        };
        if len <= space + 1 || len > rest.len() {
            break;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|&b| b == b'=') {
            records.insert(lossy(&record[..eq]), lossy(&record[eq + 1..]));
        }
        rest = &rest[len..];
    }
    records
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Flavor {
    V7,
    Posix,
    Gnu,
    Pax,
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let size = ctx.size();
    let mut info = ArchiveInfo::new(FormatKind::Tar, 0);
    let mut parsed_items: Vec<(Item, ItemSource)> = Vec::new();

    let mut pos = 0u64;
    let mut flavor = Flavor::V7;
    let mut long_name: Option<String> = None;
    let mut long_link: Option<String> = None;
    let mut pax = PaxOverrides::default();
    let mut global = PaxOverrides::default();
    let mut first = true;
    let mut block = [0u8; BLOCK as usize];

    loop {
        if pos >= size {
            break;
        }
        match ctx.read_exact_at(pos, &mut block) {
            Ok(()) => {}
            Err(Error::UnexpectedEnd { .. }) => {
                if first {
                    return Err(Error::NotThisFormat);
                }
                info.unexpected_end = true;
                break;
            }
            Err(e) => return Err(e),
        }

        if block.iter().all(|&b| b == 0) {
            if first {
                return Err(Error::NotThisFormat);
            }
            pos += BLOCK;
            let mut second = [0u8; BLOCK as usize];
            let second_zero = match ctx.read_exact_at(pos, &mut second) {
                Ok(()) => second.iter().all(|&b| b == 0),
                Err(Error::UnexpectedEnd { .. }) => false,
                Err(e) => return Err(e),
            };
            if second_zero {
                pos += BLOCK;
            } else {
                ctx.warn("tar archive ends with a single zero block");
            }
            break;
        }

        if !checksum_matches(&block) {
            if first {
                return Err(Error::NotThisFormat);
            }
            log::warn!("tar header at {:#x} fails its checksum", pos);
            info.headers_error = true;
            break;
        }
        first = false;

        let header_pos = pos;
        let magic = &block[257..265];
        let is_gnu = magic == b"ustar  \0";
        let is_posix = &magic[..6] == b"ustar\0" || &magic[..6] == b"ustar ";
        if is_gnu {
            flavor = flavor.max(Flavor::Gnu);
        } else if is_posix {
            flavor = flavor.max(Flavor::Posix);
        }

        let Some(mut packed) = numeric(&block[124..136]) else {
            info.headers_error = true;
            break;
        };
        let type_flag = block[156];
        let data_pos = pos + BLOCK;
        let mut next = data_pos.saturating_add(packed.div_ceil(BLOCK) * BLOCK);

        match type_flag {
            b'L' | b'K' | b'x' | b'g' => {
                let len = ctx.limits.check_header(packed)?;
                let data = match ctx.read_vec_at(data_pos, len as u64) {
                    Ok(data) => data,
                    Err(Error::UnexpectedEnd { .. }) => {
                        info.unexpected_end = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                match type_flag {
                    b'L' | b'K' => {
                        ctx.limits.check_name(trim_nul(&data).len() as u64)?;
                        let text = lossy(trim_nul(&data));
                        if type_flag == b'L' {
                            long_name = Some(text);
                        } else {
                            long_link = Some(text);
                        }
                        flavor = flavor.max(Flavor::Gnu);
                    }
                    b'x' => {
                        pax.apply(&pax_records(&data));
                        flavor = Flavor::Pax;
                    }
                    _ => {
                        global.apply(&pax_records(&data));
                        flavor = Flavor::Pax;
                    }
                }
                pos = next;
                continue;
            }
            _ => {}
        }

        let overrides = std::mem::take(&mut pax).merged(&global);

        let mut name = lossy(trim_nul(&block[..100]));
        if is_posix && !is_gnu {
            let prefix = trim_nul(&block[345..500]);
            if !prefix.is_empty() {
                name = format!("{}/{}", lossy(prefix), name);
            }
        }
        if let Some(long) = long_name.take() {
            name = long;
        }
        if let Some(path) = overrides.path {
            name = path;
        }
        let mut link = lossy(trim_nul(&block[157..257]));
        if let Some(long) = long_link.take() {
            link = long;
        }
        if let Some(path) = overrides.linkpath {
            link = path;
        }

        if let Some(size_override) = overrides.size {
            packed = size_override;
            next = data_pos.saturating_add(packed.div_ceil(BLOCK) * BLOCK);
        }

        let mut kind = match type_flag {
            b'1' => ItemKind::HardLink,
            b'2' => ItemKind::Symlink,
            b'3' | b'4' => ItemKind::Device,
            b'5' | b'D' => ItemKind::Directory,
            b'6' => ItemKind::Fifo,
            b'V' => ItemKind::Other,
            _ => ItemKind::File,
        };
        if kind == ItemKind::File && name.ends_with('/') {
            kind = ItemKind::Directory;
        }
        let trimmed = name.trim_end_matches('/');
        if !trimmed.is_empty() {
            name = trimmed.to_string();
        }

        let mut item = Item {
            kind,
            header_offset: header_pos,
            payload_offset: data_pos,
            mtime: overrides
                .mtime
                .or_else(|| numeric(&block[136..148]).map(|v| v as i64)),
            uid: overrides
                .uid
                .or_else(|| numeric(&block[108..116]).map(|v| v as u32)),
            gid: overrides
                .gid
                .or_else(|| numeric(&block[116..124]).map(|v| v as u32)),
            mode: numeric(&block[100..108]).map(|v| v as u32),
            ..Item::new(name)
        };
        if matches!(kind, ItemKind::Symlink | ItemKind::HardLink) && !link.is_empty() {
            item.link_target = Some(link);
        }

        let source = if type_flag == b'S' {
            // GNU sparse: skip the extension headers that follow.
            let mut extended = block[482] != 0;
            let mut data_start = data_pos;
            while extended {
                let mut ext = [0u8; BLOCK as usize];
                match ctx.read_exact_at(data_start, &mut ext) {
                    Ok(()) => {}
                    Err(Error::UnexpectedEnd { .. }) => {
                        info.unexpected_end = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
                extended = ext[504] != 0;
                data_start += BLOCK;
            }
            item.payload_offset = data_start;
            next = data_start.saturating_add(packed.div_ceil(BLOCK) * BLOCK);
            item.size = numeric(&block[483..495]);
            item.packed_size = packed;
            ItemSource::Unavailable(ItemOutcome::UnsupportedMethod)
        } else if matches!(
            kind,
            ItemKind::Directory | ItemKind::HardLink | ItemKind::Symlink
        ) {
            item.size = Some(0);
            item.packed_size = packed;
            ItemSource::Empty
        } else {
            item.size = Some(packed);
            item.packed_size = packed;
            ItemSource::stored(data_pos, packed)
        };

        ctx.limits.check_items(parsed_items.len() as u64 + 1)?;
        parsed_items.push((item, source));

        if data_pos.saturating_add(packed) > size {
            info.unexpected_end = true;
            pos = size;
            break;
        }
        pos = next;
    }

    if parsed_items.is_empty() && info.headers_error {
        return Err(Error::NotThisFormat);
    }

    info.physical_size = pos.min(size);
    info.subtype = Some(
        match flavor {
            Flavor::V7 => "v7",
            Flavor::Posix => "posix",
            Flavor::Gnu => "gnu",
            Flavor::Pax => "pax",
        }
        .to_string(),
    );

    let mut parsed = Parsed::new(info);
    for (item, source) in parsed_items {
        parsed.push(item, source);
    }
    log::debug!("tar: {} entries", parsed.items.len());
    Ok(parsed)
}
