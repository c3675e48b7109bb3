//! Portable Executable and Terse Executable images, exposed as sections.
//!
//! Every section becomes one stored item. PE images additionally list the
//! Authenticode blob (`CERTIFICATE`), the COFF symbol and string tables
//! (`COFF_SYMBOLS`) and any unreferenced byte ranges past the first page
//! (`[0]`, `[1]`, ...), so the items tile the whole file.

use crate::format::bytes::{le_u16, le_u32, le_u64, lossy, trim_nul};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::Item;
use crate::{Error, Result};

const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const COFF_HEADER_SIZE: u64 = 20;
const PE_HEADER_SIZE: u64 = 4 + COFF_HEADER_SIZE;
const DOS_HEADER_SIZE: usize = 0x40;
const OPT_HEADER32_MIN: u16 = 96;
const OPT_HEADER64_MIN: u16 = 112;
const MAGIC_PE32: u16 = 0x10B;
const MAGIC_PE32_PLUS: u16 = 0x20B;
const CHECKSUM_FIELD: u64 = 64;
const SECTION_SIZE: usize = 40;
const NAME_SIZE: usize = 8;
const MAX_DIRECTORIES: u32 = 1 << 16;
const PARSED_DIRECTORIES: usize = 16;
const DIR_CERTIFICATE: usize = 4;
const SYMBOL_SIZE: u64 = 18;
const GAP_START: u64 = 1 << 12;

const TE_SIGNATURE: &[u8; 2] = b"VZ";
const TE_HEADER_SIZE: usize = 40;
const TE_MAX_SECTIONS: u8 = 32;
const TE_MAX_RANGE: u32 = 1 << 30;

/// Machine types a TE image may declare.
const MACHINES: &[(u16, &str)] = &[
    (0x014C, "x86"),
    (0x014D, "I860"),
    (0x0162, "MIPS-R3000"),
    (0x0166, "MIPS-R4000"),
    (0x0168, "MIPS-R10000"),
    (0x0169, "MIPS-V2"),
    (0x0184, "Alpha"),
    (0x01A2, "SH3"),
    (0x01A3, "SH3-DSP"),
    (0x01A4, "SH3E"),
    (0x01A6, "SH4"),
    (0x01A8, "SH5"),
    (0x01C0, "ARM"),
    (0x01C2, "ARM-Thumb"),
    (0x01C4, "ARM-NT"),
    (0x01D3, "AM33"),
    (0x01F0, "PPC"),
    (0x01F1, "PPC-FP"),
    (0x0200, "IA-64"),
    (0x0266, "MIPS-16"),
    (0x0284, "Alpha-64"),
    (0x0366, "MIPS-FPU"),
    (0x0466, "MIPS-FPU16"),
    (0x0520, "TriCore"),
    (0x0CEF, "CEF"),
    (0x0EBC, "EFI"),
    (0x8664, "x64"),
    (0x9041, "M32R"),
    (0xAA64, "ARM64"),
    (0xC0EE, "CEE"),
];

/// Subsystem names by id; `None` marks ids that never occur.
const SUBSYSTEMS: &[Option<&str>] = &[
    Some("Unknown"),
    Some("Native"),
    Some("Windows GUI"),
    Some("Windows CUI"),
    None,
    Some("OS2"),
    None,
    Some("Posix"),
    Some("Win9x"),
    Some("Windows CE"),
    Some("EFI"),
    Some("EFI Boot"),
    Some("EFI Runtime"),
    Some("EFI ROM"),
    Some("XBOX"),
    None,
    Some("Windows Boot"),
    Some("XBOX Catalog"),
];

fn machine_name(machine: u16) -> Option<&'static str> {
    MACHINES.iter().find(|(m, _)| *m == machine).map(|(_, n)| *n)
}

fn subsystem_name(subsystem: u16) -> Option<&'static str> {
    SUBSYSTEMS.get(subsystem as usize).copied().flatten()
}

fn pe_offset_is_valid(offset: u32) -> bool {
    (0x40..=0x1000).contains(&offset)
}

pub(crate) fn probe_pe(input: &ProbeInput<'_>) -> Probe {
    let head = input.head;
    match Probe::signature(head, b"MZ") {
        Probe::Match => {}
        other => return other,
    }
    if head.len() < DOS_HEADER_SIZE {
        return Probe::NeedMoreBytes(DOS_HEADER_SIZE as u64);
    }
    let pe = le_u32(head, 0x3C);
    if !pe_offset_is_valid(pe) {
        return Probe::NotThisFormat;
    }
    let end = u64::from(pe) + PE_HEADER_SIZE;
    if end > head.len() as u64 {
        return if (head.len() as u64) < input.size {
            Probe::Match
        } else {
            Probe::NeedMoreBytes(end)
        };
    }
    let p = &head[pe as usize..];
    if p.starts_with(PE_SIGNATURE) && le_u16(p, 4 + 16) >= OPT_HEADER32_MIN {
        Probe::Match
    } else {
        Probe::NotThisFormat
    }
}

pub(crate) fn probe_te(input: &ProbeInput<'_>) -> Probe {
    match Probe::signature(input.head, TE_SIGNATURE) {
        Probe::Match => {}
        other => return other,
    }
    if input.head.len() < TE_HEADER_SIZE {
        return Probe::NeedMoreBytes(TE_HEADER_SIZE as u64);
    }
    if TeHeader::parse(input.head).is_some() {
        Probe::Match
    } else {
        Probe::NotThisFormat
    }
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    virtual_size: u32,
    va: u32,
    size: u32,
    pa: u32,
    flags: u32,
    header_offset: u64,
}

impl Section {
    fn parse(p: &[u8], header_offset: u64) -> Self {
        Self {
            name: lossy(trim_nul(&p[..NAME_SIZE])),
            virtual_size: le_u32(p, 8),
            va: le_u32(p, 12),
            size: le_u32(p, 16),
            pa: le_u32(p, 20),
            flags: le_u32(p, 36),
            header_offset,
        }
    }

    fn end(&self) -> u64 {
        u64::from(self.pa) + u64::from(self.size)
    }
}

/// A byte range listed as an item that no section header describes.
#[derive(Debug)]
struct Extra {
    name: String,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct CoffHeader {
    machine: u16,
    sections: u16,
    time: u32,
    symbols_at: u32,
    symbols: u32,
    opt_size: u16,
    flags: u16,
}

impl CoffHeader {
    fn parse(p: &[u8]) -> Self {
        Self {
            machine: le_u16(p, 0),
            sections: le_u16(p, 2),
            time: le_u32(p, 4),
            symbols_at: le_u32(p, 8),
            symbols: le_u32(p, 12),
            opt_size: le_u16(p, 16),
            flags: le_u16(p, 18),
        }
    }
}

#[derive(Debug)]
struct OptionalHeader {
    magic: u16,
    image_base: u64,
    checksum: u32,
    subsystem: u16,
    directories: [(u32, u32); PARSED_DIRECTORIES],
}

impl OptionalHeader {
    fn parse(p: &[u8]) -> Option<Self> {
        if p.len() < OPT_HEADER32_MIN as usize {
            return None;
        }
        let magic = le_u16(p, 0);
        let (image_base, count_at) = match magic {
            MAGIC_PE32 => (u64::from(le_u32(p, 28)), 92),
            MAGIC_PE32_PLUS if p.len() >= OPT_HEADER64_MIN as usize => (le_u64(p, 24), 108),
            _ => return None,
        };
        let count = le_u32(p, count_at);
        if count > MAX_DIRECTORIES || count_at + 4 + 8 * count as usize > p.len() {
            return None;
        }
        let mut directories = [(0, 0); PARSED_DIRECTORIES];
        for (i, dir) in directories.iter_mut().enumerate().take(count as usize) {
            let at = count_at + 4 + i * 8;
            *dir = (le_u32(p, at), le_u32(p, at + 4));
        }
        Some(Self {
            magic,
            image_base,
            checksum: le_u32(p, CHECKSUM_FIELD as usize),
            subsystem: le_u16(p, 68),
            directories,
        })
    }
}

/// The PE image checksum: a folded 16-bit word sum plus the image length.
fn image_checksum(ctx: &mut ParseContext<'_>, len: u64, skip: u64) -> Result<u32> {
    const CHUNK: u64 = 1 << 15;
    let len = len.min(ctx.size());
    let mut sum = 0u64;
    let mut pos = 0u64;
    while pos < len {
        let mut buf = ctx.read_vec_at(pos, CHUNK.min(len - pos))?;
        for i in 0..4 {
            if let Some(at) = (skip + i).checked_sub(pos) {
                if let Some(b) = buf.get_mut(at as usize) {
                    *b = 0;
                }
            }
        }
        for word in buf.chunks(2) {
            let lo = u64::from(word[0]);
            let hi = word.get(1).copied().map_or(0, u64::from);
            sum += lo | hi << 8;
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        pos += buf.len() as u64;
    }
    Ok((sum as u32).wrapping_add(len as u32))
}

/// Names the unreferenced ranges past the first page `[0]`, `[1]`, ...
fn gap_sections(ranges: &mut Vec<(u64, u64)>) -> Vec<Extra> {
    ranges.sort_unstable();
    let mut gaps = Vec::new();
    let mut limit = GAP_START;
    for &(offset, size) in ranges.iter() {
        if offset > limit {
            gaps.push(Extra {
                name: format!("[{}]", gaps.len()),
                offset: limit,
                size: offset - limit,
            });
            limit = offset;
        }
        limit = limit.max(offset + size);
    }
    gaps
}

pub(crate) fn parse_pe(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let file_size = ctx.size();
    let mut dos = [0u8; DOS_HEADER_SIZE];
    ctx.read_exact_at(0, &mut dos).map_err(|_| Error::NotThisFormat)?;
    if !dos.starts_with(b"MZ") {
        return Err(Error::NotThisFormat);
    }
    let pe = le_u32(&dos, 0x3C);
    if !pe_offset_is_valid(pe) {
        return Err(Error::NotThisFormat);
    }
    let mut raw = [0u8; PE_HEADER_SIZE as usize];
    ctx.read_exact_at(u64::from(pe), &mut raw)
        .map_err(|_| Error::NotThisFormat)?;
    if !raw.starts_with(PE_SIGNATURE) {
        return Err(Error::NotThisFormat);
    }
    let coff = CoffHeader::parse(&raw[4..]);
    if coff.opt_size < OPT_HEADER32_MIN {
        return Err(Error::NotThisFormat);
    }

    let opt_start = u64::from(pe) + PE_HEADER_SIZE;
    let table_len = u64::from(coff.opt_size) + u64::from(coff.sections) * SECTION_SIZE as u64;
    let table = ctx
        .read_vec_at(opt_start, table_len)
        .map_err(|e| match e {
            Error::UnexpectedEnd { .. } => Error::NotThisFormat,
            other => other,
        })?;
    let opt = OptionalHeader::parse(&table[..coff.opt_size as usize]).ok_or(Error::NotThisFormat)?;

    let mut info = ArchiveInfo::new(FormatKind::Pe, 0);
    let mut total = opt_start + table_len;

    let sections_at = opt_start + u64::from(coff.opt_size);
    let mut sections: Vec<Section> = table[coff.opt_size as usize..]
        .chunks_exact(SECTION_SIZE)
        .enumerate()
        .map(|(i, p)| Section::parse(p, sections_at + (i * SECTION_SIZE) as u64))
        .collect();
    for pair in sections.windows(2) {
        let (prev, sect) = (&pair[0], &pair[1]);
        if prev.pa < sect.pa && prev.end() > u64::from(sect.pa) && sect.size != 0 && prev.size != 0 {
            ctx.warn(format!("section {} overlaps {}", prev.name, sect.name));
            info.headers_error = true;
        }
    }
    for sect in &sections {
        total = total.max(sect.end());
    }

    let mut extras = Vec::new();
    let (cert_offset, cert_size) = opt.directories[DIR_CERTIFICATE];
    if cert_size != 0 {
        extras.push(Extra {
            name: "CERTIFICATE".to_string(),
            offset: u64::from(cert_offset),
            size: u64::from(cert_size),
        });
    }
    if coff.symbols > 0 && u64::from(coff.symbols_at) >= opt_start {
        if coff.symbols >= 1 << 24 {
            return Err(Error::NotThisFormat);
        }
        let symbols = u64::from(coff.symbols) * SYMBOL_SIZE;
        let mut strings = [0u8; 4];
        ctx.read_exact_at(u64::from(coff.symbols_at) + symbols, &mut strings)
            .map_err(|_| Error::NotThisFormat)?;
        let strings = le_u32(&strings, 0);
        if strings >= 1 << 28 {
            return Err(Error::NotThisFormat);
        }
        extras.push(Extra {
            name: "COFF_SYMBOLS".to_string(),
            offset: u64::from(coff.symbols_at),
            size: symbols + u64::from(strings),
        });
    }
    for extra in &extras {
        total = total.max(extra.offset + extra.size);
    }

    let mut ranges: Vec<(u64, u64)> = sections
        .iter()
        .map(|s| (u64::from(s.pa), u64::from(s.size)))
        .chain(extras.iter().map(|e| (e.offset, e.size)))
        .collect();
    let gaps = gap_sections(&mut ranges);

    if opt.checksum != 0 {
        let actual = image_checksum(ctx, total, opt_start + CHECKSUM_FIELD)?;
        if actual != opt.checksum {
            ctx.warn(format!(
                "PE checksum mismatch: stored {:#x}, computed {:#x}",
                opt.checksum, actual
            ));
            info.checksum_error = true;
        }
    }
    if !ctx.allow_tail && file_size > total {
        return Err(Error::NotThisFormat);
    }
    if total > file_size {
        info.unexpected_end = true;
    }

    let cpu = machine_name(coff.machine).unwrap_or("unknown CPU");
    let bits = if opt.magic == MAGIC_PE32_PLUS { "PE32+" } else { "PE32" };
    let kind = if coff.flags & (1 << 13) != 0 { "DLL" } else { "EXE" };
    info.subtype = Some(format!("{} {} {}", bits, kind, cpu));
    info.comment = subsystem_name(opt.subsystem).map(|s| format!("subsystem: {}", s));
    info.physical_size = total;
    info.mtime = (coff.time != 0).then_some(i64::from(coff.time));
    log::debug!(
        "pe: {} sections, image base {:#x}, {} bytes",
        sections.len(),
        opt.image_base,
        total
    );

    let mut parsed = Parsed::new(info);
    let mtime = parsed.info.mtime;
    for sect in sections.drain(..) {
        let item = Item {
            header_offset: sect.header_offset,
            payload_offset: u64::from(sect.pa),
            packed_size: u64::from(sect.size),
            size: Some(u64::from(sect.size)),
            mtime,
            ..Item::new(sect.name.clone())
        };
        log::trace!(
            "pe: section {} va {:#x} vsize {:#x} flags {:#x}",
            sect.name,
            sect.va,
            sect.virtual_size,
            sect.flags
        );
        parsed.push(item, ItemSource::stored(u64::from(sect.pa), u64::from(sect.size)));
    }
    for extra in extras.into_iter().chain(gaps) {
        let item = Item {
            payload_offset: extra.offset,
            packed_size: extra.size,
            size: Some(extra.size),
            ..Item::new(extra.name)
        };
        parsed.push(item, ItemSource::stored(extra.offset, extra.size));
    }
    Ok(parsed)
}

#[derive(Debug)]
struct TeHeader {
    machine: u16,
    sections: u8,
    subsystem: u8,
    stripped: u16,
}

impl TeHeader {
    fn parse(p: &[u8]) -> Option<Self> {
        let header = Self {
            machine: le_u16(p, 2),
            sections: p[4],
            subsystem: p[5],
            stripped: le_u16(p, 6),
        };
        let dirs_ok = (0..2).all(|i| le_u32(p, 24 + i * 8 + 4) < 1 << 28);
        (header.sections <= TE_MAX_SECTIONS
            && dirs_ok
            && machine_name(header.machine).is_some()
            && subsystem_name(u16::from(header.subsystem)).is_some())
        .then_some(header)
    }

    /// Maps a stripped-image file offset to an offset in the TE file.
    fn convert(&self, pa: u32) -> Option<u32> {
        pa.checked_sub(u32::from(self.stripped))
            .map(|pa| pa + TE_HEADER_SIZE as u32)
    }
}

pub(crate) fn parse_te(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let file_size = ctx.size();
    let mut raw = [0u8; TE_HEADER_SIZE];
    ctx.read_exact_at(0, &mut raw).map_err(|_| Error::NotThisFormat)?;
    if !raw.starts_with(TE_SIGNATURE) {
        return Err(Error::NotThisFormat);
    }
    let header = TeHeader::parse(&raw).ok_or(Error::NotThisFormat)?;
    let table_len = header.sections as usize * SECTION_SIZE;
    let table = ctx
        .read_vec_at(TE_HEADER_SIZE as u64, table_len as u64)
        .map_err(|_| Error::NotThisFormat)?;
    let header_size = (TE_HEADER_SIZE + table_len) as u64;

    let mut total = header_size;
    let mut sections = Vec::with_capacity(header.sections as usize);
    for (i, p) in table.chunks_exact(SECTION_SIZE).enumerate() {
        let mut sect = Section::parse(p, (TE_HEADER_SIZE + i * SECTION_SIZE) as u64);
        sect.pa = header.convert(sect.pa).ok_or(Error::NotThisFormat)?;
        if u64::from(sect.pa) < header_size || sect.pa > TE_MAX_RANGE || sect.size > TE_MAX_RANGE {
            return Err(Error::NotThisFormat);
        }
        total = total.max(sect.end());
        sections.push(sect);
    }
    if !ctx.allow_tail && file_size > total {
        return Err(Error::NotThisFormat);
    }

    let mut info = ArchiveInfo::new(FormatKind::Te, total);
    info.unexpected_end = total > file_size;
    info.subtype = machine_name(header.machine).map(str::to_string);
    info.comment = subsystem_name(u16::from(header.subsystem)).map(|s| format!("subsystem: {}", s));

    let mut parsed = Parsed::new(info);
    for sect in sections {
        let item = Item {
            header_offset: sect.header_offset,
            payload_offset: u64::from(sect.pa),
            packed_size: u64::from(sect.size),
            size: Some(u64::from(sect.size)),
            ..Item::new(sect.name)
        };
        parsed.push(item, ItemSource::stored(u64::from(sect.pa), u64::from(sect.size)));
    }
    Ok(parsed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::testing::{parse_with, probe_with};

    fn section(name: &str, pa: u32, size: u32) -> [u8; SECTION_SIZE] {
        let mut s = [0u8; SECTION_SIZE];
        s[..name.len()].copy_from_slice(name.as_bytes());
        s[8..12].copy_from_slice(&size.to_le_bytes());
        s[12..16].copy_from_slice(&(pa + 0x1000).to_le_bytes());
        s[16..20].copy_from_slice(&size.to_le_bytes());
        s[20..24].copy_from_slice(&pa.to_le_bytes());
        s[36..40].copy_from_slice(&0x6000_0020u32.to_le_bytes());
        s
    }

    /// A PE32+ image with the given `(name, pa, size)` sections, filled
    /// with the section index, and an optional certificate appended.
    pub(crate) fn build_pe(sections: &[(&str, u32, u32)], cert: Option<&[u8]>, checksum: bool) -> Vec<u8> {
        let mut img = vec![0u8; 0x40];
        img[..2].copy_from_slice(b"MZ");
        img[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        img.extend_from_slice(PE_SIGNATURE);
        let opt_size: u16 = 112 + 16 * 8;
        let mut coff = [0u8; COFF_HEADER_SIZE as usize];
        coff[0..2].copy_from_slice(&0x8664u16.to_le_bytes());
        coff[2..4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        coff[4..8].copy_from_slice(&1_600_000_000u32.to_le_bytes());
        coff[16..18].copy_from_slice(&opt_size.to_le_bytes());
        coff[18..20].copy_from_slice(&0x0022u16.to_le_bytes());
        img.extend_from_slice(&coff);
        let mut opt = vec![0u8; opt_size as usize];
        opt[0..2].copy_from_slice(&MAGIC_PE32_PLUS.to_le_bytes());
        opt[24..32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
        opt[68..70].copy_from_slice(&3u16.to_le_bytes());
        opt[108..112].copy_from_slice(&16u32.to_le_bytes());
        let data_end = sections.iter().map(|s| s.1 + s.2).max().unwrap_or(0x200);
        if let Some(cert) = cert {
            let at = 112 + DIR_CERTIFICATE * 8;
            opt[at..at + 4].copy_from_slice(&data_end.to_le_bytes());
            opt[at + 4..at + 8].copy_from_slice(&(cert.len() as u32).to_le_bytes());
        }
        img.extend_from_slice(&opt);
        for (name, pa, size) in sections {
            img.extend_from_slice(&section(name, *pa, *size));
        }
        for (i, (_, pa, size)) in sections.iter().enumerate() {
            let end = (pa + size) as usize;
            if img.len() < end {
                img.resize(end, 0);
            }
            img[*pa as usize..end].fill(i as u8 + 1);
        }
        if let Some(cert) = cert {
            img.resize(data_end as usize, 0);
            img.extend_from_slice(cert);
        }
        if checksum {
            let sum = reference_checksum(&img, 0x40 + 24 + CHECKSUM_FIELD as usize);
            let at = 0x40 + 24 + CHECKSUM_FIELD as usize;
            img[at..at + 4].copy_from_slice(&sum.to_le_bytes());
        }
        img
    }

    /// Straightforward 16-bit one's complement sum for cross-checking.
    fn reference_checksum(img: &[u8], skip: usize) -> u32 {
        let mut data = img.to_vec();
        data[skip..skip + 4].fill(0);
        if data.len() % 2 == 1 {
            data.push(0);
        }
        let mut sum = 0u32;
        for w in data.chunks(2) {
            sum += u32::from(u16::from_le_bytes([w[0], w[1]]));
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum + img.len() as u32
    }

    fn build_te(stripped: u16, sections: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut img = vec![0u8; TE_HEADER_SIZE];
        img[..2].copy_from_slice(TE_SIGNATURE);
        img[2..4].copy_from_slice(&0x8664u16.to_le_bytes());
        img[4] = sections.len() as u8;
        img[5] = 10;
        img[6..8].copy_from_slice(&stripped.to_le_bytes());
        for (name, pa, size) in sections {
            img.extend_from_slice(&section(name, *pa, *size));
        }
        for (_, pa, size) in sections {
            let end = (pa - u32::from(stripped) + TE_HEADER_SIZE as u32 + size) as usize;
            if img.len() < end {
                img.resize(end, 0xEE);
            }
        }
        img
    }

    #[test]
    fn test_probe_pe() {
        let img = build_pe(&[(".text", 0x200, 0x200)], None, false);
        assert_eq!(probe_with(probe_pe, &img), Probe::Match);
        assert_eq!(probe_with(probe_pe, b"MZ"), Probe::NeedMoreBytes(0x40));
        assert_eq!(probe_with(probe_pe, b"M"), Probe::NeedMoreBytes(2));
        let mut bad = img.clone();
        bad[0x3C] = 0x10;
        assert_eq!(probe_with(probe_pe, &bad), Probe::NotThisFormat);
    }

    #[test]
    fn test_sections_and_certificate() {
        let img = build_pe(
            &[(".text", 0x200, 0x200), (".data", 0x400, 0x100)],
            Some(&[0xC5; 0x80]),
            true,
        );
        let parsed = parse_with(parse_pe, &img, None).unwrap();
        let names: Vec<_> = parsed.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, [".text", ".data", "CERTIFICATE"]);
        assert!(!parsed.info.checksum_error);
        assert!(!parsed.info.headers_error);
        assert_eq!(parsed.info.physical_size, img.len() as u64);
        assert_eq!(parsed.info.subtype.as_deref(), Some("PE32+ EXE x64"));
        assert_eq!(parsed.items[1].payload_offset, 0x400);
        assert_eq!(parsed.items[1].size, Some(0x100));
        assert_eq!(parsed.items[2].payload_offset, 0x500);
    }

    #[test]
    fn test_checksum_mismatch_is_warning() {
        let mut img = build_pe(&[(".text", 0x200, 0x200)], None, true);
        img[0x210] ^= 0x55;
        let parsed = parse_with(parse_pe, &img, None).unwrap();
        assert!(parsed.info.checksum_error);
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn test_overlapping_sections() {
        let img = build_pe(&[(".text", 0x200, 0x200), (".data", 0x300, 0x200)], None, false);
        let parsed = parse_with(parse_pe, &img, None).unwrap();
        assert!(parsed.info.headers_error);
    }

    #[test]
    fn test_gap_sections() {
        let img = build_pe(&[(".text", 0x200, 0x200), (".big", 0x2000, 0x100)], None, false);
        let parsed = parse_with(parse_pe, &img, None).unwrap();
        let gap = parsed.items.iter().find(|i| i.name == "[0]").unwrap();
        assert_eq!(gap.payload_offset, 0x1000);
        assert_eq!(gap.size, Some(0x1000));
    }

    #[test]
    fn test_tail_rejected_without_allow_tail() {
        let mut img = build_pe(&[(".text", 0x200, 0x200)], None, false);
        img.extend_from_slice(b"overlay");
        assert!(matches!(
            parse_with(parse_pe, &img, None),
            Err(Error::NotThisFormat)
        ));
    }

    #[test]
    fn test_te_sections() {
        let img = build_te(0x100, &[(".text", 0x200, 0x80), (".reloc", 0x280, 0x20)]);
        assert_eq!(probe_with(probe_te, &img), Probe::Match);
        let parsed = parse_with(parse_te, &img, None).unwrap();
        assert_eq!(parsed.items.len(), 2);
        // 0x200 - 0x100 + 40
        assert_eq!(parsed.items[0].payload_offset, 0x128);
        assert_eq!(parsed.items[1].payload_offset, 0x1A8);
        assert_eq!(parsed.info.physical_size, img.len() as u64);
        assert_eq!(parsed.info.comment.as_deref(), Some("subsystem: EFI"));
    }

    #[test]
    fn test_te_section_inside_header_rejected() {
        let img = build_te(0x200, &[(".text", 0x200, 0x80)]);
        assert!(matches!(
            parse_with(parse_te, &img, None),
            Err(Error::NotThisFormat)
        ));
    }

    #[test]
    fn test_te_bad_machine() {
        let mut img = build_te(0x100, &[(".text", 0x200, 0x80)]);
        img[2] = 0x99;
        img[3] = 0x99;
        assert_eq!(probe_with(probe_te, &img), Probe::NotThisFormat);
    }
}
