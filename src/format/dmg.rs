//! Apple disk images (UDIF).
//!
//! A 512-byte `koly` trailer points at an XML property list whose
//! `resource-fork/blkx` array describes every partition as a `mish` chunk
//! table. Chunks are zero-filled, raw or independently compressed, so each
//! partition maps straight onto a [`BlockMap`].

use base64::Engine;

use crate::cache::BlockMap;
use crate::codec::Method;
use crate::format::bytes::{be_u32, be_u64};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::Item;
use crate::read::ItemOutcome;
use crate::{Error, Result};

const KOLY: &[u8; 12] = b"koly\0\0\0\x04\0\0\x02\0";
const KOLY_SIZE: u64 = 512;
const MISH: u32 = 0x6D69_7368;
const MISH_HEAD: usize = 0xCC;
const CHUNK_SIZE: usize = 40;
const MAX_CHUNKS: u32 = 1 << 28;
const SECTOR_LOG: u32 = 9;

const CHUNK_ZERO: u32 = 0;
const CHUNK_RAW: u32 = 1;
const CHUNK_IGNORE: u32 = 2;
const CHUNK_ADC: u32 = 0x8000_0004;
const CHUNK_ZLIB: u32 = 0x8000_0005;
const CHUNK_BZIP2: u32 = 0x8000_0006;
const CHUNK_LZFSE: u32 = 0x8000_0007;
const CHUNK_XZ: u32 = 0x8000_0008;
const CHUNK_COMMENT: u32 = 0x7FFF_FFFE;
const CHUNK_END: u32 = 0xFFFF_FFFF;

const CHECKSUM_CRC32: u32 = 2;
const CHECKSUM_DATA: usize = 128;

const XML_PREFIX: &[u8] = b"<?xml version";

/// Partition types with a conventional file extension.
const APPLE_NAMES: &[(&str, &str)] = &[
    ("Apple_HFS", "hfs"),
    ("Apple_HFSX", "hfsx"),
    ("Apple_UFS", "ufs"),
    ("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "efi_sys"),
    ("Apple_Free", "free"),
    ("DDM", "ddm"),
];

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    if input.head.starts_with(KOLY) {
        return Probe::Match;
    }
    let tail = input.tail;
    if tail.len() >= KOLY_SIZE as usize && tail[tail.len() - KOLY_SIZE as usize..].starts_with(KOLY) {
        return Probe::Match;
    }
    match Probe::signature(input.head, KOLY) {
        Probe::NeedMoreBytes(_) => Probe::NeedMoreBytes(KOLY_SIZE),
        _ => Probe::NotThisFormat,
    }
}

/// An `(offset, length)` pair from the trailer.
#[derive(Debug, Clone, Copy)]
struct ForkPair {
    offset: u64,
    len: u64,
}

impl ForkPair {
    fn parse(p: &[u8], at: usize) -> Self {
        Self {
            offset: be_u64(p, at),
            len: be_u64(p, at + 8),
        }
    }

    /// Extends `top` to cover the pair; `false` if it lies past `limit`.
    fn update_top(&self, limit: u64, top: &mut u64) -> bool {
        if self.offset > limit || self.len > limit - self.offset {
            return false;
        }
        *top = (*top).max(self.offset + self.len);
        true
    }
}

#[derive(Debug, Clone)]
struct Checksum {
    kind: u32,
    bits: u32,
    data: [u8; CHECKSUM_DATA],
}

impl Checksum {
    fn parse(p: &[u8], at: usize) -> Self {
        let mut data = [0u8; CHECKSUM_DATA];
        data.copy_from_slice(&p[at + 8..at + 8 + CHECKSUM_DATA]);
        Self {
            kind: be_u32(p, at),
            bits: be_u32(p, at + 4),
            data,
        }
    }

    fn crc32(&self) -> Option<u32> {
        (self.kind == CHECKSUM_CRC32 && self.bits == 32).then(|| be_u32(&self.data, 0))
    }

    /// The checksum bytes, if the bit count is whole and in range.
    fn bytes(&self) -> Option<&[u8]> {
        let len = (self.bits / 8) as usize;
        (self.bits % 8 == 0 && len <= CHECKSUM_DATA).then(|| &self.data[..len])
    }
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    kind: u32,
    unpacked_pos: u64,
    unpacked: u64,
    packed_pos: u64,
    packed: u64,
}

impl Chunk {
    fn method(&self) -> Method {
        match self.kind {
            CHUNK_ZERO | CHUNK_IGNORE => Method::Zero,
            CHUNK_RAW => Method::Copy,
            CHUNK_ADC => Method::Adc,
            CHUNK_ZLIB => Method::Zlib,
            CHUNK_BZIP2 => Method::Bzip2,
            CHUNK_LZFSE => Method::Lzfse,
            CHUNK_XZ => Method::Xz,
            other => Method::Unknown(other),
        }
    }
}

/// A parsed `mish` block table.
#[derive(Debug)]
struct BlockTable {
    data_start: u64,
    chunks: Vec<Chunk>,
    size: u64,
    checksum: Checksum,
    /// Zero chunks of type 2 leave the stored checksum incomplete.
    full_checksum: bool,
    consistent: bool,
}

impl BlockTable {
    fn parse(p: &[u8]) -> Option<BlockTable> {
        if p.len() < MISH_HEAD || be_u32(p, 0) != MISH || be_u32(p, 4) != 1 {
            return None;
        }
        let sectors = be_u64(p, 0x10);
        let count = be_u32(p, 0xC8);
        if count > MAX_CHUNKS || count as usize * CHUNK_SIZE + MISH_HEAD != p.len() {
            return None;
        }
        let mut table = BlockTable {
            data_start: be_u64(p, 0x18),
            chunks: Vec::with_capacity(count as usize),
            size: 0,
            checksum: Checksum::parse(p, 0x40),
            full_checksum: true,
            consistent: true,
        };

        let mut next_pos = None;
        let mut ended = false;
        for (i, raw) in p[MISH_HEAD..].chunks_exact(CHUNK_SIZE).enumerate() {
            let chunk = Chunk {
                kind: be_u32(raw, 0),
                unpacked_pos: be_u64(raw, 0x08) << SECTOR_LOG,
                unpacked: be_u64(raw, 0x10) << SECTOR_LOG,
                packed_pos: be_u64(raw, 0x18),
                packed: be_u64(raw, 0x20),
            };
            if next_pos.is_some_and(|pos| pos != chunk.unpacked_pos) {
                table.consistent = false;
                break;
            }
            next_pos = chunk.unpacked_pos.checked_add(chunk.unpacked);
            if next_pos.is_none() {
                table.consistent = false;
                break;
            }
            match chunk.kind {
                CHUNK_COMMENT => continue,
                CHUNK_END => {
                    ended = i + 1 == count as usize;
                    break;
                }
                _ => {}
            }
            if chunk.unpacked != 0 {
                if chunk.kind == CHUNK_IGNORE {
                    table.full_checksum = false;
                }
                table.chunks.push(chunk);
            }
        }
        if !ended {
            table.consistent = false;
        }
        table.size = table.chunks.last().map_or(0, |c| c.unpacked_pos + c.unpacked);
        if table.size != sectors << SECTOR_LOG {
            table.consistent = false;
        }
        Some(table)
    }

    fn packed_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.packed).sum()
    }

    /// The first non-trivial codec, for display.
    fn main_method(&self) -> Method {
        self.chunks
            .iter()
            .map(Chunk::method)
            .find(|m| !matches!(m, Method::Zero | Method::Copy))
            .or_else(|| self.chunks.iter().map(Chunk::method).find(|&m| m == Method::Copy))
            .unwrap_or(Method::Zero)
    }

    /// Builds the block map with chunk offsets shifted by `base`.
    fn block_map(&self, base: u64) -> Option<BlockMap> {
        let mut map = BlockMap::new();
        for chunk in &self.chunks {
            let method = chunk.method();
            let offset = base.checked_add(self.data_start)?.checked_add(chunk.packed_pos)?;
            match method {
                Method::Zero => map.push_zero(chunk.unpacked),
                Method::Copy if chunk.packed != chunk.unpacked => return None,
                Method::Copy => map.push_stored(offset, chunk.unpacked),
                _ => {
                    let packed = chunk.packed.max(1);
                    map.push_packed(offset, packed, method, chunk.unpacked);
                }
            }
        }
        Some(map)
    }
}

/// Names the partition after its Apple type, as `N.hfs`, or `N_name`.
fn item_name(index: usize, count: usize, name: &str) -> String {
    let mut digits = 1;
    let mut bound = 10;
    while bound < count {
        digits += 1;
        bound *= 10;
    }
    let number = format!("{:0width$}", index, width = digits);
    let kind = name
        .find('(')
        .and_then(|open| {
            let rest = &name[open + 1..];
            rest.find(')').map(|close| &rest[..close])
        })
        .map(|inner| inner.split(':').next().unwrap_or(inner).trim())
        .filter(|s| !s.is_empty());
    match kind {
        Some(kind) => {
            let ext = APPLE_NAMES
                .iter()
                .find(|(apple, _)| *apple == kind)
                .map_or(kind, |(_, ext)| ext);
            format!("{}.{}", number, ext)
        }
        None if name.is_empty() => number,
        None => format!("{}_{}", number, name),
    }
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let size = ctx.size();
    if size < KOLY_SIZE {
        return Err(Error::NotThisFormat);
    }
    let mut koly = [0u8; KOLY_SIZE as usize];
    ctx.read_exact_at(0, &mut koly)?;
    let (header_pos, koly_first) = if koly.starts_with(KOLY) {
        (0, true)
    } else {
        ctx.read_exact_at(size - KOLY_SIZE, &mut koly)?;
        if !koly.starts_with(KOLY) {
            return Err(Error::NotThisFormat);
        }
        (size - KOLY_SIZE, false)
    };

    let data_fork = ForkPair::parse(&koly, 0x18);
    let rsrc_fork = ForkPair::parse(&koly, 0x28);
    let xml = ForkPair::parse(&koly, 0xD8);
    let blob = ForkPair::parse(&koly, 0x128);
    let master = Checksum::parse(&koly, 0x160);
    let sectors = be_u64(&koly, 0x1EC);

    let limit = if koly_first { size } else { header_pos };
    let mut top = 0;
    for pair in [data_fork, xml, rsrc_fork] {
        if !pair.update_top(limit, &mut top) {
            return Err(Error::NotThisFormat);
        }
    }
    // Old images carry garbage in the code signature pair.
    blob.update_top(limit, &mut top);

    let mut start = 0;
    let physical_size = if koly_first {
        top.max(KOLY_SIZE)
    } else if top != header_pos && !xml_at(ctx, xml.offset, xml.len)? {
        // Offsets are relative to an image embedded at `start`.
        start = header_pos - top;
        top + KOLY_SIZE
    } else {
        header_pos + KOLY_SIZE
    };
    let data_base = start + if koly_first { KOLY_SIZE } else { 0 };

    if xml.len == 0 {
        return Err(Error::UnsupportedFeature {
            feature: "disk image without an XML property list",
        });
    }
    let text = ctx.read_vec_at(start + xml.offset, xml.len)?;
    let root = plist::parse(&text).ok_or_else(|| Error::corrupt_header(start + xml.offset, "malformed property list"))?;
    let blkx = plist::blkx(&root).ok_or_else(|| Error::corrupt_header(start + xml.offset, "no resource-fork blkx array"))?;

    let mut info = ArchiveInfo::new(FormatKind::Dmg, physical_size);
    info.offset = start;
    log::debug!(
        "dmg: koly at {}, {} partitions, {} sectors",
        header_pos,
        blkx.len(),
        sectors
    );
    ctx.limits.check_items(blkx.len() as u64)?;

    let mut parsed = Parsed::new(info);
    let mut methods: Vec<&'static str> = Vec::new();
    let mut checksums = Vec::new();
    let count = blkx.len();
    for (index, entry) in blkx.into_iter().enumerate() {
        let name = entry.name.unwrap_or_default();
        let mut item = Item {
            name: item_name(index, count, &name),
            ..Item::new("")
        };
        let raw = entry.data.and_then(|data| {
            let cleaned: Vec<u8> = data.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD.decode(cleaned).ok()
        });
        let table = match raw.as_deref().map(|raw| (raw.len(), BlockTable::parse(raw))) {
            Some((len, Some(table))) if ctx.limits.check_header(len as u64).is_ok() => table,
            _ => {
                ctx.warn(format!("disk image partition {} has an unreadable block table", index));
                parsed.info.headers_error = true;
                item.flags.headers_error = true;
                checksums.push(None);
                parsed.push(item, ItemSource::Unavailable(ItemOutcome::HeadersError));
                continue;
            }
        };
        if !table.consistent {
            ctx.warn(format!("disk image partition {} has a broken chunk list", index));
            parsed.info.headers_error = true;
            item.flags.headers_error = true;
        }
        checksums.push(Some(table.checksum.clone()));

        item.size = Some(table.size);
        item.packed_size = table.packed_size();
        item.method = table.main_method();
        item.payload_offset = data_base + table.data_start;
        if let Some(crc) = table.checksum.crc32().filter(|_| table.full_checksum) {
            item.crc = Some(crc);
            item.crc_covers_item = true;
        }
        for chunk in &table.chunks {
            let name = chunk.method().name();
            if !methods.contains(&name) {
                methods.push(name);
            }
        }
        let source = match table.block_map(data_base) {
            Some(map) if map.size() == table.size => ItemSource::Blocks(map),
            _ => {
                item.flags.headers_error = true;
                parsed.info.headers_error = true;
                ItemSource::Unavailable(ItemOutcome::HeadersError)
            }
        };
        parsed.push(item, source);
    }

    if let Some(expected) = master.crc32() {
        let digest = checksums
            .iter()
            .map(|c| c.as_ref().and_then(Checksum::bytes))
            .collect::<Option<Vec<_>>>()
            .map(|parts| {
                let mut hasher = crc32fast::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize()
            });
        if digest.is_some_and(|actual| actual != expected) {
            ctx.warn("disk image master checksum mismatch");
            parsed.info.checksum_error = true;
        }
    }
    if !methods.is_empty() {
        parsed.info.method = Some(methods.join(" "));
    }
    Ok(parsed)
}

/// Whether the XML fork is found at its absolute offset.
fn xml_at(ctx: &mut ParseContext<'_>, offset: u64, len: u64) -> Result<bool> {
    if len < XML_PREFIX.len() as u64 {
        return Ok(false);
    }
    let mut buf = [0u8; XML_PREFIX.len()];
    match ctx.read_exact_at(offset, &mut buf) {
        Ok(()) => Ok(&buf[..] == XML_PREFIX),
        Err(Error::UnexpectedEnd { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

mod plist {
    //! Just enough XML to walk an Apple property list.

    const MAX_DEPTH: usize = 64;

    #[derive(Debug, Default)]
    pub(super) struct Node {
        pub tag: String,
        pub text: String,
        pub children: Vec<Node>,
    }

    impl Node {
        /// The value following `<key>key</key>` when it has tag `tag`.
        fn value(&self, key: &str, tag: &str) -> Option<&Node> {
            self.children
                .windows(2)
                .find(|w| w[0].tag == "key" && w[0].text.trim() == key && w[1].tag == tag)
                .map(|w| &w[1])
        }

        fn child(&self, tag: &str) -> Option<&Node> {
            self.children.iter().find(|c| c.tag == tag)
        }
    }

    /// One `blkx` dictionary.
    #[derive(Debug)]
    pub(super) struct Entry {
        pub name: Option<String>,
        pub data: Option<String>,
    }

    /// Lists the `resource-fork/blkx` dictionaries.
    pub(super) fn blkx(root: &Node) -> Option<Vec<Entry>> {
        if root.tag != "plist" {
            return None;
        }
        let array = root
            .child("dict")?
            .value("resource-fork", "dict")?
            .value("blkx", "array")?;
        Some(
            array
                .children
                .iter()
                .filter(|d| d.tag == "dict")
                .map(|d| Entry {
                    name: d
                        .value("Name", "string")
                        .filter(|n| !n.text.is_empty())
                        .or_else(|| d.value("CFName", "string"))
                        .map(|n| n.text.clone()),
                    data: d.value("Data", "data").map(|n| n.text.clone()),
                })
                .collect(),
        )
    }

    pub(super) fn parse(text: &[u8]) -> Option<Node> {
        let mut parser = Parser { s: text, pos: 0 };
        parser.skip_misc()?;
        parser.element(0)
    }

    struct Parser<'a> {
        s: &'a [u8],
        pos: usize,
    }

    impl Parser<'_> {
        fn starts(&self, prefix: &[u8]) -> bool {
            self.s[self.pos..].starts_with(prefix)
        }

        fn find(&self, needle: &[u8]) -> Option<usize> {
            self.s[self.pos..]
                .windows(needle.len())
                .position(|w| w == needle)
                .map(|i| self.pos + i)
        }

        fn skip_past(&mut self, needle: &[u8]) -> Option<()> {
            self.pos = self.find(needle)? + needle.len();
            Some(())
        }

        /// Skips whitespace, declarations, processing instructions and comments.
        fn skip_misc(&mut self) -> Option<()> {
            loop {
                while self.s.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
                    self.pos += 1;
                }
                if self.starts(b"<?") {
                    self.skip_past(b"?>")?;
                } else if self.starts(b"<!--") {
                    self.skip_past(b"-->")?;
                } else if self.starts(b"<!") {
                    self.skip_past(b">")?;
                } else {
                    return Some(());
                }
            }
        }

        fn element(&mut self, depth: usize) -> Option<Node> {
            if depth > MAX_DEPTH || !self.starts(b"<") {
                return None;
            }
            let close = self.find(b">")?;
            let inner = &self.s[self.pos + 1..close];
            let self_closing = inner.ends_with(b"/");
            let tag_end = inner
                .iter()
                .position(|b| b.is_ascii_whitespace() || *b == b'/')
                .unwrap_or(inner.len());
            let mut node = Node {
                tag: String::from_utf8_lossy(&inner[..tag_end]).into_owned(),
                ..Node::default()
            };
            if node.tag.is_empty() {
                return None;
            }
            self.pos = close + 1;
            if self_closing {
                return Some(node);
            }
            loop {
                let lt = self.find(b"<")?;
                node.text.push_str(&unescape(&self.s[self.pos..lt]));
                self.pos = lt;
                if self.starts(b"</") {
                    let gt = self.find(b">")?;
                    if self.s[self.pos + 2..gt].trim_ascii() != node.tag.as_bytes() {
                        return None;
                    }
                    self.pos = gt + 1;
                    return Some(node);
                } else if self.starts(b"<![CDATA[") {
                    let start = self.pos + 9;
                    let end = self.find(b"]]>")?;
                    node.text.push_str(&String::from_utf8_lossy(&self.s[start..end]));
                    self.pos = end + 3;
                } else if self.starts(b"<!--") {
                    self.skip_past(b"-->")?;
                } else if self.starts(b"<?") {
                    self.skip_past(b"?>")?;
                } else {
                    node.children.push(self.element(depth + 1)?);
                }
            }
        }
    }

    fn unescape(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        if !text.contains('&') {
            return text.into_owned();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = &*text;
        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            rest = &rest[amp..];
            let Some(semi) = rest.find(';') else { break };
            let entity = &rest[1..semi];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                    .and_then(|n| n.ok())
                    .and_then(char::from_u32),
            };
            match decoded {
                Some(c) => {
                    out.push(c);
                    rest = &rest[semi + 1..];
                }
                None => {
                    out.push('&');
                    rest = &rest[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_nested_plist() {
            let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "x">
<plist version="1.0">
<dict>
  <!-- comment -->
  <key>resource-fork</key>
  <dict>
    <key>blkx</key>
    <array>
      <dict>
        <key>Name</key><string>disk image (Apple_HFS : 1)</string>
        <key>Data</key><data>
          bWlzaA==
        </data>
      </dict>
      <dict>
        <key>Name</key><string></string>
        <key>CFName</key><string>a &amp; b</string>
        <key>Attributes</key><string>0x0050</string>
        <key>empty</key><true/>
      </dict>
    </array>
  </dict>
</dict>
</plist>"#;
            let root = parse(xml).unwrap();
            let entries = blkx(&root).unwrap();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].name.as_deref(), Some("disk image (Apple_HFS : 1)"));
            assert_eq!(entries[0].data.as_deref().map(str::trim), Some("bWlzaA=="));
            assert_eq!(entries[1].name.as_deref(), Some("a & b"));
            assert!(entries[1].data.is_none());
        }

        #[test]
        fn test_mismatched_tags() {
            assert!(parse(b"<plist><dict></array></plist>").is_none());
            assert!(parse(b"<plist><dict>").is_none());
        }

        #[test]
        fn test_unescape() {
            assert_eq!(unescape(b"&lt;x&gt; &#65;&#x42; &bogus; &"), "<x> AB &bogus; &");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::cache::{BlockCache, CacheConfig};
    use crate::format::testing::{parse_with, probe_with};

    /// One chunk: type, sector count and the packed bytes.
    pub(crate) struct TestChunk {
        pub kind: u32,
        pub sectors: u64,
        pub packed: Vec<u8>,
    }

    pub(crate) fn mish(chunks: &[TestChunk], first_pack: u64, crc: Option<u32>) -> Vec<u8> {
        let total: u64 = chunks.iter().map(|c| c.sectors).sum();
        let mut p = vec![0u8; MISH_HEAD];
        p[0..4].copy_from_slice(&MISH.to_be_bytes());
        p[4..8].copy_from_slice(&1u32.to_be_bytes());
        p[0x10..0x18].copy_from_slice(&total.to_be_bytes());
        if let Some(crc) = crc {
            p[0x40..0x44].copy_from_slice(&CHECKSUM_CRC32.to_be_bytes());
            p[0x44..0x48].copy_from_slice(&32u32.to_be_bytes());
            p[0x48..0x4C].copy_from_slice(&crc.to_be_bytes());
        }
        p[0xC8..0xCC].copy_from_slice(&(chunks.len() as u32 + 1).to_be_bytes());
        let mut sector = 0u64;
        let mut pack = first_pack;
        for c in chunks {
            let mut raw = [0u8; CHUNK_SIZE];
            raw[0..4].copy_from_slice(&c.kind.to_be_bytes());
            raw[0x08..0x10].copy_from_slice(&sector.to_be_bytes());
            raw[0x10..0x18].copy_from_slice(&c.sectors.to_be_bytes());
            raw[0x18..0x20].copy_from_slice(&pack.to_be_bytes());
            raw[0x20..0x28].copy_from_slice(&(c.packed.len() as u64).to_be_bytes());
            p.extend_from_slice(&raw);
            sector += c.sectors;
            pack += c.packed.len() as u64;
        }
        let mut end = [0u8; CHUNK_SIZE];
        end[0..4].copy_from_slice(&CHUNK_END.to_be_bytes());
        end[0x08..0x10].copy_from_slice(&sector.to_be_bytes());
        p.extend_from_slice(&end);
        p
    }

    /// Builds an image with one partition per `(name, chunks, crc)` entry.
    pub(crate) fn build(partitions: &[(&str, Vec<TestChunk>, Option<u32>)]) -> Vec<u8> {
        let mut img = Vec::new();
        let mut dicts = String::new();
        for (name, chunks, crc) in partitions {
            let table = mish(chunks, img.len() as u64, *crc);
            for c in chunks {
                img.extend_from_slice(&c.packed);
            }
            dicts.push_str(&format!(
                "<dict><key>Name</key><string>{}</string><key>Data</key><data>\n{}\n</data></dict>\n",
                name,
                base64::engine::general_purpose::STANDARD.encode(table)
            ));
        }
        let data_len = img.len() as u64;
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\"><dict>\
             <key>resource-fork</key><dict><key>blkx</key><array>\n{}</array></dict></dict></plist>\n",
            dicts
        );
        let xml_offset = img.len() as u64;
        img.extend_from_slice(xml.as_bytes());

        let mut koly = vec![0u8; KOLY_SIZE as usize];
        koly[..12].copy_from_slice(KOLY);
        koly[0x18..0x20].copy_from_slice(&0u64.to_be_bytes());
        koly[0x20..0x28].copy_from_slice(&data_len.to_be_bytes());
        koly[0xD8..0xE0].copy_from_slice(&xml_offset.to_be_bytes());
        koly[0xE0..0xE8].copy_from_slice(&(xml.len() as u64).to_be_bytes());
        let crcs: Vec<u8> = partitions
            .iter()
            .flat_map(|(_, _, crc)| crc.unwrap_or(0).to_be_bytes())
            .collect();
        if partitions.iter().all(|(_, _, crc)| crc.is_some()) {
            koly[0x160..0x164].copy_from_slice(&CHECKSUM_CRC32.to_be_bytes());
            koly[0x164..0x168].copy_from_slice(&32u32.to_be_bytes());
            koly[0x168..0x16C].copy_from_slice(&crc32fast::hash(&crcs).to_be_bytes());
        }
        img.extend_from_slice(&koly);
        img
    }

    fn extract(img: &[u8], source: &ItemSource) -> crate::Result<Vec<u8>> {
        let ItemSource::Blocks(map) = source else {
            panic!("partition has no block map");
        };
        let mut out = Vec::new();
        BlockCache::new(CacheConfig::default()).copy_item(
            &mut Cursor::new(img.to_vec()),
            0,
            map,
            &mut out,
            |_| Ok(()),
        )?;
        Ok(out)
    }

    fn raw_and_zero() -> (Vec<TestChunk>, Vec<u8>) {
        let raw: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        let mut expected = raw.clone();
        expected.extend(vec![0u8; 512]);
        let chunks = vec![
            TestChunk {
                kind: CHUNK_COMMENT,
                sectors: 0,
                packed: Vec::new(),
            },
            TestChunk {
                kind: CHUNK_RAW,
                sectors: 2,
                packed: raw,
            },
            TestChunk {
                kind: CHUNK_ZERO,
                sectors: 1,
                packed: Vec::new(),
            },
        ];
        (chunks, expected)
    }

    #[test]
    fn test_probe() {
        let (chunks, expected) = raw_and_zero();
        let img = build(&[("whole disk (Apple_HFS : 0)", chunks, Some(crc32fast::hash(&expected)))]);
        assert_eq!(probe_with(probe, &img), Probe::Match);
        assert_eq!(probe_with(probe, b"koly"), Probe::NeedMoreBytes(512));
        assert_eq!(probe_with(probe, &[0u8; 600]), Probe::NotThisFormat);
    }

    #[test]
    fn test_partition_names() {
        assert_eq!(item_name(0, 3, "disk image (Apple_HFS : 2)"), "0.hfs");
        assert_eq!(item_name(3, 12, "Protective Master Boot Record (MBR : 0)"), "03.MBR");
        assert_eq!(item_name(1, 2, "plain"), "1_plain");
        assert_eq!(item_name(1, 2, ""), "1");
    }

    #[test]
    fn test_raw_and_zero_chunks() {
        let (chunks, expected) = raw_and_zero();
        let crc = crc32fast::hash(&expected);
        let img = build(&[("whole disk (Apple_HFS : 0)", chunks, Some(crc))]);
        let parsed = parse_with(parse, &img, None).unwrap();
        assert!(!parsed.info.headers_error);
        assert!(!parsed.info.checksum_error);
        assert_eq!(parsed.info.physical_size, img.len() as u64);
        let item = &parsed.items[0];
        assert_eq!(item.name, "0.hfs");
        assert_eq!(item.size, Some(1536));
        assert_eq!(item.packed_size, 1024);
        assert_eq!(item.crc, Some(crc));
        assert_eq!(item.method, Method::Copy);
        assert_eq!(extract(&img, &parsed.sources[0]).unwrap(), expected);
    }

    #[test]
    fn test_master_checksum_mismatch_is_warning() {
        let (chunks, expected) = raw_and_zero();
        let mut img = build(&[("disk", chunks, Some(crc32fast::hash(&expected)))]);
        let at = img.len() - KOLY_SIZE as usize + 0x168;
        img[at] ^= 0xFF;
        let parsed = parse_with(parse, &img, None).unwrap();
        assert!(parsed.info.checksum_error);
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn test_unsupported_chunk_method() {
        let chunks = vec![TestChunk {
            kind: CHUNK_ADC,
            sectors: 1,
            packed: vec![0x80, 0x00],
        }];
        let img = build(&[("adc", chunks, None)]);
        let parsed = parse_with(parse, &img, None).unwrap();
        assert_eq!(parsed.items[0].method, Method::Adc);
        let err = extract(&img, &parsed.sources[0]).unwrap_err();
        assert_eq!(err.outcome(), Some(ItemOutcome::UnsupportedMethod));
    }

    #[test]
    fn test_chunk_gap_sets_headers_error() {
        let (chunks, expected) = raw_and_zero();
        let mut table = mish(&chunks, 0, None);
        // Move the zero chunk two sectors further.
        let at = MISH_HEAD + 2 * CHUNK_SIZE + 0x08;
        table[at..at + 8].copy_from_slice(&4u64.to_be_bytes());
        let parsed = BlockTable::parse(&table).unwrap();
        assert!(!parsed.consistent);
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.size, 1024);
        assert_eq!(expected.len(), 1536);
    }

    #[test]
    fn test_bad_table_keeps_placeholder() {
        let (chunks, expected) = raw_and_zero();
        let good = build(&[("disk", chunks, Some(crc32fast::hash(&expected)))]);
        let start = good.windows(6).position(|w| w == b"<data>").unwrap() + "<data>\n".len();
        let mut img = good.clone();
        // Corrupt the base64 "mish" signature.
        img[start] = b'Z';
        img[start + 1] = b'Z';
        let parsed = parse_with(parse, &img, None).unwrap();
        assert!(parsed.info.headers_error);
        assert!(matches!(
            parsed.sources[0],
            ItemSource::Unavailable(ItemOutcome::HeadersError)
        ));
    }

    #[test]
    fn test_missing_trailer() {
        let err = parse_with(parse, &[0u8; 1024], None).unwrap_err();
        assert!(matches!(err, Error::NotThisFormat));
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_zlib_chunk() {
        use std::io::Write;

        let plain: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&plain).unwrap();
        let chunks = vec![TestChunk {
            kind: CHUNK_ZLIB,
            sectors: 4,
            packed: enc.finish().unwrap(),
        }];
        let img = build(&[("zlib", chunks, Some(crc32fast::hash(&plain)))]);
        let parsed = parse_with(parse, &img, None).unwrap();
        assert_eq!(parsed.items[0].method, Method::Zlib);
        assert_eq!(parsed.info.method.as_deref(), Some("Zlib"));
        assert_eq!(extract(&img, &parsed.sources[0]).unwrap(), plain);
    }
}
