//! PyInstaller CArchive overlays appended to frozen executables.
//!
//! The archive ends with a cookie holding the package length and the
//! position of a table of contents; every TOC entry names one embedded
//! file, stored or zlib compressed.

use crate::codec::Method;
use crate::format::bytes::{be_u32, lossy, trim_nul};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::Item;
use crate::read::ItemOutcome;
use crate::{Error, Result};

const MAGIC: &[u8; 8] = b"MEI\x0C\x0B\x0A\x0B\x0E";
const COOKIE_V20: u64 = 24;
const COOKIE_V21: u64 = 88;
/// Bytes before the end of the stream searched for the cookie.
const SEARCH_WINDOW: u64 = 4096 + COOKIE_V21;
const ENTRY_HEADER: usize = 18;

const FLAG_STORED: u8 = 0;
const FLAG_ZLIB: u8 = 1;
const FLAG_ENCRYPTED: u8 = 2;

fn find_magic(window: &[u8]) -> Option<usize> {
    window.windows(MAGIC.len()).rposition(|w| w == MAGIC)
}

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    let window = input.tail.len().min(SEARCH_WINDOW as usize);
    if find_magic(&input.tail[input.tail.len() - window..]).is_some() {
        Probe::Match
    } else {
        Probe::NotThisFormat
    }
}

#[derive(Debug)]
struct Cookie {
    position: u64,
    len: u64,
    package_len: u64,
    toc_offset: u64,
    toc_len: u64,
    python: u32,
    library: Option<String>,
}

impl Cookie {
    fn end(&self) -> u64 {
        self.position + self.len
    }

    fn python_version(&self) -> String {
        let (major, minor) = if self.python >= 100 {
            (self.python / 100, self.python % 100)
        } else {
            (self.python / 10, self.python % 10)
        };
        format!("{}.{}", major, minor)
    }
}

fn read_cookie(ctx: &mut ParseContext<'_>) -> Result<Cookie> {
    let size = ctx.size();
    let start = size.saturating_sub(SEARCH_WINDOW);
    let window = ctx.read_up_to(start, SEARCH_WINDOW)?;
    let found = find_magic(&window).ok_or(Error::NotThisFormat)?;
    let position = start + found as u64;
    let raw = &window[found..];
    if (raw.len() as u64) < COOKIE_V20 {
        return Err(Error::NotThisFormat);
    }

    let library = raw
        .get(COOKIE_V20 as usize..COOKIE_V21 as usize)
        .filter(|lib| lib.windows(6).any(|w| w == b"python"));
    Ok(Cookie {
        position,
        len: if library.is_some() { COOKIE_V21 } else { COOKIE_V20 },
        package_len: u64::from(be_u32(raw, 8)),
        toc_offset: u64::from(be_u32(raw, 12)),
        toc_len: u64::from(be_u32(raw, 16)),
        python: be_u32(raw, 20),
        library: library.map(|lib| lossy(trim_nul(lib))),
    })
}

/// Appends `.pyc` to compiled module entries.
fn entry_name(raw: &[u8], kind: u8, index: usize) -> String {
    let mut name: String = lossy(raw).chars().filter(|&c| c != '\0').collect();
    if let Some(stripped) = name.strip_prefix('/') {
        name = stripped.to_string();
    }
    if name.is_empty() {
        name = format!("[{}]", index);
    }
    if matches!(kind, b's' | b'M' | b'm') {
        name.push_str(".pyc");
    }
    name
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let size = ctx.size();
    let cookie = read_cookie(ctx)?;
    if cookie.toc_len > size || cookie.package_len > cookie.end() {
        return Err(Error::NotThisFormat);
    }
    let overlay = cookie.end() - cookie.package_len;
    let toc_end = cookie
        .toc_offset
        .checked_add(cookie.toc_len)
        .filter(|&end| overlay + end <= cookie.position)
        .ok_or(Error::NotThisFormat)?;
    let toc = ctx.read_vec_at(overlay + cookie.toc_offset, cookie.toc_len)?;

    let mut info = ArchiveInfo::new(FormatKind::PyInstaller, cookie.end());
    info.offset = overlay;
    info.subtype = Some(if cookie.len == COOKIE_V21 { "2.1" } else { "2.0" }.to_string());
    info.comment = Some(match &cookie.library {
        Some(lib) => format!("Python {} ({})", cookie.python_version(), lib),
        None => format!("Python {}", cookie.python_version()),
    });
    log::debug!(
        "pyinstaller: overlay at {}, toc {}..{}, {}",
        overlay,
        cookie.toc_offset,
        toc_end,
        info.comment.as_deref().unwrap_or_default()
    );

    let mut parsed = Parsed::new(info);
    let mut pos = 0usize;
    while pos < toc.len() {
        let rest = &toc[pos..];
        let entry_len = if rest.len() >= ENTRY_HEADER {
            be_u32(rest, 0) as usize
        } else {
            0
        };
        if entry_len < ENTRY_HEADER || entry_len > rest.len() {
            ctx.warn(format!("PyInstaller TOC entry at {} is malformed", pos));
            parsed.info.headers_error = true;
            break;
        }
        ctx.limits.check_items(parsed.items.len() as u64 + 1)?;
        let entry = &rest[..entry_len];
        let offset = u64::from(be_u32(entry, 4));
        let packed = u64::from(be_u32(entry, 8));
        let unpacked = u64::from(be_u32(entry, 12));
        let flag = entry[16];
        let kind = entry[17];
        let index = parsed.items.len();

        let mut item = Item {
            header_offset: overlay + cookie.toc_offset + pos as u64,
            payload_offset: overlay + offset,
            packed_size: packed,
            size: Some(unpacked),
            method: if flag == FLAG_ZLIB { Method::Zlib } else { Method::Copy },
            ..Item::new(entry_name(&entry[ENTRY_HEADER..], kind, index))
        };
        item.flags.encrypted = flag == FLAG_ENCRYPTED;
        let in_range = offset
            .checked_add(packed)
            .is_some_and(|end| overlay + end <= cookie.position);
        let source = if !in_range {
            item.flags.headers_error = true;
            parsed.info.headers_error = true;
            ItemSource::Unavailable(ItemOutcome::HeadersError)
        } else {
            match flag {
                FLAG_STORED if packed == 0 => ItemSource::Empty,
                FLAG_STORED => ItemSource::stored(overlay + offset, packed),
                FLAG_ZLIB => ItemSource::packed(overlay + offset, packed, Method::Zlib),
                other => {
                    parsed.info.encrypted |= other == FLAG_ENCRYPTED;
                    ItemSource::packed(overlay + offset, packed, Method::Unknown(u32::from(other)))
                }
            }
        };
        parsed.push(item, source);
        pos += entry_len;
    }
    Ok(parsed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::testing::{parse_with, probe_with};

    /// One TOC entry: name, type character, compress flag, stored bytes
    /// and declared uncompressed size.
    pub(crate) struct TestEntry<'a> {
        pub name: &'a str,
        pub kind: u8,
        pub flag: u8,
        pub data: Vec<u8>,
        pub size: u32,
    }

    /// Builds `stub` followed by a 2.1 CArchive holding `entries`.
    pub(crate) fn build(stub: &[u8], entries: &[TestEntry<'_>]) -> Vec<u8> {
        let mut package = Vec::new();
        let mut toc = Vec::new();
        for e in entries {
            let offset = package.len() as u32;
            package.extend_from_slice(&e.data);
            let mut name = e.name.as_bytes().to_vec();
            name.resize((name.len() + 1).next_multiple_of(16), 0);
            let len = (ENTRY_HEADER + name.len()) as u32;
            toc.extend_from_slice(&len.to_be_bytes());
            toc.extend_from_slice(&offset.to_be_bytes());
            toc.extend_from_slice(&(e.data.len() as u32).to_be_bytes());
            toc.extend_from_slice(&e.size.to_be_bytes());
            toc.push(e.flag);
            toc.push(e.kind);
            toc.extend_from_slice(&name);
        }
        let toc_offset = package.len() as u32;
        package.extend_from_slice(&toc);
        let package_len = package.len() as u32 + COOKIE_V21 as u32;

        let mut img = stub.to_vec();
        img.extend_from_slice(&package);
        img.extend_from_slice(MAGIC);
        img.extend_from_slice(&package_len.to_be_bytes());
        img.extend_from_slice(&toc_offset.to_be_bytes());
        img.extend_from_slice(&(toc.len() as u32).to_be_bytes());
        img.extend_from_slice(&311u32.to_be_bytes());
        let mut lib = b"libpython3.11.so.1.0".to_vec();
        lib.resize(64, 0);
        img.extend_from_slice(&lib);
        img
    }

    fn sample() -> Vec<u8> {
        build(
            b"MZ fake executable stub",
            &[
                TestEntry {
                    name: "/main",
                    kind: b's',
                    flag: FLAG_STORED,
                    data: b"print(1)".to_vec(),
                    size: 8,
                },
                TestEntry {
                    name: "data/readme.txt",
                    kind: b'x',
                    flag: FLAG_STORED,
                    data: b"hello".to_vec(),
                    size: 5,
                },
                TestEntry {
                    name: "",
                    kind: b'b',
                    flag: FLAG_STORED,
                    data: Vec::new(),
                    size: 0,
                },
            ],
        )
    }

    #[test]
    fn test_probe() {
        assert_eq!(probe_with(probe, &sample()), Probe::Match);
        assert_eq!(probe_with(probe, &[0u8; 200]), Probe::NotThisFormat);
    }

    #[test]
    fn test_toc_entries() {
        let img = sample();
        let parsed = parse_with(parse, &img, None).unwrap();
        let names: Vec<_> = parsed.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["main.pyc", "data/readme.txt", "[2]"]);
        assert_eq!(parsed.info.offset, 23);
        assert_eq!(parsed.info.physical_size, img.len() as u64);
        assert_eq!(parsed.info.subtype.as_deref(), Some("2.1"));
        assert!(parsed.info.comment.as_deref().unwrap().starts_with("Python 3.11"));
        let readme = &parsed.items[1];
        assert_eq!(readme.payload_offset, 23 + 8);
        let start = readme.payload_offset as usize;
        assert_eq!(&img[start..start + 5], b"hello");
        assert!(matches!(parsed.sources[2], ItemSource::Empty));
    }

    #[test]
    fn test_entry_out_of_range() {
        let mut img = sample();
        let toc_at = img.len() - COOKIE_V21 as usize - 3 * 34;
        // Point the first entry's offset far past the package.
        img[toc_at + 4..toc_at + 8].copy_from_slice(&0x00FF_0000u32.to_be_bytes());
        let parsed = parse_with(parse, &img, None).unwrap();
        assert!(parsed.info.headers_error);
        assert!(matches!(
            parsed.sources[0],
            ItemSource::Unavailable(ItemOutcome::HeadersError)
        ));
        assert_eq!(parsed.items.len(), 3);
    }

    #[test]
    fn test_cookie_past_start_rejected() {
        let mut img = sample();
        let at = img.len() - COOKIE_V21 as usize + 8;
        img[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(parse_with(parse, &img, None), Err(Error::NotThisFormat)));
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_zlib_entry() {
        use std::io::Write;

        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"zlib payload").unwrap();
        let img = build(
            b"",
            &[TestEntry {
                name: "packed.bin",
                kind: b'b',
                flag: FLAG_ZLIB,
                data: enc.finish().unwrap(),
                size: 12,
            }],
        );
        let parsed = parse_with(parse, &img, None).unwrap();
        assert_eq!(parsed.items[0].method, Method::Zlib);
        assert!(matches!(
            &parsed.sources[0],
            ItemSource::Range { method: Method::Zlib, .. }
        ));
    }
}
