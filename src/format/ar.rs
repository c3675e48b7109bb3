//! Unix `ar` archives: static libraries (GNU, BSD, Microsoft) and `.deb`.
//!
//! Members are 60-byte text headers followed by data padded to two bytes.
//! Long names live either in a GNU `//` member (referenced as `/N`) or,
//! BSD style, right after the header (`#1/N`). The archive symbol tables
//! (`/`, `__.SYMDEF`) are replaced by readable `1.txt` / `2.txt` listings.

use crate::format::bytes::{ByteOrder, be_u32, le_u16, le_u32};
use crate::format::{ArchiveInfo, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput};
use crate::item::{Item, ItemTable};
use crate::{Error, Result};

pub(crate) const SIGNATURE: &[u8; 8] = b"!<arch>\n";
const HEADER_SIZE: usize = 60;
const MAX_BSD_NAME: u64 = 1 << 12;
const MAX_TABLE_SIZE: u64 = 1 << 30;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    Probe::signature(input.head, SIGNATURE)
}

#[derive(Debug)]
struct Member {
    name: String,
    header_pos: u64,
    data_pos: u64,
    size: u64,
    mtime: u64,
    uid: u64,
    gid: u64,
    mode: u64,
}

/// Parses a right-trimmed numeric field; empty and `-1` read as 0.
fn number(field: &[u8], radix: u32) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?.trim_end_matches(' ');
    if text.is_empty() || text == "-1" {
        return Some(0);
    }
    if !text.bytes().all(|b| (b as char).is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(text, radix).ok()
}

enum Next {
    Member(Member),
    End,
    BadHeader,
}

fn read_member(ctx: &mut ParseContext<'_>, pos: u64) -> Result<Next> {
    let mut header = [0u8; HEADER_SIZE];
    match ctx.read_exact_at(pos, &mut header) {
        Ok(()) => {}
        Err(Error::UnexpectedEnd { .. }) => return Ok(Next::End),
        Err(e) => return Err(e),
    }
    if header[58] != 0x60 || header[59] != 0x0A || header[..58].contains(&0) {
        return Ok(Next::End);
    }

    let fields = (
        number(&header[16..28], 10),
        number(&header[28..34], 10),
        number(&header[34..40], 10),
        number(&header[40..48], 8),
        number(&header[48..58], 10),
    );
    let (Some(mtime), Some(uid), Some(gid), Some(mode), Some(mut size)) = fields else {
        return Ok(Next::BadHeader);
    };

    let mut data_pos = pos + HEADER_SIZE as u64;
    let raw = &header[..16];
    let name = if raw.starts_with(b"#1/") && raw[3] != b' ' {
        let Some(len) = number(&raw[3..], 10) else {
            return Ok(Next::BadHeader);
        };
        if len != 0 && len < MAX_BSD_NAME && len <= size {
            let bytes = match ctx.read_vec_at(data_pos, len) {
                Ok(bytes) => bytes,
                Err(Error::UnexpectedEnd { .. }) => return Ok(Next::End),
                Err(e) => return Err(e),
            };
            size -= len;
            data_pos += len;
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        } else {
            trimmed_name(raw)
        }
    } else {
        trimmed_name(raw)
    };

    Ok(Next::Member(Member {
        name,
        header_pos: pos,
        data_pos,
        size,
        mtime,
        uid,
        gid,
        mode,
    }))
}

fn trimmed_name(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn is_reference(name: &str) -> bool {
    name.len() > 1 && name.starts_with('/') && name[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Strips the GNU `/` terminator from a member name.
fn display_name(name: &str) -> &str {
    if name == "/" || name == "//" || is_reference(name) {
        return name;
    }
    name.strip_suffix('/').unwrap_or(name)
}

/// Resolves `/N` names against the `//` table. Returns `false` when a name
/// runs off the end of the table.
fn resolve_long_names(members: &mut [Member], table: &[u8]) -> bool {
    for member in members.iter_mut() {
        if !is_reference(&member.name) {
            continue;
        }
        let Ok(start) = member.name[1..].parse::<usize>() else {
            continue;
        };
        if start >= table.len() {
            continue;
        }
        let Some(len) = table[start..].iter().position(|&b| b == 0 || b == b'\n') else {
            return false;
        };
        let resolved = String::from_utf8_lossy(&table[start..start + len]).into_owned();
        member.name = display_name(&resolved).to_string();
    }
    true
}

/// Prefixes runs of equal adjacent names with `1.`, `2.`, ...
fn disambiguate(members: &mut [Member]) {
    let mut index = vec![0u32; members.len()];
    for i in 1..members.len() {
        if members[i].name.starts_with('/') {
            continue;
        }
        if members[i].name == members[i - 1].name {
            if index[i - 1] == 0 {
                index[i - 1] = 1;
            }
            index[i] = index[i - 1] + 1;
        }
    }
    for (member, n) in members.iter_mut().zip(index) {
        if n != 0 {
            member.name = format!("{}.{}", n, member.name);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Library {
    Gnu,
    Bsd,
    Microsoft,
}

struct SymbolListing<'a> {
    table: &'a ItemTable,
    index: crate::item::OffsetIndex,
    text: String,
}

impl SymbolListing<'_> {
    /// Appends one `member<TAB>symbol` line; `pos` advances past the NUL.
    fn add(&mut self, offset: u64, names: &[u8], pos: &mut usize) -> bool {
        let Some(member) = self.index.find(offset) else {
            return false;
        };
        let start = *pos;
        let Some(len) = names.get(start..).and_then(|rest| rest.iter().position(|&b| b == 0))
        else {
            return false;
        };
        self.text.push_str(&self.table[member].name);
        self.text.push('\t');
        self.text
            .push_str(&String::from_utf8_lossy(&names[start..start + len]));
        self.text.push('\n');
        *pos = start + len + 1;
        true
    }
}

/// Parses one symbol table member into its text listing.
fn parse_symbols(
    table: &ItemTable,
    name: &str,
    data: &[u8],
    second_linker: bool,
) -> Option<(String, Library)> {
    let size = data.len();
    if size < 4 {
        return None;
    }
    let mut listing = SymbolListing {
        table,
        index: table.offset_index(),
        text: String::new(),
    };

    let (pos, kind) = if name != "/" {
        let mut found = None;
        for order in [ByteOrder::Little, ByteOrder::Big] {
            listing.text.clear();
            let table_size = order.u32(data, 0) as usize;
            if size - 4 < table_size || table_size & 7 != 0 {
                continue;
            }
            let names_start = 4 + table_size;
            if names_start + 4 > size {
                continue;
            }
            let names_size = order.u32(data, names_start) as usize;
            let names_start = names_start + 4;
            if names_start.checked_add(names_size) != Some(size) {
                continue;
            }
            let names = &data[names_start..];
            let all = (0..table_size / 8).all(|i| {
                let entry = 4 + i * 8;
                let mut name_pos = order.u32(data, entry) as usize;
                let offset = order.u32(data, entry + 4) as u64;
                listing.add(offset, names, &mut name_pos)
            });
            if all {
                found = Some((size, Library::Bsd));
                break;
            }
        }
        found?
    } else if !second_linker {
        let count = be_u32(data, 0) as usize;
        if count > (size - 4) / 4 {
            return None;
        }
        let mut pos = 4 + 4 * count;
        for i in 0..count {
            let offset = be_u32(data, 4 + i * 4) as u64;
            if !listing.add(offset, data, &mut pos) {
                return None;
            }
        }
        (pos, Library::Gnu)
    } else {
        let members = le_u32(data, 0) as usize;
        if members > (size - 4) / 4 {
            return None;
        }
        let mut pos = 4 + 4 * members;
        if size - pos < 4 {
            return None;
        }
        let count = le_u32(data, pos) as usize;
        pos += 4;
        if count > (size - pos) / 2 {
            return None;
        }
        let indices = pos;
        pos += 2 * count;
        for i in 0..count {
            let member = le_u16(data, indices + i * 2) as usize;
            if member == 0 || member > members {
                return None;
            }
            let offset = le_u32(data, member * 4) as u64;
            if !listing.add(offset, data, &mut pos) {
                return None;
            }
        }
        (pos, Library::Microsoft)
    };

    if pos != size && pos + (pos & 1) != size {
        return None;
    }
    Some((listing.text, kind))
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let size = ctx.size();
    let mut signature = [0u8; 8];
    match ctx.read_exact_at(0, &mut signature) {
        Ok(()) => {}
        Err(Error::UnexpectedEnd { .. }) => return Err(Error::NotThisFormat),
        Err(e) => return Err(e),
    }
    if &signature != SIGNATURE {
        return Err(Error::NotThisFormat);
    }

    let mut info = ArchiveInfo::new(FormatKind::Ar, size);
    let mut members = Vec::new();
    let mut pos = SIGNATURE.len() as u64;
    loop {
        match read_member(ctx, pos)? {
            Next::Member(member) => {
                ctx.limits.check_items(members.len() as u64 + 1)?;
                let end = member.data_pos.saturating_add(member.size);
                let padded = end.saturating_add(member.size & 1);
                members.push(member);
                if end > size {
                    info.unexpected_end = true;
                    pos = end;
                    break;
                }
                pos = padded.min(size);
            }
            Next::End => break,
            Next::BadHeader => {
                info.headers_error = true;
                break;
            }
        }
    }

    if members.is_empty() && pos != size {
        return Err(Error::NotThisFormat);
    }
    info.physical_size = pos;

    for member in members.iter_mut() {
        member.name = display_name(&member.name).to_string();
    }

    if let Some(table_index) = members.iter().position(|m| m.name == "//") {
        let table_member = &members[table_index];
        let resolved = if table_member.size > MAX_TABLE_SIZE
            || table_member.data_pos + table_member.size > size
        {
            false
        } else {
            let table = ctx.read_vec_at(table_member.data_pos, table_member.size)?;
            resolve_long_names(&mut members, &table)
        };
        if resolved {
            members.remove(table_index);
        } else {
            ctx.warn("long file names parsing error");
        }
    }

    let is_deb = members.first().is_some_and(|m| m.name == "debian-binary");
    if is_deb {
        info.subtype = Some("deb".into());
    } else {
        disambiguate(&mut members);
    }

    let mut parsed = Parsed::new(info);
    for member in &members {
        ctx.limits.check_name(member.name.len() as u64)?;
        let item = Item {
            header_offset: member.header_pos,
            payload_offset: member.data_pos,
            packed_size: member.size,
            size: Some(member.size),
            mtime: (member.mtime != 0).then_some(member.mtime as i64),
            uid: Some(member.uid as u32),
            gid: Some(member.gid as u32),
            mode: Some(member.mode as u32),
            ..Item::new(member.name.clone())
        };
        parsed.push(item, ItemSource::stored(member.data_pos, member.size));
    }

    if !is_deb {
        let mut listings = 0usize;
        let mut kind = None;
        let mut error = false;
        for li in 0..members.len().min(2) {
            let member = &members[li];
            if member.name != "/" && member.name != "__.SYMDEF" && member.name != "__.SYMDEF SORTED"
            {
                continue;
            }
            if member.size > MAX_TABLE_SIZE
                || member.size < 4
                || member.data_pos + member.size > size
            {
                continue;
            }
            let data = ctx.read_vec_at(member.data_pos, member.size)?;
            match parse_symbols(&parsed.items, &member.name, &data, listings > 0) {
                Some((text, library)) => {
                    listings += 1;
                    kind = Some(library);
                    let name = if listings == 1 { "1.txt" } else { "2.txt" };
                    log::debug!("ar symbol table {:?} -> {}", member.name, name);
                    if let Some(item) = parsed.items.get_mut(li) {
                        item.name = name.to_string();
                        item.size = Some(text.len() as u64);
                        item.mode = None;
                    }
                    parsed.sources[li] = ItemSource::Bytes(text.into_bytes());
                }
                None => error = true,
            }
        }
        if error {
            ctx.warn("library symbols information error");
        }
        parsed.info.subtype = match kind {
            Some(Library::Gnu) => Some("a".into()),
            Some(Library::Bsd) => Some("a:BSD".into()),
            Some(Library::Microsoft) => Some("lib".into()),
            None => None,
        };
    }

    log::debug!(
        "ar: {} members, physical size {}",
        parsed.items.len(),
        parsed.info.physical_size
    );
    Ok(parsed)
}
