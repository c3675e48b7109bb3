//! Microsoft cabinet files, including multi-volume sets.
//!
//! A cabinet holds folders (compressed streams) made of data blocks, and
//! files that are slices of a folder's decoded stream. A folder may run on
//! into the next cabinet of a set; such folders are merged into one global
//! folder whose block list spans several volumes. Folders decode strictly
//! sequentially, which [`FolderCursor`] implements for the extraction
//! pipeline.

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use crate::codec::Method;
#[cfg(feature = "deflate")]
use crate::codec::MsZipDecoder;
use crate::format::bytes::le_u16;
use crate::format::bytes::le_u32;
use crate::format::{
    ArchiveInfo, FormatKind, FormatState, ItemSource, ParseContext, Parsed, Probe, ProbeInput,
};
use crate::item::Item;
use crate::read::ItemOutcome;
use crate::timestamp::Timestamp;
use crate::volume::VolumeSet;
use crate::window::{ReadSeek, read_exact_at};
use crate::{Error, Result};

pub(crate) const SIGNATURE: &[u8; 4] = b"MSCF";
const HEADER_SIZE: usize = 36;
const MAX_NAME: usize = 1 << 13;
const BLOCK_MAX: u32 = 1 << 15;
const MSZIP_PACKED_MAX: usize = (1 << 15) + 12;

const FLAG_PREV: u16 = 1;
const FLAG_NEXT: u16 = 2;
const FLAG_RESERVE: u16 = 4;

const CONTINUED_FROM_PREV: u16 = 0xFFFD;
const CONTINUED_TO_NEXT: u16 = 0xFFFE;
const CONTINUED_BOTH: u16 = 0xFFFF;

const ATTRIBUTE_UTF8: u16 = 0x80;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    match Probe::signature(input.head, b"MSCF\0\0\0\0") {
        Probe::Match => {}
        other => return other,
    }
    match input.head.get(..HEADER_SIZE) {
        Some(h) if header_is_valid(h) => Probe::Match,
        Some(_) => Probe::NotThisFormat,
        None => Probe::NeedMoreBytes(HEADER_SIZE as u64),
    }
}

fn header_is_valid(h: &[u8]) -> bool {
    h.starts_with(SIGNATURE)
        && le_u32(h, 0x0C) == 0
        && le_u32(h, 0x14) == 0
        && le_u32(h, 0x08) >= HEADER_SIZE as u32
        && le_u16(h, 0x1E) <= 7
}

/// The CAB data-block checksum: XOR of little-endian words, with a short
/// tail folded in big-endian order.
pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(4);
    let mut sum = 0u32;
    for word in chunks.by_ref() {
        sum ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    let tail = chunks
        .remainder()
        .iter()
        .fold(0u32, |acc, &b| acc << 8 | u32::from(b));
    sum ^ tail
}

/// One `CFDATA` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CabDataBlock {
    pub volume: u32,
    /// Position of the packed payload.
    pub offset: u64,
    pub packed: u32,
    /// Zero for the first piece of a block split across volumes.
    pub unpacked: u32,
    /// The 8 header bytes plus the per-block reserve.
    pub header: Vec<u8>,
}

impl CabDataBlock {
    fn stored_checksum(&self) -> u32 {
        le_u32(&self.header, 0)
    }
}

/// A folder after merging its parts from every volume.
#[derive(Debug, Clone)]
pub(crate) struct CabFolder {
    pub method: Method,
    pub raw_method: u16,
    pub blocks: Vec<CabDataBlock>,
    /// The block list ended early because a volume was short or missing.
    pub truncated: bool,
}

impl CabFolder {
    pub fn unpacked_size(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.unpacked)).sum()
    }
}

/// Folder layout kept for extraction.
#[derive(Debug, Clone, Default)]
pub(crate) struct CabState {
    pub folders: Vec<CabFolder>,
}

fn method_of(raw: u16) -> Method {
    match raw & 0x0F {
        0 => Method::Copy,
        1 => Method::MsZip,
        2 => Method::Quantum,
        3 => Method::Lzx,
        other => Method::Unknown(u32::from(other)),
    }
}

#[derive(Debug, Clone)]
struct RawFile {
    size: u32,
    offset: u32,
    folder_index: u16,
    date: u16,
    time: u16,
    attributes: u16,
    name: String,
    header_offset: u64,
}

impl RawFile {
    fn continued_from_prev(&self) -> bool {
        matches!(self.folder_index, CONTINUED_FROM_PREV | CONTINUED_BOTH)
    }

    fn continued_to_next(&self) -> bool {
        matches!(self.folder_index, CONTINUED_TO_NEXT | CONTINUED_BOTH)
    }

    /// Folder index within its own cabinet.
    fn local_folder(&self, folders: usize) -> Option<usize> {
        let index = if self.continued_from_prev() {
            0
        } else if self.continued_to_next() {
            folders.checked_sub(1)?
        } else {
            usize::from(self.folder_index)
        };
        (index < folders).then_some(index)
    }
}

#[derive(Debug)]
struct LocalFolder {
    raw_method: u16,
    blocks: Vec<CabDataBlock>,
    truncated: bool,
}

#[derive(Debug)]
struct Cabinet {
    size: u64,
    set_id: u16,
    number: u16,
    flags: u16,
    next_name: Option<String>,
    folders: Vec<LocalFolder>,
    files: Vec<RawFile>,
    unexpected_end: bool,
    names_error: bool,
}

impl Cabinet {
    fn has_prev_folder(&self) -> bool {
        self.files.iter().any(RawFile::continued_from_prev)
    }
}

/// Sequential reader over the header area of one volume.
struct HeaderStream<'a> {
    inner: BufReader<&'a mut dyn ReadSeek>,
    pos: u64,
}

impl<'a> HeaderStream<'a> {
    fn new(stream: &'a mut dyn ReadSeek) -> Result<Self> {
        stream.rewind()?;
        Ok(Self {
            inner: BufReader::new(stream),
            pos: 0,
        })
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos != self.pos {
            self.inner.seek(SeekFrom::Start(pos))?;
            self.pos = pos;
        }
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let n = i64::try_from(n).map_err(|_| Error::corrupt_header(self.pos, "skip overflow"))?;
        self.inner.seek_relative(n)?;
        self.pos += n as u64;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::UnexpectedEnd { offset: self.pos })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read(&mut buf)?;
        Ok(buf)
    }

    /// Reads a NUL-terminated name; `None` when it exceeds the name limit.
    fn name(&mut self) -> Result<Option<Vec<u8>>> {
        let mut name = Vec::new();
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Err(Error::UnexpectedEnd { offset: self.pos });
            }
            match available.iter().position(|&b| b == 0) {
                Some(end) => {
                    name.extend_from_slice(&available[..end]);
                    self.inner.consume(end + 1);
                    self.pos += end as u64 + 1;
                    break;
                }
                None => {
                    let n = available.len();
                    name.extend_from_slice(available);
                    self.inner.consume(n);
                    self.pos += n as u64;
                }
            }
        }
        Ok((name.len() <= MAX_NAME).then_some(name))
    }
}

fn decode_name(raw: &[u8], attributes: u16) -> String {
    let name = if attributes & ATTRIBUTE_UTF8 != 0 {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        raw.iter().map(|&b| b as char).collect()
    };
    name.replace('\\', "/")
}

fn read_cabinet(ctx: &mut ParseContext<'_>, volume: u32) -> Result<Cabinet> {
    let volume_size = ctx
        .volumes
        .size(volume)
        .ok_or(Error::VolumeUnavailable {
            volume,
            name: String::new(),
        })?;
    let limits = ctx.limits;
    let mut s = HeaderStream::new(ctx.volumes.stream(volume)?)?;

    let header: [u8; HEADER_SIZE] = match s.array() {
        Ok(h) => h,
        Err(Error::UnexpectedEnd { .. }) => return Err(Error::NotThisFormat),
        Err(e) => return Err(e),
    };
    if !header_is_valid(&header) {
        return Err(Error::NotThisFormat);
    }
    let size = u64::from(le_u32(&header, 0x08));
    let files_offset = u64::from(le_u32(&header, 0x10));
    if files_offset != 0 && files_offset > size {
        return Err(Error::NotThisFormat);
    }
    let folder_count = le_u16(&header, 0x1A) as usize;
    let file_count = le_u16(&header, 0x1C) as usize;
    let flags = le_u16(&header, 0x1E);
    let set_id = le_u16(&header, 0x20);
    let number = le_u16(&header, 0x22);

    let mut cab = Cabinet {
        size,
        set_id,
        number,
        flags,
        next_name: None,
        folders: Vec::new(),
        files: Vec::new(),
        unexpected_end: false,
        names_error: false,
    };

    let result = (|| -> Result<()> {
        let mut folder_reserve = 0u64;
        let mut data_reserve = 0usize;
        if flags & FLAG_RESERVE != 0 {
            let r: [u8; 4] = s.array()?;
            let cabinet_reserve = u64::from(le_u16(&r, 0));
            folder_reserve = u64::from(r[2]);
            data_reserve = usize::from(r[3]);
            s.skip(cabinet_reserve)?;
        }
        if flags & FLAG_PREV != 0 {
            s.name()?;
            s.name()?;
        }
        if flags & FLAG_NEXT != 0 {
            let file = s.name()?;
            s.name()?;
            match file {
                Some(name) => cab.next_name = Some(String::from_utf8_lossy(&name).into_owned()),
                None => cab.names_error = true,
            }
        }

        let mut folders = Vec::with_capacity(folder_count);
        for _ in 0..folder_count {
            let f: [u8; 8] = s.array()?;
            folders.push((u64::from(le_u32(&f, 0)), le_u16(&f, 4), le_u16(&f, 6)));
            s.skip(folder_reserve)?;
        }

        limits.check_items(file_count as u64)?;
        s.seek(files_offset)?;
        for _ in 0..file_count {
            let header_offset = s.pos;
            let f: [u8; 16] = s.array()?;
            let attributes = le_u16(&f, 14);
            let name = match s.name()? {
                Some(raw) => {
                    limits.check_name(raw.len() as u64)?;
                    decode_name(&raw, attributes)
                }
                None => {
                    cab.names_error = true;
                    "[ERROR-LONG-PATH]".to_string()
                }
            };
            cab.files.push(RawFile {
                size: le_u32(&f, 0),
                offset: le_u32(&f, 4),
                folder_index: le_u16(&f, 8),
                date: le_u16(&f, 10),
                time: le_u16(&f, 12),
                attributes,
                name,
                header_offset,
            });
        }

        for (data_start, block_count, raw_method) in folders {
            let mut folder = LocalFolder {
                raw_method,
                blocks: Vec::with_capacity(usize::from(block_count)),
                truncated: false,
            };
            s.seek(data_start)?;
            for _ in 0..block_count {
                let mut header = vec![0u8; 8 + data_reserve];
                match s.read(&mut header) {
                    Ok(()) => {}
                    Err(Error::UnexpectedEnd { .. }) => {
                        folder.truncated = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
                let packed = u32::from(le_u16(&header, 4));
                let unpacked = u32::from(le_u16(&header, 6));
                let offset = s.pos;
                if offset + u64::from(packed) > volume_size {
                    folder.truncated = true;
                    break;
                }
                folder.blocks.push(CabDataBlock {
                    volume,
                    offset,
                    packed,
                    unpacked,
                    header,
                });
                s.skip(u64::from(packed))?;
            }
            cab.folders.push(folder);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {}
        Err(Error::UnexpectedEnd { .. }) => cab.unexpected_end = true,
        Err(e) => return Err(e),
    }
    Ok(cab)
}

#[derive(Debug)]
struct Entry {
    folder: Option<usize>,
    file: RawFile,
    volume: u32,
    unavailable: bool,
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let first = read_cabinet(ctx, 0)?;
    if first.unexpected_end && first.files.is_empty() && first.folders.is_empty() {
        return Err(Error::NotThisFormat);
    }

    let mut info = ArchiveInfo::new(FormatKind::Cab, first.size.min(ctx.size()));
    if first.size > ctx.size() {
        info.unexpected_end = true;
    }

    let mut cabinets = vec![first];
    loop {
        let Some(last) = cabinets.last() else { break };
        if last.flags & FLAG_NEXT == 0 {
            break;
        }
        let expected_set = last.set_id;
        let expected_number = last.number.wrapping_add(1);
        let name = last.next_name.clone();
        let Some(volume) = ctx.volumes.open_next(&mut *ctx.provider, name.as_deref())? else {
            ctx.warn(format!(
                "next cabinet {} is missing",
                name.as_deref().unwrap_or("?")
            ));
            break;
        };
        match read_cabinet(ctx, volume) {
            Ok(cab) if cab.set_id == expected_set && cab.number == expected_number => {
                log::debug!("cab volume {} accepted ({:?})", volume, name);
                cabinets.push(cab);
            }
            Ok(cab) => {
                ctx.warn(format!(
                    "cabinet {:?} belongs to set {} #{}, expected set {} #{}",
                    name, cab.set_id, cab.number, expected_set, expected_number
                ));
                ctx.volumes.truncate(volume as usize);
                break;
            }
            Err(e) if e.is_format_mismatch() => {
                ctx.warn(format!("cabinet {:?} is not a cabinet", name));
                ctx.volumes.truncate(volume as usize);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let mut folders: Vec<CabFolder> = Vec::new();
    let mut entries: Vec<Entry> = Vec::new();
    for (v, cab) in cabinets.into_iter().enumerate() {
        info.unexpected_end |= cab.unexpected_end;
        info.headers_error |= cab.names_error;
        let merge = v > 0 && cab.has_prev_folder() && !folders.is_empty();
        let base = folders.len();
        let local_count = cab.folders.len();
        for (local, part) in cab.folders.into_iter().enumerate() {
            if local == 0 && merge {
                if let Some(last) = folders.last_mut() {
                    if last.raw_method != part.raw_method {
                        log::warn!("cab folder continues with a different method");
                        info.headers_error = true;
                    }
                    last.blocks.extend(part.blocks);
                    last.truncated = part.truncated;
                }
            } else {
                folders.push(CabFolder {
                    method: method_of(part.raw_method),
                    raw_method: part.raw_method,
                    blocks: part.blocks,
                    truncated: part.truncated,
                });
            }
        }
        for file in cab.files {
            let folder = file.local_folder(local_count).map(|local| {
                if merge {
                    if local == 0 { base - 1 } else { base + local - 1 }
                } else {
                    base + local
                }
            });
            if folder.is_none() {
                info.headers_error = true;
            }
            entries.push(Entry {
                unavailable: v == 0 && file.continued_from_prev(),
                folder,
                file,
                volume: v as u32,
            });
        }
    }
    if folders.last().is_some_and(|f| f.truncated) {
        info.unexpected_end = true;
    }

    entries.sort_by(|a, b| {
        (a.folder.unwrap_or(usize::MAX), a.file.offset, a.file.size, &a.file.name).cmp(&(
            b.folder.unwrap_or(usize::MAX),
            b.file.offset,
            b.file.size,
            &b.file.name,
        ))
    });
    entries.dedup_by(|later, earlier| {
        later.folder == earlier.folder
            && later.file.offset == earlier.file.offset
            && later.file.size == earlier.file.size
            && later.file.name == earlier.file.name
    });
    ctx.limits.check_items(entries.len() as u64)?;

    let mut per_folder = vec![0usize; folders.len()];
    let mut parsed = Parsed::new(info);
    for entry in entries {
        let file = &entry.file;
        let mut item = Item {
            header_offset: file.header_offset,
            size: Some(u64::from(file.size)),
            mtime: Timestamp::from_dos(file.date, file.time).map(|t| t.as_unix_secs()),
            attributes: Some(u32::from(file.attributes)),
            volume: entry.volume,
            ..Item::new(file.name.clone())
        };
        item.flags.split_before = file.continued_from_prev();
        item.flags.split_after = file.continued_to_next();
        let source = match entry.folder {
            None => {
                item.flags.headers_error = true;
                ItemSource::Unavailable(ItemOutcome::HeadersError)
            }
            Some(_) if entry.unavailable => ItemSource::Unavailable(ItemOutcome::Unavailable),
            Some(folder) => {
                item.method = folders[folder].method;
                per_folder[folder] += 1;
                if file.size == 0 {
                    ItemSource::Empty
                } else {
                    ItemSource::Folder {
                        folder,
                        offset: u64::from(file.offset),
                    }
                }
            }
        };
        parsed.push(item, source);
    }

    parsed.info.volumes = ctx.volumes.len() as u32;
    parsed.info.solid = per_folder.iter().any(|&n| n > 1);
    let mut methods: Vec<&str> = Vec::new();
    for folder in &folders {
        if !methods.contains(&folder.method.name()) {
            methods.push(folder.method.name());
        }
    }
    parsed.info.method = (!methods.is_empty()).then(|| methods.join(" "));
    parsed.state = FormatState::Cab(CabState { folders });
    log::debug!(
        "cab: {} files, {} volumes",
        parsed.items.len(),
        parsed.info.volumes
    );
    Ok(parsed)
}

/// Sequential decoder over one folder, positioned at a decoded offset.
pub(crate) struct FolderCursor {
    folder: usize,
    next_block: usize,
    /// Decoded offset of `pending[0]`.
    base: u64,
    pending: Vec<u8>,
    consumed: usize,
    #[cfg(feature = "deflate")]
    mszip: MsZipDecoder,
}

impl std::fmt::Debug for FolderCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderCursor")
            .field("folder", &self.folder)
            .field("next_block", &self.next_block)
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl FolderCursor {
    pub fn new(folder: usize) -> Self {
        Self {
            folder,
            next_block: 0,
            base: 0,
            pending: Vec::new(),
            consumed: 0,
            #[cfg(feature = "deflate")]
            mszip: MsZipDecoder::new(),
        }
    }

    pub fn folder(&self) -> usize {
        self.folder
    }

    /// Decoded offset of the next byte this cursor yields.
    pub fn position(&self) -> u64 {
        self.base + self.consumed as u64
    }

    fn decode_next<R: Read + Seek>(
        &mut self,
        state: &CabState,
        volumes: &mut VolumeSet<R>,
        verify: bool,
    ) -> Result<()> {
        let folder = state
            .folders
            .get(self.folder)
            .ok_or_else(|| Error::corrupt_header(0, "folder index out of range"))?;
        if !matches!(folder.method, Method::Copy | Method::MsZip) {
            return Err(Error::unsupported(folder.method));
        }

        let mut packed = Vec::new();
        let unpacked = loop {
            let Some(block) = folder.blocks.get(self.next_block) else {
                return Err(if folder.truncated {
                    Error::UnexpectedEnd {
                        offset: self.position(),
                    }
                } else {
                    Error::data(format!(
                        "folder {} ends at {} bytes",
                        self.folder,
                        self.position()
                    ))
                });
            };
            self.next_block += 1;
            let start = packed.len();
            packed.resize(start + block.packed as usize, 0);
            read_exact_at(volumes.stream(block.volume)?, block.offset, &mut packed[start..])?;
            let stored = block.stored_checksum();
            if verify && stored != 0 {
                let actual = checksum(&block.header) ^ checksum(&packed[start..]);
                if actual != 0 {
                    log::warn!("cab block at {:#x} fails its checksum", block.offset);
                    return Err(Error::CrcMismatch {
                        item_index: 0,
                        item_name: None,
                        expected: stored,
                        actual: stored ^ actual,
                    });
                }
            }
            if folder.method == Method::MsZip && packed.len() > MSZIP_PACKED_MAX {
                return Err(Error::data("MSZIP block exceeds 32 KiB + 12"));
            }
            if block.unpacked != 0 {
                break block.unpacked;
            }
        };
        if unpacked > BLOCK_MAX {
            return Err(Error::data(format!(
                "cab block of {} bytes exceeds 32 KiB",
                unpacked
            )));
        }

        let data = match folder.method {
            Method::Copy => {
                if packed.len() != unpacked as usize {
                    return Err(Error::data(format!(
                        "stored cab block holds {} bytes, header says {}",
                        packed.len(),
                        unpacked
                    )));
                }
                packed
            }
            #[cfg(feature = "deflate")]
            Method::MsZip => self.mszip.decode_block(&packed, unpacked as usize)?,
            other => return Err(Error::unsupported(other)),
        };
        log::trace!(
            "cab folder {} block {} -> {} bytes",
            self.folder,
            self.next_block - 1,
            data.len()
        );
        self.base += self.pending.len() as u64;
        self.pending = data;
        self.consumed = 0;
        Ok(())
    }

    /// Copies the next `len` decoded bytes to `out`.
    ///
    /// `between_blocks` runs after each decoded block with the bytes copied
    /// so far.
    pub fn copy<R: Read + Seek>(
        &mut self,
        state: &CabState,
        volumes: &mut VolumeSet<R>,
        verify: bool,
        len: u64,
        out: &mut dyn Write,
        between_blocks: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<u64> {
        let mut done = 0u64;
        while done < len {
            if self.consumed == self.pending.len() {
                self.decode_next(state, volumes, verify)?;
                if done > 0 {
                    between_blocks(done)?;
                }
                continue;
            }
            let n = (self.pending.len() - self.consumed).min((len - done) as usize);
            out.write_all(&self.pending[self.consumed..self.consumed + n])?;
            self.consumed += n;
            done += n as u64;
        }
        Ok(done)
    }

    /// Decodes and discards bytes up to decoded `offset`.
    pub fn skip_to<R: Read + Seek>(
        &mut self,
        state: &CabState,
        volumes: &mut VolumeSet<R>,
        verify: bool,
        offset: u64,
    ) -> Result<()> {
        let skip = offset.saturating_sub(self.position());
        self.copy(state, volumes, verify, skip, &mut io::sink(), &mut |_| Ok(()))?;
        Ok(())
    }
}
