//! RAR 5 archives.
//!
//! A RAR 5 archive is a marker followed by self-describing header blocks,
//! each guarded by a CRC-32 and sized by a variable-length integer. File
//! blocks carry their packed data right after the header. Items split across
//! volumes are stitched back together here, so one [`Item`] may own extents
//! in several volumes.
//!
//! Only stored items can be decoded. Compressed items are listed with their
//! method and report [`UnsupportedMethod`](crate::Error::UnsupportedMethod)
//! on extraction. Encrypted payloads carry their AES parameters to the
//! extraction pipeline; encrypted headers are decrypted here and need the
//! password at open time.

use zeroize::Zeroizing;

use crate::codec::Method;
use crate::crypto::Password;
use crate::format::bytes::{ByteOrder, ByteReader, le_u32, lossy, trim_nul};
use crate::format::{
    ArchiveInfo, Encryption, FormatKind, ItemSource, ParseContext, Parsed, Probe, ProbeInput,
};
use crate::item::{Item, ItemKind};
use crate::read::ItemOutcome;
use crate::timestamp::Timestamp;
use crate::volume::Extent;
use crate::window::read_exact_at;
use crate::{Error, Result};

pub(crate) const MARKER: &[u8; 8] = b"Rar!\x1A\x07\x01\x00";

const MAX_HEADER: u64 = 2 << 20;
const AES_BLOCK: usize = 16;
const MAX_COMMENT: u64 = 64 << 10;

const BLOCK_MAIN: u64 = 1;
const BLOCK_FILE: u64 = 2;
const BLOCK_SERVICE: u64 = 3;
const BLOCK_CRYPT: u64 = 4;
const BLOCK_END: u64 = 5;

const HFL_EXTRA: u64 = 0x01;
const HFL_DATA: u64 = 0x02;
const HFL_SPLIT_BEFORE: u64 = 0x08;
const HFL_SPLIT_AFTER: u64 = 0x10;

const MAIN_VOLUME: u64 = 0x01;
const MAIN_VOLUME_NUMBER: u64 = 0x02;
const MAIN_SOLID: u64 = 0x04;

const FILE_DIR: u64 = 0x01;
const FILE_UNIX_TIME: u64 = 0x02;
const FILE_CRC: u64 = 0x04;
const FILE_UNKNOWN_SIZE: u64 = 0x08;

const END_MORE_VOLUMES: u64 = 0x01;

const EXTRA_CRYPTO: u64 = 1;
const EXTRA_HASH: u64 = 2;
const EXTRA_TIME: u64 = 3;
const EXTRA_LINK: u64 = 5;
const EXTRA_OWNER: u64 = 6;

const CRYPT_CHECK: u64 = 0x01;
const CRYPT_MAC: u64 = 0x02;

const HOST_UNIX: u64 = 1;

pub(crate) fn probe(input: &ProbeInput<'_>) -> Probe {
    Probe::signature(input.head, MARKER)
}

/// One header block, decrypted and CRC-checked.
#[derive(Debug)]
struct Block {
    offset: u64,
    kind: u64,
    flags: u64,
    data_size: u64,
    data_offset: u64,
    /// Type-specific fields.
    body: Vec<u8>,
    body_offset: u64,
    /// The extra area that closes the header.
    extra: Vec<u8>,
    extra_offset: u64,
}

impl Block {
    fn next(&self) -> Option<u64> {
        self.data_offset.checked_add(self.data_size)
    }

    fn body(&self) -> ByteReader<'_> {
        ByteReader::new(&self.body, self.body_offset, ByteOrder::Little)
    }
}

fn as_len(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[cfg(feature = "aes")]
fn decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    crate::crypto::decrypt_blocks(key, iv, data)
        .map(|_| ())
        .map_err(Error::from_io)
}

#[cfg(not(feature = "aes"))]
fn decrypt(_key: &[u8; 32], _iv: &[u8; 16], _data: &mut [u8]) -> Result<()> {
    Err(Error::UnsupportedFeature {
        feature: "AES decryption",
    })
}

/// Reads the block at `offset`; with `key`, the block is an IV followed by
/// the AES-encrypted header padded to whole cipher blocks.
fn read_block(
    ctx: &mut ParseContext<'_>,
    volume: u32,
    offset: u64,
    key: Option<&[u8; 32]>,
) -> Result<Block> {
    let limits = ctx.limits;
    let stream = ctx.volumes.stream(volume)?;

    let (start, iv, head) = match key {
        Some(key) => {
            let mut raw = [0u8; 2 * AES_BLOCK];
            read_exact_at(stream, offset, &mut raw)?;
            let mut iv = [0u8; AES_BLOCK];
            iv.copy_from_slice(&raw[..AES_BLOCK]);
            let mut head = raw[AES_BLOCK..].to_vec();
            decrypt(key, &iv, &mut head)?;
            (offset + AES_BLOCK as u64, Some(iv), head)
        }
        None => {
            let mut head = vec![0u8; 7];
            read_exact_at(stream, offset, &mut head)?;
            (offset, None, head)
        }
    };

    let mut r = ByteReader::new(&head[4..7], start + 4, ByteOrder::Little);
    let size = r.vint()?;
    let size_len = r.position();
    if !(2..=MAX_HEADER).contains(&size) {
        return Err(Error::corrupt_header(start, format!("header size {}", size)));
    }
    let total = 4 + size_len + size as usize;
    let padded = match key {
        Some(_) => total.next_multiple_of(AES_BLOCK),
        None => total,
    };
    limits.check_header(padded as u64)?;

    let mut buf = vec![0u8; padded];
    read_exact_at(stream, start, &mut buf)?;
    if let (Some(key), Some(iv)) = (key, iv) {
        decrypt(key, &iv, &mut buf)?;
        if buf[total..].iter().any(|&b| b != 0) {
            return Err(Error::corrupt_header(start, "non-zero header padding"));
        }
    }

    let stored = le_u32(&buf, 0);
    let actual = crc32fast::hash(&buf[4..total]);
    if stored != actual {
        return Err(Error::corrupt_header(
            start,
            format!("header CRC {:08x}, computed {:08x}", stored, actual),
        ));
    }

    let fields_start = 4 + size_len;
    let mut r = ByteReader::new(
        &buf[fields_start..total],
        start + fields_start as u64,
        ByteOrder::Little,
    );
    let kind = r.vint()?;
    let flags = r.vint()?;
    let extra_size = if flags & HFL_EXTRA != 0 { r.vint()? } else { 0 };
    let data_size = if flags & HFL_DATA != 0 { r.vint()? } else { 0 };

    let body_start = fields_start + r.position();
    let rest = total - body_start;
    if extra_size > rest as u64 {
        return Err(Error::corrupt_header(start, "extra area larger than header"));
    }
    let extra_start = total - extra_size as usize;
    Ok(Block {
        offset,
        kind,
        flags,
        data_size,
        data_offset: start + padded as u64,
        body: buf[body_start..extra_start].to_vec(),
        body_offset: start + body_start as u64,
        extra: buf[extra_start..total].to_vec(),
        extra_offset: start + extra_start as u64,
    })
}

/// Parses the AES record shared by the archive encryption header and the
/// per-file crypto extra. Header encryption has no IV in the record.
fn parse_crypto(r: &mut ByteReader<'_>, with_iv: bool) -> Result<Encryption> {
    let algorithm = r.vint()?;
    if algorithm != 0 {
        return Err(Error::UnsupportedFeature {
            feature: "RAR5 encryption algorithm",
        });
    }
    let flags = r.vint()?;
    let iterations_log = r.u8()?;
    let mut salt = [0u8; 16];
    salt.copy_from_slice(r.bytes(16)?);
    let mut iv = [0u8; 16];
    if with_iv {
        iv.copy_from_slice(r.bytes(16)?);
    }
    let check = if flags & CRYPT_CHECK != 0 {
        let mut check = [0u8; 8];
        check.copy_from_slice(r.bytes(8)?);
        let mut sum = [0u8; 4];
        sum.copy_from_slice(r.bytes(4)?);
        check_is_trusted(&check, &sum).then_some(check)
    } else {
        None
    };
    Ok(Encryption {
        iterations_log,
        salt,
        iv,
        check,
        use_mac: flags & CRYPT_MAC != 0,
    })
}

#[cfg(feature = "aes")]
fn check_is_trusted(check: &[u8; 8], sum: &[u8; 4]) -> bool {
    let valid = crate::crypto::check_value_is_valid(check, sum);
    if !valid {
        log::debug!("RAR5 password check value has a bad checksum, ignoring it");
    }
    valid
}

#[cfg(not(feature = "aes"))]
fn check_is_trusted(_check: &[u8; 8], _sum: &[u8; 4]) -> bool {
    true
}

#[cfg(feature = "aes")]
fn header_key(password: &Password, props: &Encryption) -> Result<Zeroizing<[u8; 32]>> {
    let keys = crate::crypto::Rar5Keys::derive(password, &props.salt, props.iterations_log)?;
    if let Some(check) = &props.check {
        if !keys.matches(check) {
            return Err(Error::WrongPassword { item_index: None });
        }
    }
    Ok(Zeroizing::new(*keys.key()))
}

#[cfg(not(feature = "aes"))]
fn header_key(_password: &Password, _props: &Encryption) -> Result<Zeroizing<[u8; 32]>> {
    Err(Error::UnsupportedFeature {
        feature: "encrypted RAR5 headers",
    })
}

/// Fixed fields of a file or service header.
#[derive(Debug)]
struct FileHeader {
    flags: u64,
    size: u64,
    attributes: u64,
    mtime: Option<u32>,
    crc: Option<u32>,
    compression: u64,
    host: u64,
    name: String,
}

impl FileHeader {
    fn parse(block: &Block, ctx: &ParseContext<'_>) -> Result<Self> {
        let mut r = block.body();
        let flags = r.vint()?;
        let size = r.vint()?;
        let attributes = r.vint()?;
        let mtime = if flags & FILE_UNIX_TIME != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let crc = if flags & FILE_CRC != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let compression = r.vint()?;
        let host = r.vint()?;
        let name_len = ctx.limits.check_name(r.vint()?)?;
        let name = lossy(r.bytes(name_len)?);
        Ok(Self {
            flags,
            size,
            attributes,
            mtime,
            crc,
            compression,
            host,
            name,
        })
    }

    fn method(&self) -> Method {
        match (self.compression >> 7) & 0x7 {
            0 => Method::Copy,
            level => Method::Rar(level as u8),
        }
    }

    fn is_solid(&self) -> bool {
        self.compression & 0x40 != 0
    }

    fn dictionary_log(&self) -> u64 {
        (self.compression >> 10) & 0x1F
    }
}

/// What the extra area of a file header adds.
#[derive(Debug, Default)]
struct FileExtras {
    crypto: Option<Encryption>,
    mtime: Option<i64>,
    link: Option<(ItemKind, String)>,
    uid: Option<u32>,
    gid: Option<u32>,
    has_hash: bool,
}

impl FileExtras {
    fn parse(block: &Block) -> Result<Self> {
        let mut extras = FileExtras::default();
        let mut r = ByteReader::new(&block.extra, block.extra_offset, ByteOrder::Little);
        while !r.is_empty() {
            let size = r.vint()?;
            let base = block.extra_offset + r.position() as u64;
            let record = r.bytes(as_len(size))?;
            let mut rec = ByteReader::new(record, base, ByteOrder::Little);
            match rec.vint()? {
                EXTRA_CRYPTO => extras.crypto = Some(parse_crypto(&mut rec, true)?),
                EXTRA_HASH => extras.has_hash = true,
                EXTRA_TIME => extras.mtime = parse_time(&mut rec)?,
                EXTRA_LINK => extras.link = Some(parse_link(&mut rec)?),
                EXTRA_OWNER => {
                    let flags = rec.vint()?;
                    for bit in [0x01, 0x02] {
                        if flags & bit != 0 {
                            let len = rec.vint()?;
                            rec.skip(as_len(len))?;
                        }
                    }
                    if flags & 0x04 != 0 {
                        extras.uid = u32::try_from(rec.vint()?).ok();
                    }
                    if flags & 0x08 != 0 {
                        extras.gid = u32::try_from(rec.vint()?).ok();
                    }
                }
                other => log::trace!("skipping RAR5 extra record type {}", other),
            }
        }
        Ok(extras)
    }
}

fn parse_time(r: &mut ByteReader<'_>) -> Result<Option<i64>> {
    let flags = r.vint()?;
    let unix = flags & 0x01 != 0;
    let mut mtime = None;
    for bit in [0x02, 0x04, 0x08] {
        if flags & bit == 0 {
            continue;
        }
        let secs = if unix {
            i64::from(r.u32()?)
        } else {
            Timestamp::from_filetime(r.u64()?).as_unix_secs()
        };
        if bit == 0x02 {
            mtime = Some(secs);
        }
    }
    Ok(mtime)
}

fn parse_link(r: &mut ByteReader<'_>) -> Result<(ItemKind, String)> {
    let kind = match r.vint()? {
        1..=3 => ItemKind::Symlink,
        _ => ItemKind::HardLink,
    };
    let _flags = r.vint()?;
    let len = r.vint()?;
    let target = lossy(r.bytes(as_len(len))?);
    Ok((kind, target))
}

/// An item being assembled from one or more file blocks.
#[derive(Debug)]
struct Entry {
    item: Item,
    extents: Vec<Extent>,
    crypto: Option<Box<Encryption>>,
    broken: Option<ItemOutcome>,
}

impl Entry {
    fn into_parts(self) -> (Item, ItemSource) {
        let Entry {
            item,
            extents,
            crypto,
            broken,
        } = self;
        let source = if let Some(outcome) = broken {
            ItemSource::Unavailable(outcome)
        } else if item.flags.split_before || item.flags.split_after {
            ItemSource::Unavailable(ItemOutcome::Unavailable)
        } else if matches!(
            item.kind,
            ItemKind::Directory | ItemKind::Symlink | ItemKind::HardLink
        ) || extents.is_empty()
        {
            ItemSource::Empty
        } else {
            ItemSource::Range {
                extents,
                method: item.method,
                crypto,
            }
        };
        (item, source)
    }
}

/// Walks the header blocks of every volume in turn.
struct Walker {
    info: ArchiveInfo,
    entries: Vec<Entry>,
    /// Entry whose last block had the split-after flag.
    pending: Option<usize>,
}

impl Walker {
    /// Reads one volume; returns `true` when the archive continues in the
    /// next volume.
    fn read_volume(&mut self, ctx: &mut ParseContext<'_>, volume: u32) -> Result<bool> {
        let mut marker = [0u8; 8];
        match read_exact_at(ctx.volumes.stream(volume)?, 0, &mut marker) {
            Ok(()) if &marker == MARKER => {}
            Ok(()) | Err(Error::UnexpectedEnd { .. }) => return Err(Error::NotThisFormat),
            Err(e) => return Err(e),
        }
        let volume_size = ctx.volumes.size(volume).unwrap_or(0);

        let mut pos = MARKER.len() as u64;
        let mut key: Option<Zeroizing<[u8; 32]>> = None;
        let mut seen_main = false;
        loop {
            let block = match read_block(ctx, volume, pos, key.as_deref()) {
                Ok(block) => block,
                Err(e) if !seen_main && key.is_some() && e.is_corruption() => {
                    log::debug!("RAR5 main header does not decrypt: {}", e);
                    return Err(Error::WrongPassword { item_index: None });
                }
                Err(e) if !seen_main && e.is_format_mismatch() => {
                    log::debug!("RAR5 volume {} rejected: {}", volume, e);
                    return Err(Error::NotThisFormat);
                }
                Err(Error::UnexpectedEnd { offset }) => {
                    ctx.warn(format!("RAR5 headers end early at {:#x}", offset));
                    self.info.unexpected_end = true;
                    self.set_physical(volume, volume_size);
                    return Ok(false);
                }
                Err(e) if e.is_corruption() => {
                    ctx.warn(format!("RAR5 header at {:#x}: {}", pos, e));
                    self.info.headers_error = true;
                    self.set_physical(volume, pos);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            log::trace!(
                "RAR5 block type {} at {:#x}, {} data bytes",
                block.kind,
                block.offset,
                block.data_size
            );

            match block.kind {
                BLOCK_CRYPT if !seen_main && key.is_none() => {
                    let props = parse_crypto(&mut block.body(), false)?;
                    let password = ctx.password().ok_or(Error::PasswordRequired)?;
                    key = Some(header_key(&password, &props)?);
                    self.info.encrypted = true;
                    log::debug!("RAR5 headers are encrypted (2^{} rounds)", props.iterations_log);
                }
                BLOCK_MAIN if !seen_main => {
                    self.main_header(ctx, &block, volume)?;
                    seen_main = true;
                }
                _ if !seen_main => {
                    return Err(Error::NotThisFormat);
                }
                BLOCK_FILE => self.file_block(ctx, &block, volume)?,
                BLOCK_SERVICE => self.service_block(ctx, &block, volume),
                BLOCK_END => {
                    let flags = block.body().vint().unwrap_or(0);
                    let end = block.next().unwrap_or(volume_size);
                    self.set_physical(volume, end);
                    return Ok(flags & END_MORE_VOLUMES != 0);
                }
                other => log::debug!("skipping RAR5 block type {} at {:#x}", other, block.offset),
            }

            pos = match block.next() {
                Some(next) if next <= volume_size => next,
                _ => {
                    ctx.warn(format!(
                        "RAR5 data of block at {:#x} runs past the end of volume {}",
                        block.offset, volume
                    ));
                    self.info.unexpected_end = true;
                    if let Some(entry) = self.entries.last_mut() {
                        if entry.item.header_offset == block.offset {
                            entry.item.flags.unexpected_end = true;
                            entry.broken.get_or_insert(ItemOutcome::UnexpectedEnd);
                        }
                    }
                    self.set_physical(volume, volume_size);
                    return Ok(false);
                }
            };
            if pos == volume_size {
                ctx.warn("RAR5 archive has no end-of-archive block");
                self.info.unexpected_end = true;
                self.set_physical(volume, pos);
                return Ok(self.pending.is_some());
            }
        }
    }

    fn set_physical(&mut self, volume: u32, end: u64) {
        if volume == 0 {
            self.info.physical_size = end;
        }
    }

    fn main_header(&mut self, ctx: &mut ParseContext<'_>, block: &Block, volume: u32) -> Result<()> {
        let mut r = block.body();
        let flags = r.vint()?;
        let number = if flags & MAIN_VOLUME_NUMBER != 0 {
            r.vint()?
        } else {
            0
        };
        if volume > 0 {
            if flags & MAIN_VOLUME == 0 || number != u64::from(volume) {
                return Err(Error::InvalidFormat(format!(
                    "volume {} has volume number {}",
                    volume, number
                )));
            }
            return Ok(());
        }

        if flags & MAIN_VOLUME != 0 && number != 0 {
            ctx.warn(format!("archive starts at volume {}", number + 1));
        }
        self.info.solid = flags & MAIN_SOLID != 0;
        if let Err(e) = self.main_extras(block) {
            ctx.warn(format!("RAR5 archive metadata: {}", e));
        }
        Ok(())
    }

    /// Locator and metadata records of the main header; only the archive
    /// name and creation time are kept.
    fn main_extras(&mut self, block: &Block) -> Result<()> {
        let mut r = ByteReader::new(&block.extra, block.extra_offset, ByteOrder::Little);
        while !r.is_empty() {
            let size = r.vint()?;
            let base = block.extra_offset + r.position() as u64;
            let mut rec = ByteReader::new(r.bytes(as_len(size))?, base, ByteOrder::Little);
            if rec.vint()? != 2 {
                continue;
            }
            let flags = rec.vint()?;
            if flags & 0x01 != 0 {
                let len = rec.vint()?;
                let name = lossy(trim_nul(rec.bytes(as_len(len))?));
                self.info.name = Some(name);
            }
            if flags & 0x02 != 0 {
                self.info.mtime = Some(if flags & 0x04 != 0 && flags & 0x08 == 0 {
                    i64::from(rec.u32()?)
                } else if flags & 0x04 != 0 {
                    (rec.u64()? / 1_000_000_000) as i64
                } else {
                    Timestamp::from_filetime(rec.u64()?).as_unix_secs()
                });
            }
        }
        Ok(())
    }

    fn file_block(&mut self, ctx: &mut ParseContext<'_>, block: &Block, volume: u32) -> Result<()> {
        let header = match FileHeader::parse(block, ctx) {
            Ok(header) => header,
            Err(e @ Error::ResourceLimitExceeded(_)) => return Err(e),
            Err(e) => {
                ctx.warn(format!("RAR5 file header at {:#x}: {}", block.offset, e));
                self.info.headers_error = true;
                return Ok(());
            }
        };
        let (extras, extras_ok) = match FileExtras::parse(block) {
            Ok(extras) => (extras, true),
            Err(e) => {
                ctx.warn(format!("RAR5 extra area of {:?}: {}", header.name, e));
                (FileExtras::default(), false)
            }
        };
        if header.is_solid() {
            self.info.solid = true;
        }
        if extras.crypto.is_some() {
            self.info.encrypted = true;
        }

        let extent = Extent::new(volume, block.data_offset, block.data_size);
        let split_after = block.flags & HFL_SPLIT_AFTER != 0;

        if block.flags & HFL_SPLIT_BEFORE != 0 {
            if let Some(index) = self.pending.take() {
                let entry = &mut self.entries[index];
                if entry.item.name == header.name && header.flags & FILE_DIR == 0 {
                    if extent.len > 0 {
                        entry.extents.push(extent);
                    }
                    entry.item.packed_size += block.data_size;
                    entry.item.crc = header.crc;
                    entry.item.crc_covers_item = !split_after;
                    entry.item.flags.split_after = split_after;
                    entry.item.flags.headers_error |= !extras_ok;
                    if split_after {
                        self.pending = Some(index);
                    }
                    log::trace!("{:?} continues in volume {}", header.name, volume);
                    return Ok(());
                }
                ctx.warn(format!("{:?} has no continuation", entry.item.name));
            } else {
                ctx.warn(format!(
                    "{:?} continues from a volume that is not available",
                    header.name
                ));
            }
        } else if let Some(index) = self.pending.take() {
            let name = &self.entries[index].item.name;
            ctx.warn(format!("{:?} has no continuation", name));
        }

        ctx.limits.check_items(self.entries.len() as u64 + 1)?;

        let mut item = Item::new(header.name.clone());
        item.header_offset = block.offset;
        item.payload_offset = block.data_offset;
        item.packed_size = block.data_size;
        item.volume = volume;
        item.size = (header.flags & FILE_UNKNOWN_SIZE == 0).then_some(header.size);
        item.mtime = extras.mtime.or(header.mtime.map(i64::from));
        item.method = header.method();
        item.crc = header.crc;
        item.crc_covers_item = !split_after;
        item.uid = extras.uid;
        item.gid = extras.gid;
        let attributes = u32::try_from(header.attributes).ok();
        if header.host == HOST_UNIX {
            item.mode = attributes;
        } else {
            item.attributes = attributes;
        }
        item.kind = if header.flags & FILE_DIR != 0 {
            ItemKind::Directory
        } else if let Some((kind, target)) = extras.link {
            item.link_target = Some(target);
            kind
        } else if header.host == HOST_UNIX {
            match ItemKind::from_unix_mode(attributes.unwrap_or(0)) {
                ItemKind::Directory | ItemKind::Symlink => ItemKind::File,
                kind => kind,
            }
        } else {
            ItemKind::File
        };
        item.flags.encrypted = extras.crypto.is_some();
        item.flags.split_before = block.flags & HFL_SPLIT_BEFORE != 0;
        item.flags.split_after = split_after;
        item.flags.headers_error = !extras_ok;
        log::trace!(
            "RAR5 item {:?}: {} (dictionary 2^{}), {} packed bytes{}",
            item.name,
            item.method,
            header.dictionary_log() + 17,
            item.packed_size,
            if extras.has_hash { ", BLAKE2sp" } else { "" }
        );

        let index = self.entries.len();
        self.entries.push(Entry {
            item,
            extents: if extent.len > 0 { vec![extent] } else { Vec::new() },
            crypto: extras.crypto.map(Box::new),
            broken: None,
        });
        if split_after {
            self.pending = Some(index);
        }
        Ok(())
    }

    /// Service blocks hold comments, ACLs and streams; only the comment is
    /// read.
    fn service_block(&mut self, ctx: &mut ParseContext<'_>, block: &Block, volume: u32) {
        let Ok(header) = FileHeader::parse(block, ctx) else {
            self.info.headers_error = true;
            return;
        };
        let encrypted = FileExtras::parse(block).map_or(true, |e| e.crypto.is_some());
        if header.name != "CMT" || volume != 0 {
            log::debug!("skipping RAR5 service block {:?}", header.name);
            return;
        }
        if header.method() != Method::Copy || encrypted || header.size > MAX_COMMENT {
            log::debug!("RAR5 comment is packed or encrypted, not read");
            return;
        }
        let len = header.size.min(block.data_size) as usize;
        let mut text = vec![0u8; len];
        match ctx
            .volumes
            .stream(volume)
            .and_then(|s| read_exact_at(s, block.data_offset, &mut text))
        {
            Ok(()) => self.info.comment = Some(lossy(trim_nul(&text))),
            Err(e) => ctx.warn(format!("RAR5 comment: {}", e)),
        }
    }

    fn finish(mut self, ctx: &mut ParseContext<'_>) -> Parsed {
        if let Some(index) = self.pending.take() {
            let name = &self.entries[index].item.name;
            ctx.warn(format!("{:?} continues in a volume that is not available", name));
        }
        let mut methods: Vec<String> = Vec::new();
        for entry in &self.entries {
            if entry.item.is_dir() {
                continue;
            }
            let name = entry.item.method.to_string();
            if !methods.contains(&name) {
                methods.push(name);
            }
        }
        if !methods.is_empty() {
            self.info.method = Some(methods.join(" "));
        }
        self.info.volumes = ctx.volumes.len() as u32;

        let mut parsed = Parsed::new(self.info);
        for entry in self.entries {
            let (item, source) = entry.into_parts();
            parsed.push(item, source);
        }
        parsed
    }
}

pub(crate) fn parse(ctx: &mut ParseContext<'_>) -> Result<Parsed> {
    let mut walker = Walker {
        info: ArchiveInfo::new(FormatKind::Rar5, ctx.size()),
        entries: Vec::new(),
        pending: None,
    };

    let mut more = walker.read_volume(ctx, 0)?;
    while more {
        let number = ctx.volumes.len();
        let Some(volume) = ctx.volumes.open_next(&mut *ctx.provider, None)? else {
            ctx.warn(format!("RAR5 volume {} is missing", number + 1));
            break;
        };
        match walker.read_volume(ctx, volume) {
            Ok(next) => {
                log::debug!("RAR5 volume {} read", volume);
                more = next;
            }
            Err(e) if e.is_format_mismatch() => {
                ctx.warn(format!("volume {} does not continue this archive: {}", volume, e));
                ctx.volumes.truncate(volume as usize);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    log::debug!(
        "RAR5: {} items in {} volumes",
        walker.entries.len(),
        ctx.volumes.len()
    );
    Ok(walker.finish(ctx))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::testing::{parse_with, parse_with_volumes, probe_with};
    use crate::volume::MemoryVolumes;

    pub(crate) fn vint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let b = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(b);
                return out;
            }
            out.push(b | 0x80);
        }
    }

    /// Encodes one block; `data` follows the header.
    pub(crate) fn block(kind: u64, flags: u64, body: &[u8], extra: &[u8], data: Option<&[u8]>) -> Vec<u8> {
        let header = header_bytes(kind, flags, body, extra, data.map(|d| d.len()));
        let mut out = header;
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        out
    }

    fn header_bytes(kind: u64, flags: u64, body: &[u8], extra: &[u8], data: Option<usize>) -> Vec<u8> {
        let mut flags = flags;
        if !extra.is_empty() {
            flags |= HFL_EXTRA;
        }
        if data.is_some() {
            flags |= HFL_DATA;
        }
        let mut h = vint(kind);
        h.extend(vint(flags));
        if !extra.is_empty() {
            h.extend(vint(extra.len() as u64));
        }
        if let Some(len) = data {
            h.extend(vint(len as u64));
        }
        h.extend_from_slice(body);
        h.extend_from_slice(extra);
        let mut sized = vint(h.len() as u64);
        sized.extend(h);
        let mut out = crc32fast::hash(&sized).to_le_bytes().to_vec();
        out.extend(sized);
        out
    }

    pub(crate) fn main_block(flags: u64, number: Option<u64>) -> Vec<u8> {
        let mut body = vint(flags | if number.is_some() { MAIN_VOLUME_NUMBER } else { 0 });
        if let Some(n) = number {
            body.extend(vint(n));
        }
        block(BLOCK_MAIN, 0, &body, &[], None)
    }

    pub(crate) fn end_block(more: bool) -> Vec<u8> {
        block(BLOCK_END, 0, &vint(u64::from(more)), &[], None)
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct TestFile {
        pub name: String,
        pub data: Vec<u8>,
        pub size: Option<u64>,
        pub dir: bool,
        pub method: u64,
        pub crc: Option<u32>,
        pub split_before: bool,
        pub split_after: bool,
        pub unix_mode: Option<u64>,
        pub extra: Vec<u8>,
        pub service: bool,
    }

    impl TestFile {
        pub(crate) fn stored(name: &str, data: &[u8]) -> Self {
            Self {
                name: name.to_string(),
                data: data.to_vec(),
                crc: Some(crc32fast::hash(data)),
                ..Default::default()
            }
        }

        pub(crate) fn encode(&self) -> Vec<u8> {
            let mut flags = 0;
            if self.dir {
                flags |= FILE_DIR;
            }
            if self.crc.is_some() {
                flags |= FILE_CRC;
            }
            let mut body = vint(flags);
            body.extend(vint(self.size.unwrap_or(self.data.len() as u64)));
            body.extend(vint(self.unix_mode.unwrap_or(0x20)));
            if let Some(crc) = self.crc {
                body.extend(crc.to_le_bytes());
            }
            body.extend(vint(self.method << 7));
            body.extend(vint(if self.unix_mode.is_some() { HOST_UNIX } else { 0 }));
            body.extend(vint(self.name.len() as u64));
            body.extend(self.name.as_bytes());
            let mut header_flags = 0;
            if self.split_before {
                header_flags |= HFL_SPLIT_BEFORE;
            }
            if self.split_after {
                header_flags |= HFL_SPLIT_AFTER;
            }
            let kind = if self.service { BLOCK_SERVICE } else { BLOCK_FILE };
            let data = (!self.dir).then_some(&self.data[..]);
            block(kind, header_flags, &body, &self.extra, data)
        }
    }

    pub(crate) fn extra_record(kind: u64, data: &[u8]) -> Vec<u8> {
        let mut rec = vint(kind);
        rec.extend_from_slice(data);
        let mut out = vint(rec.len() as u64);
        out.extend(rec);
        out
    }

    pub(crate) fn archive(files: &[TestFile]) -> Vec<u8> {
        let mut out = MARKER.to_vec();
        out.extend(main_block(0, None));
        for file in files {
            out.extend(file.encode());
        }
        out.extend(end_block(false));
        out
    }

    #[test]
    fn test_probe() {
        assert_eq!(probe_with(probe, &archive(&[])), Probe::Match);
        assert_eq!(probe_with(probe, b"Rar!\x1A\x07"), Probe::NeedMoreBytes(8));
        assert_eq!(probe_with(probe, b"Rar!\x1A\x07\x00\x00"), Probe::NotThisFormat);
    }

    #[test]
    fn test_stored_items() {
        let data = archive(&[
            TestFile {
                name: "docs".into(),
                dir: true,
                crc: None,
                ..Default::default()
            },
            TestFile::stored("docs/readme.txt", b"hello rar"),
            TestFile::stored("empty", b""),
        ]);
        let parsed = parse_with(parse, &data, None).unwrap();
        assert_eq!(parsed.items.len(), 3);
        assert!(parsed.items[0].is_dir());
        assert!(matches!(parsed.sources[0], ItemSource::Empty));

        let item = &parsed.items[1];
        assert_eq!(item.name, "docs/readme.txt");
        assert_eq!(item.size, Some(9));
        assert_eq!(item.method, Method::Copy);
        assert_eq!(item.crc, Some(crc32fast::hash(b"hello rar")));
        assert!(item.crc_covers_item);
        assert_eq!(item.attributes, Some(0x20));
        match &parsed.sources[1] {
            ItemSource::Range { extents, method, crypto } => {
                assert_eq!(extents.len(), 1);
                assert_eq!(extents[0].len, 9);
                assert_eq!(&data[extents[0].offset as usize..][..9], b"hello rar");
                assert_eq!(*method, Method::Copy);
                assert!(crypto.is_none());
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert!(matches!(parsed.sources[2], ItemSource::Empty));
        assert_eq!(parsed.info.physical_size, data.len() as u64);
        assert!(!parsed.info.headers_error);
        assert_eq!(parsed.info.method.as_deref(), Some("Copy"));
    }

    #[test]
    fn test_compressed_item_listed() {
        let mut file = TestFile::stored("packed.bin", b"\x01\x02\x03");
        file.method = 3;
        file.size = Some(100);
        let parsed = parse_with(parse, &archive(&[file]), None).unwrap();
        assert_eq!(parsed.items[0].method, Method::Rar(3));
        assert_eq!(parsed.items[0].size, Some(100));
        assert_eq!(parsed.items[0].packed_size, 3);
        assert_eq!(parsed.info.method.as_deref(), Some("RAR:m3"));
    }

    #[test]
    fn test_extras() {
        let mut time = vint(0x02);
        // 2021-01-01T00:00:00Z as FILETIME
        time.extend((132_539_328_000_000_000u64).to_le_bytes());
        let mut link = vint(1);
        link.extend(vint(0));
        link.extend(vint(6));
        link.extend(b"target");
        let mut owner = vint(0x01 | 0x04 | 0x08);
        owner.extend(vint(4));
        owner.extend(b"root");
        owner.extend(vint(1000));
        owner.extend(vint(100));

        let mut file = TestFile::stored("link", b"");
        file.unix_mode = Some(0o120777);
        file.extra = [
            extra_record(EXTRA_TIME, &time),
            extra_record(EXTRA_LINK, &link),
            extra_record(EXTRA_OWNER, &owner),
        ]
        .concat();
        let parsed = parse_with(parse, &archive(&[file]), None).unwrap();
        let item = &parsed.items[0];
        assert_eq!(item.kind, ItemKind::Symlink);
        assert_eq!(item.link_target.as_deref(), Some("target"));
        assert_eq!(item.mtime, Some(1_609_459_200));
        assert_eq!(item.uid, Some(1000));
        assert_eq!(item.gid, Some(100));
        assert_eq!(item.mode, Some(0o120777));
        assert!(item.attributes.is_none());
    }

    #[test]
    fn test_first_block_crc_is_not_rar() {
        let mut data = archive(&[TestFile::stored("a", b"a")]);
        data[8] ^= 0xFF;
        let err = parse_with(parse, &data, None).unwrap_err();
        assert!(matches!(err, Error::NotThisFormat));
    }

    #[test]
    fn test_later_block_crc_sets_headers_error() {
        let first = TestFile::stored("a.txt", b"aaaa");
        let mut data = MARKER.to_vec();
        data.extend(main_block(0, None));
        data.extend(first.encode());
        let bad = data.len();
        data.extend(TestFile::stored("b.txt", b"bbbb").encode());
        data.extend(end_block(false));
        data[bad] ^= 0x55;

        let parsed = parse_with(parse, &data, None).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "a.txt");
        assert!(parsed.info.headers_error);
        assert_eq!(parsed.info.physical_size, bad as u64);
    }

    #[test]
    fn test_truncated_data() {
        let mut data = archive(&[TestFile::stored("big", &[7u8; 64])]);
        data.truncate(data.len() - 40);
        let parsed = parse_with(parse, &data, None).unwrap();
        assert!(parsed.info.unexpected_end);
        assert!(parsed.items[0].flags.unexpected_end);
        assert!(matches!(
            parsed.sources[0],
            ItemSource::Unavailable(ItemOutcome::UnexpectedEnd)
        ));
    }

    fn split_volumes(second_number: u64) -> (Vec<u8>, Vec<u8>) {
        let content = b"first half|second half";
        let mut head = TestFile::stored("split.bin", &content[..11]);
        head.size = Some(content.len() as u64);
        head.crc = Some(crc32fast::hash(&content[..11]));
        head.split_after = true;
        let mut tail = TestFile::stored("split.bin", &content[11..]);
        tail.size = Some(content.len() as u64);
        tail.crc = Some(crc32fast::hash(content));
        tail.split_before = true;

        let mut first = MARKER.to_vec();
        first.extend(main_block(MAIN_VOLUME, None));
        first.extend(TestFile::stored("before.txt", b"x").encode());
        first.extend(head.encode());
        first.extend(end_block(true));

        let mut second = MARKER.to_vec();
        second.extend(main_block(MAIN_VOLUME, Some(second_number)));
        second.extend(tail.encode());
        second.extend(TestFile::stored("after.txt", b"y").encode());
        second.extend(end_block(false));
        (first, second)
    }

    #[test]
    fn test_split_across_volumes() {
        let (first, second) = split_volumes(1);
        let mut volumes = MemoryVolumes::new().with("set.part2.rar", second.clone());
        let parsed = parse_with_volumes(parse, &first, None, &mut volumes).unwrap();
        assert_eq!(parsed.info.volumes, 2);
        let names: Vec<_> = parsed.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["before.txt", "split.bin", "after.txt"]);

        let item = &parsed.items[1];
        assert_eq!(item.packed_size, 22);
        assert_eq!(item.crc, Some(crc32fast::hash(b"first half|second half")));
        assert!(item.crc_covers_item);
        assert!(!item.flags.split_after);
        match &parsed.sources[1] {
            ItemSource::Range { extents, .. } => {
                assert_eq!(extents.len(), 2);
                assert_eq!((extents[0].volume, extents[0].len), (0, 11));
                assert_eq!((extents[1].volume, extents[1].len), (1, 11));
                let start = extents[1].offset as usize;
                assert_eq!(&second[start..start + 11], b"second half");
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(parsed.items[2].volume, 1);
    }

    #[test]
    fn test_missing_volume() {
        let (first, _) = split_volumes(1);
        let parsed = parse_with(parse, &first, None).unwrap();
        assert_eq!(parsed.info.volumes, 1);
        assert_eq!(parsed.items.len(), 2);
        assert!(parsed.items[1].flags.split_after);
        assert!(!parsed.items[1].crc_covers_item);
        assert!(matches!(
            parsed.sources[1],
            ItemSource::Unavailable(ItemOutcome::Unavailable)
        ));
        assert!(!parsed.info.warnings.is_empty());
    }

    #[test]
    fn test_wrong_volume_number() {
        let (first, second) = split_volumes(4);
        let mut volumes = MemoryVolumes::new().with("x", second);
        let parsed = parse_with_volumes(parse, &first, None, &mut volumes).unwrap();
        assert_eq!(parsed.info.volumes, 1);
        assert!(matches!(
            parsed.sources[1],
            ItemSource::Unavailable(ItemOutcome::Unavailable)
        ));
    }

    #[test]
    fn test_comment_and_solid() {
        let mut comment = TestFile::stored("CMT", b"archive comment\0");
        comment.service = true;
        let mut data = MARKER.to_vec();
        data.extend(main_block(MAIN_SOLID, None));
        data.extend(comment.encode());
        data.extend(TestFile::stored("a", b"a").encode());
        data.extend(end_block(false));
        let parsed = parse_with(parse, &data, None).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.info.comment.as_deref(), Some("archive comment"));
        assert!(parsed.info.solid);
    }

    #[cfg(feature = "aes")]
    pub(crate) fn crypto_record(password: &str, salt: [u8; 16], iv: Option<[u8; 16]>, log: u8) -> Vec<u8> {
        use sha2::{Digest, Sha256};

        let keys = crate::crypto::Rar5Keys::derive(&Password::new(password), &salt, log).unwrap();
        let check = *keys.check_value();
        let mut rec = vint(0);
        rec.extend(vint(CRYPT_CHECK));
        rec.push(log);
        rec.extend(salt);
        if let Some(iv) = iv {
            rec.extend(iv);
        }
        rec.extend(check);
        rec.extend(&Sha256::digest(check)[..4]);
        rec
    }

    #[cfg(feature = "aes")]
    fn encrypted_headers(password: &str) -> Vec<u8> {
        let salt = [9u8; 16];
        let key = *crate::crypto::Rar5Keys::derive(&Password::new(password), &salt, 1)
            .unwrap()
            .key();
        let seal = |plain: Vec<u8>, iv: [u8; 16], data: &[u8]| -> Vec<u8> {
            let mut padded = plain;
            padded.resize(padded.len().next_multiple_of(AES_BLOCK), 0);
            crate::crypto::encrypt_blocks(&key, &iv, &mut padded);
            let mut out = iv.to_vec();
            out.extend(padded);
            out.extend_from_slice(data);
            out
        };

        let mut data = MARKER.to_vec();
        data.extend(block(BLOCK_CRYPT, 0, &crypto_record(password, salt, None, 1), &[], None));
        let main = main_block(0, None);
        data.extend(seal(main, [1; 16], &[]));
        let file = TestFile::stored("secret.txt", b"plain payload");
        let encoded = file.encode();
        let header_len = encoded.len() - file.data.len();
        data.extend(seal(encoded[..header_len].to_vec(), [2; 16], &file.data));
        data.extend(seal(end_block(false), [3; 16], &[]));
        data
    }

    #[cfg(feature = "aes")]
    #[test]
    fn test_encrypted_headers() {
        let data = encrypted_headers("hunter2");
        assert!(matches!(
            parse_with(parse, &data, None).unwrap_err(),
            Error::PasswordRequired
        ));
        assert!(matches!(
            parse_with(parse, &data, Some("wrong")).unwrap_err(),
            Error::WrongPassword { item_index: None }
        ));

        let parsed = parse_with(parse, &data, Some("hunter2")).unwrap();
        assert!(parsed.info.encrypted);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "secret.txt");
        assert!(!parsed.items[0].flags.encrypted);
        assert_eq!(parsed.info.physical_size, data.len() as u64);
        match &parsed.sources[0] {
            ItemSource::Range { extents, .. } => {
                let start = extents[0].offset as usize;
                assert_eq!(&data[start..start + 13], b"plain payload");
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[cfg(feature = "aes")]
    #[test]
    fn test_encrypted_item_parameters() {
        let salt = [4u8; 16];
        let iv = [5u8; 16];
        let mut file = TestFile::stored("locked.txt", &[0u8; 16]);
        file.size = Some(10);
        file.extra = extra_record(EXTRA_CRYPTO, &crypto_record("pw", salt, Some(iv), 2));
        let parsed = parse_with(parse, &archive(&[file]), None).unwrap();
        assert!(parsed.info.encrypted);
        assert!(parsed.items[0].flags.encrypted);
        match &parsed.sources[0] {
            ItemSource::Range { crypto: Some(crypto), .. } => {
                assert_eq!(crypto.salt, salt);
                assert_eq!(crypto.iv, iv);
                assert_eq!(crypto.iterations_log, 2);
                assert!(crypto.check.is_some());
                assert!(!crypto.use_mac);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }
}
