//! Container builders shared by the integration tests.
//!
//! Each integration test file compiles as its own crate and uses a subset
//! of these helpers.

#![allow(dead_code)]

use std::io::Cursor;

use arkiv::{Archive, OpenOptions};

/// Opens an in-memory container with default options.
pub fn open(data: Vec<u8>) -> Archive<Cursor<Vec<u8>>> {
    Archive::open(Cursor::new(data), OpenOptions::new()).expect("container should open")
}

// ---------------------------------------------------------------------------
// ar
// ---------------------------------------------------------------------------

/// Appends one `ar` member with a raw 16-byte name field.
pub fn ar_member(out: &mut Vec<u8>, name: &str, data: &[u8]) {
    let header = format!(
        "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
        name,
        1_700_000_000,
        0,
        0,
        100644,
        data.len()
    );
    assert_eq!(header.len(), 60);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(b'\n');
    }
}

/// Builds a GNU-style archive with `name/` member names.
pub fn ar(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        ar_member(&mut out, &format!("{}/", name), data);
    }
    out
}

// ---------------------------------------------------------------------------
// tar
// ---------------------------------------------------------------------------

/// Builds one ustar header block.
pub fn tar_header(name: &str, type_flag: u8, size: u64, link: &str) -> [u8; 512] {
    let mut h = [0u8; 512];
    h[..name.len()].copy_from_slice(name.as_bytes());
    h[100..108].copy_from_slice(b"0000644\0");
    h[108..116].copy_from_slice(b"0001750\0");
    h[116..124].copy_from_slice(b"0001750\0");
    h[124..136].copy_from_slice(format!("{:011o}\0", size).as_bytes());
    h[136..148].copy_from_slice(b"14533436700\0");
    h[156] = type_flag;
    h[157..157 + link.len()].copy_from_slice(link.as_bytes());
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    h[148..156].fill(b' ');
    let sum: u32 = h.iter().map(|&b| u32::from(b)).sum();
    h[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
    h
}

/// Appends one tar entry with its data and padding.
pub fn tar_entry(out: &mut Vec<u8>, name: &str, type_flag: u8, data: &[u8], link: &str) {
    out.extend_from_slice(&tar_header(name, type_flag, data.len() as u64, link));
    out.extend_from_slice(data);
    out.resize(out.len().next_multiple_of(512), 0);
}

/// Builds a tar archive of regular files, terminated by two zero blocks.
pub fn tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in files {
        tar_entry(&mut out, name, b'0', data, "");
    }
    out.resize(out.len() + 1024, 0);
    out
}

// ---------------------------------------------------------------------------
// CAB
// ---------------------------------------------------------------------------

pub const CAB_HEADER: usize = 36;
pub const CONTINUED_FROM_PREV: u16 = 0xFFFD;
pub const CONTINUED_TO_NEXT: u16 = 0xFFFE;

/// The CAB data checksum.
pub fn cab_checksum(data: &[u8]) -> u32 {
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

/// One `CFFILE` record.
pub struct CabFile<'a> {
    pub name: &'a str,
    pub folder: u16,
    pub offset: u32,
    pub size: u32,
}

/// One cabinet of a set; each folder is a list of `(payload, unpacked)`
/// stored blocks.
pub struct Cabinet<'a> {
    pub set_id: u16,
    pub number: u16,
    pub prev: Option<&'a str>,
    pub next: Option<&'a str>,
    pub folders: Vec<Vec<(Vec<u8>, u16)>>,
    pub files: Vec<CabFile<'a>>,
}

impl<'a> Cabinet<'a> {
    /// A standalone cabinet with one stored folder.
    pub fn single(blocks: Vec<(Vec<u8>, u16)>, files: Vec<CabFile<'a>>) -> Self {
        Self {
            set_id: 0x1234,
            number: 0,
            prev: None,
            next: None,
            folders: vec![blocks],
            files,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut names = Vec::new();
        let mut flags = 0u16;
        if let Some(prev) = self.prev {
            flags |= 1;
            for s in [prev, "Disk"] {
                names.extend_from_slice(s.as_bytes());
                names.push(0);
            }
        }
        if let Some(next) = self.next {
            flags |= 2;
            for s in [next, "Disk"] {
                names.extend_from_slice(s.as_bytes());
                names.push(0);
            }
        }

        let folders_at = CAB_HEADER + names.len();
        let files_at = folders_at + 8 * self.folders.len();
        let file_bytes: usize = self.files.iter().map(|f| 16 + f.name.len() + 1).sum();
        let data_at = files_at + file_bytes;

        let mut data = Vec::new();
        let mut starts = Vec::new();
        for folder in &self.folders {
            starts.push(data_at + data.len());
            for (payload, unpacked) in folder {
                let mut header = vec![0u8; 8];
                header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
                header[6..8].copy_from_slice(&unpacked.to_le_bytes());
                let sum = cab_checksum(payload) ^ cab_checksum(&header);
                header[0..4].copy_from_slice(&sum.to_le_bytes());
                data.extend(header);
                data.extend_from_slice(payload);
            }
        }

        let total = data_at + data.len();
        let mut out = vec![0u8; CAB_HEADER];
        out[..4].copy_from_slice(b"MSCF");
        out[8..12].copy_from_slice(&(total as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(files_at as u32).to_le_bytes());
        out[24] = 3;
        out[25] = 1;
        out[26..28].copy_from_slice(&(self.folders.len() as u16).to_le_bytes());
        out[28..30].copy_from_slice(&(self.files.len() as u16).to_le_bytes());
        out[30..32].copy_from_slice(&flags.to_le_bytes());
        out[32..34].copy_from_slice(&self.set_id.to_le_bytes());
        out[34..36].copy_from_slice(&self.number.to_le_bytes());
        out.extend(names);
        for (folder, start) in self.folders.iter().zip(&starts) {
            out.extend_from_slice(&(*start as u32).to_le_bytes());
            out.extend_from_slice(&(folder.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
        }
        for file in &self.files {
            out.extend_from_slice(&file.size.to_le_bytes());
            out.extend_from_slice(&file.offset.to_le_bytes());
            out.extend_from_slice(&file.folder.to_le_bytes());
            out.extend_from_slice(&0x5861u16.to_le_bytes());
            out.extend_from_slice(&0x63C5u16.to_le_bytes());
            out.extend_from_slice(&0x20u16.to_le_bytes());
            out.extend_from_slice(file.name.as_bytes());
            out.push(0);
        }
        out.extend(data);
        assert_eq!(out.len(), total);
        out
    }
}

// ---------------------------------------------------------------------------
// RAR 5
// ---------------------------------------------------------------------------

pub const RAR5_MARKER: &[u8; 8] = b"Rar!\x1A\x07\x01\x00";

pub fn vint(mut value: u64) -> Vec<u8> {
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

/// Encodes one block with header CRC, optional extra area and data area.
pub fn rar5_block(kind: u64, mut flags: u64, body: &[u8], extra: &[u8], data: Option<&[u8]>) -> Vec<u8> {
    if !extra.is_empty() {
        flags |= 0x01;
    }
    if data.is_some() {
        flags |= 0x02;
    }
    let mut h = vint(kind);
    h.extend(vint(flags));
    if !extra.is_empty() {
        h.extend(vint(extra.len() as u64));
    }
    if let Some(data) = data {
        h.extend(vint(data.len() as u64));
    }
    h.extend_from_slice(body);
    h.extend_from_slice(extra);
    let mut sized = vint(h.len() as u64);
    sized.extend(h);
    let mut out = crc32fast::hash(&sized).to_le_bytes().to_vec();
    out.extend(sized);
    if let Some(data) = data {
        out.extend_from_slice(data);
    }
    out
}

/// A stored RAR 5 file record.
#[derive(Debug, Clone, Default)]
pub struct RarFile {
    pub name: String,
    pub data: Vec<u8>,
    pub size: Option<u64>,
    pub crc: Option<u32>,
    pub extra: Vec<u8>,
    pub split_before: bool,
    pub split_after: bool,
}

impl RarFile {
    pub fn stored(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_vec(),
            crc: Some(crc32fast::hash(data)),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = vint(if self.crc.is_some() { 0x04 } else { 0 });
        body.extend(vint(self.size.unwrap_or(self.data.len() as u64)));
        body.extend(vint(0x20));
        if let Some(crc) = self.crc {
            body.extend(crc.to_le_bytes());
        }
        body.extend(vint(0));
        body.extend(vint(0));
        body.extend(vint(self.name.len() as u64));
        body.extend(self.name.as_bytes());
        let flags = u64::from(self.split_before) * 0x08 | u64::from(self.split_after) * 0x10;
        rar5_block(2, flags, &body, &self.extra, Some(&self.data))
    }
}

/// One extra-area record.
pub fn rar5_extra(kind: u64, data: &[u8]) -> Vec<u8> {
    let mut rec = vint(kind);
    rec.extend_from_slice(data);
    let mut out = vint(rec.len() as u64);
    out.extend(rec);
    out
}

/// One volume of a multi-volume set; `number` is zero-based.
pub fn rar5_volume(number: u64, files: &[RarFile], more: bool) -> Vec<u8> {
    let mut main = vint(if number > 0 { 0x03 } else { 0x01 });
    if number > 0 {
        main.extend(vint(number));
    }
    let mut out = RAR5_MARKER.to_vec();
    out.extend(rar5_block(1, 0, &main, &[], None));
    for file in files {
        out.extend(file.encode());
    }
    out.extend(rar5_block(5, 0, &vint(u64::from(more)), &[], None));
    out
}

pub fn rar5(files: &[RarFile]) -> Vec<u8> {
    let mut out = RAR5_MARKER.to_vec();
    out.extend(rar5_block(1, 0, &vint(0), &[], None));
    for file in files {
        out.extend(file.encode());
    }
    out.extend(rar5_block(5, 0, &vint(0), &[], None));
    out
}

// ---------------------------------------------------------------------------
// cramfs
// ---------------------------------------------------------------------------

/// Builds a little-endian cramfs image whose root holds one regular file.
///
/// `blocks` are the already-packed 4 KiB blocks of the file; an empty
/// block is stored as a zero-length pointer step, which cramfs reads as a
/// hole.
pub fn cramfs_single_file(name: &str, size: u32, blocks: &[Vec<u8>]) -> Vec<u8> {
    const HEADER: usize = 0x40;
    const NODE: usize = 12;
    let node = |mode: u16, size: u32, name_len: usize, offset: usize| -> [u8; 12] {
        let mut n = [0u8; NODE];
        n[0..2].copy_from_slice(&mode.to_le_bytes());
        n[2..4].copy_from_slice(&1000u16.to_le_bytes());
        n[4..8].copy_from_slice(&(size | 100 << 24).to_le_bytes());
        let units = (name_len / 4) as u32;
        let off = (offset / 4) as u32;
        n[8..12].copy_from_slice(&(units | off << 6).to_le_bytes());
        n
    };

    let padded = name.len().div_ceil(4) * 4;
    let dir_at = HEADER + NODE;
    let dir_len = NODE + padded;
    let table_at = dir_at + dir_len;

    let mut img = vec![0u8; table_at + blocks.len() * 4];
    let mut end = img.len();
    for (i, block) in blocks.iter().enumerate() {
        img.extend_from_slice(block);
        end += block.len();
        img[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&(end as u32).to_le_bytes());
    }
    img.resize(img.len().next_multiple_of(4), 0);

    img[HEADER..HEADER + NODE].copy_from_slice(&node(0o040755, dir_len as u32, 0, dir_at));
    img[dir_at..dir_at + NODE].copy_from_slice(&node(0o100644, size, padded, table_at));
    img[dir_at + NODE..dir_at + NODE + name.len()].copy_from_slice(name.as_bytes());

    let total = img.len() as u32;
    img[..4].copy_from_slice(&[0x45, 0x3D, 0xCD, 0x28]);
    img[4..8].copy_from_slice(&total.to_le_bytes());
    img[8..12].copy_from_slice(&(1u32 | 1 << 14).to_le_bytes());
    img[16..32].copy_from_slice(b"Compressed ROMFS");
    img[0x2C..0x30].copy_from_slice(&2u32.to_le_bytes());
    img[0x30..0x34].copy_from_slice(b"test");
    let crc = crc32fast::hash(&img);
    img[0x20..0x24].copy_from_slice(&crc.to_le_bytes());
    img
}
