//! Multi-volume container support.
//!
//! CAB and RAR5 archives can be split across several files. Parsers open the
//! follow-on volumes sequentially through a [`VolumeProvider`] while reading
//! headers; the opened streams are kept in a [`VolumeSet`] for the lifetime
//! of the archive, and items reference their payload pieces as [`Extent`]s.
//!
//! # Volume naming
//!
//! - CAB stores the next cabinet's file name in its header; the provider
//!   receives it as [`VolumeRequest::name`].
//! - RAR numbers its volumes (`name.part01.rar`, `name.part02.rar`, ...);
//!   [`next_volume_name`] derives the follow-on name.
//!
//! ```rust,no_run
//! use arkiv::{Archive, OpenOptions};
//! use arkiv::volume::DirectoryVolumes;
//!
//! let file = std::fs::File::open("disk1.cab")?;
//! let options = OpenOptions::new().volumes(DirectoryVolumes::new("."));
//! let archive = Archive::open(std::io::BufReader::new(file), options)?;
//! println!("{} items", archive.len());
//! # Ok::<(), arkiv::Error>(())
//! ```

mod provider;

use std::io::{self, Read, Seek, SeekFrom};

pub use provider::{
    DirectoryVolumes, MemoryVolumes, NoVolumes, VolumeProvider, VolumeRequest, VolumeStream,
    next_volume_name,
};

use crate::window::{ReadSeek, stream_len};
use crate::{Error, Result};

/// A contiguous piece of payload in one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Volume index (0 is the primary stream).
    pub volume: u32,
    /// Offset inside the volume.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Extent {
    /// Creates an extent.
    pub fn new(volume: u32, offset: u64, len: u64) -> Self {
        Self {
            volume,
            offset,
            len,
        }
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }
}

/// An additional volume held open for the archive's lifetime.
pub struct Volume {
    /// Name the volume was opened under, if known.
    pub name: Option<String>,
    /// The stream.
    pub stream: VolumeStream,
    /// Stream length.
    pub size: u64,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// The primary stream plus every additional volume.
#[derive(Debug)]
pub struct VolumeSet<R> {
    primary: R,
    primary_size: u64,
    primary_name: Option<String>,
    extra: Vec<Volume>,
}

impl<R> VolumeSet<R> {
    /// Number of volumes, primary included.
    pub fn len(&self) -> usize {
        1 + self.extra.len()
    }

    /// Always `false`: the primary stream is always present.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<R: Read + Seek> VolumeSet<R> {
    /// Creates a set holding only the primary stream.
    pub fn new(mut primary: R, primary_name: Option<String>) -> Result<Self> {
        let primary_size = stream_len(&mut primary)?;
        Ok(Self {
            primary,
            primary_size,
            primary_name,
            extra: Vec::new(),
        })
    }

    /// Length of volume `volume`.
    pub fn size(&self, volume: u32) -> Option<u64> {
        match volume {
            0 => Some(self.primary_size),
            n => self.extra.get(n as usize - 1).map(|v| v.size),
        }
    }

    /// Name of volume `volume`, if known.
    pub fn name(&self, volume: u32) -> Option<&str> {
        match volume {
            0 => self.primary_name.as_deref(),
            n => self.extra.get(n as usize - 1).and_then(|v| v.name.as_deref()),
        }
    }

    /// Appends an opened volume and returns its index.
    pub fn push(&mut self, name: Option<String>, mut stream: VolumeStream) -> Result<u32> {
        let size = stream_len(&mut stream)?;
        self.extra.push(Volume { name, stream, size });
        Ok(self.extra.len() as u32)
    }

    /// Drops every volume from `count` on.
    pub fn truncate(&mut self, count: usize) {
        self.extra.truncate(count.saturating_sub(1));
    }

    /// Returns the stream of volume `volume`.
    pub fn stream(&mut self, volume: u32) -> Result<&mut dyn ReadSeek> {
        match volume {
            0 => Ok(&mut self.primary),
            n => match self.extra.get_mut(n as usize - 1) {
                Some(v) => Ok(&mut v.stream),
                None => Err(Error::VolumeUnavailable {
                    volume: n,
                    name: String::new(),
                }),
            },
        }
    }

    /// Returns the primary stream.
    pub fn primary_mut(&mut self) -> &mut R {
        &mut self.primary
    }

    /// Asks `provider` for the next volume and keeps it.
    ///
    /// Returns the new volume's index, or `None` when the provider has none.
    pub fn open_next(
        &mut self,
        provider: &mut dyn VolumeProvider,
        stored_name: Option<&str>,
    ) -> Result<Option<u32>> {
        let number = self.len() as u32;
        let previous = self.name(number - 1).map(str::to_string);
        let request = VolumeRequest {
            number,
            name: stored_name,
            previous: previous.as_deref(),
        };
        let name = request.resolved_name();
        match provider.next_volume(&request)? {
            Some(stream) => Ok(Some(self.push(name, stream)?)),
            None => {
                log::debug!("volume {} ({:?}) not available", number, name);
                Ok(None)
            }
        }
    }

    /// Moves the additional volumes out, leaving only the primary.
    pub fn take_extra(&mut self) -> Vec<Volume> {
        std::mem::take(&mut self.extra)
    }

    /// Appends volumes taken from another set.
    pub fn extend(&mut self, volumes: Vec<Volume>) {
        self.extra.extend(volumes);
    }

    /// Returns `true` if `extent` lies inside its volume.
    pub fn contains(&self, extent: &Extent) -> bool {
        match (self.size(extent.volume), extent.end()) {
            (Some(size), Some(end)) => end <= size,
            _ => false,
        }
    }

    /// Consumes the set and returns the primary stream.
    pub fn into_primary(self) -> R {
        self.primary
    }
}

/// A seekable reader over a list of extents, possibly in several volumes.
pub struct ExtentReader<'a, R> {
    volumes: &'a mut VolumeSet<R>,
    extents: &'a [Extent],
    size: u64,
    pos: u64,
}

impl<R> std::fmt::Debug for ExtentReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentReader")
            .field("extents", &self.extents)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<'a, R: Read + Seek> ExtentReader<'a, R> {
    /// Creates a reader over `extents` in order.
    pub fn new(volumes: &'a mut VolumeSet<R>, extents: &'a [Extent]) -> Self {
        let size = extents.iter().map(|e| e.len).sum();
        Self {
            volumes,
            extents,
            size,
            pos: 0,
        }
    }

    /// Total length of all extents.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read + Seek> Read for ExtentReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }
        let mut start = 0u64;
        for extent in self.extents {
            if self.pos < start + extent.len {
                let within = self.pos - start;
                let n = (extent.len - within).min(buf.len() as u64) as usize;
                let stream = self.volumes.stream(extent.volume)?;
                stream.seek(SeekFrom::Start(extent.offset + within))?;
                let got = stream.read(&mut buf[..n])?;
                if got == 0 {
                    return Err(Error::UnexpectedEnd {
                        offset: extent.offset + within,
                    }
                    .into());
                }
                self.pos += got as u64;
                return Ok(got);
            }
            start += extent.len;
        }
        Ok(0)
    }
}

impl<R: Read + Seek> Seek for ExtentReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.size.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek position")
        })?;
        self.pos = target;
        Ok(target)
    }
}
