//! Seekable read-only views over a sub-range of an input stream.
//!
//! [`ByteWindow`] borrows the underlying source; it never owns it. Every read
//! re-seeks the source to the window's absolute position, so several windows
//! (and the parsers that hold them) can take turns on the same stream.

use std::io::{self, Read, Seek, SeekFrom};

use crate::{Error, Result};

/// A readable, seekable byte source.
///
/// Blanket-implemented for everything that is `Read + Seek`, so trait objects
/// of the form `dyn ReadSeek` can stand in for any input.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// A window of `len` bytes starting at `start` in an underlying stream.
///
/// Reads past the end of the window return `Ok(0)`; seeking past the end is
/// permitted as it is for files.
///
/// # Example
///
/// ```rust
/// use arkiv::window::ByteWindow;
/// use std::io::{Cursor, Read};
///
/// let mut source = Cursor::new(b"headerPAYLOADtrailer".to_vec());
/// let mut window = ByteWindow::new(&mut source, 6, 7);
/// let mut out = String::new();
/// window.read_to_string(&mut out).unwrap();
/// assert_eq!(out, "PAYLOAD");
/// ```
pub struct ByteWindow<'a, R: ?Sized> {
    inner: &'a mut R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: ?Sized> std::fmt::Debug for ByteWindow<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteWindow")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<'a, R: Read + Seek + ?Sized> ByteWindow<'a, R> {
    /// Creates a window over `inner[start..start + len]`.
    pub fn new(inner: &'a mut R, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            len,
            pos: 0,
        }
    }

    /// Returns the window length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the window covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the absolute offset of the window start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the current position relative to the window start.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns the bytes left between the position and the window end.
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    /// Reads exactly `buf.len()` bytes at a window-relative offset.
    ///
    /// Fails with [`Error::UnexpectedEnd`] when the range leaves the window,
    /// without touching the underlying stream.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::UnexpectedEnd { offset })?;
        if end > self.len {
            return Err(Error::UnexpectedEnd {
                offset: self.start.saturating_add(self.len),
            });
        }
        read_exact_at(self.inner, self.start + offset, buf)
    }

    /// Reads `len` bytes at a window-relative offset into a new buffer.
    pub fn read_vec_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Narrows this window to a sub-range of itself.
    pub fn sub_window(&mut self, offset: u64, len: u64) -> ByteWindow<'_, R> {
        let offset = offset.min(self.len);
        let len = len.min(self.len - offset);
        ByteWindow::new(self.inner, self.start + offset, len)
    }
}

impl<R: Read + Seek + ?Sized> Read for ByteWindow<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (remaining.min(buf.len() as u64)) as usize;
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + ?Sized> Seek for ByteWindow<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

/// Returns the total length of a stream, restoring its position afterwards.
pub fn stream_len<R: Seek + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let pos = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))?;
    if pos != len {
        reader.seek(SeekFrom::Start(pos))?;
    }
    Ok(len)
}

/// Reads exactly `buf.len()` bytes at an absolute offset.
///
/// A short source yields [`Error::UnexpectedEnd`] carrying the first offset
/// that could not be read.
pub fn read_exact_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let n = read_at_most(reader, offset, buf)?;
    if n < buf.len() {
        return Err(Error::UnexpectedEnd {
            offset: offset + n as u64,
        });
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes at an absolute offset, stopping at EOF.
pub fn read_at_most<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
