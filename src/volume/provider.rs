//! Next-volume collaborators.

use std::fs::File;
use std::io::{self, BufReader, Cursor};
use std::path::{Path, PathBuf};

use crate::window::ReadSeek;
use crate::Result;

/// An opened additional volume.
pub type VolumeStream = Box<dyn ReadSeek + Send>;

/// What a parser asks the [`VolumeProvider`] for.
#[derive(Debug, Clone, Copy)]
pub struct VolumeRequest<'a> {
    /// Zero-based number of the requested volume (the primary stream is 0).
    pub number: u32,
    /// File name stored in the previous volume's header, when the format
    /// records one (CAB).
    pub name: Option<&'a str>,
    /// Name of the previous volume, when known, for formats that derive
    /// the next name by numbering (RAR).
    pub previous: Option<&'a str>,
}

impl VolumeRequest<'_> {
    /// Returns the name to look up: the stored name, else the next name in
    /// the numbering sequence of `previous`.
    pub fn resolved_name(&self) -> Option<String> {
        match self.name {
            Some(name) => Some(name.to_string()),
            None => self.previous.and_then(next_volume_name),
        }
    }
}

/// Opens the volumes of a multi-part archive on demand.
///
/// Returning `Ok(None)` means "not available"; the archive then consists of
/// the volumes seen so far.
pub trait VolumeProvider: Send {
    /// Opens the requested volume.
    fn next_volume(&mut self, request: &VolumeRequest<'_>) -> Result<Option<VolumeStream>>;
}

/// A provider that never has another volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVolumes;

impl VolumeProvider for NoVolumes {
    fn next_volume(&mut self, _request: &VolumeRequest<'_>) -> Result<Option<VolumeStream>> {
        Ok(None)
    }
}

/// Opens sibling files from one directory.
#[derive(Debug, Clone)]
pub struct DirectoryVolumes {
    dir: PathBuf,
}

impl DirectoryVolumes {
    /// Serves volumes from `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the directory volumes are opened from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl VolumeProvider for DirectoryVolumes {
    fn next_volume(&mut self, request: &VolumeRequest<'_>) -> Result<Option<VolumeStream>> {
        let Some(name) = request.resolved_name() else {
            return Ok(None);
        };
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            log::warn!("refusing volume name outside the archive directory: {:?}", name);
            return Ok(None);
        }
        let path = self.dir.join(&name);
        match File::open(&path) {
            Ok(file) => {
                log::debug!("opened volume {} from {}", request.number, path.display());
                Ok(Some(Box::new(BufReader::new(file))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory volumes, looked up by name first and then by number.
#[derive(Debug, Clone, Default)]
pub struct MemoryVolumes {
    volumes: Vec<(String, Vec<u8>)>,
}

impl MemoryVolumes {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a volume; the n-th added volume answers request number n.
    pub fn with(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.volumes.push((name.into(), data));
        self
    }
}

impl VolumeProvider for MemoryVolumes {
    fn next_volume(&mut self, request: &VolumeRequest<'_>) -> Result<Option<VolumeStream>> {
        let by_name = request
            .resolved_name()
            .and_then(|name| self.volumes.iter().find(|(n, _)| *n == name));
        let found = by_name.or_else(|| {
            (request.number as usize)
                .checked_sub(1)
                .and_then(|i| self.volumes.get(i))
        });
        Ok(found.map(|(_, data)| Box::new(Cursor::new(data.clone())) as VolumeStream))
    }
}

/// Derives the next name of a numbered volume sequence.
///
/// Handles `name.partN.rar` (keeping the digit width), the older
/// `name.rar` -> `name.r00` -> `name.r01` scheme, and `name.NNN` splits.
///
/// ```rust
/// use arkiv::volume::next_volume_name;
///
/// assert_eq!(next_volume_name("set.part01.rar").as_deref(), Some("set.part02.rar"));
/// assert_eq!(next_volume_name("set.part9.rar").as_deref(), Some("set.part10.rar"));
/// assert_eq!(next_volume_name("old.rar").as_deref(), Some("old.r00"));
/// assert_eq!(next_volume_name("old.r07").as_deref(), Some("old.r08"));
/// ```
pub fn next_volume_name(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".rar") {
        let stem = &name[..name.len() - 4];
        let digits = stem.bytes().rev().take_while(u8::is_ascii_digit).count();
        if digits > 0 && stem[..stem.len() - digits].to_ascii_lowercase().ends_with(".part") {
            let split = stem.len() - digits;
            let next = increment_digits(&stem[split..])?;
            return Some(format!("{}{}{}", &stem[..split], next, &name[name.len() - 4..]));
        }
        return Some(format!("{}.r00", stem));
    }
    let dot = name.rfind('.')?;
    let ext = &name[dot + 1..];
    let (prefix, digits) = match ext.as_bytes().first() {
        Some(b'r' | b'R') if ext.len() > 1 => (&ext[..1], &ext[1..]),
        _ => ("", ext),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let next = increment_digits(digits)?;
    Some(format!("{}.{}{}", &name[..dot], prefix, next))
}

fn increment_digits(digits: &str) -> Option<String> {
    let value: u64 = digits.parse().ok()?;
    let next = value.checked_add(1)?;
    Some(format!("{:0width$}", next, width = digits.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_name_schemes() {
        assert_eq!(next_volume_name("a.part1.rar").as_deref(), Some("a.part2.rar"));
        assert_eq!(next_volume_name("a.part099.rar").as_deref(), Some("a.part100.rar"));
        assert_eq!(next_volume_name("A.PART01.RAR").as_deref(), Some("A.PART02.RAR"));
        assert_eq!(next_volume_name("disk.001").as_deref(), Some("disk.002"));
        assert_eq!(next_volume_name("plain.txt"), None);
        assert_eq!(next_volume_name("noext"), None);
    }

    #[test]
    fn test_request_prefers_stored_name() {
        let request = VolumeRequest {
            number: 1,
            name: Some("disk2.cab"),
            previous: Some("disk1.cab"),
        };
        assert_eq!(request.resolved_name().as_deref(), Some("disk2.cab"));
    }

    #[test]
    fn test_memory_volumes_by_name_then_number() {
        let mut volumes = MemoryVolumes::new()
            .with("b.cab", b"second".to_vec())
            .with("c.cab", b"third".to_vec());
        let named = VolumeRequest {
            number: 7,
            name: Some("c.cab"),
            previous: None,
        };
        assert!(volumes.next_volume(&named).unwrap().is_some());
        let numbered = VolumeRequest {
            number: 1,
            name: None,
            previous: None,
        };
        assert!(volumes.next_volume(&numbered).unwrap().is_some());
        let missing = VolumeRequest {
            number: 9,
            name: None,
            previous: None,
        };
        assert!(volumes.next_volume(&missing).unwrap().is_none());
    }

    #[test]
    fn test_directory_volumes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("set.part2.rar"), b"volume two").unwrap();
        let mut provider = DirectoryVolumes::new(dir.path());

        let request = VolumeRequest {
            number: 1,
            name: None,
            previous: Some("set.part1.rar"),
        };
        assert!(provider.next_volume(&request).unwrap().is_some());

        let request = VolumeRequest {
            number: 2,
            name: None,
            previous: Some("set.part2.rar"),
        };
        assert!(provider.next_volume(&request).unwrap().is_none());

        let escape = VolumeRequest {
            number: 1,
            name: Some("../etc/passwd"),
            previous: None,
        };
        assert!(provider.next_volume(&escape).unwrap().is_none());
    }
}
