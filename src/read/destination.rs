//! Extraction sinks.
//!
//! An [`ExtractSink`] decides where decoded bytes go. The pipeline asks it
//! for one writer per item, streams the item into that writer, drops it,
//! and then reports the item's outcome through [`ExtractSink::finish`].
//!
//! # Built-in sinks
//!
//! - [`FilesystemSink`] writes under a root directory
//! - [`MemorySink`] keeps every item in memory
//! - [`NullSink`] discards the bytes and counts them
//!
//! # Custom sinks
//!
//! ```rust
//! use std::io::Write;
//! use arkiv::{ExtractSink, Item, ItemOutcome, Result};
//!
//! /// Keeps only the sizes.
//! #[derive(Default)]
//! struct Sizes(Vec<(String, usize)>, Vec<u8>);
//!
//! impl ExtractSink for Sizes {
//!     fn writer(&mut self, item: &Item, _index: usize) -> Result<Option<Box<dyn Write + '_>>> {
//!         if item.is_dir() {
//!             return Ok(None);
//!         }
//!         self.1.clear();
//!         Ok(Some(Box::new(&mut self.1)))
//!     }
//!
//!     fn finish(&mut self, item: &Item, _index: usize, outcome: ItemOutcome) -> Result<()> {
//!         if outcome.is_ok() {
//!             self.0.push((item.name.clone(), self.1.len()));
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::item::{Item, ItemKind};
use crate::Result;

use super::ItemOutcome;
use super::path_safety::{create_symlink, validate_path, validate_symlink_target};

/// Destination of extracted items.
pub trait ExtractSink {
    /// Returns the writer for item `index`, or `None` to decode without
    /// keeping the bytes.
    ///
    /// Errors returned here end the extraction.
    fn writer(&mut self, item: &Item, index: usize) -> Result<Option<Box<dyn Write + '_>>>;

    /// Called once per item after its writer is dropped, including items
    /// that never got a writer because their data is unavailable.
    ///
    /// Errors returned here end the extraction.
    fn finish(&mut self, item: &Item, index: usize, outcome: ItemOutcome) -> Result<()>;

    /// Called instead of [`finish`](ExtractSink::finish) when the batch
    /// stops during this item.
    fn abort(&mut self, item: &Item, index: usize) {
        let _ = (item, index);
    }
}

/// Writes items under a root directory.
///
/// Names are validated before use: absolute names, drive prefixes and `..`
/// components fail with [`Error::PathTraversal`](crate::Error::PathTraversal), as do symlinks whose
/// target leaves the root. Files that end with any outcome other than
/// [`ItemOutcome::Ok`] are removed. Modification times are restored, and
/// on Unix so are permission bits.
///
/// Devices and FIFOs are skipped.
#[derive(Debug)]
pub struct FilesystemSink {
    root: PathBuf,
    preserve_permissions: bool,
    current: Option<PathBuf>,
}

impl FilesystemSink {
    /// Creates a sink rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            preserve_permissions: true,
            current: None,
        })
    }

    /// Sets whether Unix permission bits are restored.
    pub fn preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn create_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn link(&self, item: &Item, index: usize, path: &Path) -> Result<()> {
        let Some(target) = item.link_target.as_deref() else {
            return Ok(());
        };
        Self::create_parent(path)?;
        match item.kind {
            ItemKind::Symlink => {
                validate_symlink_target(index, &item.name, target)?;
                if let Err(e) = create_symlink(path, target) {
                    log::warn!("cannot create symlink '{}': {}", path.display(), e);
                }
            }
            _ => {
                let Some(source) = validate_path(index, target, &self.root)? else {
                    return Ok(());
                };
                if let Err(e) = fs::hard_link(&source, path) {
                    log::warn!(
                        "cannot link '{}' to '{}': {}",
                        path.display(),
                        source.display(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    fn restore_metadata(&self, item: &Item, path: &Path) {
        if let Some(mtime) = item.mtime {
            let time = filetime::FileTime::from_unix_time(mtime, 0);
            if let Err(e) = filetime::set_file_mtime(path, time) {
                log::warn!("cannot set mtime on '{}': {}", path.display(), e);
            }
        }

        #[cfg(unix)]
        if self.preserve_permissions {
            if let Some(mode) = item.mode {
                use std::os::unix::fs::PermissionsExt;
                let permissions = fs::Permissions::from_mode(mode & 0o7777);
                if let Err(e) = fs::set_permissions(path, permissions) {
                    log::warn!("cannot set permissions on '{}': {}", path.display(), e);
                }
            }
        }
    }

    fn remove_partial(&mut self) {
        if let Some(path) = self.current.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("cannot remove partial file '{}': {}", path.display(), e);
                }
            }
        }
    }
}

impl ExtractSink for FilesystemSink {
    fn writer(&mut self, item: &Item, index: usize) -> Result<Option<Box<dyn Write + '_>>> {
        self.current = None;
        let Some(path) = validate_path(index, &item.name, &self.root)? else {
            log::debug!("item {} has no usable name, skipping", index);
            return Ok(None);
        };

        match item.kind {
            ItemKind::Directory => {
                fs::create_dir_all(&path)?;
                Ok(None)
            }
            ItemKind::Symlink | ItemKind::HardLink if item.link_target.is_some() => {
                self.link(item, index, &path)?;
                Ok(None)
            }
            ItemKind::Device | ItemKind::Fifo => {
                log::debug!("skipping special file '{}'", item.name);
                Ok(None)
            }
            _ => {
                Self::create_parent(&path)?;
                let file = File::create(&path)?;
                self.current = Some(path);
                Ok(Some(Box::new(BufWriter::new(file))))
            }
        }
    }

    fn finish(&mut self, item: &Item, _index: usize, outcome: ItemOutcome) -> Result<()> {
        if !outcome.is_ok() {
            self.remove_partial();
            return Ok(());
        }
        if let Some(path) = self.current.take() {
            self.restore_metadata(item, &path);
        }
        Ok(())
    }

    fn abort(&mut self, _item: &Item, _index: usize) {
        self.remove_partial();
    }
}

/// One item captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    /// Stored path.
    pub name: String,
    /// Decoded bytes; partial if the outcome is not `Ok`.
    pub data: Vec<u8>,
    /// Outcome, once the item finished.
    pub outcome: Option<ItemOutcome>,
}

/// Keeps every extracted item in memory, keyed by item index.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: BTreeMap<usize, MemoryFile>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bytes of the first item named `name` that extracted
    /// successfully.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files
            .values()
            .find(|f| f.name == name && f.outcome == Some(ItemOutcome::Ok))
            .map(|f| f.data.as_slice())
    }

    /// Returns the captured item `index`.
    pub fn file(&self, index: usize) -> Option<&MemoryFile> {
        self.files.get(&index)
    }

    /// Iterates `(index, file)` in index order.
    pub fn files(&self) -> impl Iterator<Item = (usize, &MemoryFile)> {
        self.files.iter().map(|(i, f)| (*i, f))
    }

    /// Consumes the sink and returns the captured items.
    pub fn into_files(self) -> BTreeMap<usize, MemoryFile> {
        self.files
    }

    /// Number of captured items.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn entry(&mut self, item: &Item, index: usize) -> &mut MemoryFile {
        self.files.entry(index).or_insert_with(|| MemoryFile {
            name: item.name.clone(),
            data: Vec::new(),
            outcome: None,
        })
    }
}

impl ExtractSink for MemorySink {
    fn writer(&mut self, item: &Item, index: usize) -> Result<Option<Box<dyn Write + '_>>> {
        let file = self.entry(item, index);
        file.data.clear();
        file.outcome = None;
        if item.is_dir() {
            return Ok(None);
        }
        Ok(Some(Box::new(&mut file.data)))
    }

    fn finish(&mut self, item: &Item, index: usize, outcome: ItemOutcome) -> Result<()> {
        self.entry(item, index).outcome = Some(outcome);
        Ok(())
    }
}

/// Discards extracted bytes, counting items and bytes.
#[derive(Debug, Default)]
pub struct NullSink {
    items: usize,
    bytes: u64,
}

struct Counter<'a>(&'a mut u64);

impl Write for Counter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        *self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl NullSink {
    /// Creates a sink with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Items that finished with [`ItemOutcome::Ok`].
    pub fn items(&self) -> usize {
        self.items
    }

    /// Bytes written, including bytes of failed items.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl ExtractSink for NullSink {
    fn writer(&mut self, _item: &Item, _index: usize) -> Result<Option<Box<dyn Write + '_>>> {
        Ok(Some(Box::new(Counter(&mut self.bytes))))
    }

    fn finish(&mut self, _item: &Item, _index: usize, outcome: ItemOutcome) -> Result<()> {
        if outcome.is_ok() {
            self.items += 1;
        }
        Ok(())
    }
}

impl<S: ExtractSink + ?Sized> ExtractSink for &mut S {
    fn writer(&mut self, item: &Item, index: usize) -> Result<Option<Box<dyn Write + '_>>> {
        (**self).writer(item, index)
    }

    fn finish(&mut self, item: &Item, index: usize, outcome: ItemOutcome) -> Result<()> {
        (**self).finish(item, index, outcome)
    }

    fn abort(&mut self, item: &Item, index: usize) {
        (**self).abort(item, index)
    }
}
