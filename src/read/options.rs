//! Open and extraction options.

use crate::cache::CacheConfig;
use crate::crypto::PasswordProvider;
use crate::format::FormatKind;
use crate::progress::ProgressReporter;
use crate::volume::VolumeProvider;
use crate::{Error, Result};

/// Safety limits applied while parsing headers.
///
/// Every declared size is compared against these limits before anything is
/// allocated from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of items in the table.
    pub max_items: usize,
    /// Maximum size of one header region read into memory.
    pub max_header_bytes: u64,
    /// Maximum decoded size of one item buffered in memory.
    pub max_item_size: u64,
    /// Maximum length of one stored name.
    pub max_name_len: usize,
    /// Maximum directory nesting for tree formats.
    pub max_dir_depth: usize,
}

impl Default for Limits {
    /// Creates limits with the following default values:
    ///
    /// | Limit | Default Value |
    /// |-------|---------------|
    /// | `max_items` | 1,000,000 |
    /// | `max_header_bytes` | 64 MiB |
    /// | `max_item_size` | 4 GiB |
    /// | `max_name_len` | 64 KiB |
    /// | `max_dir_depth` | 256 |
    fn default() -> Self {
        Self {
            max_items: 1_000_000,
            max_header_bytes: 64 << 20,
            max_item_size: 4 << 30,
            max_name_len: 64 << 10,
            max_dir_depth: 256,
        }
    }
}

impl Limits {
    /// Creates the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates limits with no restrictions.
    pub fn unlimited() -> Self {
        Self {
            max_items: usize::MAX,
            max_header_bytes: u64::MAX,
            max_item_size: u64::MAX,
            max_name_len: usize::MAX,
            max_dir_depth: usize::MAX,
        }
    }

    /// Sets the item-count ceiling.
    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = max;
        self
    }

    /// Sets the header-region ceiling.
    pub fn max_header_bytes(mut self, max: u64) -> Self {
        self.max_header_bytes = max;
        self
    }

    /// Sets the buffered item ceiling.
    pub fn max_item_size(mut self, max: u64) -> Self {
        self.max_item_size = max;
        self
    }

    /// Sets the name-length ceiling.
    pub fn max_name_len(mut self, max: usize) -> Self {
        self.max_name_len = max;
        self
    }

    /// Sets the directory-depth ceiling.
    pub fn max_dir_depth(mut self, max: usize) -> Self {
        self.max_dir_depth = max;
        self
    }

    pub(crate) fn check_items(&self, count: u64) -> Result<()> {
        if count > self.max_items as u64 {
            return Err(Error::limit("item count", count, self.max_items as u64));
        }
        Ok(())
    }

    pub(crate) fn check_header(&self, len: u64) -> Result<usize> {
        if len > self.max_header_bytes {
            return Err(Error::limit("header size", len, self.max_header_bytes));
        }
        usize::try_from(len).map_err(|_| Error::limit("header size", len, usize::MAX as u64))
    }

    pub(crate) fn check_item_size(&self, len: u64) -> Result<usize> {
        if len > self.max_item_size {
            return Err(Error::limit("item size", len, self.max_item_size));
        }
        usize::try_from(len).map_err(|_| Error::limit("item size", len, usize::MAX as u64))
    }

    pub(crate) fn check_name(&self, len: u64) -> Result<usize> {
        if len > self.max_name_len as u64 {
            return Err(Error::limit("name length", len, self.max_name_len as u64));
        }
        Ok(len as usize)
    }

    pub(crate) fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.max_dir_depth {
            return Err(Error::limit(
                "directory depth",
                depth as u64,
                self.max_dir_depth as u64,
            ));
        }
        Ok(())
    }
}

/// Options for [`Archive::open`](crate::Archive::open).
///
/// # Example
///
/// ```rust
/// use arkiv::{CacheConfig, FormatKind, Limits, OpenOptions};
///
/// let options = OpenOptions::new()
///     .format(FormatKind::Tar)
///     .cache(CacheConfig::low_memory())
///     .limits(Limits::default().max_items(10_000))
///     .verify_checksums(false);
/// assert_eq!(options.forced_format(), Some(FormatKind::Tar));
/// ```
pub struct OpenOptions {
    pub(crate) format: Option<FormatKind>,
    pub(crate) allow_tail: bool,
    pub(crate) cache: CacheConfig,
    pub(crate) limits: Limits,
    pub(crate) password: Option<Box<dyn PasswordProvider>>,
    pub(crate) volumes: Option<Box<dyn VolumeProvider>>,
    pub(crate) verify_checksums: bool,
    pub(crate) name: Option<String>,
}

impl std::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("format", &self.format)
            .field("allow_tail", &self.allow_tail)
            .field("cache", &self.cache)
            .field("limits", &self.limits)
            .field("password", &self.password.is_some())
            .field("volumes", &self.volumes.is_some())
            .field("verify_checksums", &self.verify_checksums)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            format: None,
            allow_tail: false,
            cache: CacheConfig::default(),
            limits: Limits::default(),
            password: None,
            volumes: None,
            verify_checksums: true,
            name: None,
        }
    }
}

impl OpenOptions {
    /// Creates default options: probe every format, no volumes, no password.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces one parser instead of probing.
    pub fn format(mut self, kind: FormatKind) -> Self {
        self.format = Some(kind);
        self
    }

    /// Accepts trailing bytes after formats with a computed size (PE).
    pub fn allow_tail(mut self, allow: bool) -> Self {
        self.allow_tail = allow;
        self
    }

    /// Sets the block-cache bounds.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the parsing limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the password source for encrypted content.
    pub fn password(mut self, provider: impl PasswordProvider + 'static) -> Self {
        self.password = Some(Box::new(provider));
        self
    }

    /// Sets the provider for additional volumes.
    ///
    /// Without one, [`Archive::open`](crate::Archive::open) sees only the
    /// primary stream and [`Archive::open_path`](crate::Archive::open_path)
    /// looks for siblings in the archive's directory.
    pub fn volumes(mut self, provider: impl VolumeProvider + 'static) -> Self {
        self.volumes = Some(Box::new(provider));
        self
    }

    /// Enables or disables header checksum verification.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Sets the file name of the primary stream, used to derive volume names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the forced format, if any.
    pub fn forced_format(&self) -> Option<FormatKind> {
        self.format
    }
}

/// Whether extraction writes output or only verifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// Decode and hand the bytes to the sink.
    #[default]
    Extract,
    /// Decode and verify without requesting writers.
    Test,
}

/// Which items an extraction covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every item in table order.
    #[default]
    All,
    /// The given indices, in the given order.
    Indices(Vec<usize>),
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::Indices(indices)
    }
}

impl From<&[usize]> for Selection {
    fn from(indices: &[usize]) -> Self {
        Selection::Indices(indices.to_vec())
    }
}

/// Options for [`Archive::extract`](crate::Archive::extract).
///
/// The progress reporter may be borrowed, so a caller can inspect it after
/// the extraction returns:
///
/// ```rust
/// use arkiv::ExtractOptions;
/// use arkiv::progress::StatisticsProgress;
///
/// let mut stats = StatisticsProgress::new();
/// let options = ExtractOptions::new().progress(&mut stats);
/// drop(options);
/// assert_eq!(stats.state.items_processed, 0);
/// ```
pub struct ExtractOptions<'p> {
    /// Extract or test.
    pub mode: ExtractMode,
    /// Verify stored CRCs after decoding.
    pub verify_crc: bool,
    /// Progress callback.
    pub progress: Option<Box<dyn ProgressReporter + 'p>>,
}

impl std::fmt::Debug for ExtractOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("mode", &self.mode)
            .field("verify_crc", &self.verify_crc)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for ExtractOptions<'_> {
    fn default() -> Self {
        Self {
            mode: ExtractMode::Extract,
            verify_crc: true,
            progress: None,
        }
    }
}

impl<'p> ExtractOptions<'p> {
    /// Creates default options: extract, verify CRCs, no progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a test run.
    pub fn test() -> Self {
        Self::default().mode(ExtractMode::Test)
    }

    /// Sets the mode.
    pub fn mode(mut self, mode: ExtractMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enables or disables CRC verification.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.verify_crc = verify;
        self
    }

    /// Sets the progress reporter.
    pub fn progress(mut self, progress: impl ProgressReporter + 'p) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }
}
