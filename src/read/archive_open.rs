//! Archive opening: format probing, parsing and placement checks.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use crate::cache::{BlockCache, BlockMap, BlockSource};
#[cfg(feature = "aes")]
use crate::crypto::KeyCache;
use crate::crypto::PasswordProvider;
use crate::format::{
    self, ArchiveInfo, FormatHandler, FormatKind, ItemSource, PROBE_HEAD, PROBE_TAIL,
    ParseContext, Parsed, ProbeInput,
};
use crate::item::ItemTable;
use crate::volume::{DirectoryVolumes, NoVolumes, Volume, VolumeProvider, VolumeSet};
use crate::window::{ReadSeek, read_at_most, stream_len};
use crate::{Error, Result};

use super::{Archive, ItemOutcome, Limits, OpenOptions};

impl Archive<BufReader<File>> {
    /// Opens an archive from a file path.
    ///
    /// The file name seeds volume-name derivation, and unless `options`
    /// already carries a volume provider, follow-on volumes are looked up
    /// next to the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or no parser accepts it.
    pub fn open_path(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut options = options;
        if options.name.is_none() {
            options.name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
        }
        if options.volumes.is_none() {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            options.volumes = Some(Box::new(DirectoryVolumes::new(dir)));
        }
        Self::open(BufReader::new(file), options)
    }
}

impl<R: Read + Seek> Archive<R> {
    /// Opens an archive from a reader.
    ///
    /// Without a forced format every probe in the format table runs over
    /// the first and last bytes of the stream; matching parsers are tried in
    /// table order and a parser that rejects the layout hands over to the
    /// next candidate.
    ///
    /// # Errors
    ///
    /// - [`Error::NotThisFormat`] when no parser accepts the stream
    /// - [`Error::NeedMoreBytes`] when the stream is a prefix of a signature
    /// - the parser's error when a forced format fails, or when a matching
    ///   parser fails with anything other than a layout mismatch
    pub fn open(mut reader: R, options: OpenOptions) -> Result<Self> {
        let OpenOptions {
            format: forced,
            allow_tail,
            cache,
            limits,
            mut password,
            volumes,
            verify_checksums,
            name,
        } = options;
        let mut provider: Box<dyn VolumeProvider> = volumes.unwrap_or_else(|| Box::new(NoVolumes));

        let size = stream_len(&mut reader)?;
        let mut needed = None;
        let candidates = match forced {
            Some(kind) => vec![kind],
            None => probe(&mut reader, size, &mut needed)?,
        };
        log::debug!("probe candidates for {} byte stream: {:?}", size, candidates);

        let mut rejection = None;
        for kind in candidates {
            let Some(handler) = format::handler(kind) else {
                continue;
            };
            let attempt = run_parser(
                handler,
                &mut reader,
                name.as_deref(),
                limits,
                allow_tail,
                verify_checksums,
                provider.as_mut(),
                &mut password,
            );
            match attempt {
                Ok((parsed, extra)) => {
                    log::debug!(
                        "opened {} archive: {} items, {} volumes",
                        kind,
                        parsed.items.len(),
                        parsed.info.volumes
                    );
                    let mut volumes = VolumeSet::new(reader, name)?;
                    volumes.extend(extra);
                    return Ok(Self::assemble(
                        volumes,
                        parsed,
                        BlockCache::new(cache),
                        limits,
                        verify_checksums,
                        password,
                    ));
                }
                Err(e) if forced.is_none() && e.is_format_mismatch() => {
                    log::debug!("{} parser rejected the stream: {}", kind, e);
                    if !matches!(e, Error::NotThisFormat) && rejection.is_none() {
                        rejection = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(e) = rejection {
            return Err(e);
        }
        match needed {
            Some(needed) if needed > size => Err(Error::NeedMoreBytes { needed }),
            _ => Err(Error::NotThisFormat),
        }
    }

    fn assemble(
        volumes: VolumeSet<R>,
        parsed: Parsed,
        cache: BlockCache,
        limits: Limits,
        verify_checksums: bool,
        password: Option<Box<dyn PasswordProvider>>,
    ) -> Self {
        let Parsed {
            mut items,
            mut sources,
            mut info,
            state,
        } = parsed;
        check_placement(&volumes, &mut items, &mut sources, &mut info);
        Self {
            volumes,
            items,
            sources,
            info,
            state,
            cache,
            limits,
            verify_checksums,
            password,
            #[cfg(feature = "aes")]
            keys: KeyCache::default(),
        }
    }

    /// Releases the item table, the additional volumes and the cache, and
    /// returns the primary stream.
    pub fn close(self) -> R {
        log::debug!("closing {} archive", self.info.kind);
        self.volumes.into_primary()
    }
}

/// Runs every probe over the head and tail of the stream.
fn probe<R: Read + Seek>(
    reader: &mut R,
    size: u64,
    needed: &mut Option<u64>,
) -> Result<Vec<FormatKind>> {
    let mut head = vec![0u8; PROBE_HEAD.min(size as usize)];
    let n = read_at_most(reader, 0, &mut head)?;
    head.truncate(n);

    let tail_len = PROBE_TAIL.min(size as usize);
    let mut tail = vec![0u8; tail_len];
    let n = read_at_most(reader, size - tail_len as u64, &mut tail)?;
    tail.truncate(n);

    let input = ProbeInput {
        head: &head,
        tail: &tail,
        size,
    };
    Ok(format::detect(&input, needed))
}

/// Runs one parser over `reader`, returning the parse and any volumes it
/// opened.
#[allow(clippy::too_many_arguments)]
fn run_parser<R: Read + Seek>(
    handler: &FormatHandler,
    reader: &mut R,
    name: Option<&str>,
    limits: Limits,
    allow_tail: bool,
    verify_checksums: bool,
    provider: &mut dyn VolumeProvider,
    password: &mut Option<Box<dyn PasswordProvider>>,
) -> Result<(Parsed, Vec<Volume>)> {
    let mut ctx = ParseContext {
        volumes: VolumeSet::new(reader as &mut dyn ReadSeek, name.map(str::to_string))?,
        limits,
        allow_tail,
        verify_checksums,
        provider,
        password,
        warnings: Vec::new(),
    };
    let mut parsed = (handler.parse)(&mut ctx)?;
    for warning in ctx.warnings.drain(..) {
        if !parsed.info.warnings.contains(&warning) {
            parsed.info.warnings.push(warning);
        }
    }
    Ok((parsed, ctx.volumes.take_extra()))
}

/// Checks every item's physical placement against its volume.
///
/// Payload that cannot be read is never trusted: the item and the archive
/// get their `headers_error` flag, and the item's source becomes
/// unavailable with the outcome extraction will report.
fn check_placement<R: Read + Seek>(
    volumes: &VolumeSet<R>,
    items: &mut ItemTable,
    sources: &mut [ItemSource],
    info: &mut ArchiveInfo,
) {
    for (index, source) in sources.iter_mut().enumerate() {
        let Some(item) = items.get_mut(index) else {
            break;
        };
        let outcome = match source {
            ItemSource::Range { extents, .. } => extents
                .iter()
                .find(|e| !volumes.contains(e))
                .map(|e| match volumes.size(e.volume) {
                    Some(size) if e.offset < size => ItemOutcome::UnexpectedEnd,
                    Some(_) => ItemOutcome::HeadersError,
                    None => ItemOutcome::Unavailable,
                }),
            ItemSource::Blocks(map) => {
                let size = volumes.size(0).unwrap_or(0);
                (!map.fits_within(size)).then(|| overrun_outcome(map, size))
            }
            _ => None,
        };

        let single_volume = !item.flags.split_before && !item.flags.split_after;
        if single_volume && matches!(source, ItemSource::Range { .. } | ItemSource::Blocks(_)) {
            let size = volumes.size(item.volume).unwrap_or(0);
            if !item.check_placement(size) {
                info.headers_error = true;
            }
        }

        if let Some(outcome) = outcome {
            log::debug!(
                "item {} ({}) lies outside its volume: {}",
                index,
                item.name,
                outcome
            );
            item.flags.headers_error = true;
            info.headers_error = true;
            if outcome == ItemOutcome::UnexpectedEnd {
                item.flags.unexpected_end = true;
                info.unexpected_end = true;
            }
            *source = ItemSource::Unavailable(outcome);
        }
    }
}

fn overrun_outcome(map: &BlockMap, size: u64) -> ItemOutcome {
    let starts_inside = map.spans().iter().all(|span| match span.source {
        BlockSource::Zero => true,
        BlockSource::Stored { offset } | BlockSource::Packed { offset, .. } => offset < size,
    });
    if starts_inside {
        ItemOutcome::UnexpectedEnd
    } else {
        ItemOutcome::HeadersError
    }
}
