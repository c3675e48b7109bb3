//! Bulk extraction.
//!
//! [`Archive::extract`] walks the selected items in caller order, decodes
//! each into the writer its [`ExtractSink`] hands out, checks the decoded
//! length and CRC, and records one [`ItemOutcome`] per item. Item-level
//! failures never stop the batch; sink I/O errors and cancellation do.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Read, Seek, Write};

use crate::format::ItemSource;
use crate::format::cab::FolderCursor;
use crate::progress::{NoProgress, ProgressReporter};
use crate::{Error, Result};

use super::decompression::attach_index;
use super::{Archive, ExtractMode, ExtractOptions, ExtractSink, ItemOutcome, NullSink, Selection};

/// Per-item results of [`Archive::extract`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// `(item index, outcome)` for every requested item, in processing order.
    pub outcomes: Vec<(usize, ItemOutcome)>,
    /// Decoded bytes across all items.
    pub bytes: u64,
}

impl ExtractReport {
    /// Returns `true` if every item finished with [`ItemOutcome::Ok`].
    pub fn is_ok(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_ok())
    }

    /// Returns the outcome recorded for item `index`.
    pub fn outcome(&self, index: usize) -> Option<ItemOutcome> {
        self.outcomes
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, o)| *o)
    }

    /// Number of items that finished with `outcome`.
    pub fn count(&self, outcome: ItemOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    /// Items that did not finish with [`ItemOutcome::Ok`].
    pub fn failures(&self) -> impl Iterator<Item = (usize, ItemOutcome)> + '_ {
        self.outcomes.iter().copied().filter(|(_, o)| !o.is_ok())
    }
}

/// Identity of a decoded byte range several items share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AliasKey {
    folder: usize,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct AliasSlot {
    data: Option<Vec<u8>>,
    /// Consumers that have not claimed the slot yet.
    remaining: usize,
}

/// Decoded buffers of aliased items, each freed after its last replay.
#[derive(Debug, Default)]
struct AliasArena {
    slots: HashMap<AliasKey, AliasSlot>,
}

enum Claim<'a> {
    /// First consumer: decode and offer the bytes back to the arena.
    Decode,
    /// Later consumer: replay the stored bytes.
    Replay(Cow<'a, [u8]>),
}

impl AliasArena {
    /// Builds slots for every key that occurs more than once.
    fn new(keys: impl Iterator<Item = AliasKey>) -> Self {
        let mut counts: HashMap<AliasKey, usize> = HashMap::new();
        for key in keys {
            *counts.entry(key).or_default() += 1;
        }
        let slots = counts
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .map(|(key, n)| {
                (
                    key,
                    AliasSlot {
                        data: None,
                        remaining: n,
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// Claims `key` for one consumer; `None` when the key is not aliased.
    fn claim(&mut self, key: AliasKey) -> Option<Claim<'_>> {
        let remaining = {
            let slot = self.slots.get_mut(&key)?;
            slot.remaining = slot.remaining.saturating_sub(1);
            if slot.data.is_none() {
                return Some(Claim::Decode);
            }
            slot.remaining
        };
        if remaining == 0 {
            let data = self.slots.remove(&key)?.data?;
            return Some(Claim::Replay(Cow::Owned(data)));
        }
        let data = self.slots.get(&key)?.data.as_deref()?;
        Some(Claim::Replay(Cow::Borrowed(data)))
    }

    /// Stores the bytes a first consumer decoded, if anyone still needs them.
    fn store(&mut self, key: AliasKey, data: Vec<u8>) {
        match self.slots.get_mut(&key) {
            Some(slot) if slot.remaining > 0 => slot.data = Some(data),
            Some(_) => {
                self.slots.remove(&key);
            }
            None => {}
        }
    }

    fn len(&self) -> usize {
        self.slots.values().filter(|s| s.data.is_some()).count()
    }
}

/// Passes decoded bytes to the sink while hashing and counting them.
struct Tap<'a, 'w> {
    out: Option<&'a mut (dyn Write + 'w)>,
    hasher: crc32fast::Hasher,
    written: u64,
    kept: Option<Vec<u8>>,
    sink_failed: bool,
}

impl<'a, 'w> Tap<'a, 'w> {
    fn new(out: Option<&'a mut (dyn Write + 'w)>, keep: bool) -> Self {
        Self {
            out,
            hasher: crc32fast::Hasher::new(),
            written: 0,
            kept: keep.then(Vec::new),
            sink_failed: false,
        }
    }
}

impl Write for Tap<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.write_all(buf) {
                self.sink_failed = true;
                return Err(e);
            }
        }
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        if let Some(kept) = self.kept.as_mut() {
            kept.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.flush() {
                self.sink_failed = true;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Running totals for progress reports.
#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    total: u64,
    done: u64,
    packed: u64,
}

impl<R: Read + Seek> Archive<R> {
    /// Extracts the selected items into `sink`.
    ///
    /// Items are processed in selection order. Each one gets exactly one
    /// [`ItemOutcome`] in the returned report; an item that fails to decode
    /// does not stop the items after it.
    ///
    /// In [`ExtractMode::Test`] no writers are requested and the sink is not
    /// called; items are decoded and verified only.
    ///
    /// # Errors
    ///
    /// - [`Error::IndexOutOfRange`] if the selection names a missing item
    /// - [`Error::Cancelled`] when the progress reporter asks to stop
    /// - I/O errors raised by the sink, which end the batch
    pub fn extract(
        &mut self,
        selection: Selection,
        options: ExtractOptions<'_>,
        sink: &mut dyn ExtractSink,
    ) -> Result<ExtractReport> {
        let ExtractOptions {
            mode,
            verify_crc,
            progress,
        } = options;
        let mut progress: Box<dyn ProgressReporter + '_> =
            progress.unwrap_or_else(|| Box::new(NoProgress));

        let len = self.items.len();
        let indices: Vec<usize> = match selection {
            Selection::All => (0..len).collect(),
            Selection::Indices(indices) => indices,
        };
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(Error::IndexOutOfRange { index, len });
        }

        let mut totals = Totals {
            total: indices.iter().filter_map(|&i| self.items[i].size).sum(),
            ..Totals::default()
        };
        progress.on_total(totals.total, indices.len());
        for warning in &self.info.warnings {
            progress.on_warning(warning);
        }

        let mut arena = AliasArena::new(indices.iter().filter_map(|&i| self.alias_key(i)));
        let mut folder = None;
        let mut report = ExtractReport::default();
        log::debug!(
            "extracting {} of {} items ({} bytes, {:?})",
            indices.len(),
            len,
            totals.total,
            mode
        );

        for index in indices {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            let name = self.items[index].name.clone();
            progress.on_item_start(&name, self.items[index].size);

            let step = self.extract_one(
                index,
                mode,
                verify_crc,
                sink,
                &mut arena,
                &mut folder,
                progress.as_mut(),
                totals,
            );
            let (outcome, written) = match step {
                Ok(step) => step,
                Err(e) => {
                    if mode == ExtractMode::Extract {
                        sink.abort(&self.items[index], index);
                    }
                    return Err(e);
                }
            };

            totals.done += written;
            totals.packed += self.items[index].packed_size;
            report.bytes += written;
            report.outcomes.push((index, outcome));
            progress.on_ratio(totals.packed, totals.done);
            progress.on_item_complete(&name, outcome);
            if !progress.on_progress(totals.done, totals.total) || progress.should_cancel() {
                return Err(Error::Cancelled);
            }
        }
        debug_assert_eq!(arena.len(), 0);
        Ok(report)
    }

    /// Decodes and verifies the selected items without writing them.
    ///
    /// # Errors
    ///
    /// As [`extract`](Archive::extract).
    pub fn test(&mut self, selection: Selection, options: ExtractOptions<'_>) -> Result<ExtractReport> {
        let options = options.mode(ExtractMode::Test);
        self.extract(selection, options, &mut NullSink::new())
    }

    fn alias_key(&self, index: usize) -> Option<AliasKey> {
        match self.sources[index] {
            ItemSource::Folder { folder, offset } => Some(AliasKey {
                folder,
                offset,
                size: self.items[index].size?,
            }),
            _ => None,
        }
    }

    /// Extracts one item; `Err` only for errors that end the batch.
    #[allow(clippy::too_many_arguments)]
    fn extract_one(
        &mut self,
        index: usize,
        mode: ExtractMode,
        verify_crc: bool,
        sink: &mut dyn ExtractSink,
        arena: &mut AliasArena,
        folder: &mut Option<FolderCursor>,
        progress: &mut dyn ProgressReporter,
        totals: Totals,
    ) -> Result<(ItemOutcome, u64)> {
        if let ItemSource::Unavailable(outcome) = self.sources[index] {
            log::debug!("item {} ({}) unavailable: {}", index, self.items[index].name, outcome);
            if mode == ExtractMode::Extract {
                sink.finish(&self.items[index], index, outcome)?;
            }
            return Ok((outcome, 0));
        }

        let mut writer = match mode {
            ExtractMode::Extract => sink.writer(&self.items[index], index)?,
            ExtractMode::Test => None,
        };
        let key = self.alias_key(index);
        let claim = key.and_then(|k| arena.claim(k));
        let keep = matches!(claim, Some(Claim::Decode));
        let mut tap = Tap::new(writer.as_deref_mut(), keep);

        let result = match claim {
            Some(Claim::Replay(data)) => {
                log::trace!("replaying {} aliased bytes for item {}", data.len(), index);
                tap.write_all(&data)
                    .map(|()| data.len() as u64)
                    .map_err(Error::from)
            }
            _ => {
                let mut poll = |written: u64| -> Result<()> {
                    if !progress.on_progress(totals.done + written, totals.total)
                        || progress.should_cancel()
                    {
                        return Err(Error::Cancelled);
                    }
                    Ok(())
                };
                self.write_item(index, &mut tap, folder, &mut poll)
            }
        };
        let result = result.and_then(|written| {
            tap.flush()?;
            Ok(written)
        });

        let Tap {
            hasher,
            written,
            kept,
            sink_failed,
            ..
        } = tap;
        drop(writer);

        let outcome = match result {
            Ok(_) => {
                if let (Some(key), Some(kept)) = (key, kept) {
                    arena.store(key, kept);
                }
                self.verify(index, written, hasher.finalize(), verify_crc)?
            }
            Err(e) if sink_failed => return Err(e),
            Err(e) => {
                let e = attach_index(e, index, &self.items[index]);
                match e.outcome() {
                    Some(outcome) => {
                        log::debug!("item {} ({}): {}", index, self.items[index].name, e);
                        outcome
                    }
                    None => return Err(e),
                }
            }
        };

        if mode == ExtractMode::Extract {
            sink.finish(&self.items[index], index, outcome)?;
        }
        Ok((outcome, written))
    }

    /// Checks the decoded length and CRC of a fully decoded item.
    fn verify(&mut self, index: usize, written: u64, actual: u32, verify_crc: bool) -> Result<ItemOutcome> {
        let item = &self.items[index];
        if let Some(size) = item.size {
            if written != size {
                log::debug!(
                    "item {} ({}) decoded to {} bytes, expected {}",
                    index,
                    item.name,
                    written,
                    size
                );
                return Ok(ItemOutcome::DataError);
            }
        }
        let Some(stored) = item.crc.filter(|_| verify_crc && item.crc_covers_item) else {
            return Ok(ItemOutcome::Ok);
        };
        match self.crc_matches(index, stored, actual) {
            Ok(true) => Ok(ItemOutcome::Ok),
            Ok(false) => {
                log::debug!(
                    "item {} CRC mismatch: stored {:#010x}, computed {:#010x}",
                    index,
                    stored,
                    actual
                );
                Ok(ItemOutcome::CrcError)
            }
            Err(e) => e.outcome().ok_or(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::progress::{CancellationToken, StatisticsProgress, WithCancellation};
    use crate::read::MemorySink;
    use crate::OpenOptions;

    fn ar(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = b"!<arch>\n".to_vec();
        for (name, data) in members {
            out.extend_from_slice(
                format!(
                    "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
                    format!("{}/", name),
                    0,
                    0,
                    0,
                    100644,
                    data.len()
                )
                .as_bytes(),
            );
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    fn open(data: Vec<u8>) -> Archive<Cursor<Vec<u8>>> {
        Archive::open(Cursor::new(data), OpenOptions::new()).unwrap()
    }

    #[test]
    fn test_alias_arena_replays_and_frees() {
        let key = AliasKey {
            folder: 0,
            offset: 10,
            size: 3,
        };
        let other = AliasKey { offset: 20, ..key };
        let mut arena = AliasArena::new([key, other, key, key].into_iter());
        assert!(arena.claim(other).is_none());

        assert!(matches!(arena.claim(key), Some(Claim::Decode)));
        arena.store(key, b"abc".to_vec());
        assert_eq!(arena.len(), 1);
        match arena.claim(key) {
            Some(Claim::Replay(Cow::Borrowed(data))) => assert_eq!(data, b"abc"),
            _ => panic!("expected a borrowed replay"),
        }
        match arena.claim(key) {
            Some(Claim::Replay(Cow::Owned(data))) => assert_eq!(data, b"abc"),
            _ => panic!("expected the last replay to take the buffer"),
        }
        assert_eq!(arena.len(), 0);
        assert!(arena.claim(key).is_none());
    }

    #[test]
    fn test_alias_arena_skips_store_without_consumers() {
        let key = AliasKey {
            folder: 1,
            offset: 0,
            size: 1,
        };
        let mut arena = AliasArena::new([key, key].into_iter());
        assert!(matches!(arena.claim(key), Some(Claim::Decode)));
        assert!(matches!(arena.claim(key), Some(Claim::Decode)));
        arena.store(key, vec![1]);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_tap_forwards_to_borrowed_sink_writer() {
        let mut target = Vec::new();
        let mut writer: Option<Box<dyn Write + '_>> = Some(Box::new(&mut target));
        let mut tap = Tap::new(writer.as_deref_mut(), true);
        tap.write_all(b"abc").unwrap();
        tap.flush().unwrap();
        let Tap {
            hasher,
            written,
            kept,
            sink_failed,
            ..
        } = tap;
        drop(writer);

        assert_eq!(written, 3);
        assert!(!sink_failed);
        assert_eq!(kept.as_deref(), Some(&b"abc"[..]));
        assert_eq!(hasher.finalize(), crc32fast::hash(b"abc"));
        assert_eq!(target, b"abc");
    }

    #[test]
    fn test_extract_selection_order_and_report() {
        let mut archive = open(ar(&[("a", b"1"), ("b", b"22"), ("c", b"333")]));
        let mut sink = MemorySink::new();
        let report = archive
            .extract(Selection::Indices(vec![2, 0]), ExtractOptions::new(), &mut sink)
            .unwrap();
        assert_eq!(
            report.outcomes,
            vec![(2, ItemOutcome::Ok), (0, ItemOutcome::Ok)]
        );
        assert_eq!(report.bytes, 4);
        assert_eq!(sink.get("c"), Some(&b"333"[..]));
        assert_eq!(sink.get("b"), None);
    }

    #[test]
    fn test_selection_out_of_range() {
        let mut archive = open(ar(&[("a", b"1")]));
        let err = archive
            .extract(Selection::Indices(vec![0, 9]), ExtractOptions::new(), &mut MemorySink::new())
            .unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 9, len: 1 }));
    }

    #[test]
    fn test_progress_sees_totals_and_outcomes() {
        let mut archive = open(ar(&[("a", b"1234"), ("b", b"56")]));
        let mut stats = StatisticsProgress::new();
        let report = archive
            .test(Selection::All, ExtractOptions::new().progress(&mut stats))
            .unwrap();
        assert!(report.is_ok());
        assert_eq!(stats.state.total_bytes, 6);
        assert_eq!(stats.state.items_total, 2);
        assert_eq!(stats.state.items_processed, 2);
        assert_eq!(
            stats.outcomes,
            vec![
                ("a".to_string(), ItemOutcome::Ok),
                ("b".to_string(), ItemOutcome::Ok)
            ]
        );
    }

    #[test]
    fn test_cancelled_before_first_item() {
        let mut archive = open(ar(&[("a", b"1")]));
        let token = CancellationToken::new();
        token.cancel();
        let progress = WithCancellation::new(StatisticsProgress::new(), token);
        let err = archive
            .test(Selection::All, ExtractOptions::new().progress(progress))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_sink_write_failure_is_fatal() {
        struct Failing;
        impl ExtractSink for Failing {
            fn writer(
                &mut self,
                _item: &crate::Item,
                _index: usize,
            ) -> Result<Option<Box<dyn Write + '_>>> {
                struct Broken;
                impl Write for Broken {
                    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                        Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
                    }
                    fn flush(&mut self) -> io::Result<()> {
                        Ok(())
                    }
                }
                Ok(Some(Box::new(Broken)))
            }

            fn finish(&mut self, _item: &crate::Item, _index: usize, _outcome: ItemOutcome) -> Result<()> {
                Ok(())
            }
        }

        let mut archive = open(ar(&[("a", b"1"), ("b", b"2")]));
        let err = archive
            .extract(Selection::All, ExtractOptions::new(), &mut Failing)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_report_helpers() {
        let report = ExtractReport {
            outcomes: vec![
                (0, ItemOutcome::Ok),
                (1, ItemOutcome::DataError),
                (2, ItemOutcome::Ok),
            ],
            bytes: 9,
        };
        assert!(!report.is_ok());
        assert_eq!(report.count(ItemOutcome::Ok), 2);
        assert_eq!(report.outcome(1), Some(ItemOutcome::DataError));
        assert_eq!(report.failures().collect::<Vec<_>>(), vec![(1, ItemOutcome::DataError)]);
    }
}
