//! Progress reporting and cooperative cancellation.
//!
//! The extraction pipeline reports through a [`ProgressReporter`]:
//! - the byte total and item count once, before decoding starts
//! - input-consumed / output-produced counters as blocks are decoded
//! - item start and completion, with the item's [`ItemOutcome`]
//! - warnings from degraded parses
//!
//! Cancellation is polled: the pipeline calls
//! [`ProgressReporter::should_cancel`] before and after each item and between
//! blocks, and stops with [`Error::Cancelled`](crate::Error::Cancelled).
//!
//! # Example
//!
//! ```rust
//! use arkiv::progress::{CancellationToken, ProgressReporter};
//!
//! let token = CancellationToken::new();
//! let reporter = token.clone();
//! assert!(!reporter.should_cancel());
//! token.cancel();
//! assert!(reporter.should_cancel());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::read::ItemOutcome;

/// Progress callbacks for extraction.
///
/// Every method has a no-op default.
pub trait ProgressReporter: Send {
    /// Called once with the sum of known item sizes and the item count.
    fn on_total(&mut self, total_bytes: u64, item_count: usize) {
        let _ = (total_bytes, item_count);
    }

    /// Called as output is produced.
    ///
    /// Returns `true` to continue or `false` to request cancellation.
    fn on_progress(&mut self, bytes_processed: u64, total_bytes: u64) -> bool {
        let _ = (bytes_processed, total_bytes);
        true
    }

    /// Called with packed bytes consumed and decoded bytes produced so far.
    fn on_ratio(&mut self, input_bytes: u64, output_bytes: u64) {
        let _ = (input_bytes, output_bytes);
    }

    /// Called when an item starts.
    fn on_item_start(&mut self, name: &str, size: Option<u64>) {
        let _ = (name, size);
    }

    /// Called when an item finishes, whatever the outcome.
    fn on_item_complete(&mut self, name: &str, outcome: ItemOutcome) {
        let _ = (name, outcome);
    }

    /// Called for non-fatal problems.
    fn on_warning(&mut self, message: &str) {
        let _ = message;
    }

    /// Polled between items and blocks.
    fn should_cancel(&self) -> bool {
        false
    }
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for &mut P {
    fn on_total(&mut self, total_bytes: u64, item_count: usize) {
        (**self).on_total(total_bytes, item_count);
    }

    fn on_progress(&mut self, bytes_processed: u64, total_bytes: u64) -> bool {
        (**self).on_progress(bytes_processed, total_bytes)
    }

    fn on_ratio(&mut self, input_bytes: u64, output_bytes: u64) {
        (**self).on_ratio(input_bytes, output_bytes);
    }

    fn on_item_start(&mut self, name: &str, size: Option<u64>) {
        (**self).on_item_start(name, size);
    }

    fn on_item_complete(&mut self, name: &str, outcome: ItemOutcome) {
        (**self).on_item_complete(name, outcome);
    }

    fn on_warning(&mut self, message: &str) {
        (**self).on_warning(message);
    }

    fn should_cancel(&self) -> bool {
        (**self).should_cancel()
    }
}

/// Progress snapshot with timing.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Total bytes to produce.
    pub total_bytes: u64,
    /// Bytes produced so far.
    pub processed_bytes: u64,
    /// Packed bytes consumed so far.
    pub packed_bytes: u64,
    /// Item currently being decoded.
    pub current_item: Option<String>,
    /// Items finished.
    pub items_processed: usize,
    /// Items requested.
    pub items_total: usize,
    /// Start of the operation.
    pub start_time: Instant,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            total_bytes: 0,
            processed_bytes: 0,
            packed_bytes: 0,
            current_item: None,
            items_processed: 0,
            items_total: 0,
            start_time: Instant::now(),
        }
    }
}

impl ProgressState {
    /// Creates a new progress state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the completion percentage (0.0 - 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.processed_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Returns packed / unpacked.
    pub fn compression_ratio(&self) -> f64 {
        if self.processed_bytes == 0 {
            1.0
        } else {
            self.packed_bytes as f64 / self.processed_bytes as f64
        }
    }

    /// Returns elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// A progress reporter that does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// A progress reporter that records everything it is told.
#[derive(Debug, Default, Clone)]
pub struct StatisticsProgress {
    /// The progress state.
    pub state: ProgressState,
    /// Whether cancellation was requested.
    pub cancelled: bool,
    /// Warnings collected.
    pub warnings: Vec<String>,
    /// Outcome of every finished item, in completion order.
    pub outcomes: Vec<(String, ItemOutcome)>,
}

impl StatisticsProgress {
    /// Creates a new statistics progress reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected state.
    pub fn state(&self) -> &ProgressState {
        &self.state
    }
}

impl ProgressReporter for StatisticsProgress {
    fn on_total(&mut self, total_bytes: u64, item_count: usize) {
        self.state.total_bytes = total_bytes;
        self.state.items_total = item_count;
    }

    fn on_progress(&mut self, bytes_processed: u64, _total_bytes: u64) -> bool {
        self.state.processed_bytes = bytes_processed;
        !self.cancelled
    }

    fn on_ratio(&mut self, input_bytes: u64, _output_bytes: u64) {
        self.state.packed_bytes = input_bytes;
    }

    fn on_item_start(&mut self, name: &str, _size: Option<u64>) {
        self.state.current_item = Some(name.to_string());
    }

    fn on_item_complete(&mut self, name: &str, outcome: ItemOutcome) {
        self.state.items_processed += 1;
        self.state.current_item = None;
        self.outcomes.push((name.to_string(), outcome));
    }

    fn on_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    fn should_cancel(&self) -> bool {
        self.cancelled
    }
}

/// A shareable cancellation flag.
///
/// Clones observe the same flag, so one clone can be handed to the
/// extraction while another stays with the thread that may cancel.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for CancellationToken {
    fn on_progress(&mut self, _bytes_processed: u64, _total_bytes: u64) -> bool {
        !self.is_cancelled()
    }

    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// Wraps a reporter so it also stops when a token is cancelled.
#[derive(Debug)]
pub struct WithCancellation<P> {
    inner: P,
    token: CancellationToken,
}

impl<P: ProgressReporter> WithCancellation<P> {
    /// Pairs `inner` with `token`.
    pub fn new(inner: P, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    /// Returns the inner reporter.
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: ProgressReporter> ProgressReporter for WithCancellation<P> {
    fn on_total(&mut self, total_bytes: u64, item_count: usize) {
        self.inner.on_total(total_bytes, item_count);
    }

    fn on_progress(&mut self, bytes_processed: u64, total_bytes: u64) -> bool {
        self.inner.on_progress(bytes_processed, total_bytes) && !self.token.is_cancelled()
    }

    fn on_ratio(&mut self, input_bytes: u64, output_bytes: u64) {
        self.inner.on_ratio(input_bytes, output_bytes);
    }

    fn on_item_start(&mut self, name: &str, size: Option<u64>) {
        self.inner.on_item_start(name, size);
    }

    fn on_item_complete(&mut self, name: &str, outcome: ItemOutcome) {
        self.inner.on_item_complete(name, outcome);
    }

    fn on_warning(&mut self, message: &str) {
        self.inner.on_warning(message);
    }

    fn should_cancel(&self) -> bool {
        self.token.is_cancelled() || self.inner.should_cancel()
    }
}
