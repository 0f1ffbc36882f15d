//! Progress reporting types for file operations.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use twinpane_core::OperationError;

use crate::operation::{ItemState, OperationItem, OperationKind};

/// Receives engine events.
///
/// Called synchronously by whichever worker produced the event, so
/// implementations should return quickly. Every method has an empty
/// default.
pub trait ProgressSink: Send + Sync {
    /// Bytes written so far for one item.
    fn on_progress(&self, _item: &OperationItem, _bytes_transferred: u64, _total_bytes: u64) {}

    /// An item reached a terminal state.
    fn on_item_terminal(&self, _item: &OperationItem) {}

    /// Directory trees are being measured before the transfer starts.
    fn on_sizing(&self, _progress: &SizingProgress) {}

    /// Aggregate batch counters changed.
    fn on_batch_progress(&self, _progress: &OperationProgress) {}
}

/// A sink that ignores everything.
impl ProgressSink for () {}

/// Aggregate progress for a batch.
#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    /// The type of operation.
    pub kind: OperationKind,
    /// Number of items in a terminal state.
    pub items_completed: usize,
    /// Total number of items in the plan.
    pub items_total: usize,
    /// Number of bytes processed so far.
    pub bytes_processed: u64,
    /// Total bytes to process (may be 0 if unknown).
    pub bytes_total: u64,
    /// The file currently being processed.
    pub current_file: Option<PathBuf>,
    /// Errors encountered so far.
    pub errors: Vec<OperationError>,
}

impl OperationProgress {
    pub fn new(kind: OperationKind, items_total: usize, bytes_total: u64) -> Self {
        Self {
            kind,
            items_completed: 0,
            items_total,
            bytes_processed: 0,
            bytes_total,
            current_file: None,
            errors: Vec::new(),
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    ///
    /// Uses bytes when the total is known, item counts otherwise.
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            self.bytes_percentage()
        } else {
            self.item_percentage()
        }
    }

    /// Share of items that reached a terminal state.
    pub fn item_percentage(&self) -> f64 {
        if self.items_total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / self.items_total as f64) * 100.0
    }

    /// Share of bytes processed.
    pub fn bytes_percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub(crate) fn add_bytes(&mut self, delta: u64) {
        self.bytes_processed = (self.bytes_processed + delta).min(self.bytes_total);
    }

    pub(crate) fn set_current_file(&mut self, path: Option<PathBuf>) {
        self.current_file = path;
    }

    /// Account for an item that just became terminal.
    pub(crate) fn finish_item(&mut self, item: &OperationItem) {
        self.items_completed += 1;
        if let Some(error) = item.error() {
            self.errors.push(error.clone());
        }
    }
}

/// Sub-progress while directory trees are measured.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SizingProgress {
    pub files_seen: u64,
    pub dirs_seen: u64,
    pub bytes_seen: u64,
    /// Entry most recently visited.
    pub current: Option<PathBuf>,
    /// Set on the final report.
    pub finished: bool,
}

/// One engine callback, as a value.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    Progress {
        item: OperationItem,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Terminal(OperationItem),
    Sizing(SizingProgress),
    Batch(OperationProgress),
}

/// Forwards every callback through an unbounded tokio channel.
///
/// Lets an async consumer (a UI task) observe a batch without doing work
/// on the worker threads.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: OperationEvent) {
        // Receiver gone means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, item: &OperationItem, bytes_transferred: u64, total_bytes: u64) {
        self.send(OperationEvent::Progress {
            item: item.clone(),
            bytes_transferred,
            total_bytes,
        });
    }

    fn on_item_terminal(&self, item: &OperationItem) {
        self.send(OperationEvent::Terminal(item.clone()));
    }

    fn on_sizing(&self, progress: &SizingProgress) {
        self.send(OperationEvent::Sizing(progress.clone()));
    }

    fn on_batch_progress(&self, progress: &OperationProgress) {
        self.send(OperationEvent::Batch(progress.clone()));
    }
}

/// Rate limiter for progress events: fires after `every_bytes` more bytes
/// or after `every` has elapsed, whichever comes first.
#[derive(Debug)]
pub(crate) struct Throttle {
    every_bytes: u64,
    every: Duration,
    last_bytes: u64,
    last_at: Instant,
}

impl Throttle {
    pub(crate) fn new(every_bytes: u64, every: Duration) -> Self {
        Self {
            every_bytes,
            every,
            last_bytes: 0,
            last_at: Instant::now(),
        }
    }

    pub(crate) fn ready(&mut self, bytes: u64) -> bool {
        if bytes.saturating_sub(self.last_bytes) >= self.every_bytes
            || self.last_at.elapsed() >= self.every
        {
            self.last_bytes = bytes;
            self.last_at = Instant::now();
            return true;
        }
        false
    }
}

/// Final tally of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub kind: OperationKind,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Bytes moved by completed items.
    pub bytes_processed: u64,
    pub errors: Vec<OperationError>,
}

impl BatchSummary {
    pub fn from_items(kind: OperationKind, items: &[OperationItem]) -> Self {
        let mut summary = Self {
            kind,
            completed: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            bytes_processed: 0,
            errors: Vec::new(),
        };

        for item in items {
            match item.state() {
                ItemState::Completed => {
                    summary.completed += 1;
                    if !item.is_dir() {
                        summary.bytes_processed += item.bytes_transferred();
                    }
                }
                ItemState::Failed => summary.failed += 1,
                ItemState::Skipped => summary.skipped += 1,
                ItemState::Cancelled => summary.cancelled += 1,
                _ => {}
            }
            if let Some(error) = item.error() {
                summary.errors.push(error.clone());
            }
        }

        summary
    }

    /// Check if every item completed.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Get a human-readable summary of the operation.
    pub fn summary(&self) -> String {
        let action = match self.kind {
            OperationKind::Copy => "Copied",
            OperationKind::Move => "Moved",
            OperationKind::Delete => "Deleted",
            OperationKind::CreateDirectory => "Created",
        };

        let mut text = format!("{} {} items", action, self.completed);
        for (count, label) in [
            (self.failed, "failed"),
            (self.skipped, "skipped"),
            (self.cancelled, "cancelled"),
        ] {
            if count > 0 {
                text.push_str(&format!(", {} {}", count, label));
            }
        }
        text
    }
}
