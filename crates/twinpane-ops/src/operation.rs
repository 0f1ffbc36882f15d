//! Operation items and their lifecycle.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use thiserror::Error;
use twinpane_core::{EntryKind, OperationError};

use crate::conflict::Decision;

/// The kind of work an item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
    CreateDirectory,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "Copy"),
            Self::Move => write!(f, "Move"),
            Self::Delete => write!(f, "Delete"),
            Self::CreateDirectory => write!(f, "Create directory"),
        }
    }
}

/// Lifecycle state of an operation item.
///
/// ```text
/// Pending ──> AwaitingConflictDecision ──> InProgress ──> Completed
///    │                  │                      │      └─> Failed
///    └──────────────────┴──> Skipped           └──────┐
///    (any non-terminal) ─────────────────────────────> Cancelled
/// ```
///
/// `Pending` may also go straight to `Failed` when the plan builder finds
/// the source already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ItemState {
    Pending,
    AwaitingConflictDecision,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl ItemState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (Pending, AwaitingConflictDecision | InProgress | Skipped | Failed | Cancelled) => true,
            (AwaitingConflictDecision, InProgress | Skipped | Failed | Cancelled) => true,
            (InProgress, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::AwaitingConflictDecision => write!(f, "Awaiting decision"),
            Self::InProgress => write!(f, "In progress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal transition for item {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: usize,
    pub from: ItemState,
    pub to: ItemState,
}

/// One unit of work in a plan: a single source entry being copied, moved,
/// deleted or created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationItem {
    id: usize,
    kind: OperationKind,
    entry: EntryKind,
    source: PathBuf,
    destination: Option<PathBuf>,
    size_bytes: u64,
    bytes_transferred: u64,
    state: ItemState,
    error: Option<OperationError>,
    conflict_decision: Option<Decision>,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
}

impl OperationItem {
    pub(crate) fn new(
        id: usize,
        kind: OperationKind,
        entry: EntryKind,
        source: PathBuf,
        destination: Option<PathBuf>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id,
            kind,
            entry,
            source,
            destination,
            size_bytes,
            bytes_transferred: 0,
            state: ItemState::Pending,
            error: None,
            conflict_decision: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Position of this item in its plan.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Kind of the source entry.
    pub fn entry(&self) -> EntryKind {
        self.entry
    }

    pub fn is_dir(&self) -> bool {
        self.entry == EntryKind::Directory
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Destination path; `None` for deletions.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Known or estimated size. For directories, the sum of their contents.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// The failure, present only in the `Failed` state.
    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    /// How a destination conflict was resolved, if there was one.
    pub fn conflict_decision(&self) -> Option<&Decision> {
        self.conflict_decision.as_ref()
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn set_size(&mut self, size_bytes: u64) {
        self.size_bytes = size_bytes;
    }

    pub(crate) fn set_destination(&mut self, destination: PathBuf) {
        self.destination = Some(destination);
    }

    pub(crate) fn set_decision(&mut self, decision: Decision) {
        self.conflict_decision = Some(decision);
    }

    fn transition(&mut self, to: ItemState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to == ItemState::InProgress {
            self.started_at = Some(SystemTime::now());
        }
        if to.is_terminal() {
            self.finished_at = Some(SystemTime::now());
        }
        Ok(())
    }

    pub(crate) fn await_decision(&mut self) -> Result<(), TransitionError> {
        self.transition(ItemState::AwaitingConflictDecision)
    }

    pub(crate) fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(ItemState::InProgress)
    }

    /// Record bytes written so far. Returns how much the counter advanced.
    ///
    /// The counter never decreases and never passes `size_bytes`.
    pub(crate) fn record_progress(&mut self, total_written: u64) -> u64 {
        if self.state != ItemState::InProgress {
            return 0;
        }
        let clamped = total_written.min(self.size_bytes);
        if clamped <= self.bytes_transferred {
            return 0;
        }
        let delta = clamped - self.bytes_transferred;
        self.bytes_transferred = clamped;
        delta
    }

    /// Mark the item finished. Returns the final byte-counter advance.
    ///
    /// A directory's counter only moves through `record_progress`: creating
    /// it transfers nothing, its contents are counted by their own items.
    pub(crate) fn complete(&mut self) -> Result<u64, TransitionError> {
        self.transition(ItemState::Completed)?;
        if self.is_dir() {
            return Ok(0);
        }
        let delta = self.size_bytes - self.bytes_transferred;
        self.bytes_transferred = self.size_bytes;
        Ok(delta)
    }

    pub(crate) fn fail(&mut self, error: OperationError) -> Result<(), TransitionError> {
        self.transition(ItemState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub(crate) fn skip(&mut self) -> Result<(), TransitionError> {
        self.transition(ItemState::Skipped)
    }

    pub(crate) fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(ItemState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinpane_core::ErrorKind;

    fn file_item() -> OperationItem {
        OperationItem::new(
            0,
            OperationKind::Copy,
            EntryKind::File,
            PathBuf::from("/src/a.txt"),
            Some(PathBuf::from("/dst/a.txt")),
            10,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut item = file_item();
        assert_eq!(item.state(), ItemState::Pending);
        item.begin().unwrap();
        assert!(item.started_at().is_some());
        assert_eq!(item.record_progress(4), 4);
        assert_eq!(item.complete().unwrap(), 6);
        assert_eq!(item.state(), ItemState::Completed);
        assert_eq!(item.bytes_transferred(), 10);
        assert!(item.finished_at().is_some());
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut item = file_item();
        let err = item.complete().unwrap_err();
        assert_eq!(err.from, ItemState::Pending);
        assert_eq!(err.to, ItemState::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut item = file_item();
        item.skip().unwrap();
        assert!(item.begin().is_err());
        assert!(item.cancel().is_err());
        assert!(item.is_terminal());
    }

    #[test]
    fn test_awaiting_decision_paths() {
        let mut item = file_item();
        item.await_decision().unwrap();
        assert!(item.complete().is_err());
        item.begin().unwrap();
        item.fail(OperationError::not_found("/src/a.txt")).unwrap();
        assert_eq!(item.error().map(|e| e.kind), Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_failing_while_awaiting_decision_never_starts() {
        let mut item = file_item();
        item.await_decision().unwrap();
        item.fail(OperationError::not_found("/src/a.txt")).unwrap();
        assert_eq!(item.state(), ItemState::Failed);
        assert!(item.started_at().is_none());
        assert!(item.finished_at().is_some());
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut item = file_item();
        assert_eq!(item.record_progress(5), 0); // not started yet
        item.begin().unwrap();
        assert_eq!(item.record_progress(7), 7);
        assert_eq!(item.record_progress(3), 0);
        assert_eq!(item.record_progress(50), 3);
        assert_eq!(item.bytes_transferred(), 10);
    }

    #[test]
    fn test_directory_completion_moves_no_bytes() {
        let mut dir = OperationItem::new(
            1,
            OperationKind::CreateDirectory,
            EntryKind::Directory,
            PathBuf::from("/src/d"),
            Some(PathBuf::from("/dst/d")),
            100,
        );
        dir.begin().unwrap();
        assert_eq!(dir.complete().unwrap(), 0);
        assert_eq!(dir.bytes_transferred(), 0);
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for setup in [0, 1, 2] {
            let mut item = file_item();
            match setup {
                1 => item.await_decision().unwrap(),
                2 => item.begin().unwrap(),
                _ => {}
            }
            item.cancel().unwrap();
            assert_eq!(item.state(), ItemState::Cancelled);
            assert!(item.error().is_none());
        }
    }
}
