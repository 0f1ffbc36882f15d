//! Expands a request into an ordered plan of operation items.
//!
//! Copy and move plans are pre-order (a directory before its contents),
//! delete plans are post-order (contents before their directory). Every
//! source entry gets exactly one item, including entries under a skipped
//! or failed directory.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use twinpane_core::{
    is_ancestor_of, validate_filename, EngineConfig, EntryKind, ErrorKind, FileItem,
    OperationError,
};

use crate::conflict::{AskOutcome, BatchResolver, Conflict, ConflictKind, Decision, Resolution};
use crate::operation::{ItemState, OperationItem, OperationKind};
use crate::progress::{ProgressSink, SizingProgress, Throttle};
use crate::transfer::{make_dir, same_volume};

/// What a worker does for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Copy of a directory. Executed while the plan is built.
    MakeDir { create: bool },
    CopyFile { overwrite: bool },
    CopySymlink { overwrite: bool },
    MoveEntry { overwrite: bool, same_volume: bool },
    /// Rename a whole directory; the items in `covered` finish with it.
    MoveTree { covered: Range<usize> },
    /// Flattened directory move. The destination is created while the plan
    /// is built, the emptied source is removed after all children finish.
    RemoveSourceDir { create: bool },
    DeleteFile,
    DeleteDir,
    /// Handled by the `MoveTree` item that owns it.
    Covered,
}

impl Step {
    /// Whether the item waits until all of its children are terminal.
    pub(crate) fn is_gated(&self) -> bool {
        matches!(self, Self::RemoveSourceDir { .. } | Self::DeleteDir)
    }

    pub(crate) fn set_overwrite(&mut self, value: bool) {
        match self {
            Self::CopyFile { overwrite }
            | Self::CopySymlink { overwrite }
            | Self::MoveEntry { overwrite, .. } => *overwrite = value,
            _ => {}
        }
    }
}

/// Result of planning, before execution.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub items: Vec<OperationItem>,
    pub steps: Vec<Step>,
    /// Plan index of each item's parent directory item.
    pub parents: Vec<Option<usize>>,
    /// Destinations claimed by this plan.
    pub reserved: HashSet<PathBuf>,
    /// File-level conflicts waiting for the decision interface.
    pub asks: Vec<(usize, Conflict)>,
}

impl Plan {
    /// Create destination directories for copies and flattened moves.
    ///
    /// Runs before any worker starts, so a directory always exists before
    /// anything is written into it. Descendants of a directory that could
    /// not be created fail with it.
    pub(crate) fn prepare_directories(&mut self, config: &EngineConfig, cancel: &CancellationToken) {
        for idx in 0..self.items.len() {
            if self.items[idx].is_terminal() {
                continue;
            }

            if let Some(parent) = self.parents[idx].filter(|p| *p < idx) {
                if self.items[parent].state() == ItemState::Failed {
                    let kind = self.items[parent].error().map_or(ErrorKind::Io, |e| e.kind);
                    let error = inherited_error(kind, self.items[idx].source());
                    fail_item(&mut self.items[idx], error);
                    continue;
                }
            }

            if cancel.is_cancelled() {
                // Left for the scheduler to cancel
                continue;
            }

            let item = &mut self.items[idx];
            match self.steps[idx] {
                Step::MakeDir { create } => {
                    if let Err(e) = item.begin() {
                        tracing::warn!(error = %e, "Unexpected state while creating directory");
                        continue;
                    }
                    let created = match (create, item.destination()) {
                        (true, Some(dst)) => make_dir(config, Some(item.source()), dst),
                        _ => Ok(()),
                    };
                    let result = match created {
                        Ok(()) => item.complete().map(|_| ()),
                        Err(error) => item.fail(error),
                    };
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Unexpected state while creating directory");
                    }
                }
                Step::RemoveSourceDir { create: true } => {
                    let created = match item.destination() {
                        Some(dst) => make_dir(config, Some(item.source()), dst),
                        None => Ok(()),
                    };
                    if let Err(error) = created {
                        fail_item(item, error);
                    }
                }
                _ => {}
            }
        }

        let items = &self.items;
        self.asks.retain(|(idx, _)| !items[*idx].is_terminal());
    }
}

/// How a conflict decision plays out for one item.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// Continue with this destination. `replace` means an existing entry is
    /// overwritten (files) or merged into (directories).
    Proceed { destination: PathBuf, replace: bool },
    Skip,
    Fail(OperationError),
}

/// Check a decision against the conflict it answers.
///
/// The engine never replaces a directory with a file or the reverse, and
/// never merges or overwrites an entry with itself.
pub(crate) fn apply_decision(
    conflict: &Conflict,
    decision: &Decision,
    taken: &dyn Fn(&Path) -> bool,
) -> Action {
    let destination = &conflict.destination;
    match decision {
        Decision::Skip => Action::Skip,
        Decision::Overwrite | Decision::MergeDirectories if conflict.is_same_entry() => {
            Action::Fail(OperationError::new(
                ErrorKind::InvalidDestination,
                destination,
                "Source and destination are the same entry",
            ))
        }
        Decision::Overwrite => match conflict.kind {
            ConflictKind::TypeMismatch => Action::Fail(mismatch_error(conflict)),
            _ => Action::Proceed {
                destination: destination.clone(),
                replace: true,
            },
        },
        Decision::MergeDirectories => match conflict.kind {
            ConflictKind::DirectoryExists => Action::Proceed {
                destination: destination.clone(),
                replace: true,
            },
            ConflictKind::TypeMismatch => Action::Fail(mismatch_error(conflict)),
            ConflictKind::FileExists => Action::Fail(OperationError::type_mismatch(
                destination,
                "Only directories can be merged",
            )),
        },
        Decision::Rename(name) => {
            if let Err(reason) = validate_filename(name) {
                return Action::Fail(OperationError::new(
                    ErrorKind::InvalidName,
                    destination,
                    format!("Invalid name '{name}': {reason}"),
                ));
            }
            let renamed = destination.with_file_name(name);
            if taken(&renamed) {
                return Action::Fail(OperationError::new(
                    ErrorKind::AlreadyExists,
                    renamed,
                    "Renamed destination is already taken",
                ));
            }
            Action::Proceed {
                destination: renamed,
                replace: false,
            }
        }
    }
}

fn mismatch_error(conflict: &Conflict) -> OperationError {
    let message = if conflict.existing.is_dir() {
        "Refusing to replace a directory with a file"
    } else {
        "Refusing to replace a file with a directory"
    };
    OperationError::type_mismatch(&conflict.destination, message)
}

fn inherited_error(kind: ErrorKind, path: &Path) -> OperationError {
    OperationError::new(kind, path, "Not processed because its directory failed")
}

/// Fail an item from whatever live state it is in.
pub(crate) fn fail_item(item: &mut OperationItem, error: OperationError) {
    if let Err(e) = item.fail(error) {
        tracing::warn!(error = %e, "Unexpected state while failing item");
    }
}

/// Outcome forced on a whole subtree.
#[derive(Debug, Clone)]
enum Inherit {
    Skip,
    Fail(ErrorKind),
    Cancel,
    /// Listed for a `MoveTree` ancestor, nothing to decide.
    Covered,
}

/// Walks sources and builds a [`Plan`]. Runs on a blocking thread.
pub(crate) struct PlanBuilder<'a> {
    kind: OperationKind,
    resolver: &'a BatchResolver,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    plan: Plan,
    sizing: SizingProgress,
    throttle: Throttle,
}

impl<'a> PlanBuilder<'a> {
    pub(crate) fn new(
        kind: OperationKind,
        config: &EngineConfig,
        resolver: &'a BatchResolver,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            kind,
            resolver,
            sink,
            cancel,
            plan: Plan::default(),
            sizing: SizingProgress::default(),
            throttle: Throttle::new(config.progress_interval_bytes, config.progress_interval),
        }
    }

    /// Plan a copy or move of `sources` into `destination_dir`.
    pub(crate) fn transfer(mut self, sources: &[FileItem], destination_dir: &Path) -> Plan {
        for source in sources {
            let name = source.path().file_name().map(PathBuf::from).unwrap_or_default();
            self.plan_transfer(
                source.path(),
                destination_dir.join(name),
                None,
                source.kind(),
                None,
            );
        }
        self.finish()
    }

    /// Plan deletion of `sources`.
    pub(crate) fn delete(mut self, sources: &[FileItem]) -> Plan {
        for source in sources {
            self.plan_delete(source.path(), source.kind());
        }
        self.finish()
    }

    fn finish(mut self) -> Plan {
        self.sizing.finished = true;
        self.sizing.current = None;
        self.sink.on_sizing(&self.sizing);
        tracing::debug!(
            kind = %self.kind,
            items = self.plan.items.len(),
            bytes = self.sizing.bytes_seen,
            asks = self.plan.asks.len(),
            "Plan built"
        );
        self.plan
    }

    fn push(
        &mut self,
        entry: EntryKind,
        source: &Path,
        destination: Option<PathBuf>,
        size: u64,
        step: Step,
        parent: Option<usize>,
    ) -> usize {
        let kind = match (self.kind, entry) {
            (OperationKind::Copy, EntryKind::Directory) => OperationKind::CreateDirectory,
            (kind, _) => kind,
        };
        let idx = self.plan.items.len();
        self.plan.items.push(OperationItem::new(
            idx,
            kind,
            entry,
            source.to_path_buf(),
            destination,
            size,
        ));
        self.plan.steps.push(step);
        self.plan.parents.push(parent);

        if entry == EntryKind::Directory {
            self.sizing.dirs_seen += 1;
        } else {
            self.sizing.files_seen += 1;
            self.sizing.bytes_seen += size;
        }
        if self.throttle.ready(self.sizing.bytes_seen) {
            self.sizing.current = Some(source.to_path_buf());
            self.sink.on_sizing(&self.sizing);
        }
        idx
    }

    fn apply_inherited(&mut self, idx: usize, inherit: &Inherit) {
        let item = &mut self.plan.items[idx];
        let result = match inherit {
            Inherit::Skip => item.skip(),
            Inherit::Cancel => item.cancel(),
            Inherit::Fail(kind) => {
                let error = inherited_error(*kind, item.source());
                item.fail(error)
            }
            Inherit::Covered => {
                self.plan.steps[idx] = Step::Covered;
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Unexpected state while planning");
        }
    }

    fn is_taken(reserved: &HashSet<PathBuf>, path: &Path) -> bool {
        reserved.contains(path) || fs::symlink_metadata(path).is_ok()
    }

    /// Plan one entry of a copy/move and, for directories, its subtree.
    /// Returns the number of bytes under the entry.
    fn plan_transfer(
        &mut self,
        source: &Path,
        destination: PathBuf,
        parent: Option<usize>,
        hint: EntryKind,
        inherit: Option<&Inherit>,
    ) -> u64 {
        let metadata = match fs::symlink_metadata(source) {
            Ok(metadata) => metadata,
            Err(e) => {
                let idx = self.push(hint, source, Some(destination), 0, Step::Covered, parent);
                match inherit {
                    Some(inherit) => self.apply_inherited(idx, inherit),
                    None => fail_item(&mut self.plan.items[idx], source_error(source, &e)),
                }
                return 0;
            }
        };

        let snapshot = FileItem::from_metadata(source.to_path_buf(), &metadata);
        let entry = snapshot.kind();
        let size = snapshot.size().unwrap_or(0);
        let idx = self.push(entry, source, Some(destination.clone()), size, Step::Covered, parent);

        if let Some(inherit) = inherit {
            self.apply_inherited(idx, inherit);
            if entry == EntryKind::Directory {
                let total = self.plan_children(idx, source, &destination, Some(inherit));
                self.plan.items[idx].set_size(total);
                return total;
            }
            return size;
        }

        let outcome = self.decide_destination(idx, &snapshot, &destination);
        let (destination, replace) = match outcome {
            Action::Proceed {
                destination,
                replace,
            } => (destination, replace),
            Action::Skip | Action::Fail(_) => {
                let inherit = match outcome {
                    Action::Fail(error) => {
                        let kind = error.kind;
                        fail_item(&mut self.plan.items[idx], error);
                        Inherit::Fail(kind)
                    }
                    _ if self.plan.items[idx].state() == ItemState::Cancelled => Inherit::Cancel,
                    _ => {
                        if let Err(e) = self.plan.items[idx].skip() {
                            tracing::warn!(error = %e, "Unexpected state while planning");
                        }
                        Inherit::Skip
                    }
                };
                if entry == EntryKind::Directory {
                    let total = self.plan_children(idx, source, &destination, Some(&inherit));
                    self.plan.items[idx].set_size(total);
                    return total;
                }
                return size;
            }
        };

        self.plan.reserved.insert(destination.clone());
        self.plan.items[idx].set_destination(destination.clone());
        let on_one_volume = || {
            destination
                .parent()
                .is_some_and(|dir| same_volume(source, dir))
        };

        let step = match (self.kind, entry) {
            (OperationKind::Move, EntryKind::Directory) if !replace && on_one_volume() => {
                let total = self.plan_children(idx, source, &destination, Some(&Inherit::Covered));
                let covered = idx + 1..self.plan.items.len();
                self.plan.items[idx].set_size(total);
                self.plan.steps[idx] = Step::MoveTree { covered };
                return total;
            }
            (OperationKind::Move, EntryKind::Directory) => Step::RemoveSourceDir { create: !replace },
            (_, EntryKind::Directory) => Step::MakeDir { create: !replace },
            (OperationKind::Move, _) => Step::MoveEntry {
                overwrite: replace,
                same_volume: on_one_volume(),
            },
            (_, EntryKind::Symlink) => Step::CopySymlink { overwrite: replace },
            (_, EntryKind::File) => Step::CopyFile { overwrite: replace },
        };
        self.plan.steps[idx] = step;

        if entry == EntryKind::Directory {
            let total = self.plan_children(idx, source, &destination, None);
            self.plan.items[idx].set_size(total);
            return total;
        }
        size
    }

    /// Work out where an entry goes, consulting the resolver on collisions.
    fn decide_destination(&mut self, idx: usize, snapshot: &FileItem, destination: &Path) -> Action {
        let source = snapshot.path();

        if self.cancel.is_cancelled() {
            if let Err(e) = self.plan.items[idx].cancel() {
                tracing::warn!(error = %e, "Unexpected state while planning");
            }
            return Action::Skip;
        }

        if snapshot.is_dir() && destination != source && is_ancestor_of(source, destination) {
            return Action::Fail(OperationError::new(
                ErrorKind::InvalidDestination,
                destination,
                "Cannot place a directory inside itself",
            ));
        }

        if self.plan.reserved.contains(destination) {
            return Action::Fail(OperationError::new(
                ErrorKind::AlreadyExists,
                destination,
                "Another item in this batch has the same destination",
            ));
        }

        let existing = match fs::symlink_metadata(destination) {
            Ok(metadata) => FileItem::from_metadata(destination.to_path_buf(), &metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Action::Proceed {
                    destination: destination.to_path_buf(),
                    replace: false,
                };
            }
            Err(e) => {
                return Action::Fail(OperationError::io(
                    destination,
                    "Failed to inspect destination",
                    &e,
                ));
            }
        };

        let conflict = Conflict::new(snapshot, existing);
        let reserved = &self.plan.reserved;
        let taken = |p: &Path| Self::is_taken(reserved, p);

        let decision = match self.resolver.resolve(&conflict, &taken) {
            Resolution::Decided(decision) => decision,
            Resolution::Ask if snapshot.is_dir() => {
                // The subtree's plan depends on the answer
                if let Err(e) = self.plan.items[idx].await_decision() {
                    tracing::warn!(error = %e, "Unexpected state while planning");
                }
                let reserved = &self.plan.reserved;
                let taken = |p: &Path| Self::is_taken(reserved, p);
                match self.resolver.ask(&conflict, &taken) {
                    AskOutcome::Decided(decision) => decision,
                    AskOutcome::Abort => {
                        tracing::info!(path = %destination.display(), "Batch aborted at conflict");
                        self.cancel.cancel();
                        if let Err(e) = self.plan.items[idx].cancel() {
                            tracing::warn!(error = %e, "Unexpected state while planning");
                        }
                        return Action::Skip;
                    }
                }
            }
            Resolution::Ask => {
                if let Err(e) = self.plan.items[idx].await_decision() {
                    tracing::warn!(error = %e, "Unexpected state while planning");
                }
                self.plan.asks.push((idx, conflict));
                // Keep the original name; an answer may move it elsewhere
                return Action::Proceed {
                    destination: destination.to_path_buf(),
                    replace: false,
                };
            }
        };

        let reserved = &self.plan.reserved;
        let taken = |p: &Path| Self::is_taken(reserved, p);
        let action = apply_decision(&conflict, &decision, &taken);
        tracing::debug!(
            path = %destination.display(),
            kind = ?conflict.kind,
            ?decision,
            "Resolved conflict"
        );
        self.plan.items[idx].set_decision(decision);
        action
    }

    /// Plan the children of a directory item. Returns their total size.
    fn plan_children(
        &mut self,
        dir_idx: usize,
        source: &Path,
        destination: &Path,
        inherit: Option<&Inherit>,
    ) -> u64 {
        let children = match read_children(source) {
            Ok(children) => children,
            Err(e) => {
                if inherit.is_none() {
                    let error = OperationError::io(source, "Failed to read directory", &e);
                    fail_item(&mut self.plan.items[dir_idx], error);
                }
                return 0;
            }
        };

        let mut total = 0;
        for (child, hint) in children {
            let name = child.file_name().map(PathBuf::from).unwrap_or_default();
            // A cancel while walking applies to everything not yet planned
            let inherit = match inherit {
                None if self.cancel.is_cancelled() => Some(&Inherit::Cancel),
                other => other,
            };
            total += self.plan_transfer(&child, destination.join(name), Some(dir_idx), hint, inherit);
        }
        total
    }

    /// Plan deletion of one entry, children first. Returns the item index.
    fn plan_delete(&mut self, path: &Path, hint: EntryKind) -> (usize, u64) {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                let idx = self.push(hint, path, None, 0, Step::DeleteFile, None);
                fail_item(&mut self.plan.items[idx], source_error(path, &e));
                return (idx, 0);
            }
        };

        let snapshot = FileItem::from_metadata(path.to_path_buf(), &metadata);
        if !snapshot.is_dir() {
            let size = snapshot.size().unwrap_or(0);
            let idx = self.push(snapshot.kind(), path, None, size, Step::DeleteFile, None);
            self.cancel_if_requested(idx);
            return (idx, size);
        }

        let mut children = Vec::new();
        let mut total = 0;
        let read_error = match read_children(path) {
            Ok(entries) => {
                for (child, hint) in entries {
                    let (child_idx, size) = self.plan_delete(&child, hint);
                    children.push(child_idx);
                    total += size;
                }
                None
            }
            Err(e) => Some(e),
        };

        let idx = self.push(EntryKind::Directory, path, None, total, Step::DeleteDir, None);
        for child in children {
            self.plan.parents[child] = Some(idx);
        }
        match read_error {
            Some(e) => {
                let error = OperationError::io(path, "Failed to read directory", &e);
                fail_item(&mut self.plan.items[idx], error);
            }
            None => self.cancel_if_requested(idx),
        }
        (idx, total)
    }

    fn cancel_if_requested(&mut self, idx: usize) {
        if self.cancel.is_cancelled() {
            if let Err(e) = self.plan.items[idx].cancel() {
                tracing::warn!(error = %e, "Unexpected state while planning");
            }
        }
    }
}

fn source_error(path: &Path, error: &io::Error) -> OperationError {
    if error.kind() == io::ErrorKind::NotFound {
        OperationError::not_found(path)
    } else {
        OperationError::io(path, "Failed to read source", error)
    }
}

/// Directory entries sorted by name, with their kinds (links not followed).
fn read_children(dir: &Path) -> io::Result<Vec<(PathBuf, EntryKind)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let kind = match entry.file_type() {
            Ok(t) if t.is_symlink() => EntryKind::Symlink,
            Ok(t) if t.is_dir() => EntryKind::Directory,
            _ => EntryKind::File,
        };
        children.push((entry.path(), kind));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

/// Total size of files under `items`, reported through `sink` as it grows.
pub(crate) fn measure(
    items: &[FileItem],
    config: &EngineConfig,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Option<u64> {
    let mut sizing = SizingProgress::default();
    let mut throttle = Throttle::new(config.progress_interval_bytes, config.progress_interval);
    let mut stack: Vec<PathBuf> = items.iter().map(|i| i.path().to_path_buf()).collect();

    while let Some(path) = stack.pop() {
        if cancel.is_cancelled() {
            return None;
        }
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        if metadata.is_dir() {
            sizing.dirs_seen += 1;
            match read_children(&path) {
                Ok(children) => stack.extend(children.into_iter().map(|(p, _)| p)),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "Cannot read directory"),
            }
        } else {
            sizing.files_seen += 1;
            sizing.bytes_seen += metadata.len();
        }
        if throttle.ready(sizing.bytes_seen) {
            sizing.current = Some(path);
            sink.on_sizing(&sizing);
        }
    }

    sizing.current = None;
    sizing.finished = true;
    sink.on_sizing(&sizing);
    Some(sizing.bytes_seen)
}
