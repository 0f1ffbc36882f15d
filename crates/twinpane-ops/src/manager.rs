//! Public entry point of the engine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use twinpane_core::{
    normalize_path, validate_filename, EngineConfig, EngineError, EntryKind, FileItem,
    OperationError,
};

use crate::conflict::{AskOutcome, BatchResolver, Conflict, ConflictKind, ConflictResolver, Resolution};
use crate::operation::{OperationItem, OperationKind};
use crate::plan::{apply_decision, fail_item, measure, Action, Plan, PlanBuilder};
use crate::progress::{BatchSummary, ProgressSink};
use crate::scheduler;
use crate::transfer::make_dir;

/// Runs copy, move and delete batches.
///
/// Each call owns its items until it returns; nothing is shared between
/// calls. Calls return once every item is terminal.
#[derive(Debug, Clone, Default)]
pub struct FileOperationsManager {
    config: EngineConfig,
}

impl FileOperationsManager {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Copy `items` into the directory `destination`.
    ///
    /// A missing destination directory is created. Per-item failures are
    /// reported on the returned items, never as an `Err`.
    pub async fn copy_items(
        &self,
        items: &[FileItem],
        destination: &Path,
        resolver: ConflictResolver,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<OperationItem>, EngineError> {
        self.transfer(OperationKind::Copy, items, destination, resolver, sink, cancel)
            .await
    }

    /// Move `items` into the directory `destination`.
    ///
    /// Within one volume entries are renamed. Across volumes they are
    /// copied, verified, and only then removed from the source.
    pub async fn move_items(
        &self,
        items: &[FileItem],
        destination: &Path,
        resolver: ConflictResolver,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<OperationItem>, EngineError> {
        self.transfer(OperationKind::Move, items, destination, resolver, sink, cancel)
            .await
    }

    /// Delete `items`, directory contents before the directory itself.
    pub async fn delete_items(
        &self,
        items: &[FileItem],
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<OperationItem>, EngineError> {
        let sources = select_sources(items)?;
        let cancel = cancel.child_token();
        let resolver = Arc::new(BatchResolver::new(ConflictResolver::Skip));
        tracing::info!(items = sources.len(), "Starting delete");

        let plan = {
            let config = self.config.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let resolver = resolver.clone();
            tokio::task::spawn_blocking(move || {
                PlanBuilder::new(OperationKind::Delete, &config, &resolver, sink.as_ref(), &cancel)
                    .delete(&sources)
            })
            .await
            .map_err(EngineError::task)?
        };

        let items = scheduler::run(
            OperationKind::Delete,
            self.config.clone(),
            sink,
            cancel,
            resolver,
            plan,
        )
        .await;
        log_summary(OperationKind::Delete, &items);
        Ok(items)
    }

    /// Create the directory `name` inside `parent`.
    ///
    /// An existing file of that name is a type mismatch. An existing
    /// directory goes through `resolver` like any other conflict.
    pub async fn create_directory(
        &self,
        parent: &Path,
        name: &str,
        resolver: ConflictResolver,
    ) -> Result<OperationItem, EngineError> {
        validate_filename(name).map_err(|reason| EngineError::InvalidName {
            name: name.to_string(),
            reason,
        })?;

        let config = self.config.clone();
        let parent = parent.to_path_buf();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<OperationItem, EngineError> {
            let parent = prepare_destination(&parent)?;
            Ok(create_directory_blocking(&config, &parent.join(name), resolver))
        })
        .await
        .map_err(EngineError::task)?
    }

    /// Total size of the files under `items`.
    ///
    /// Reports its progress through `sink.on_sizing`. Returns
    /// [`EngineError::Cancelled`] if `cancel` fires first.
    pub async fn calculate_size(
        &self,
        items: &[FileItem],
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<u64, EngineError> {
        let sources = select_sources(items)?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || measure(&sources, &config, sink.as_ref(), &cancel))
            .await
            .map_err(EngineError::task)?
            .ok_or(EngineError::Cancelled)
    }

    async fn transfer(
        &self,
        kind: OperationKind,
        items: &[FileItem],
        destination: &Path,
        resolver: ConflictResolver,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<OperationItem>, EngineError> {
        let sources = select_sources(items)?;
        let cancel = cancel.child_token();
        let resolver = Arc::new(BatchResolver::new(resolver));
        tracing::info!(
            %kind,
            items = sources.len(),
            destination = %destination.display(),
            "Starting batch"
        );

        let plan = {
            let config = self.config.clone();
            let destination = destination.to_path_buf();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let resolver = resolver.clone();
            tokio::task::spawn_blocking(move || -> Result<Plan, EngineError> {
                let destination = prepare_destination(&destination)?;
                let mut plan = PlanBuilder::new(kind, &config, &resolver, sink.as_ref(), &cancel)
                    .transfer(&sources, &destination);
                plan.prepare_directories(&config, &cancel);
                Ok(plan)
            })
            .await
            .map_err(EngineError::task)??
        };

        let items = scheduler::run(kind, self.config.clone(), sink, cancel, resolver, plan).await;
        log_summary(kind, &items);
        Ok(items)
    }
}

/// Collapse duplicate selections and drop entries nested under another
/// selected directory, keeping the caller's order.
fn select_sources(items: &[FileItem]) -> Result<Vec<FileItem>, EngineError> {
    if items.is_empty() {
        return Err(EngineError::EmptyRequest);
    }

    let unique: IndexSet<&FileItem> = items.iter().collect();
    let sources: Vec<FileItem> = unique
        .iter()
        .filter(|item| {
            !unique.iter().any(|other| {
                other.is_dir() && other.path() != item.path() && item.path().starts_with(other.path())
            })
        })
        .map(|item| (*item).clone())
        .collect();

    if sources.len() < items.len() {
        tracing::debug!(
            requested = items.len(),
            kept = sources.len(),
            "Dropped duplicate or nested selections"
        );
    }
    Ok(sources)
}

/// Make sure the destination directory exists.
fn prepare_destination(destination: &Path) -> Result<PathBuf, EngineError> {
    let destination = normalize_path(destination);
    match fs::metadata(&destination) {
        Ok(metadata) if metadata.is_dir() => Ok(destination),
        Ok(_) => Err(EngineError::NotADirectory { path: destination }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&destination).map_err(|source| {
                EngineError::DestinationUnavailable {
                    path: destination.clone(),
                    source,
                }
            })?;
            tracing::info!(path = %destination.display(), "Created destination directory");
            Ok(destination)
        }
        Err(source) => Err(EngineError::DestinationUnavailable {
            path: destination,
            source,
        }),
    }
}

fn create_directory_blocking(
    config: &EngineConfig,
    target: &Path,
    resolver: ConflictResolver,
) -> OperationItem {
    let mut item = OperationItem::new(
        0,
        OperationKind::CreateDirectory,
        EntryKind::Directory,
        target.to_path_buf(),
        Some(target.to_path_buf()),
        0,
    );

    let (destination, replace) = match fs::symlink_metadata(target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => (target.to_path_buf(), false),
        Err(e) => {
            fail_item(
                &mut item,
                OperationError::io(target, "Failed to inspect destination", &e),
            );
            return item;
        }
        Ok(metadata) => {
            let existing = FileItem::from_metadata(target.to_path_buf(), &metadata);
            let conflict = Conflict::for_new_directory(target.to_path_buf(), existing);
            match resolve_new_directory(&mut item, &conflict, resolver) {
                Some(resolved) => resolved,
                None => return item,
            }
        }
    };

    if let Err(e) = item.begin() {
        tracing::warn!(error = %e, "Unexpected state while creating directory");
        return item;
    }
    item.set_destination(destination.clone());
    let created = if replace {
        Ok(())
    } else {
        make_dir(config, None, &destination)
    };
    let result = match created {
        Ok(()) => item.complete().map(|_| ()),
        Err(error) => item.fail(error),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Unexpected state while creating directory");
    }
    tracing::debug!(path = %destination.display(), state = %item.state(), "Create directory finished");
    item
}

/// Decide what happens to a new directory whose name is taken.
///
/// Returns the destination to use, or `None` once `item` is terminal.
fn resolve_new_directory(
    item: &mut OperationItem,
    conflict: &Conflict,
    resolver: ConflictResolver,
) -> Option<(PathBuf, bool)> {
    if conflict.kind == ConflictKind::TypeMismatch {
        fail_item(
            item,
            OperationError::type_mismatch(
                &conflict.destination,
                "A file with this name already exists",
            ),
        );
        return None;
    }

    let resolver = BatchResolver::new(resolver);
    let taken = |p: &Path| fs::symlink_metadata(p).is_ok();
    let decision = match resolver.resolve(conflict, &taken) {
        Resolution::Decided(decision) => decision,
        Resolution::Ask => {
            if let Err(e) = item.await_decision() {
                tracing::warn!(error = %e, "Unexpected state while creating directory");
            }
            match resolver.ask(conflict, &taken) {
                AskOutcome::Decided(decision) => decision,
                AskOutcome::Abort => {
                    if let Err(e) = item.cancel() {
                        tracing::warn!(error = %e, "Unexpected state while creating directory");
                    }
                    return None;
                }
            }
        }
    };

    let action = apply_decision(conflict, &decision, &taken);
    item.set_decision(decision);
    match action {
        Action::Proceed {
            destination,
            replace,
        } => Some((destination, replace)),
        Action::Skip => {
            if let Err(e) = item.skip() {
                tracing::warn!(error = %e, "Unexpected state while creating directory");
            }
            None
        }
        Action::Fail(error) => {
            fail_item(item, error);
            None
        }
    }
}

fn log_summary(kind: OperationKind, items: &[OperationItem]) {
    let summary = BatchSummary::from_items(kind, items);
    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        bytes = summary.bytes_processed,
        "{}",
        summary.summary()
    );
}
