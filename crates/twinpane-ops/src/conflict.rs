//! Conflict detection and resolution for file operations.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use twinpane_core::FileItem;

/// A destination collision detected while planning or running a batch.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The source path being operated on.
    pub source: PathBuf,
    /// The destination path where the conflict exists.
    pub destination: PathBuf,
    /// The kind of conflict.
    pub kind: ConflictKind,
    /// Snapshot of the incoming entry; `None` when creating a new directory.
    pub incoming: Option<FileItem>,
    /// Snapshot of the entry already at the destination.
    pub existing: FileItem,
}

impl Conflict {
    /// Create a conflict between a source entry and an existing destination.
    pub fn new(incoming: &FileItem, existing: FileItem) -> Self {
        let kind = match (incoming.is_dir(), existing.is_dir()) {
            (true, true) => ConflictKind::DirectoryExists,
            (false, false) => ConflictKind::FileExists,
            _ => ConflictKind::TypeMismatch,
        };
        Self {
            source: incoming.path().to_path_buf(),
            destination: existing.path().to_path_buf(),
            kind,
            incoming: Some(incoming.clone()),
            existing,
        }
    }

    /// Create a conflict for a directory about to be created at an occupied path.
    pub fn for_new_directory(target: PathBuf, existing: FileItem) -> Self {
        let kind = if existing.is_dir() {
            ConflictKind::DirectoryExists
        } else {
            ConflictKind::TypeMismatch
        };
        Self {
            source: target,
            destination: existing.path().to_path_buf(),
            kind,
            incoming: None,
            existing,
        }
    }

    /// Whether the destination is the source entry itself.
    pub fn is_same_entry(&self) -> bool {
        self.incoming.is_some() && self.source == self.destination
    }
}

/// The kind of conflict encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A file already exists at the destination.
    FileExists,
    /// A directory already exists where a directory is going.
    DirectoryExists,
    /// A file would collide with a directory or vice versa.
    TypeMismatch,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileExists => write!(f, "File already exists"),
            Self::DirectoryExists => write!(f, "Directory already exists"),
            Self::TypeMismatch => write!(f, "A file and a directory have the same name"),
        }
    }
}

/// What to do with one conflicting item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Replace the existing entry.
    Overwrite,
    /// Leave the existing entry and skip this item.
    Skip,
    /// Use this name (same parent directory) instead.
    Rename(String),
    /// Union two directories; nested conflicts are resolved again.
    MergeDirectories,
}

/// Outcome of asking a resolver about a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided(Decision),
    /// The caller has to be asked through the decision interface.
    Ask,
}

/// Answer returned by the interactive decision interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAnswer {
    /// Apply to this item only.
    Once(Decision),
    /// Apply to this item and every later conflict in the batch.
    ForAll(Decision),
    /// Cancel the whole batch.
    Abort,
}

/// Decision interface consumed by the engine for [`ConflictResolver::Ask`].
///
/// May block; the engine calls it from a dedicated blocking thread so other
/// items keep running.
pub trait ConflictDecider: Send + Sync {
    fn request_decision(&self, conflict: &Conflict) -> ConflictAnswer;
}

impl<F> ConflictDecider for F
where
    F: Fn(&Conflict) -> ConflictAnswer + Send + Sync,
{
    fn request_decision(&self, conflict: &Conflict) -> ConflictAnswer {
        self(conflict)
    }
}

/// Conflict resolution strategy for a batch.
#[derive(Clone)]
pub enum ConflictResolver {
    /// Skip every conflicting item.
    Skip,
    /// Replace conflicting files; directory collisions are merged.
    Overwrite,
    /// Pick a free `name (N).ext` for every conflicting item.
    Rename,
    /// Merge directory collisions, keep existing files.
    Merge,
    /// Ask the caller for every conflict.
    Ask(Arc<dyn ConflictDecider>),
}

impl ConflictResolver {
    /// Create an interactive resolver.
    pub fn ask(decider: impl ConflictDecider + 'static) -> Self {
        Self::Ask(Arc::new(decider))
    }

    /// Check if this resolver needs caller input.
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Ask(_))
    }

    /// Decide a conflict.
    ///
    /// `taken` reports destination paths that are occupied or already
    /// reserved, so generated names never collide.
    pub fn resolve(&self, conflict: &Conflict, taken: &dyn Fn(&Path) -> bool) -> Resolution {
        let decision = match self {
            Self::Skip => Decision::Skip,
            Self::Overwrite => Decision::Overwrite,
            Self::Rename => {
                let renamed = auto_rename_path(&conflict.destination, taken);
                match renamed.file_name().and_then(|n| n.to_str()) {
                    Some(name) => Decision::Rename(name.to_string()),
                    None => Decision::Skip,
                }
            }
            Self::Merge => match conflict.kind {
                ConflictKind::FileExists => Decision::Skip,
                ConflictKind::DirectoryExists | ConflictKind::TypeMismatch => {
                    Decision::MergeDirectories
                }
            },
            Self::Ask(_) => return Resolution::Ask,
        };
        Resolution::Decided(decision)
    }

    /// The non-interactive strategy that repeats a decision for later conflicts.
    fn sticky_for(decision: &Decision) -> Self {
        match decision {
            Decision::Overwrite => Self::Overwrite,
            Decision::Skip => Self::Skip,
            Decision::Rename(_) => Self::Rename,
            Decision::MergeDirectories => Self::Merge,
        }
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => write!(f, "Skip"),
            Self::Overwrite => write!(f, "Overwrite"),
            Self::Rename => write!(f, "Rename"),
            Self::Merge => write!(f, "Merge"),
            Self::Ask(_) => write!(f, "Ask(..)"),
        }
    }
}

/// Result of putting a conflict to the decision interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AskOutcome {
    Decided(Decision),
    Abort,
}

/// Resolver state for one batch.
///
/// Nested conflicts (inside merged directories) go through the same
/// instance, so a "for all" answer applies to them as well.
pub(crate) struct BatchResolver {
    resolver: ConflictResolver,
    sticky: Mutex<Option<ConflictResolver>>,
}

impl BatchResolver {
    pub(crate) fn new(resolver: ConflictResolver) -> Self {
        Self {
            resolver,
            sticky: Mutex::new(None),
        }
    }

    fn sticky(&self) -> Option<ConflictResolver> {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve without calling the decision interface.
    pub(crate) fn resolve(&self, conflict: &Conflict, taken: &dyn Fn(&Path) -> bool) -> Resolution {
        match self.sticky() {
            Some(sticky) => sticky.resolve(conflict, taken),
            None => self.resolver.resolve(conflict, taken),
        }
    }

    /// Put a conflict to the caller. Blocks until the decider answers.
    pub(crate) fn ask(&self, conflict: &Conflict, taken: &dyn Fn(&Path) -> bool) -> AskOutcome {
        if let Resolution::Decided(decision) = self.resolve(conflict, taken) {
            return AskOutcome::Decided(decision);
        }

        let ConflictResolver::Ask(decider) = &self.resolver else {
            return AskOutcome::Decided(Decision::Skip);
        };

        match decider.request_decision(conflict) {
            ConflictAnswer::Once(decision) => AskOutcome::Decided(decision),
            ConflictAnswer::ForAll(decision) => {
                tracing::debug!(?decision, "Applying conflict decision to the rest of the batch");
                *self.sticky.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(ConflictResolver::sticky_for(&decision));
                AskOutcome::Decided(decision)
            }
            ConflictAnswer::Abort => AskOutcome::Abort,
        }
    }
}

/// Generate an auto-renamed path to avoid conflicts.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc., skipping
/// every candidate for which `taken` returns true.
pub fn auto_rename_path(path: &Path, taken: &dyn Fn(&Path) -> bool) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path.extension().and_then(|e| e.to_str());

    for i in 1..10_000 {
        let new_name = match extension {
            Some(ext) => format!("{} ({}).{}", stem, i, ext),
            None => format!("{} ({})", stem, i),
        };

        let new_path = parent.join(&new_name);
        if !taken(&new_path) {
            return new_path;
        }
    }

    // Fallback: use timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let new_name = match extension {
        Some(ext) => format!("{}_{}.{}", stem, timestamp, ext),
        None => format!("{}_{}", stem, timestamp),
    };

    parent.join(&new_name)
}
