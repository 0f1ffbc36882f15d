//! Error types for file operations.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use thiserror::Error;

/// `ENOSPC` on Linux and the BSDs.
#[cfg(unix)]
const ENOSPC: i32 = 28;

/// Classification of a per-item failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The source vanished before or during execution.
    NotFound,
    /// Permission denied on the source or destination.
    PermissionDenied,
    /// No space left on the destination volume.
    DiskFull,
    /// A file would replace a directory or vice versa.
    TypeMismatch,
    /// The written destination does not match the recorded source size.
    IntegrityMismatch,
    /// The destination is already occupied.
    AlreadyExists,
    /// A requested name is not a valid file name.
    InvalidName,
    /// The destination is the source itself or lies inside it.
    InvalidDestination,
    /// A directory could not be removed because it still has entries.
    DirectoryNotEmpty,
    /// Any other I/O failure.
    Io,
}

impl ErrorKind {
    /// Classify an I/O error.
    pub fn from_io(error: &io::Error) -> Self {
        #[cfg(unix)]
        if error.raw_os_error() == Some(ENOSPC) {
            return Self::DiskFull;
        }

        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::StorageFull => Self::DiskFull,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty,
            _ => Self::Io,
        }
    }

    /// Stable snake_case identifier, used as a label key.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "Not found"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::DiskFull => write!(f, "Disk full"),
            Self::TypeMismatch => write!(f, "File/directory type mismatch"),
            Self::IntegrityMismatch => write!(f, "Size check failed"),
            Self::AlreadyExists => write!(f, "Already exists"),
            Self::InvalidName => write!(f, "Invalid name"),
            Self::InvalidDestination => write!(f, "Invalid destination"),
            Self::DirectoryNotEmpty => write!(f, "Directory not empty"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

/// An error recorded against a single operation item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{path}: {message}")]
pub struct OperationError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(kind: ErrorKind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an error from an I/O failure with a short context prefix.
    pub fn io(path: impl Into<PathBuf>, context: &str, source: &io::Error) -> Self {
        Self::new(
            ErrorKind::from_io(source),
            path,
            format!("{context}: {source}"),
        )
    }

    /// Source vanished between selection and execution.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::new(ErrorKind::NotFound, path, "Source no longer exists")
    }

    /// File/directory collision refused by the engine.
    pub fn type_mismatch(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, path, message)
    }

    /// Post-copy size check failed.
    pub fn integrity(path: impl Into<PathBuf>, expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorKind::IntegrityMismatch,
            path,
            format!("Expected {expected} bytes, destination has {actual}"),
        )
    }
}

/// Errors that fail a whole request before any item runs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No items were given.
    #[error("No items to operate on")]
    EmptyRequest,

    /// The destination directory does not exist and could not be created.
    #[error("Destination {path} is unavailable: {source}")]
    DestinationUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination exists but is not a directory.
    #[error("Destination is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// A requested name failed validation.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The request was cancelled before it produced a result.
    #[error("Operation cancelled")]
    Cancelled,

    /// A background task could not be joined.
    #[error("Background task failed: {message}")]
    Task { message: String },
}

impl EngineError {
    /// Wrap a task join failure.
    pub fn task(error: impl std::fmt::Display) -> Self {
        Self::Task {
            message: error.to_string(),
        }
    }
}
