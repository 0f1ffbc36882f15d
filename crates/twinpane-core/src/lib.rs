//! Core types and configuration for twinpane.
//!
//! This crate holds the value types shared by the file operations engine and
//! whatever drives it: filesystem entry snapshots, the per-item error
//! taxonomy, engine configuration and path/name helpers.

mod config;
mod error;
mod item;
mod path;

pub use config::{
    default_concurrency, EngineConfig, EngineConfigBuilder, DEFAULT_CHUNK_SIZE,
    DEFAULT_PROGRESS_BYTES, DEFAULT_PROGRESS_INTERVAL,
};
pub use error::{EngineError, ErrorKind, OperationError};
pub use item::{EntryKind, FileItem};
pub use path::{is_ancestor_of, normalize_path, validate_filename};
