//! Engine configuration types.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default copy chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of bytes between two progress events for one item.
pub const DEFAULT_PROGRESS_BYTES: u64 = 256 * 1024;

/// Default minimum time between two progress events for one item.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the file operations engine.
///
/// Passed to the manager at construction; the engine never reads global
/// settings.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Number of items executed concurrently.
    #[builder(default = "default_concurrency()")]
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Size of each streamed read/write during a copy.
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Emit a progress event at least every this many bytes.
    #[builder(default = "DEFAULT_PROGRESS_BYTES")]
    #[serde(default = "default_progress_bytes")]
    pub progress_interval_bytes: u64,

    /// Emit a progress event at least this often during a transfer.
    #[builder(default = "DEFAULT_PROGRESS_INTERVAL")]
    #[serde(default = "default_progress_interval")]
    pub progress_interval: Duration,

    /// Copy modification times onto copied files.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,

    /// Copy permission bits onto copied files.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub preserve_permissions: bool,
}

/// Worker count matching detected I/O parallelism, kept between 2 and 4.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 4)
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_progress_bytes() -> u64 {
    DEFAULT_PROGRESS_BYTES
}

fn default_progress_interval() -> Duration {
    DEFAULT_PROGRESS_INTERVAL
}

fn default_true() -> bool {
    true
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }
        if self.chunk_size == Some(0) {
            return Err("Chunk size must be at least 1 byte".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_bytes: DEFAULT_PROGRESS_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            preserve_timestamps: true,
            preserve_permissions: true,
        }
    }
}

impl From<EngineConfigBuilderError> for EngineError {
    fn from(error: EngineConfigBuilderError) -> Self {
        Self::InvalidConfig {
            message: error.to_string(),
        }
    }
}
