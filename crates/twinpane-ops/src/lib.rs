//! File operations engine for twinpane.
//!
//! This crate runs copy, move, delete and create-directory requests as
//! plans of [`OperationItem`]s: each item has its own lifecycle, failures
//! stay with the item that caused them, and a batch can be cancelled at
//! any point through a [`CancellationToken`](tokio_util::sync::CancellationToken).
//! Progress is pushed to a [`ProgressSink`]; [`ChannelSink`] turns it into
//! a channel of [`OperationEvent`]s.

mod conflict;
mod labels;
mod manager;
mod operation;
mod plan;
mod progress;
mod scheduler;
mod transfer;

pub use conflict::{
    auto_rename_path, Conflict, ConflictAnswer, ConflictDecider, ConflictKind, ConflictResolver,
    Decision, Resolution,
};
pub use labels::{DefaultLabels, Label, LabelLookup, TableLabels};
pub use manager::FileOperationsManager;
pub use operation::{ItemState, OperationItem, OperationKind, TransitionError};
pub use progress::{
    BatchSummary, ChannelSink, OperationEvent, OperationProgress, ProgressSink, SizingProgress,
};
