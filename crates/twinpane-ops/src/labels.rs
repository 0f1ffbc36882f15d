//! Display labels for states, errors and operation kinds.
//!
//! Purely cosmetic: nothing in the engine branches on a label.

use std::collections::HashMap;

use twinpane_core::ErrorKind;

use crate::operation::{ItemState, OperationKind};

/// Something the UI wants a localized name for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    State(ItemState),
    Error(ErrorKind),
    Kind(OperationKind),
}

impl Label {
    /// Lookup key, e.g. `state.completed` or `error.disk_full`.
    pub fn key(&self) -> String {
        let (prefix, name): (&str, &'static str) = match self {
            Self::State(state) => ("state", state.into()),
            Self::Error(kind) => ("error", kind.as_str()),
            Self::Kind(kind) => ("operation", kind.into()),
        };
        format!("{prefix}.{name}")
    }
}

/// Maps labels to display strings.
pub trait LabelLookup: Send + Sync {
    fn label(&self, label: Label) -> String;
}

/// Built-in English labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLabels;

impl LabelLookup for DefaultLabels {
    fn label(&self, label: Label) -> String {
        match label {
            Label::State(state) => state.to_string(),
            Label::Error(kind) => kind.to_string(),
            Label::Kind(kind) => kind.to_string(),
        }
    }
}

/// Labels from a flat key/value table, falling back to English for
/// missing keys.
#[derive(Debug, Clone, Default)]
pub struct TableLabels {
    entries: HashMap<String, String>,
}

impl TableLabels {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Parse a JSON object of `"key": "text"` pairs.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LabelLookup for TableLabels {
    fn label(&self, label: Label) -> String {
        match self.entries.get(&label.key()) {
            Some(text) => text.clone(),
            None => {
                tracing::debug!(key = %label.key(), "No label for key, using default");
                DefaultLabels.label(label)
            }
        }
    }
}
