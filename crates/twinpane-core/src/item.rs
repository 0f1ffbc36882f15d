//! Filesystem entry snapshots.

use std::fs::{self, Metadata};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::path::normalize_path;

/// Type of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file (or anything that is neither a directory nor a link).
    File,
    /// Directory.
    Directory,
    /// Symbolic link. Never traversed.
    Symlink,
}

/// Immutable snapshot of one filesystem entry.
///
/// Identity is the normalized absolute path: two snapshots of the same path
/// compare equal even if the entry changed between them. To observe an entry
/// again, take a fresh snapshot with [`FileItem::refresh`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    name: CompactString,
    path: PathBuf,
    kind: EntryKind,
    size: Option<u64>,
    modified: SystemTime,
    hidden: bool,
    permissions: u32,
}

impl FileItem {
    /// Take a snapshot of the entry at `path`.
    ///
    /// Symlinks are described as links, not as their targets.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = normalize_path(path.as_ref());
        let metadata = fs::symlink_metadata(&path)?;
        Ok(Self::from_metadata(path, &metadata))
    }

    /// Build a snapshot from metadata that was already read.
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let name: CompactString = path
            .file_name()
            .map(|n| n.to_string_lossy().as_ref().into())
            .unwrap_or_else(|| path.to_string_lossy().as_ref().into());

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        let size = match kind {
            EntryKind::Directory => None,
            _ => Some(metadata.len()),
        };

        let hidden = name.starts_with('.') || has_hidden_attribute(metadata);

        Self {
            name,
            path,
            kind,
            size,
            modified: metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
            hidden,
            permissions: mode_bits(metadata),
        }
    }

    /// Take a fresh snapshot of the same path.
    pub fn refresh(&self) -> io::Result<Self> {
        Self::from_path(&self.path)
    }

    /// Entry name (last path component).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized absolute path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry kind.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Check if this entry is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Size in bytes; `None` for directories.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Last modification time.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Whether the entry is hidden.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Unix permission bits (0 on other platforms).
    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    /// File extension without the dot, empty for directories.
    pub fn extension(&self) -> &str {
        if self.is_dir() {
            return "";
        }
        Path::new(self.name.as_str())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
    }

    /// Human-readable size, empty for directories.
    pub fn format_size(&self) -> String {
        match self.size {
            Some(bytes) if !self.is_dir() => humansize::format_size(bytes, humansize::BINARY),
            _ => String::new(),
        }
    }

    /// Modification time in local time using a strftime-style format.
    pub fn format_modified(&self, format: &str) -> String {
        let time: DateTime<Local> = self.modified.into();
        time.format(format).to_string()
    }

    /// Owner read bit.
    pub fn can_read(&self) -> bool {
        self.permissions & 0o400 != 0
    }

    /// Owner write bit.
    pub fn can_write(&self) -> bool {
        self.permissions & 0o200 != 0
    }

    /// Owner execute bit.
    pub fn can_execute(&self) -> bool {
        self.permissions & 0o100 != 0
    }
}

impl PartialEq for FileItem {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for FileItem {}

impl Hash for FileItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl std::fmt::Display for FileItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.kind {
            EntryKind::File => "[FILE]",
            EntryKind::Directory => "[DIR]",
            EntryKind::Symlink => "[LINK]",
        };
        write!(f, "{} {}", tag, self.name)
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &Metadata) -> u32 {
    0
}

#[cfg(windows)]
fn has_hidden_attribute(metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn has_hidden_attribute(_metadata: &Metadata) -> bool {
    false
}
