//! Blocking filesystem primitives executed by the workers.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use twinpane_core::{EngineConfig, ErrorKind, OperationError};

/// Why a step did not finish.
#[derive(Debug)]
pub(crate) enum StepError {
    /// The batch was cancelled; any partial output has been removed.
    Cancelled,
    Failed(OperationError),
}

impl From<OperationError> for StepError {
    fn from(error: OperationError) -> Self {
        Self::Failed(error)
    }
}

pub(crate) type StepResult = Result<(), StepError>;

/// Options shared by every copy in a batch.
pub(crate) struct CopyContext<'a> {
    pub config: &'a EngineConfig,
    pub cancel: &'a CancellationToken,
}

const PARTIAL_PREFIX: &str = ".twinpane-";
const PARTIAL_SUFFIX: &str = ".partial";

/// Create a uniquely named hidden file beside `destination`.
///
/// The name has a fixed length whatever the destination name is, and the
/// file is created exclusively, so an existing entry is never reused.
/// Dropping the handle removes the file.
fn create_partial(destination: &Path) -> Result<NamedTempFile, OperationError> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut builder = tempfile::Builder::new();
    builder.prefix(PARTIAL_PREFIX).suffix(PARTIAL_SUFFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    builder
        .tempfile_in(dir)
        .map_err(|e| OperationError::io(destination, "Failed to create destination", &e))
}

/// Copy one regular file in chunks.
///
/// Bytes go to a partial file that is renamed over `destination` only after
/// its size matches `expected_size`. `report` receives the running total.
pub(crate) fn copy_file(
    ctx: &CopyContext<'_>,
    source: &Path,
    destination: &Path,
    expected_size: u64,
    overwrite: bool,
    report: &mut dyn FnMut(u64),
) -> StepResult {
    let mut partial = create_partial(destination)?;
    match write_partial(ctx, source, &mut partial, expected_size, report) {
        Ok(()) => install(ctx, partial, destination, overwrite),
        Err(e) => {
            discard(partial);
            Err(e)
        }
    }
}

fn discard(partial: NamedTempFile) {
    let path = partial.path().to_path_buf();
    if let Err(e) = partial.close() {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

fn write_partial(
    ctx: &CopyContext<'_>,
    source: &Path,
    partial: &mut NamedTempFile,
    expected_size: u64,
    report: &mut dyn FnMut(u64),
) -> StepResult {
    let mut reader =
        File::open(source).map_err(|e| OperationError::io(source, "Failed to open source", &e))?;
    let metadata = reader
        .metadata()
        .map_err(|e| OperationError::io(source, "Failed to read metadata", &e))?;

    let partial_path = partial.path().to_path_buf();
    let writer = partial.as_file_mut();
    let mut buffer = vec![0u8; ctx.config.chunk_size];
    let mut written = 0u64;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(OperationError::io(source, "Failed to read", &e).into()),
        };

        writer
            .write_all(&buffer[..read])
            .map_err(|e| OperationError::io(&partial_path, "Failed to write", &e))?;
        written += read as u64;
        report(written);
    }

    writer
        .flush()
        .map_err(|e| OperationError::io(&partial_path, "Failed to write", &e))?;

    if ctx.config.preserve_timestamps {
        if let Err(e) = metadata.modified().and_then(|mtime| writer.set_modified(mtime)) {
            tracing::debug!(path = %partial_path.display(), error = %e, "Could not preserve modification time");
        }
    }

    if ctx.config.preserve_permissions {
        if let Err(e) = fs::set_permissions(&partial_path, metadata.permissions()) {
            tracing::debug!(path = %partial_path.display(), error = %e, "Could not preserve permissions");
        }
    }

    let actual = fs::metadata(&partial_path)
        .map_err(|e| OperationError::io(&partial_path, "Failed to verify destination", &e))?
        .len();
    if actual != expected_size || written != expected_size {
        return Err(OperationError::integrity(source, expected_size, actual).into());
    }

    Ok(())
}

/// Move a verified partial file into place.
///
/// Without `overwrite` the rename refuses to replace an entry that
/// appeared while copying.
fn install(
    ctx: &CopyContext<'_>,
    partial: NamedTempFile,
    destination: &Path,
    overwrite: bool,
) -> StepResult {
    if ctx.cancel.is_cancelled() {
        discard(partial);
        return Err(StepError::Cancelled);
    }

    if fs::symlink_metadata(destination).is_ok_and(|existing| existing.is_dir()) {
        discard(partial);
        return Err(OperationError::type_mismatch(
            destination,
            "A directory occupies the destination",
        )
        .into());
    }

    let persisted = if overwrite {
        partial.persist(destination)
    } else {
        partial.persist_noclobber(destination)
    };

    match persisted {
        Ok(_) => Ok(()),
        Err(e) => {
            let error = if e.error.kind() == io::ErrorKind::AlreadyExists {
                OperationError::new(
                    ErrorKind::AlreadyExists,
                    destination,
                    "Destination appeared while copying",
                )
            } else {
                OperationError::io(destination, "Failed to finalize copy", &e.error)
            };
            discard(e.file);
            Err(error.into())
        }
    }
}

/// Recreate a symbolic link with the same target.
#[cfg(unix)]
pub(crate) fn copy_symlink(source: &Path, destination: &Path, overwrite: bool) -> StepResult {
    let target = fs::read_link(source)
        .map_err(|e| OperationError::io(source, "Failed to read link", &e))?;

    if let Ok(existing) = fs::symlink_metadata(destination) {
        if existing.is_dir() {
            return Err(OperationError::type_mismatch(
                destination,
                "A directory occupies the destination",
            )
            .into());
        }
        if !overwrite {
            return Err(OperationError::new(
                ErrorKind::AlreadyExists,
                destination,
                "Destination already exists",
            )
            .into());
        }
        fs::remove_file(destination)
            .map_err(|e| OperationError::io(destination, "Failed to replace destination", &e))?;
    }

    std::os::unix::fs::symlink(&target, destination)
        .map_err(|e| OperationError::io(destination, "Failed to create link", &e))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn copy_symlink(source: &Path, _destination: &Path, _overwrite: bool) -> StepResult {
    Err(OperationError::new(
        ErrorKind::Io,
        source,
        "Copying symbolic links is not supported on this platform",
    )
    .into())
}

/// Move a file or link.
///
/// On one volume this is a single rename. Otherwise the entry is copied,
/// verified, and only then removed from the source.
pub(crate) fn move_entry(
    ctx: &CopyContext<'_>,
    source: &Path,
    destination: &Path,
    expected_size: u64,
    overwrite: bool,
    same_volume: bool,
    report: &mut dyn FnMut(u64),
) -> StepResult {
    let is_link = fs::symlink_metadata(source)
        .map_err(|e| OperationError::io(source, "Failed to read metadata", &e))?
        .is_symlink();

    if same_volume {
        if !overwrite && fs::symlink_metadata(destination).is_ok() {
            return Err(OperationError::new(
                ErrorKind::AlreadyExists,
                destination,
                "Destination already exists",
            )
            .into());
        }
        match fs::rename(source, destination) {
            Ok(()) => return verify_size(destination, expected_size, is_link),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                tracing::debug!(source = %source.display(), "Rename crossed devices, copying instead");
            }
            Err(e) => return Err(OperationError::io(source, "Failed to move", &e).into()),
        }
    }

    if is_link {
        copy_symlink(source, destination, overwrite)?;
    } else {
        copy_file(ctx, source, destination, expected_size, overwrite, report)?;
    }

    fs::remove_file(source)
        .map_err(|e| OperationError::io(source, "Copied, but failed to remove source", &e))?;
    Ok(())
}

fn verify_size(destination: &Path, expected_size: u64, is_link: bool) -> StepResult {
    if is_link {
        return Ok(());
    }
    let actual = fs::symlink_metadata(destination)
        .map_err(|e| OperationError::io(destination, "Failed to verify destination", &e))?
        .len();
    if actual != expected_size {
        return Err(OperationError::integrity(destination, expected_size, actual).into());
    }
    Ok(())
}

/// Rename a whole directory tree in one call.
pub(crate) fn move_tree(source: &Path, destination: &Path) -> StepResult {
    if fs::symlink_metadata(destination).is_ok() {
        return Err(OperationError::new(
            ErrorKind::AlreadyExists,
            destination,
            "Destination already exists",
        )
        .into());
    }
    fs::rename(source, destination)
        .map_err(|e| OperationError::io(source, "Failed to move directory", &e))?;
    Ok(())
}

/// Create one destination directory, copying the source's permissions.
pub(crate) fn make_dir(
    config: &EngineConfig,
    source: Option<&Path>,
    destination: &Path,
) -> Result<(), OperationError> {
    fs::create_dir(destination)
        .map_err(|e| OperationError::io(destination, "Failed to create directory", &e))?;

    if let (true, Some(source)) = (config.preserve_permissions, source) {
        if let Err(e) = fs::metadata(source).and_then(|m| fs::set_permissions(destination, m.permissions())) {
            tracing::debug!(path = %destination.display(), error = %e, "Could not preserve permissions");
        }
    }
    Ok(())
}

/// Remove a file or link and confirm it is gone.
pub(crate) fn delete_file(path: &Path) -> StepResult {
    fs::remove_file(path).map_err(|e| OperationError::io(path, "Failed to delete", &e))?;
    verify_absent(path)
}

/// Remove an empty directory and confirm it is gone.
pub(crate) fn delete_dir(path: &Path) -> StepResult {
    fs::remove_dir(path).map_err(|e| OperationError::io(path, "Failed to remove directory", &e))?;
    verify_absent(path)
}

fn verify_absent(path: &Path) -> StepResult {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OperationError::io(path, "Failed to verify removal", &e).into()),
        Ok(_) => Err(OperationError::new(ErrorKind::Io, path, "Entry still present after removal").into()),
    }
}

/// Whether `source` and the directory `destination_dir` are on one volume.
#[cfg(unix)]
pub(crate) fn same_volume(source: &Path, destination_dir: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::symlink_metadata(source), fs::metadata(destination_dir)) {
        (Ok(src), Ok(dst)) => src.dev() == dst.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn same_volume(source: &Path, destination_dir: &Path) -> bool {
    use std::path::Component;

    let prefix = |p: &Path| match p.components().next() {
        Some(Component::Prefix(prefix)) => Some(prefix.as_os_str().to_ascii_uppercase()),
        _ => None,
    };
    prefix(source) == prefix(destination_dir)
}
