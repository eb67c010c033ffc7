//! Root-relative path resolution and the filesystem primitives the engine uses.
//!
//! Every declared location is sanitised before it touches the disk: a single
//! leading separator is stripped, and anything that would climb out of the
//! configured root is rejected.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

use pgfile_core::{SyncError, SyncResult};
use tempfile::NamedTempFile;

/// Join `root` with the declared relative directory and file name.
///
/// # Errors
///
/// Returns `InvalidPath` when the directory escapes the root or the name is
/// empty or contains a separator.
pub fn resolve(root: &Path, path: &str, name: &str) -> SyncResult<PathBuf> {
    let relative = sanitize_directory(path)?;
    validate_name(name)?;
    Ok(root.join(relative).join(name))
}

fn sanitize_directory(path: &str) -> SyncResult<PathBuf> {
    let trimmed = path
        .strip_prefix('/')
        .or_else(|| path.strip_prefix('\\'))
        .unwrap_or(path);

    let mut sanitized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::InvalidPath {
                    field: "path",
                    reason: "absolute_path",
                    value: path.to_string(),
                });
            }
            Component::ParentDir => {
                return Err(SyncError::InvalidPath {
                    field: "path",
                    reason: "parent_segment",
                    value: path.to_string(),
                });
            }
        }
    }
    Ok(sanitized)
}

fn validate_name(name: &str) -> SyncResult<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.contains(['/', '\\', '\0']) {
        "separator"
    } else if name == "." || name == ".." {
        "relative_segment"
    } else {
        return Ok(());
    };
    Err(SyncError::InvalidPath {
        field: "name",
        reason,
        value: name.to_string(),
    })
}

/// Create every missing directory above `file` with `mode`.
///
/// # Errors
///
/// Returns `Io` if a directory cannot be created.
pub fn ensure_directories(file: &Path, mode: u32) -> SyncResult<()> {
    let Some(parent) = file.parent() else {
        return Ok(());
    };
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder
        .create(parent)
        .map_err(|source| SyncError::io("ensure_directories", parent, source))
}

/// Write `bytes` to `path` through a sibling temporary file and rename it into place.
///
/// Readers see either the previous content or the new content, never a
/// partial write.
///
/// # Errors
///
/// Returns `Io` if the temporary file cannot be written or persisted.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> SyncResult<u64> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(parent)
        .map_err(|source| SyncError::io("write_atomic.create_temp", parent, source))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|source| SyncError::io("write_atomic.write", staged.path(), source))?;

    #[cfg(unix)]
    fs::set_permissions(staged.path(), fs::Permissions::from_mode(mode))
        .map_err(|source| SyncError::io("write_atomic.set_permissions", staged.path(), source))?;
    #[cfg(not(unix))]
    let _ = mode;

    staged
        .persist(path)
        .map_err(|err| SyncError::io("write_atomic.persist", path, err.error))?;
    Ok(bytes.len() as u64)
}

/// Remove the file at `path`; a missing file is not an error.
///
/// Returns whether a file was removed.
///
/// # Errors
///
/// Returns `Io` for any failure other than the file being absent.
pub fn delete_file(path: &Path) -> SyncResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SyncError::io("delete_file", path, source)),
    }
}
