//! Utility functions for ncbackup
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - Atomic file copy (temporary file + rename) preserving permissions and times
//! - Recursive removal returning the number of bytes freed
//! - Tree size computation
//!
//! ### Path Manipulation
//! - Converting absolute paths to relative paths
//! - Detecting overlapping roots
//!
//! ### Display
//! - Byte formatting (human-readable sizes)
//!
//! All functions are thread-safe and can be called concurrently from
//! multiple threads without synchronization.

use crate::error::{is_storage_full, BackupError, EntryErrorKind, Result};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;
use walkdir::WalkDir;

/// Prefix of the temporary files copies are staged in
pub const TEMP_PREFIX: &str = ".ncbackup-";

/// Failure of [`copy_file_atomic`], already classified for the report
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct CopyError {
    /// Report classification
    pub kind: EntryErrorKind,
    /// Underlying failure
    #[source]
    pub source: io::Error,
}

impl CopyError {
    /// Failure before any byte reached the destination
    fn before_write(source: io::Error) -> Self {
        Self {
            kind: EntryErrorKind::from_io(&source),
            source,
        }
    }

    /// Failure after the staging file was created
    fn during_write(source: io::Error) -> Self {
        let kind = if is_storage_full(&source) {
            EntryErrorKind::InsufficientSpace
        } else {
            EntryErrorKind::PartialCopyAborted
        };
        Self { kind, source }
    }
}

/// Copy a file atomically, preserving permissions and timestamps
///
/// Content is written to a temporary file in the destination directory, synced,
/// stamped with the source's permissions and access/modification times, and
/// renamed over `dst` only once everything succeeded. If any step fails the
/// temporary file is removed and `dst` is left exactly as it was, so an
/// interrupted copy can never look up to date to a later run.
///
/// Returns the number of bytes copied.
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::copy_file_atomic;
/// use std::path::Path;
///
/// let bytes = copy_file_atomic(Path::new("data/a.txt"), Path::new("backup/a.txt"))?;
/// println!("copied {} bytes", bytes);
/// ```
pub fn copy_file_atomic(src: &Path, dst: &Path) -> std::result::Result<u64, CopyError> {
    let mut reader = File::open(src).map_err(CopyError::before_write)?;
    let metadata = reader.metadata().map_err(CopyError::before_write)?;

    let bytes = write_atomic(&mut reader, &metadata, dst)?;
    trace!("Copied {:?} -> {:?} ({} bytes)", src, dst, bytes);
    Ok(bytes)
}

/// Stage `reader`'s content next to `dst`, stamp it with `metadata`'s
/// permissions and times, and rename it into place
fn write_atomic<R: Read>(
    reader: &mut R,
    metadata: &fs::Metadata,
    dst: &Path,
) -> std::result::Result<u64, CopyError> {
    let parent = dst.parent().ok_or_else(|| {
        CopyError::before_write(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination {:?} has no parent directory", dst),
        ))
    })?;

    let mut staged = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(CopyError::before_write)?;

    let bytes = io::copy(reader, staged.as_file_mut()).map_err(CopyError::during_write)?;
    staged.as_file().sync_all().map_err(CopyError::during_write)?;

    fs::set_permissions(staged.path(), metadata.permissions()).map_err(CopyError::during_write)?;
    filetime::set_file_times(
        staged.path(),
        FileTime::from_last_access_time(metadata),
        FileTime::from_last_modification_time(metadata),
    )
    .map_err(CopyError::during_write)?;

    staged
        .persist(dst)
        .map_err(|e| CopyError::during_write(e.error))?;
    Ok(bytes)
}

/// Remove a file, symlink or directory tree
///
/// Symbolic links are removed without following them. Returns the number of
/// bytes of regular file content removed.
pub fn remove_entry(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        let size = tree_size(path);
        fs::remove_dir_all(path)?;
        trace!("Removed directory tree: {:?}", path);
        Ok(size)
    } else {
        fs::remove_file(path)?;
        trace!("Removed file: {:?}", path);
        Ok(if metadata.is_file() { metadata.len() } else { 0 })
    }
}

/// Total size of the regular files under `root`
///
/// Unreadable entries are skipped; symbolic links are not followed.
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Whether a file name belongs to a staging file left by an interrupted copy
pub fn is_staging_file(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .map(|s| s.starts_with(TEMP_PREFIX) && s.ends_with(".tmp"))
        .unwrap_or(false)
}

/// Make a path relative to a base path
///
/// Attempts a lexical strip first so symbolic links keep their own path,
/// falling back to canonicalization only when the lexical strip fails.
///
/// # Errors
///
/// - [`BackupError::Internal`] if the path is not under the base path
/// - [`BackupError::Io`] if canonicalization fails (fallback case only)
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            BackupError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Whether one of two existing directories contains the other
pub fn paths_overlap(a: &Path, b: &Path) -> io::Result<bool> {
    let a = a.canonicalize()?;
    let b = b.canonicalize()?;
    Ok(a.starts_with(&b) || b.starts_with(&a))
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
