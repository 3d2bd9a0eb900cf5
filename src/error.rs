//! Error types for the ncbackup library
//!
//! Two layers of failure exist in a backup run:
//!
//! - [`BackupError`] is returned by [`crate::BackupExecutor::run`] and means the
//!   run could not start (bad roots, unidentifiable partition, another run holds
//!   the lock). Nothing under the backup root has been touched when it surfaces.
//! - [`EntryErrorKind`] classifies failures of a single entry. These never abort
//!   a run; they are collected into [`crate::RunReport::errors`].

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the ncbackup library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Run-level error type
#[derive(Debug, Error)]
pub enum BackupError {
    /// Source root does not exist
    #[error("Source directory does not exist: {0:?}")]
    SourceMissing(PathBuf),

    /// Source root exists but is not a directory
    #[error("Source path is not a directory: {0:?}")]
    SourceNotDirectory(PathBuf),

    /// Backup root (usually the partition mount point) does not exist
    #[error("Backup directory does not exist: {0:?}")]
    BackupRootMissing(PathBuf),

    /// Backup root exists but is not a directory
    #[error("Backup path is not a directory: {0:?}")]
    BackupRootNotDirectory(PathBuf),

    /// Backup root cannot be written to
    #[error("Backup directory is not writable: {path:?}")]
    BackupRootNotWritable {
        /// Backup root path
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Partition identifier does not name a mount point or mounted device
    #[error("Backup partition '{0}' could not be identified")]
    PartitionUnidentifiable(String),

    /// One root lies inside the other
    #[error("Source {source_root:?} and backup {backup_root:?} overlap")]
    OverlappingRoots {
        /// Source root
        source_root: PathBuf,
        /// Backup root
        backup_root: PathBuf,
    },

    /// Exclude pattern failed to compile
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Another run holds the lock on the backup root
    #[error("Another backup run holds the lock at {0:?}")]
    AlreadyRunning(PathBuf),

    /// I/O errors outside of per-entry processing
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Check if this error is a configuration-level failure
    ///
    /// Configuration errors are raised before any traversal and map to a
    /// non-zero exit status in the CLI.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BackupError::SourceMissing(_)
                | BackupError::SourceNotDirectory(_)
                | BackupError::BackupRootMissing(_)
                | BackupError::BackupRootNotDirectory(_)
                | BackupError::BackupRootNotWritable { .. }
                | BackupError::PartitionUnidentifiable(_)
                | BackupError::OverlappingRoots { .. }
                | BackupError::InvalidPattern(_)
                | BackupError::AlreadyRunning(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::SourceMissing(path) => {
                format!("Data directory {:?} does not exist. Check --source or NCBACKUP_SOURCE.", path)
            }
            BackupError::BackupRootMissing(path) => {
                format!(
                    "Backup directory {:?} does not exist. Is the backup partition mounted?",
                    path
                )
            }
            BackupError::BackupRootNotWritable { path, .. } => {
                format!(
                    "Cannot write to {:?}. Check that the partition is mounted read-write \
                     and that you have sufficient privileges.",
                    path
                )
            }
            BackupError::PartitionUnidentifiable(id) => {
                format!(
                    "Backup partition '{}' is neither a directory nor a mounted device. \
                     Check --partition or NCBACKUP_PARTITION.",
                    id
                )
            }
            BackupError::AlreadyRunning(path) => {
                format!(
                    "Another backup is running (lock held on {:?}). Wait for it to finish and try again.",
                    path
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Classification of a single entry's failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryErrorKind {
    /// Access to the source or backup entry was refused
    PermissionDenied,
    /// Source entry is a symbolic link whose target does not exist
    BrokenLink,
    /// Any other I/O failure on this entry
    #[serde(rename = "ENTRY_IO_ERROR")]
    Io,
    /// The backup partition has no room for this entry
    InsufficientSpace,
    /// A copy failed part way; the partial output was removed
    PartialCopyAborted,
}

impl EntryErrorKind {
    /// Classify an I/O error raised while inspecting or copying an entry
    pub fn from_io(err: &io::Error) -> Self {
        if is_storage_full(err) {
            EntryErrorKind::InsufficientSpace
        } else if err.kind() == io::ErrorKind::PermissionDenied {
            EntryErrorKind::PermissionDenied
        } else {
            EntryErrorKind::Io
        }
    }

    /// Stable name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryErrorKind::PermissionDenied => "PERMISSION_DENIED",
            EntryErrorKind::BrokenLink => "BROKEN_LINK",
            EntryErrorKind::Io => "ENTRY_IO_ERROR",
            EntryErrorKind::InsufficientSpace => "INSUFFICIENT_SPACE",
            EntryErrorKind::PartialCopyAborted => "PARTIAL_COPY_ABORTED",
        }
    }
}

impl std::fmt::Display for EntryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an I/O error means the destination filesystem is full
pub fn is_storage_full(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC on platforms where the kind is not mapped
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(28) {
        return true;
    }
    false
}
