//! Core data types used throughout the ncbackup library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File System State**: `FileSystemEntry`, `EntryKind` - immutable snapshots of one node
//! - **Classification**: `Decision`, `DecisionKind` - what the executor must do with a path
//! - **Results**: `RunReport`, `EntryError`, `ActionRecord` - the outcome of one run
//! - **Progress**: `ProgressInfo`, `ProgressCallback` - per-entry notifications
//!
//! ## Examples
//!
//! ```rust
//! use ncbackup::types::{DecisionKind, RunReport};
//!
//! let report = RunReport::new(false);
//! assert_eq!(report.count(DecisionKind::Create), 0);
//! assert!(!report.has_errors());
//! ```

use crate::error::EntryErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Unresolved symbolic link, or any other node that is neither a file nor
    /// a directory
    ///
    /// Only produced for backup-side entries. Source-side links are resolved
    /// to their target's kind at detection time.
    Symlink,
}

/// Snapshot of one filesystem node under the source or backup root
///
/// Entries are taken at traversal time and never mutated afterwards.
///
/// # Examples
///
/// ```rust
/// # use ncbackup::types::{EntryKind, FileSystemEntry};
/// # use std::path::PathBuf;
/// # use chrono::Utc;
/// let entry = FileSystemEntry {
///     path: PathBuf::from("photos/2024/cat.jpg"),
///     kind: EntryKind::File,
///     modified: Utc::now(),
///     size: 2048,
/// };
/// assert!(entry.is_file());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemEntry {
    /// Path relative to the root it was taken under
    pub path: PathBuf,
    /// Node kind
    pub kind: EntryKind,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

impl FileSystemEntry {
    /// Whether this entry is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Whether this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Classification outcome for a relative path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// Absent on the backup side
    Create,
    /// Present on the backup side but stale
    Update,
    /// Present and up to date
    Skip,
    /// Present only on the backup side (orphan cleanup)
    Delete,
}

impl DecisionKind {
    /// Whether this decision copies data onto the backup partition
    pub fn copies(&self) -> bool {
        matches!(self, DecisionKind::Create | DecisionKind::Update)
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecisionKind::Create => "CREATE",
            DecisionKind::Update => "UPDATE",
            DecisionKind::Skip => "SKIP",
            DecisionKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// What the executor must do with one relative path
///
/// Produced by [`crate::ChangeDetector`] and consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Root-relative path
    pub path: PathBuf,
    /// Action to take
    pub kind: DecisionKind,
    /// Kind of the entry the action is about (the source entry, or the
    /// backup entry for `Delete`)
    pub entry_kind: EntryKind,
    /// Bytes a copy will write (0 unless `kind.copies()` and the entry is a file)
    pub size: u64,
    /// A backup entry of a different kind sits at this path and must be removed first
    pub replaces_stale: bool,
}

/// Per-entry failure recorded in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    /// Root-relative path of the failed entry
    pub path: PathBuf,
    /// Failure classification
    pub kind: EntryErrorKind,
    /// Human readable cause
    pub message: String,
}

/// One decision as it was applied (or planned, under dry-run)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Root-relative path
    pub path: PathBuf,
    /// Applied decision
    pub decision: DecisionKind,
    /// Entry kind
    pub kind: EntryKind,
}

/// Outcome of one backup run
///
/// Counts only reflect entries that were actually processed: an entry that
/// failed is listed in `errors` and not counted as created or updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique identifier of the run
    pub run_id: String,
    /// Whether the run was a dry run
    pub dry_run: bool,
    /// Whether the run stopped early on request
    pub interrupted: bool,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall clock duration in milliseconds
    pub duration_ms: u64,
    /// Entries created (files and directories)
    pub created: usize,
    /// Of `created`, how many were directories
    pub directories_created: usize,
    /// Files updated
    pub updated: usize,
    /// Entries already up to date
    pub skipped: usize,
    /// Orphan entries removed (top-most path of each removed subtree)
    pub deleted: usize,
    /// Bytes written by copies
    pub bytes_copied: u64,
    /// Bytes freed by orphan removal
    pub bytes_deleted: u64,
    /// Per-entry failures, sorted by path once the run finishes
    pub errors: Vec<EntryError>,
    /// Applied decisions, recorded for verbose and dry runs
    pub actions: Vec<ActionRecord>,
}

impl RunReport {
    /// Start an empty report
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            dry_run,
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            created: 0,
            directories_created: 0,
            updated: 0,
            skipped: 0,
            deleted: 0,
            bytes_copied: 0,
            bytes_deleted: 0,
            errors: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Count for one decision kind
    pub fn count(&self, kind: DecisionKind) -> usize {
        match kind {
            DecisionKind::Create => self.created,
            DecisionKind::Update => self.updated,
            DecisionKind::Skip => self.skipped,
            DecisionKind::Delete => self.deleted,
        }
    }

    /// Files created (excluding directories)
    pub fn files_created(&self) -> usize {
        self.created - self.directories_created
    }

    /// Whether any entry failed
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors of one kind
    pub fn errors_of(&self, kind: EntryErrorKind) -> impl Iterator<Item = &EntryError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    /// Error recorded for a path, if any
    pub fn error_for(&self, path: &Path) -> Option<&EntryError> {
        self.errors.iter().find(|e| e.path == path)
    }

    /// Total number of create, update and delete actions
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub(crate) fn record(&mut self, decision: &Decision, keep_action: bool) {
        match decision.kind {
            DecisionKind::Create => {
                self.created += 1;
                if decision.entry_kind == EntryKind::Directory {
                    self.directories_created += 1;
                }
            }
            DecisionKind::Update => self.updated += 1,
            DecisionKind::Skip => self.skipped += 1,
            DecisionKind::Delete => self.deleted += 1,
        }
        if keep_action {
            self.actions.push(ActionRecord {
                path: decision.path.clone(),
                decision: decision.kind,
                kind: decision.entry_kind,
            });
        }
    }

    pub(crate) fn record_error(
        &mut self,
        path: impl Into<PathBuf>,
        kind: EntryErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(EntryError {
            path: path.into(),
            kind,
            message: message.into(),
        });
    }

    pub(crate) fn finish(&mut self, interrupted: bool) {
        let finished = Utc::now();
        self.interrupted = interrupted;
        self.duration_ms = (finished - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(finished);
        self.errors.sort_by(|a, b| a.path.cmp(&b.path));
        self.actions.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Phase being performed ("Backing up", "Removing orphans")
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Entries processed so far
    pub processed: usize,
    /// Bytes copied so far
    pub bytes_processed: u64,
}
