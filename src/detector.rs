//! Change detection between the source tree and the backup tree
//!
//! The [`ChangeDetector`] is a pure classifier: it receives snapshots of a
//! source entry and of the backup entry at the same relative path (if any) and
//! returns exactly one [`Decision`]. It never touches the filesystem, so the
//! rules can be exercised with synthetic entries.
//!
//! ## Rules
//!
//! In priority order:
//!
//! 1. No backup entry: `Create`.
//! 2. Backup entry of another kind (a file replaced a directory or the other way
//!    round): `Create`, flagged `replaces_stale` so the executor removes the old
//!    entry first.
//! 3. File whose source is newer than the backup beyond the timestamp
//!    tolerance, or whose size differs: `Update`.
//! 4. Directory of the right kind: `Skip`, but its children are still visited.
//! 5. Anything else: `Skip`.
//!
//! Orphans (backup paths missing from the source) are computed separately by
//! [`ChangeDetector::orphans`] once the forward pass is complete.
//!
//! ## Timestamp tolerance
//!
//! Filesystems store modification times at different resolutions (1 ns on ext4,
//! 100 ns on NTFS, 1 s on ext3, 2 s on FAT). A copy onto a coarser filesystem
//! truncates the time, which must not look like staleness. The resolution of a
//! timestamp is inferred from its sub-second part and the coarser of the two is
//! used as tolerance, raised to the configured modify window when that is
//! larger. Times closer than the tolerance compare equal.
//!
//! ```rust
//! use ncbackup::{ChangeDetector, DecisionKind};
//! use ncbackup::types::{EntryKind, FileSystemEntry};
//! use chrono::{TimeZone, Utc};
//! use std::path::PathBuf;
//!
//! let source = FileSystemEntry {
//!     path: PathBuf::from("a.txt"),
//!     kind: EntryKind::File,
//!     modified: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
//!     size: 100,
//! };
//! // Same file, copied onto a filesystem with 1 second resolution
//! let backup = FileSystemEntry {
//!     modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
//!     ..source.clone()
//! };
//!
//! let decision = ChangeDetector::new().classify(&source, Some(&backup));
//! assert_eq!(decision.kind, DecisionKind::Skip);
//! ```

use crate::collections::HashSet;
use crate::config::RunConfig;
use crate::types::{Decision, DecisionKind, EntryKind, FileSystemEntry};
use chrono::{DateTime, TimeDelta, Utc};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::trace;

/// Classifies source/backup entry pairs
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    /// Minimum tolerance applied to every timestamp comparison
    modify_window: Duration,
}

impl ChangeDetector {
    /// Create a detector that only tolerates inferred timestamp resolution
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detector using the modify window of a run configuration
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new().with_modify_window(config.modify_window())
    }

    /// Set the minimum timestamp tolerance
    pub fn with_modify_window(mut self, window: Duration) -> Self {
        self.modify_window = window;
        self
    }

    /// Classify one source entry against the backup entry at the same path
    pub fn classify(&self, source: &FileSystemEntry, backup: Option<&FileSystemEntry>) -> Decision {
        let (kind, replaces_stale) = match backup {
            None => (DecisionKind::Create, false),
            Some(existing) if existing.kind != source.kind => (DecisionKind::Create, true),
            Some(existing) => match source.kind {
                EntryKind::File => {
                    if existing.size != source.size
                        || self.is_newer(&source.modified, &existing.modified)
                    {
                        (DecisionKind::Update, false)
                    } else {
                        (DecisionKind::Skip, false)
                    }
                }
                _ => (DecisionKind::Skip, false),
            },
        };

        let size = if kind.copies() && source.kind == EntryKind::File {
            source.size
        } else {
            0
        };

        trace!("{} {:?}", kind, source.path);
        Decision {
            path: source.path.clone(),
            kind,
            entry_kind: source.kind,
            size,
            replaces_stale,
        }
    }

    /// Whether `source` is strictly later than `backup` beyond the tolerance
    pub fn is_newer(&self, source: &DateTime<Utc>, backup: &DateTime<Utc>) -> bool {
        let delta = *source - *backup;
        delta > TimeDelta::zero() && delta >= self.tolerance(source, backup)
    }

    /// Tolerance used when comparing two timestamps
    pub fn tolerance(&self, a: &DateTime<Utc>, b: &DateTime<Utc>) -> TimeDelta {
        let inferred = timestamp_resolution(a).max(timestamp_resolution(b));
        let window = TimeDelta::from_std(self.modify_window).unwrap_or(TimeDelta::MAX);
        inferred.max(window)
    }

    /// Compute `Delete` decisions for backup entries missing from the source
    ///
    /// Only the top-most entry of an orphaned subtree is returned, since its
    /// removal is recursive. Entries are returned in path order.
    pub fn orphans(
        &self,
        backup_entries: &[FileSystemEntry],
        source_paths: &HashSet<PathBuf>,
    ) -> Vec<Decision> {
        let mut sorted: Vec<&FileSystemEntry> = backup_entries.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut decisions = Vec::new();
        let mut orphan_root: Option<&Path> = None;

        for entry in sorted {
            if let Some(root) = orphan_root {
                if entry.path.starts_with(root) {
                    continue;
                }
            }
            if source_paths.contains(&entry.path) {
                continue;
            }
            orphan_root = Some(entry.path.as_path());
            decisions.push(Decision {
                path: entry.path.clone(),
                kind: DecisionKind::Delete,
                entry_kind: entry.kind,
                size: 0,
                replaces_stale: false,
            });
        }

        decisions
    }
}

/// Resolution a timestamp was most likely recorded at
///
/// Inferred from the trailing zeros of the sub-second part: a whole second
/// means 1 s, whole milliseconds 1 ms, and so on down to 1 ns.
pub fn timestamp_resolution(ts: &DateTime<Utc>) -> TimeDelta {
    let nanos = ts.timestamp_subsec_nanos();
    if nanos == 0 {
        TimeDelta::seconds(1)
    } else if nanos % 1_000_000 == 0 {
        TimeDelta::milliseconds(1)
    } else if nanos % 1_000 == 0 {
        TimeDelta::microseconds(1)
    } else if nanos % 100 == 0 {
        TimeDelta::nanoseconds(100)
    } else {
        TimeDelta::nanoseconds(1)
    }
}

/// Build an entry snapshot from metadata
///
/// Fails with [`io::ErrorKind::Unsupported`] for sockets, FIFOs and device
/// nodes, which cannot be backed up by copying their content.
pub fn snapshot(relative: &Path, metadata: &Metadata) -> io::Result<FileSystemEntry> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported file type at {:?}", relative),
        ));
    };

    Ok(FileSystemEntry {
        path: relative.to_path_buf(),
        kind,
        modified: DateTime::<Utc>::from(metadata.modified()?),
        size: if kind == EntryKind::File { metadata.len() } else { 0 },
    })
}

/// Snapshot the backup entry at a relative path, without following links
///
/// Returns `Ok(None)` when nothing exists there, including when a non-directory
/// sits where one of its ancestors should be. Special files on the backup
/// side are reported as [`EntryKind::Symlink`], so they never match a source
/// entry and get replaced.
pub fn snapshot_backup(backup_root: &Path, relative: &Path) -> io::Result<Option<FileSystemEntry>> {
    let full_path = backup_root.join(relative);
    let metadata = match fs::symlink_metadata(&full_path) {
        Ok(metadata) => metadata,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };

    match snapshot(relative, &metadata) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(Some(FileSystemEntry {
            path: relative.to_path_buf(),
            kind: EntryKind::Symlink,
            modified: DateTime::<Utc>::from(metadata.modified()?),
            size: 0,
        })),
        Err(e) => Err(e),
    }
}
