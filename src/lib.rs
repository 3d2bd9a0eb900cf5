//! # ncbackup - Incremental backups of a data directory
//!
//! Mirrors a data directory (typically a Nextcloud `data/` folder) onto a
//! backup directory on a dedicated partition, copying only what changed since
//! the last run.
//!
//! ## Overview
//!
//! A run walks the source tree and, for every entry, asks the
//! [`ChangeDetector`] whether the backup copy is missing, stale or up to date.
//! The [`BackupExecutor`] applies those decisions: it creates directories,
//! copies new and modified files (atomically, preserving modification times and
//! permissions) and optionally removes backup entries whose source is gone.
//!
//! - **Incremental**: up-to-dateness is recomputed from live metadata on every
//!   run, so there is no manifest to corrupt and failed files are simply
//!   retried next time
//! - **Dry runs**: full detection and reporting without touching the backup
//! - **Space aware**: copies are budgeted against the free space of the backup
//!   partition; running out is reported per entry rather than aborting the run
//! - **Parallel**: file copies run on a bounded rayon pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ncbackup::{BackupExecutor, RunConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::new("/var/www/nextcloud/data", "/mnt/nextcloud_backup")
//!     .with_partition("/dev/sdc1")
//!     .with_exclude(vec!["*.part".to_string()])
//!     .with_delete_orphans(true);
//!
//! let report = BackupExecutor::new().run(&config)?;
//! println!(
//!     "{} created, {} updated, {} skipped, {} errors",
//!     report.created,
//!     report.updated,
//!     report.skipped,
//!     report.errors.len()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! [`BackupExecutor::run`] returns `Err` only when the run cannot start: a
//! missing root, an unidentifiable partition, overlapping roots, a bad exclude
//! pattern or another run holding the lock. Failures of individual entries
//! (permissions, broken links, out of space) are collected in
//! [`RunReport::errors`] and the run carries on.
//!
//! ## Module Organization
//!
//! - [`config`]: Run configuration and exclude patterns
//! - [`detector`]: Classification of source/backup entry pairs
//! - [`executor`]: The backup run itself
//! - [`space`]: Free space probes and reservation
//! - [`partition`]: Resolution of the backup partition's mount point
//! - [`lock`]: Exclusive run lock on the backup root
//! - [`types`]: Entries, decisions and reports
//! - [`error`]: Error types and handling

// Public API modules
pub mod config;
pub mod detector;
pub mod error;
pub mod executor;
pub mod lock;
pub mod partition;
pub mod space;
pub mod types;

// Internal modules (not part of public API)
mod collections;
mod utils;

// Re-export main types for convenience
pub use config::{ExcludeMatcher, RunConfig};
pub use detector::ChangeDetector;
pub use error::{BackupError, EntryErrorKind, Result};
pub use executor::BackupExecutor;
pub use space::{PartitionProbe, QuotaProbe, SpaceProbe};
pub use types::*;
