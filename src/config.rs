//! Run configuration
//!
//! A [`RunConfig`] is built once per invocation by the caller and treated as
//! read-only by the engine. There are no process-wide defaults: everything the
//! engine needs is carried in this value, so tests can point a run at any pair
//! of directories.
//!
//! ```rust
//! use ncbackup::RunConfig;
//!
//! let config = RunConfig::new("/var/www/nextcloud/data", "/mnt/nextcloud_backup")
//!     .with_partition("/dev/sdc1")
//!     .with_exclude(vec!["*.part".to_string()])
//!     .with_dry_run(true);
//!
//! assert!(config.is_verbose()); // dry runs always report in detail
//! ```

use crate::error::{BackupError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved configuration for one backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Data directory to back up
    pub source_root: PathBuf,
    /// Directory the backup is mirrored into
    pub backup_root: PathBuf,
    /// Mount point or device of the backup partition, used for free space checks
    pub backup_partition: Option<String>,
    /// Log every decision
    pub verbose: bool,
    /// Detect and report without touching the backup root
    pub dry_run: bool,
    /// Remove backup entries that no longer exist in the source
    pub delete_orphans: bool,
    /// Glob patterns for entries that are neither copied nor deleted
    pub exclude: Vec<String>,
    /// Number of threads copying files
    pub parallel_workers: usize,
    /// Extra tolerance in milliseconds when comparing modification times
    pub modify_window_ms: u64,
    /// Upper bound on the total size of the backup tree
    pub space_limit: Option<u64>,
    /// Take the exclusive run lock on the backup root
    pub lock: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::new(),
            backup_root: PathBuf::new(),
            backup_partition: None,
            verbose: false,
            dry_run: false,
            delete_orphans: false,
            exclude: Vec::new(),
            parallel_workers: num_cpus::get(),
            modify_window_ms: 0,
            space_limit: None,
            lock: true,
        }
    }
}

impl RunConfig {
    /// Create a configuration for the given roots with default options
    pub fn new(source_root: impl Into<PathBuf>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            backup_root: backup_root.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    ///
    /// Missing fields take their default values.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Set the backup partition identifier
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.backup_partition = Some(partition.into());
        self
    }

    /// Set verbose reporting
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enable or disable orphan cleanup
    pub fn with_delete_orphans(mut self, delete: bool) -> Self {
        self.delete_orphans = delete;
        self
    }

    /// Set exclude patterns
    pub fn with_exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    /// Set number of copy workers (minimum 1)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Set the modification time window in milliseconds
    pub fn with_modify_window_ms(mut self, window_ms: u64) -> Self {
        self.modify_window_ms = window_ms;
        self
    }

    /// Cap the total size of the backup tree
    pub fn with_space_limit(mut self, limit: Option<u64>) -> Self {
        self.space_limit = limit;
        self
    }

    /// Enable or disable the run lock
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Dry runs always report in detail
    pub fn is_verbose(&self) -> bool {
        self.verbose || self.dry_run
    }

    /// Modification time window as a duration
    pub fn modify_window(&self) -> Duration {
        Duration::from_millis(self.modify_window_ms)
    }

    /// Worker count, never below one
    pub fn workers(&self) -> usize {
        self.parallel_workers.max(1)
    }

    /// Compile the exclude patterns
    pub fn exclude_matcher(&self) -> Result<ExcludeMatcher> {
        ExcludeMatcher::new(&self.exclude)
    }
}

/// Compiled exclude patterns
///
/// A relative path is excluded when a pattern matches either the whole path or
/// its final component, so `*.part` excludes `a/b/upload.part` while
/// `cache/**` only matches under a top-level `cache` directory.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
    empty: bool,
}

impl ExcludeMatcher {
    /// Compile a list of glob patterns
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| BackupError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| BackupError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            set,
            empty: patterns.is_empty(),
        })
    }

    /// Whether a root-relative path is excluded
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.empty {
            return false;
        }
        if self.set.is_match(relative) {
            return true;
        }
        relative
            .file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}
