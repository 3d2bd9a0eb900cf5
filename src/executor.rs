//! Backup executor
//!
//! Runs one backup: validates the configuration, walks the source tree,
//! applies the [`ChangeDetector`]'s decisions to the backup tree and finally
//! removes orphans. Per-entry failures are recorded in the [`RunReport`] and
//! never abort the run; only configuration problems surface as `Err`.
//!
//! ## Execution model
//!
//! The source tree is walked depth-first in name order on the calling thread.
//! Directories are created right there, before any of their children is
//! visited. File copies are queued and flushed in batches to a rayon pool of
//! `parallel_workers` threads (with one worker they run inline, in walk order).
//! Every queued copy has already reserved its size in the [`SpaceBudget`], so
//! the walk thread is the budget's only writer.
//!
//! ```rust,no_run
//! use ncbackup::{BackupExecutor, RunConfig};
//!
//! # fn main() -> ncbackup::Result<()> {
//! let config = RunConfig::new("/var/www/nextcloud/data", "/mnt/nextcloud_backup")
//!     .with_partition("/dev/sdc1")
//!     .with_delete_orphans(true);
//!
//! let report = BackupExecutor::new().run(&config)?;
//! println!("{} created, {} updated", report.created, report.updated);
//! # Ok(())
//! # }
//! ```

use crate::collections::HashSet;
use crate::config::{ExcludeMatcher, RunConfig};
use crate::detector::{snapshot, snapshot_backup, ChangeDetector};
use crate::error::{BackupError, EntryErrorKind, Result};
use crate::lock::{is_lock_file, BackupLock};
use crate::partition;
use crate::space::{PartitionProbe, QuotaProbe, SpaceBudget, SpaceProbe};
use crate::types::{Decision, DecisionKind, EntryKind, ProgressCallback, ProgressInfo, RunReport};
use crate::utils::{self, copy_file_atomic, is_staging_file, paths_overlap, remove_entry, tree_size};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Copies queued per worker before a batch is flushed
const BATCH_PER_WORKER: usize = 64;

/// Copies completed between two free space probes
const PROBE_INTERVAL: usize = 256;

/// Applies change detection results to the backup tree
#[derive(Default)]
pub struct BackupExecutor {
    space_probe: Option<Arc<dyn SpaceProbe>>,
    progress: Option<ProgressCallback>,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for BackupExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupExecutor")
            .field("space_probe", &self.space_probe)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

impl BackupExecutor {
    /// Create an executor probing the backup partition for free space
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the free space probe
    ///
    /// A configured `space_limit` still caps whatever this probe reports.
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = Some(probe);
        self
    }

    /// Receive one progress event per processed entry
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Stop the run between entries once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Run one backup
    ///
    /// # Errors
    ///
    /// Only configuration-level failures are returned, always before anything
    /// under the backup root is modified. Everything else ends up in
    /// [`RunReport::errors`].
    #[instrument(skip(self, config), fields(source = ?config.source_root, backup = ?config.backup_root, dry_run = config.dry_run))]
    pub fn run(&self, config: &RunConfig) -> Result<RunReport> {
        let matcher = validate(config)?;
        let probe_path = partition::resolve(config.backup_partition.as_deref(), &config.backup_root)?;

        let _lock = if !config.dry_run && config.lock {
            Some(BackupLock::acquire(&config.backup_root)?)
        } else {
            check_writable(config)?;
            None
        };

        let probe = self.build_probe(config, probe_path);
        let budget = SpaceBudget::new(probe.as_ref(), config.dry_run)?;

        let pool = if config.workers() > 1 && !config.dry_run {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.workers())
                    .thread_name(|i| format!("ncbackup-copy-{}", i))
                    .build()
                    .map_err(|e| BackupError::ThreadPool(e.to_string()))?,
            )
        } else {
            None
        };

        info!(
            "Starting {}backup of {:?} into {:?}",
            if config.dry_run { "dry-run " } else { "" },
            config.source_root,
            config.backup_root
        );

        let ctx = RunContext {
            config,
            detector: ChangeDetector::from_config(config),
            matcher,
            report: Mutex::new(RunReport::new(config.dry_run)),
            processed: AtomicUsize::new(0),
            bytes_processed: AtomicU64::new(0),
            exhausted: budget.exhaustion_flag(),
            space: probe.as_ref(),
            progress: self.progress.clone(),
        };

        let (interrupted, source_paths, protected) = {
            let mut pass = ForwardPass {
                ctx: &ctx,
                budget,
                pool: pool.as_ref(),
                pending: Vec::new(),
                copied_since_probe: 0,
                source_paths: HashSet::default(),
                protected: Vec::new(),
                replaced_dirs: Vec::new(),
            };
            let interrupted = pass.run(self.cancel.as_deref());
            (interrupted, pass.source_paths, pass.protected)
        };

        if interrupted {
            warn!("Backup interrupted, orphan cleanup skipped");
        } else if config.delete_orphans {
            remove_orphans(&ctx, &source_paths, &protected);
        }

        let mut report = ctx.report.into_inner();
        report.finish(interrupted);

        info!(
            "Backup finished in {}ms: {} created, {} updated, {} skipped, {} deleted, {} copied, {} errors",
            report.duration_ms,
            report.created,
            report.updated,
            report.skipped,
            report.deleted,
            utils::format_bytes(report.bytes_copied),
            report.errors.len()
        );

        Ok(report)
    }

    fn build_probe(&self, config: &RunConfig, probe_path: PathBuf) -> Arc<dyn SpaceProbe> {
        let base: Arc<dyn SpaceProbe> = match &self.space_probe {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(PartitionProbe::new(probe_path)),
        };
        match config.space_limit {
            Some(limit) => Arc::new(QuotaProbe::new(base, config.backup_root.clone(), limit)),
            None => base,
        }
    }
}

/// Check roots and patterns, returning the compiled exclude matcher
fn validate(config: &RunConfig) -> Result<ExcludeMatcher> {
    match fs::metadata(&config.source_root) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(BackupError::SourceNotDirectory(config.source_root.clone())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::SourceMissing(config.source_root.clone()))
        }
        Err(e) => return Err(e.into()),
    }

    match fs::metadata(&config.backup_root) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(BackupError::BackupRootNotDirectory(config.backup_root.clone())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::BackupRootMissing(config.backup_root.clone()))
        }
        Err(e) => return Err(e.into()),
    }

    if paths_overlap(&config.source_root, &config.backup_root)? {
        return Err(BackupError::OverlappingRoots {
            source_root: config.source_root.clone(),
            backup_root: config.backup_root.clone(),
        });
    }

    config.exclude_matcher()
}

/// Prove the backup root accepts writes, without leaving anything behind
///
/// Dry runs must not write at all and only look at the permission bits.
fn check_writable(config: &RunConfig) -> Result<()> {
    let not_writable = |source| BackupError::BackupRootNotWritable {
        path: config.backup_root.clone(),
        source,
    };

    if config.dry_run {
        let metadata = fs::metadata(&config.backup_root)?;
        if metadata.permissions().readonly() {
            return Err(not_writable(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "backup directory is read-only",
            )));
        }
        return Ok(());
    }

    tempfile::Builder::new()
        .prefix(utils::TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(&config.backup_root)
        .map(drop)
        .map_err(not_writable)
}

/// State shared between the walk thread and the copy workers
struct RunContext<'a> {
    config: &'a RunConfig,
    detector: ChangeDetector,
    matcher: ExcludeMatcher,
    report: Mutex<RunReport>,
    processed: AtomicUsize,
    bytes_processed: AtomicU64,
    exhausted: Arc<AtomicBool>,
    space: &'a dyn SpaceProbe,
    progress: Option<ProgressCallback>,
}

impl RunContext<'_> {
    fn source_path(&self, relative: &Path) -> PathBuf {
        self.config.source_root.join(relative)
    }

    fn backup_path(&self, relative: &Path) -> PathBuf {
        self.config.backup_root.join(relative)
    }

    /// Record a decision that was applied (or planned, under dry-run)
    fn applied(&self, decision: &Decision, bytes: u64, operation: &str) {
        debug!(dry_run = self.config.dry_run, "{} {}", decision.kind, decision.path.display());
        {
            let mut report = self.report.lock();
            report.record(decision, self.config.is_verbose());
            match decision.kind {
                DecisionKind::Delete => report.bytes_deleted += bytes,
                _ => report.bytes_copied += bytes,
            }
        }
        if decision.kind.copies() {
            self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        }
        self.emit(operation, &decision.path);
    }

    fn fail(&self, relative: &Path, kind: EntryErrorKind, message: impl Into<String>, operation: &str) {
        let message = message.into();
        warn!("{} {}: {}", kind, relative.display(), message);
        self.report.lock().record_error(relative, kind, message);
        self.emit(operation, relative);
    }

    fn emit(&self, operation: &str, relative: &Path) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: operation.to_string(),
                current_item: Some(relative.display().to_string()),
                processed,
                bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            });
        }
    }

    fn is_out_of_space(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Copy one file; runs on a worker thread or inline
    fn copy_file(&self, decision: &Decision) {
        if self.is_out_of_space() {
            self.fail(
                &decision.path,
                EntryErrorKind::InsufficientSpace,
                "backup destination ran out of space",
                BACKING_UP,
            );
            return;
        }

        let dst = self.backup_path(&decision.path);
        let mut replaced = 0;
        if decision.replaces_stale {
            match remove_entry(&dst) {
                Ok(bytes) => self.space.record_freed(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.fail(
                        &decision.path,
                        EntryErrorKind::from_io(&e),
                        format!("cannot remove stale backup entry: {}", e),
                        BACKING_UP,
                    );
                    return;
                }
            }
        } else if decision.kind == DecisionKind::Update {
            replaced = fs::symlink_metadata(&dst).map(|m| m.len()).unwrap_or(0);
        }

        match copy_file_atomic(&self.source_path(&decision.path), &dst) {
            Ok(bytes) => {
                self.space.record_freed(replaced);
                self.space.record_written(bytes);
                self.applied(decision, bytes, BACKING_UP);
            }
            Err(e) => {
                if e.kind == EntryErrorKind::InsufficientSpace
                    && !self.exhausted.swap(true, Ordering::SeqCst)
                {
                    warn!("Backup destination is full, remaining copies will be skipped");
                }
                self.fail(&decision.path, e.kind, e.source.to_string(), BACKING_UP);
            }
        }
    }
}

const BACKING_UP: &str = "Backing up";
const REMOVING_ORPHANS: &str = "Removing orphans";

/// Walk of the source tree, owned by the calling thread
struct ForwardPass<'a> {
    ctx: &'a RunContext<'a>,
    budget: SpaceBudget<'a>,
    pool: Option<&'a ThreadPool>,
    pending: Vec<Decision>,
    copied_since_probe: usize,
    /// Every source path seen, excluded ones aside
    source_paths: HashSet<PathBuf>,
    /// Source paths that could not be inspected; their backup side is left alone
    protected: Vec<PathBuf>,
    /// Dry run only: directories that would replace a backup non-directory,
    /// innermost last
    replaced_dirs: Vec<PathBuf>,
}

impl ForwardPass<'_> {
    /// Walk the source tree; returns whether the run was interrupted
    fn run(&mut self, cancel: Option<&AtomicBool>) -> bool {
        let ctx = self.ctx;
        let mut walker = WalkDir::new(&ctx.config.source_root)
            .follow_links(true)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        let mut interrupted = false;
        while let Some(item) = walker.next() {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                interrupted = true;
                break;
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    self.walk_error(&e);
                    continue;
                }
            };

            let relative = match utils::make_relative(entry.path(), &ctx.config.source_root) {
                Ok(relative) => relative,
                Err(e) => {
                    warn!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let is_lock = entry.depth() == 1 && is_lock_file(entry.file_name());
            if is_lock || ctx.matcher.is_excluded(&relative) {
                trace!("Excluded {:?}", relative);
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if !self.visit(&relative, &entry) && entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }

        self.flush();
        interrupted
    }

    /// Process one source entry; `false` means its subtree must not be visited
    fn visit(&mut self, relative: &Path, entry: &walkdir::DirEntry) -> bool {
        let ctx = self.ctx;
        self.source_paths.insert(relative.to_path_buf());

        let source = match entry.metadata().map_err(io::Error::from).and_then(|m| snapshot(relative, &m)) {
            Ok(source) => source,
            Err(e) => {
                self.protected.push(relative.to_path_buf());
                ctx.fail(relative, EntryErrorKind::from_io(&e), e.to_string(), BACKING_UP);
                return false;
            }
        };

        while self.replaced_dirs.last().is_some_and(|dir| !relative.starts_with(dir)) {
            self.replaced_dirs.pop();
        }
        let backup = if !self.replaced_dirs.is_empty() {
            // Below a directory that would replace a backup file or link
            Ok(None)
        } else {
            snapshot_backup(&ctx.config.backup_root, relative)
        };

        let backup = match backup {
            Ok(backup) => backup,
            Err(e) => {
                self.protected.push(relative.to_path_buf());
                ctx.fail(
                    relative,
                    EntryErrorKind::from_io(&e),
                    format!("cannot inspect backup entry: {}", e),
                    BACKING_UP,
                );
                return false;
            }
        };

        let decision = ctx.detector.classify(&source, backup.as_ref());
        match source.kind {
            EntryKind::Directory => self.apply_directory(&decision),
            _ => {
                self.schedule_file(decision);
                true
            }
        }
    }

    fn apply_directory(&mut self, decision: &Decision) -> bool {
        let ctx = self.ctx;
        if decision.kind != DecisionKind::Create || ctx.config.dry_run {
            if decision.replaces_stale && ctx.config.dry_run {
                self.replaced_dirs.push(decision.path.clone());
            }
            ctx.applied(decision, 0, BACKING_UP);
            return true;
        }

        let dst = ctx.backup_path(&decision.path);
        let result = if decision.replaces_stale {
            // Queued copies never target the stale file, so it can go right away
            remove_entry(&dst).and_then(|bytes| {
                ctx.space.record_freed(bytes);
                fs::create_dir(&dst)
            })
        } else {
            fs::create_dir(&dst)
        };

        match result {
            Ok(()) => {
                ctx.applied(decision, 0, BACKING_UP);
                true
            }
            Err(e) => {
                self.protected.push(decision.path.clone());
                ctx.fail(
                    &decision.path,
                    EntryErrorKind::from_io(&e),
                    format!("cannot create directory: {}", e),
                    BACKING_UP,
                );
                false
            }
        }
    }

    fn schedule_file(&mut self, decision: Decision) {
        let ctx = self.ctx;
        if !decision.kind.copies() {
            ctx.applied(&decision, 0, BACKING_UP);
            return;
        }

        if !self.reserve(decision.size) {
            let message = if self.budget.remaining() >= decision.size {
                "backup destination ran out of space".to_string()
            } else {
                format!(
                    "needs {}, only {} available",
                    utils::format_bytes(decision.size),
                    utils::format_bytes(self.budget.remaining())
                )
            };
            ctx.fail(&decision.path, EntryErrorKind::InsufficientSpace, message, BACKING_UP);
            return;
        }

        if ctx.config.dry_run {
            ctx.applied(&decision, decision.size, BACKING_UP);
            return;
        }

        self.pending.push(decision);
        let batch = match self.pool {
            Some(pool) => pool.current_num_threads() * BATCH_PER_WORKER,
            None => 1,
        };
        if self.pending.len() >= batch {
            self.flush();
        }
    }

    /// Reserve room for a copy, settling queued copies once if needed
    ///
    /// A file that does not fit fails on its own; only a destination with no
    /// space left at all latches the budget.
    fn reserve(&mut self, bytes: u64) -> bool {
        if self.budget.try_reserve(bytes) {
            return true;
        }
        if self.budget.is_exhausted() {
            return false;
        }

        self.flush();
        self.budget.refresh();
        self.copied_since_probe = 0;
        if self.budget.try_reserve(bytes) {
            return true;
        }

        if self.budget.remaining() == 0 {
            self.budget.exhaust();
        }
        false
    }

    /// Run all queued copies and wait for them
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let jobs = std::mem::take(&mut self.pending);
        let ctx = self.ctx;
        match self.pool {
            Some(pool) => pool.install(|| jobs.par_iter().for_each(|job| ctx.copy_file(job))),
            None => jobs.iter().for_each(|job| ctx.copy_file(job)),
        }

        self.copied_since_probe += jobs.len();
        if self.copied_since_probe >= PROBE_INTERVAL {
            self.budget.refresh();
            self.copied_since_probe = 0;
        }
    }

    fn walk_error(&mut self, err: &walkdir::Error) {
        let relative = err
            .path()
            .and_then(|p| p.strip_prefix(&self.ctx.config.source_root).ok())
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let (kind, message) = classify_walk_error(err);
        self.protected.push(relative.clone());
        self.ctx.fail(&relative, kind, message, BACKING_UP);
    }
}

fn classify_walk_error(err: &walkdir::Error) -> (EntryErrorKind, String) {
    if let Some(ancestor) = err.loop_ancestor() {
        return (
            EntryErrorKind::Io,
            format!("filesystem loop back to {}", ancestor.display()),
        );
    }

    match (err.path(), err.io_error()) {
        (Some(path), Some(io_err)) => {
            let is_link = fs::symlink_metadata(path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_link && io_err.kind() == io::ErrorKind::NotFound {
                (
                    EntryErrorKind::BrokenLink,
                    format!("link target does not exist: {}", io_err),
                )
            } else {
                (EntryErrorKind::from_io(io_err), io_err.to_string())
            }
        }
        _ => (EntryErrorKind::Io, err.to_string()),
    }
}

/// Second pass: remove backup entries whose source is gone
fn remove_orphans(ctx: &RunContext<'_>, source_paths: &HashSet<PathBuf>, protected: &[PathBuf]) {
    let backup_root = &ctx.config.backup_root;
    let mut candidates = Vec::new();
    let mut walker = WalkDir::new(backup_root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter();

    while let Some(item) = walker.next() {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let relative = e
                    .path()
                    .and_then(|p| p.strip_prefix(backup_root).ok())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                let kind = e.io_error().map(EntryErrorKind::from_io).unwrap_or(EntryErrorKind::Io);
                ctx.fail(&relative, kind, e.to_string(), REMOVING_ORPHANS);
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(backup_root) else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();

        if entry.depth() == 1 && is_lock_file(entry.file_name()) {
            continue;
        }
        if protected.iter().any(|p| relative.starts_with(p)) || ctx.matcher.is_excluded(relative) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        if source_paths.contains(relative) {
            // A source file replaced this directory; only reachable under dry-run
            if is_dir && !ctx.source_path(relative).is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        if is_staging_file(entry.file_name()) {
            sweep_staging_file(ctx, relative);
            continue;
        }

        match snapshot_backup(backup_root, relative) {
            Ok(Some(orphan)) => candidates.push(orphan),
            Ok(None) => {}
            Err(e) => ctx.fail(relative, EntryErrorKind::from_io(&e), e.to_string(), REMOVING_ORPHANS),
        }
        if is_dir {
            walker.skip_current_dir();
        }
    }

    for decision in ctx.detector.orphans(&candidates, source_paths) {
        let path = ctx.backup_path(&decision.path);
        if ctx.config.dry_run {
            ctx.applied(&decision, tree_size(&path), REMOVING_ORPHANS);
            continue;
        }
        match remove_entry(&path) {
            Ok(bytes) => {
                ctx.space.record_freed(bytes);
                ctx.applied(&decision, bytes, REMOVING_ORPHANS);
            }
            Err(e) => ctx.fail(
                &decision.path,
                EntryErrorKind::from_io(&e),
                format!("cannot remove orphan: {}", e),
                REMOVING_ORPHANS,
            ),
        }
    }
}

/// Staging files only outlive a copy when a previous run was killed mid-copy
fn sweep_staging_file(ctx: &RunContext<'_>, relative: &Path) {
    if ctx.config.dry_run {
        debug!("Would remove stale staging file {}", relative.display());
        return;
    }
    match fs::remove_file(ctx.backup_path(relative)) {
        Ok(()) => debug!("Removed stale staging file {}", relative.display()),
        Err(e) => warn!("Cannot remove stale staging file {}: {}", relative.display(), e),
    }
}
