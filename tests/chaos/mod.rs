//! Chaos testing for ncbackup
//!
//! Runs backups against hostile data directories: unreadable entries, broken
//! and looping links, skewed clocks, a backup partition that fills up, runs
//! that get cancelled or collide with another run, and leftovers from a run
//! that was killed mid-copy.

use crate::integration::{bump_mtime, tree_snapshot};
use ::ncbackup::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};

/// Chaos test fixture: a data directory, a backup directory and a seeded engine
pub struct BackupChaosTest {
    pub source_dir: TempDir,
    pub backup_dir: TempDir,
    pub chaos_engine: ChaosEngine,
}

impl BackupChaosTest {
    pub fn new(seed: u64) -> Self {
        Self {
            source_dir: TempDir::new().unwrap(),
            backup_dir: TempDir::new().unwrap(),
            chaos_engine: ChaosEngine::new(seed),
        }
    }

    pub fn source(&self) -> &Path {
        self.source_dir.path()
    }

    pub fn backup(&self) -> &Path {
        self.backup_dir.path()
    }

    pub fn config(&self) -> RunConfig {
        RunConfig::new(self.source(), self.backup()).with_delete_orphans(true)
    }

    pub fn run(&self, config: &RunConfig) -> RunReport {
        BackupExecutor::new().run(config).unwrap()
    }

    /// Fill the data directory with `count` files of `size` bytes
    pub fn populate(&mut self, count: usize, size: usize) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(count);
        for i in 0..count {
            let relative = PathBuf::from(format!("file_{:02}.bin", i));
            let content = self.chaos_engine.bytes(size);
            fs::write(self.source_dir.path().join(&relative), content).unwrap();
            files.push(relative);
        }
        files
    }

    /// Apply `rounds` random mutation rounds, backing up after each one
    ///
    /// After every round the backup must mirror the data directory.
    pub fn run_chaos_rounds(&mut self, rounds: usize, mutations: usize) -> ChaosReport {
        let mut report = ChaosReport::default();
        let config = self.config().with_parallel_workers(4);

        for round in 0..rounds {
            let root = self.source_dir.path().to_path_buf();
            for _ in 0..mutations {
                let mutation = self.chaos_engine.mutate(&root);
                report.mutations += 1;
                if matches!(mutation, Mutation::Replaced(_)) {
                    report.kind_replacements += 1;
                }
            }

            let run = self.run(&config);
            if run.has_errors() {
                warn!("Round {} had errors: {:?}", round, run.errors);
                report.runs_with_errors += 1;
            }
            if tree_snapshot(self.source()) == tree_snapshot(self.backup()) {
                report.rounds_mirrored += 1;
            }
            report.entries_copied += run.created + run.updated;
            report.orphans_removed += run.deleted;
            info!("Chaos round {} done: {} changes", round, run.total_changes());
        }

        report
    }
}

/// One random change applied by the [`ChaosEngine`]
#[derive(Debug, Clone)]
pub enum Mutation {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    /// A file became a directory or the other way round
    Replaced(PathBuf),
    Nothing,
}

/// Seeded source of random changes
pub struct ChaosEngine {
    rng: StdRng,
    mtime_offset: u64,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            mtime_offset: 0,
        }
    }

    pub fn bytes(&mut self, size: usize) -> Vec<u8> {
        (0..size).map(|_| self.rng.random()).collect()
    }

    /// Apply one random change under `root`
    pub fn mutate(&mut self, root: &Path) -> Mutation {
        let entries: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.path().to_path_buf())
            .collect();

        let choice = if entries.is_empty() { 0 } else { self.rng.random_range(0..4) };
        match choice {
            0 => {
                let parent = entries
                    .iter()
                    .filter(|p| p.is_dir())
                    .nth(self.rng.random_range(0..=entries.len()))
                    .cloned()
                    .unwrap_or_else(|| root.to_path_buf());
                let path = if self.rng.random_bool(0.3) {
                    let dir = parent.join(format!("d{}", self.rng.random_range(0..1000)));
                    if fs::create_dir_all(&dir).is_err() {
                        return Mutation::Nothing;
                    }
                    dir.join("inner.txt")
                } else {
                    parent.join(format!("f{}.txt", self.rng.random_range(0..1000)))
                };
                if path.exists() {
                    return Mutation::Nothing;
                }
                let size = self.rng.random_range(0..2048);
                let content = self.bytes(size);
                fs::write(&path, content).unwrap();
                self.mtime_offset += 60;
                bump_mtime(&path, self.mtime_offset);
                Mutation::Created(path)
            }
            1 => {
                let files: Vec<&PathBuf> = entries.iter().filter(|p| p.is_file()).collect();
                if files.is_empty() {
                    return Mutation::Nothing;
                }
                let path = files[self.rng.random_range(0..files.len())].clone();
                let size = self.rng.random_range(0..2048);
                let content = self.bytes(size);
                fs::write(&path, content).unwrap();
                self.mtime_offset += 60;
                bump_mtime(&path, self.mtime_offset);
                Mutation::Modified(path)
            }
            2 => {
                let path = entries[self.rng.random_range(0..entries.len())].clone();
                if path.is_dir() {
                    fs::remove_dir_all(&path).unwrap();
                } else {
                    fs::remove_file(&path).unwrap();
                }
                Mutation::Deleted(path)
            }
            _ => {
                let path = entries[self.rng.random_range(0..entries.len())].clone();
                if path.is_dir() {
                    fs::remove_dir_all(&path).unwrap();
                    fs::write(&path, b"was a directory").unwrap();
                } else {
                    fs::remove_file(&path).unwrap();
                    fs::create_dir(&path).unwrap();
                    fs::write(path.join("was_a_file.txt"), b"nested").unwrap();
                }
                Mutation::Replaced(path)
            }
        }
    }
}

/// Totals over a series of chaos rounds
#[derive(Debug, Default)]
pub struct ChaosReport {
    pub mutations: usize,
    pub kind_replacements: usize,
    pub rounds_mirrored: usize,
    pub runs_with_errors: usize,
    pub entries_copied: usize,
    pub orphans_removed: usize,
}

/// Free space reported as a fixed number of bytes, whatever is written
#[derive(Debug)]
struct FixedProbe(u64);

impl SpaceProbe for FixedProbe {
    fn available_bytes(&self) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_random_chaos_rounds_keep_mirror() {
        let mut chaos_test = BackupChaosTest::new(7);
        chaos_test.populate(20, 512);

        let result = chaos_test.run_chaos_rounds(8, 12);
        info!("Chaos report: {:?}", result);

        assert_eq!(result.runs_with_errors, 0);
        assert_eq!(result.rounds_mirrored, 8, "backup diverged from the data directory");
        assert!(result.entries_copied > 0);
        assert!(logs_contain("Chaos round 7 done"));
    }

    #[test]
    fn test_unreadable_entries_are_reported_and_protected() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut chaos_test = BackupChaosTest::new(1);
            chaos_test.populate(3, 64);
            fs::create_dir(chaos_test.source().join("private")).unwrap();
            fs::write(chaos_test.source().join("private/secret.txt"), b"secret").unwrap();

            // The first run sees everything
            chaos_test.run(&chaos_test.config());

            let private = chaos_test.source().join("private");
            fs::set_permissions(&private, fs::Permissions::from_mode(0o000)).unwrap();
            if fs::read_dir(&private).is_ok() {
                // Running with privileges that ignore permission bits
                fs::set_permissions(&private, fs::Permissions::from_mode(0o755)).unwrap();
                return;
            }

            let report = chaos_test.run(&chaos_test.config());
            fs::set_permissions(&private, fs::Permissions::from_mode(0o755)).unwrap();

            assert_eq!(
                report.error_for(Path::new("private")).map(|e| e.kind),
                Some(EntryErrorKind::PermissionDenied)
            );
            // Unreadable source subtree keeps its backup
            assert!(chaos_test.backup().join("private/secret.txt").exists());
            assert_eq!(report.deleted, 0);
            // Three files plus the directory entry itself
            assert_eq!(report.skipped, 4);
        }
    }

    #[test]
    fn test_unreadable_file_fails_without_partial_copy() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let chaos_test = BackupChaosTest::new(2);
            let path = chaos_test.source().join("unreadable.txt");
            fs::write(&path, b"cannot read me").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
            if fs::read(&path).is_ok() {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
                return;
            }

            let report = chaos_test.run(&chaos_test.config());
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

            assert_eq!(report.errors_of(EntryErrorKind::PermissionDenied).count(), 1);
            assert_eq!(report.created, 0);
            assert_eq!(fs::read_dir(chaos_test.backup()).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_broken_link_keeps_previous_copy() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;

            let chaos_test = BackupChaosTest::new(3);
            fs::write(chaos_test.source().join("target.txt"), b"target").unwrap();
            symlink("target.txt", chaos_test.source().join("link.txt")).unwrap();
            chaos_test.run(&chaos_test.config());
            assert_eq!(fs::read(chaos_test.backup().join("link.txt")).unwrap(), b"target");

            // Target disappears, the link dangles
            fs::remove_file(chaos_test.source().join("target.txt")).unwrap();
            let report = chaos_test.run(&chaos_test.config());

            assert_eq!(
                report.error_for(Path::new("link.txt")).map(|e| e.kind),
                Some(EntryErrorKind::BrokenLink)
            );
            assert_eq!(report.deleted, 1);
            assert!(!chaos_test.backup().join("target.txt").exists());
            assert_eq!(fs::read(chaos_test.backup().join("link.txt")).unwrap(), b"target");
        }
    }

    #[test]
    fn test_symlink_loop_is_reported() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;

            let chaos_test = BackupChaosTest::new(4);
            fs::create_dir(chaos_test.source().join("dir")).unwrap();
            fs::write(chaos_test.source().join("dir/a.txt"), b"a").unwrap();
            symlink("..", chaos_test.source().join("dir/loop")).unwrap();

            let report = chaos_test.run(&chaos_test.config());

            assert_eq!(
                report.error_for(Path::new("dir/loop")).map(|e| e.kind),
                Some(EntryErrorKind::Io)
            );
            assert_eq!(fs::read(chaos_test.backup().join("dir/a.txt")).unwrap(), b"a");
            assert!(!chaos_test.backup().join("dir/loop").exists());
        }
    }

    #[test]
    fn test_clock_skewed_timestamps() {
        let chaos_test = BackupChaosTest::new(5);
        let future = chaos_test.source().join("future.txt");
        let past = chaos_test.source().join("past.txt");
        fs::write(&future, b"from the future").unwrap();
        fs::write(&past, b"from the past").unwrap();
        // 2100-01-01 and the epoch
        filetime::set_file_mtime(&future, FileTime::from_unix_time(4_102_444_800, 0)).unwrap();
        filetime::set_file_mtime(&past, FileTime::from_unix_time(0, 0)).unwrap();

        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.files_created(), 2);

        let backed_up = fs::metadata(chaos_test.backup().join("future.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&backed_up).unix_seconds(), 4_102_444_800);

        // Preserved times make the next run a no-op
        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.total_changes(), 0);

        // A source older than its copy is left alone when the size matches
        filetime::set_file_mtime(&future, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.updated, 0);

        // Unless the size changed
        fs::write(&future, b"from the future, now longer").unwrap();
        filetime::set_file_mtime(&future, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.updated, 1);
    }

    #[test]
    fn test_quota_exhausted_mid_run() {
        let mut chaos_test = BackupChaosTest::new(6);
        chaos_test.populate(10, 300);

        let config = chaos_test
            .config()
            .with_space_limit(Some(1000))
            .with_parallel_workers(4);
        let report = chaos_test.run(&config);

        // Reservations follow walk order, so the first three fit
        assert_eq!(report.files_created(), 3);
        assert_eq!(report.errors_of(EntryErrorKind::InsufficientSpace).count(), 7);
        for i in 0..3 {
            assert!(chaos_test.backup().join(format!("file_{:02}.bin", i)).exists());
        }
        for i in 3..10 {
            assert!(!chaos_test.backup().join(format!("file_{:02}.bin", i)).exists());
        }

        // With room again, the next run completes the mirror
        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.files_created(), 7);
        assert_eq!(report.skipped, 3);
        assert_eq!(tree_snapshot(chaos_test.source()), tree_snapshot(chaos_test.backup()));
    }

    #[test]
    fn test_partition_reporting_no_space() {
        let mut chaos_test = BackupChaosTest::new(8);
        chaos_test.populate(4, 100);
        fs::create_dir(chaos_test.source().join("empty")).unwrap();

        let report = BackupExecutor::new()
            .with_space_probe(Arc::new(FixedProbe(0)))
            .run(&chaos_test.config())
            .unwrap();

        // Directories take no reserved space
        assert_eq!(report.directories_created, 1);
        assert_eq!(report.files_created(), 0);
        assert_eq!(report.errors_of(EntryErrorKind::InsufficientSpace).count(), 4);

        // Empty files fit even on a full partition
        for i in 0..4 {
            fs::remove_file(chaos_test.source().join(format!("file_{:02}.bin", i))).unwrap();
        }
        fs::write(chaos_test.source().join("zero.bin"), b"").unwrap();
        let report = BackupExecutor::new()
            .with_space_probe(Arc::new(FixedProbe(0)))
            .run(&chaos_test.config())
            .unwrap();
        assert_eq!(report.files_created(), 1);
    }

    #[test]
    fn test_cancel_from_progress_callback() {
        let mut chaos_test = BackupChaosTest::new(9);
        chaos_test.populate(10, 32);
        fs::write(chaos_test.backup().join("orphan.txt"), b"orphan").unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let report = BackupExecutor::new()
            .with_cancel_flag(Arc::clone(&cancel))
            .with_progress(Arc::new(move |info: ProgressInfo| {
                if info.processed >= 3 {
                    flag.store(true, Ordering::SeqCst);
                }
            }))
            .run(&chaos_test.config().with_parallel_workers(1))
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.files_created(), 3);
        // No orphan cleanup after an interrupted walk
        assert!(chaos_test.backup().join("orphan.txt").exists());

        // A later complete run picks up where it stopped
        let report = chaos_test.run(&chaos_test.config());
        assert!(!report.interrupted);
        assert_eq!(report.files_created(), 7);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn test_stale_staging_files_are_swept() {
        let chaos_test = BackupChaosTest::new(10);
        fs::create_dir(chaos_test.source().join("docs")).unwrap();
        fs::write(chaos_test.source().join("docs/report.odt"), b"report").unwrap();
        fs::create_dir(chaos_test.backup().join("docs")).unwrap();
        let staging = chaos_test.backup().join("docs/.ncbackup-Xy12ab.tmp");
        fs::write(&staging, b"half a cop").unwrap();

        // Dry runs leave it in place
        chaos_test.run(&chaos_test.config().with_dry_run(true));
        assert!(staging.exists());

        let report = chaos_test.run(&chaos_test.config());
        assert!(!staging.exists());
        // Sweeping is housekeeping, not an orphan deletion
        assert_eq!(report.deleted, 0);
        assert_eq!(fs::read(chaos_test.backup().join("docs/report.odt")).unwrap(), b"report");
    }

    #[test]
    fn test_concurrent_run_is_refused() {
        let chaos_test = BackupChaosTest::new(11);
        fs::write(chaos_test.source().join("a.txt"), b"a").unwrap();

        let held = lock::BackupLock::acquire(chaos_test.backup()).unwrap();
        let err = BackupExecutor::new().run(&chaos_test.config()).unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning(_)));
        assert!(err.is_config_error());
        assert!(!chaos_test.backup().join("a.txt").exists());

        // Lock files are never treated as orphans or copied
        let report = chaos_test.run(&chaos_test.config().with_lock(false));
        assert_eq!(report.deleted, 0);
        assert!(held.path().exists());

        drop(held);
        let report = chaos_test.run(&chaos_test.config());
        assert_eq!(report.skipped, 1);
        assert!(!chaos_test.backup().join(lock::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_unidentifiable_partition_stops_before_writing() {
        let chaos_test = BackupChaosTest::new(12);
        fs::write(chaos_test.source().join("a.txt"), b"a").unwrap();

        let config = chaos_test.config().with_partition("/dev/ncbackup-no-such-device");
        let err = BackupExecutor::new().run(&config).unwrap_err();

        assert!(matches!(err, BackupError::PartitionUnidentifiable(_)));
        assert!(err.user_message().contains("ncbackup-no-such-device"));
        assert_eq!(fs::read_dir(chaos_test.backup()).unwrap().count(), 0);
    }
}
