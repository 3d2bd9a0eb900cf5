//! Exclusive run lock on the backup root
//!
//! Two runs mirroring into the same backup root would race on every file. The
//! lock is an advisory `flock`-style lock (via `fs2`) on [`LOCK_FILE_NAME`] in
//! the backup root, held for the lifetime of a [`BackupLock`].

use crate::error::{BackupError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file inside the backup root
pub const LOCK_FILE_NAME: &str = ".ncbackup.lock";

/// Held run lock, released and removed on drop
#[derive(Debug)]
pub struct BackupLock {
    file: File,
    path: PathBuf,
}

impl BackupLock {
    /// Take the lock on `backup_root` without blocking
    ///
    /// # Errors
    ///
    /// - [`BackupError::AlreadyRunning`] if another run holds the lock
    /// - [`BackupError::BackupRootNotWritable`] if the lock file cannot be created
    pub fn acquire(backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| BackupError::BackupRootNotWritable {
                path: backup_root.to_path_buf(),
                source,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            return Err(if is_contended(&e) {
                BackupError::AlreadyRunning(path)
            } else {
                BackupError::Io(e)
            });
        }

        // Holder's pid, for whoever finds a stuck lock
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired run lock {:?}", path);
        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release run lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}

/// Whether a name is the lock file, which never takes part in a backup
pub fn is_lock_file(name: &std::ffi::OsStr) -> bool {
    name == LOCK_FILE_NAME
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
