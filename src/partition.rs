//! Backup partition resolution
//!
//! The backup partition may be given as the directory it is mounted on or as
//! its device (`/dev/sdc1`, or just `sdc1`). Either way the result is a
//! directory whose filesystem is probed for free space.

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mount table consulted for device identifiers
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or filesystem source
    pub device: String,
    /// Directory it is mounted on
    pub mount_point: PathBuf,
    /// Filesystem type
    pub fs_type: String,
}

/// Resolve the directory whose free space bounds the backup
///
/// - no identifier: the backup root itself
/// - an existing directory: that directory
/// - a device path or name: its mount point, read from [`MOUNT_TABLE`]
pub fn resolve(identifier: Option<&str>, backup_root: &Path) -> Result<PathBuf> {
    let Some(identifier) = identifier.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(backup_root.to_path_buf());
    };

    let as_path = Path::new(identifier);
    let resolved = if as_path.is_dir() {
        as_path.to_path_buf()
    } else {
        let table = fs::read_to_string(MOUNT_TABLE).unwrap_or_default();
        find_mount_point(&parse_mount_table(&table), identifier)
            .ok_or_else(|| BackupError::PartitionUnidentifiable(identifier.to_string()))?
    };

    debug!("Backup partition {} resolved to {:?}", identifier, resolved);
    if !is_under(backup_root, &resolved) {
        warn!(
            "Backup directory {:?} is not on partition {} (mounted at {:?})",
            backup_root, identifier, resolved
        );
    }
    Ok(resolved)
}

/// Find the mount point of a device, matched on its full path or its name
pub fn find_mount_point(entries: &[MountEntry], device: &str) -> Option<PathBuf> {
    let name = Path::new(device).file_name()?;
    entries
        .iter()
        .find(|entry| {
            entry.device == device || Path::new(&entry.device).file_name() == Some(name)
        })
        .map(|entry| entry.mount_point.clone())
}

/// Parse the `/proc/mounts` format
///
/// Fields are whitespace separated; spaces, tabs, newlines and backslashes
/// inside fields are written as octal escapes (`\040` for a space).
/// Malformed lines are ignored.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape(device),
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type: unescape(fs_type),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

fn is_under(path: &Path, mount_point: &Path) -> bool {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mount_point = mount_point
        .canonicalize()
        .unwrap_or_else(|_| mount_point.to_path_buf());
    path.starts_with(mount_point)
}
