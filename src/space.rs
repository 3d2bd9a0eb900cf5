//! Free space accounting on the backup partition
//!
//! A [`SpaceProbe`] reports how many bytes may still be written. The executor
//! wraps it in a [`SpaceBudget`], which the walk thread uses to reserve the size
//! of every file it is about to copy before the copy is queued. Reservations are
//! settled by re-probing after queued copies have finished: when a reservation
//! does not fit, and periodically while copies keep completing.
//!
//! A reservation that cannot be satisfied even after a fresh probe fails only
//! its own file. Once a fresh probe finds nothing left at all, the budget
//! latches as exhausted and every later copy is refused. The latch is shared
//! with the copy workers, which set it when a write fails with "storage full".

use crate::utils::tree_size;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of the number of bytes still writable to the backup destination
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Bytes currently available
    fn available_bytes(&self) -> io::Result<u64>;

    /// Note bytes of file content written under the backup root
    fn record_written(&self, _bytes: u64) {}

    /// Note bytes of file content removed from the backup root
    fn record_freed(&self, _bytes: u64) {}
}

/// Free space of the filesystem holding a path, as seen by unprivileged users
#[derive(Debug, Clone)]
pub struct PartitionProbe {
    path: PathBuf,
}

impl PartitionProbe {
    /// Probe the filesystem that `path` lives on
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path whose filesystem is probed
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpaceProbe for PartitionProbe {
    fn available_bytes(&self) -> io::Result<u64> {
        fs2::available_space(&self.path)
    }
}

/// Caps another probe with a size limit on the backup tree
///
/// Available space is `limit - size of the tree under root`, or the inner
/// probe's figure when that is smaller. The tree is walked on the first probe
/// only; later probes use that figure adjusted by the recorded writes and
/// removals.
#[derive(Debug)]
pub struct QuotaProbe {
    inner: Arc<dyn SpaceProbe>,
    root: PathBuf,
    limit: u64,
    used: Mutex<Option<u64>>,
}

impl QuotaProbe {
    /// Limit the tree under `root` to `limit` bytes
    pub fn new(inner: Arc<dyn SpaceProbe>, root: impl Into<PathBuf>, limit: u64) -> Self {
        Self {
            inner,
            root: root.into(),
            limit,
            used: Mutex::new(None),
        }
    }
}

impl SpaceProbe for QuotaProbe {
    fn available_bytes(&self) -> io::Result<u64> {
        let used = *self.used.lock().get_or_insert_with(|| {
            let size = tree_size(&self.root);
            debug!("Backup tree under quota holds {} bytes", size);
            size
        });
        Ok(self.limit.saturating_sub(used).min(self.inner.available_bytes()?))
    }

    fn record_written(&self, bytes: u64) {
        // Not measured yet: the first walk will see these bytes
        if let Some(used) = self.used.lock().as_mut() {
            *used = used.saturating_add(bytes);
        }
        self.inner.record_written(bytes);
    }

    fn record_freed(&self, bytes: u64) {
        if let Some(used) = self.used.lock().as_mut() {
            *used = used.saturating_sub(bytes);
        }
        self.inner.record_freed(bytes);
    }
}

/// Reservation ledger over a [`SpaceProbe`]
///
/// Owned by the walk thread; only the exhaustion latch is shared.
#[derive(Debug)]
pub struct SpaceBudget<'a> {
    probe: &'a dyn SpaceProbe,
    available: u64,
    reserved: u64,
    exhausted: Arc<AtomicBool>,
    simulate: bool,
}

impl<'a> SpaceBudget<'a> {
    /// Take the initial probe
    ///
    /// A simulating budget (used for dry runs) never probes again: nothing is
    /// written, so reservations simply accumulate against the initial figure.
    pub fn new(probe: &'a dyn SpaceProbe, simulate: bool) -> io::Result<Self> {
        let available = probe.available_bytes()?;
        debug!("Initial free space: {} bytes", available);
        Ok(Self {
            probe,
            available,
            reserved: 0,
            exhausted: Arc::new(AtomicBool::new(false)),
            simulate,
        })
    }

    /// Reserve room for a copy of `bytes`
    ///
    /// Returns `false` without reserving when the budget is exhausted or the
    /// bytes do not fit in what remains.
    pub fn try_reserve(&mut self, bytes: u64) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match self.reserved.checked_add(bytes) {
            Some(total) if total <= self.available => {
                self.reserved = total;
                true
            }
            _ => false,
        }
    }

    /// Replace the ledger with a fresh probe
    ///
    /// Must only be called while no reserved copy is still in flight, since
    /// completed copies are then part of the probed figure. A failed probe
    /// keeps the previous figures.
    pub fn refresh(&mut self) {
        if self.simulate || self.is_exhausted() {
            return;
        }
        match self.probe.available_bytes() {
            Ok(available) => {
                self.available = available;
                self.reserved = 0;
            }
            Err(e) => warn!("Free space probe failed, keeping previous figure: {}", e),
        }
    }

    /// Latch the budget as exhausted
    pub fn exhaust(&self) {
        if !self.exhausted.swap(true, Ordering::SeqCst) {
            warn!("Backup destination is out of space, remaining copies will be skipped");
        }
    }

    /// Whether the budget has been exhausted
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Shared handle on the exhaustion latch, for copy workers
    pub fn exhaustion_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exhausted)
    }

    /// Bytes not yet reserved
    pub fn remaining(&self) -> u64 {
        self.available.saturating_sub(self.reserved)
    }
}
