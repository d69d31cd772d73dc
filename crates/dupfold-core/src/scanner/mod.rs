pub mod walk;

pub use walk::Walker;

use crate::model::{FileFingerprint, ScanStatsSnapshot, WarningRecord};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Shared scan counters. The walker, aggregator and grouper write only
/// through atomic increments; the scheduler reads snapshots for progress
/// events, so observed values never decrease.
#[derive(Default)]
pub struct ScanCounters {
    pub files_scanned: AtomicU64,
    pub folders_scanned: AtomicU64,
    pub folders_discovered: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub hardlink_aliases: AtomicU64,
    pub workers: AtomicU64,
    pub total_folders: AtomicU64,
    pub folders_aggregated: AtomicU64,
    pub pairs_total: AtomicU64,
    pub pairs_processed: AtomicU64,
    last_path: Mutex<Option<String>>,
}

impl ScanCounters {
    pub fn new() -> Self {
        let counters = Self::default();
        // The root is known before the walk begins.
        counters.folders_discovered.store(1, Ordering::Relaxed);
        counters
    }

    pub fn set_last_path(&self, path: &std::path::Path) {
        *self.last_path.lock().unwrap() = Some(path.to_string_lossy().into_owned());
    }

    pub fn last_path(&self) -> Option<String> {
        self.last_path.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            folders_scanned: self.folders_scanned.load(Ordering::Relaxed),
            folders_discovered: self.folders_discovered.load(Ordering::Relaxed),
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            hardlink_aliases: self.hardlink_aliases.load(Ordering::Relaxed),
            workers: self.workers.load(Ordering::Relaxed),
        }
    }
}

/// Direct contents of one walked folder: its own files and the names of the
/// subdirectories that were enqueued. Roll-up happens in the aggregator.
#[derive(Debug)]
pub struct DirectScan {
    pub relative_path: String,
    pub path: PathBuf,
    pub files: Vec<FileFingerprint>,
    pub subdirs: Vec<String>,
    pub unstable: bool,
}

/// Everything the walk produced; emissions for a folder are complete before
/// it appears here.
#[derive(Debug)]
pub struct WalkOutcome {
    pub folders: Vec<DirectScan>,
    pub warnings: Vec<WarningRecord>,
}
