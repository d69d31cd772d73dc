use super::{DirectScan, ScanCounters, WalkOutcome};
use crate::cache::{CacheKey, FileHashCache};
use crate::config::ScanRequest;
use crate::error::Error;
use crate::model::{FileEqualityMode, FileFingerprint, WarningRecord, WarningType};
use crate::paths;
use crossbeam_channel as channel;
use dashmap::DashSet;
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;

const HASH_CHUNK_SIZE: usize = 4 * 1024 * 1024;
const RECV_TICK: Duration = Duration::from_millis(50);

/// Work item: (relative path, absolute path) of a directory to read.
type WorkItem = (String, PathBuf);

enum WalkMessage {
    Folder(DirectScan),
    Warning(WarningRecord),
}

/// Concurrent depth-first traversal under a bounded worker pool.
///
/// Guarantees:
/// - symlinks are never followed and never emitted
/// - the first `(device, inode)` wins; later hard links are counted as
///   aliases and contribute no weight
/// - emissions for a folder are complete before its `DirectScan` is sent
/// - a cancel signal drains pending directories without starting new work
pub struct Walker<'a> {
    root: PathBuf,
    request: &'a ScanRequest,
    cache: Option<&'a FileHashCache>,
    counters: &'a ScanCounters,
    cancel: &'a AtomicBool,
    filter: GlobFilter,
}

impl<'a> Walker<'a> {
    /// `root` must already be resolved through `paths::resolve_root`.
    pub fn new(
        root: PathBuf,
        request: &'a ScanRequest,
        cache: Option<&'a FileHashCache>,
        counters: &'a ScanCounters,
        cancel: &'a AtomicBool,
    ) -> Result<Self, Error> {
        let filter = GlobFilter::compile(&request.include, &request.exclude)?;
        Ok(Self {
            root,
            request,
            cache,
            counters,
            cancel,
            filter,
        })
    }

    pub fn walk(&self) -> Result<WalkOutcome, Error> {
        let workers = self.request.worker_count();
        self.counters.workers.store(workers as u64, Ordering::Relaxed);
        debug!("Walking {} with {} workers", self.root.display(), workers);

        let (work_tx, work_rx) = channel::unbounded::<WorkItem>();
        let (result_tx, result_rx) = channel::unbounded::<WalkMessage>();
        let in_flight = AtomicUsize::new(1);
        let seen_inodes: DashSet<(u64, u64)> = DashSet::new();

        work_tx
            .send((".".to_string(), self.root.clone()))
            .expect("work channel open");

        let mut folders = Vec::new();
        let mut warnings = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let work_tx = work_tx.clone();
                let result_tx = result_tx.clone();
                let in_flight = &in_flight;
                let seen_inodes = &seen_inodes;
                scope.spawn(move || {
                    self.worker_loop(&work_rx, &work_tx, &result_tx, in_flight, seen_inodes);
                });
            }
            drop(work_tx);
            drop(result_tx);

            for message in result_rx.iter() {
                match message {
                    WalkMessage::Folder(unit) => folders.push(unit),
                    WalkMessage::Warning(warning) => warnings.push(warning),
                }
            }
        });

        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(WalkOutcome { folders, warnings })
    }

    fn worker_loop(
        &self,
        work_rx: &channel::Receiver<WorkItem>,
        work_tx: &channel::Sender<WorkItem>,
        result_tx: &channel::Sender<WalkMessage>,
        in_flight: &AtomicUsize,
        seen_inodes: &DashSet<(u64, u64)>,
    ) {
        loop {
            match work_rx.recv_timeout(RECV_TICK) {
                Ok((rel, path)) => {
                    // Cancellation is checked at directory granularity: a
                    // queued directory is drained but not processed.
                    if !self.cancel.load(Ordering::Relaxed) {
                        self.process_directory(
                            rel, path, work_tx, result_tx, in_flight, seen_inodes,
                        );
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Err(channel::RecvTimeoutError::Timeout) => {
                    if in_flight.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                }
                Err(channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn process_directory(
        &self,
        rel: String,
        path: PathBuf,
        work_tx: &channel::Sender<WorkItem>,
        result_tx: &channel::Sender<WalkMessage>,
        in_flight: &AtomicUsize,
        seen_inodes: &DashSet<(u64, u64)>,
    ) {
        self.counters.set_last_path(&path);

        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                let kind = if err.kind() == ErrorKind::PermissionDenied {
                    WarningType::Permission
                } else {
                    WarningType::IoError
                };
                let _ = result_tx.send(WalkMessage::Warning(WarningRecord {
                    path: path.clone(),
                    kind,
                    message: format!("Failed to read directory: {err}"),
                }));
                return;
            }
        };

        let mut unit = DirectScan {
            relative_path: rel.clone(),
            path,
            files: Vec::new(),
            subdirs: Vec::new(),
            unstable: false,
        };

        for entry_result in entries {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(err) => {
                    let _ = result_tx.send(WalkMessage::Warning(WarningRecord {
                        path: unit.path.clone(),
                        kind: WarningType::IoError,
                        message: format!("Failed to read entry: {err}"),
                    }));
                    continue;
                }
            };

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(err) => {
                    let _ = result_tx.send(WalkMessage::Warning(WarningRecord {
                        path: entry.path(),
                        kind: WarningType::IoError,
                        message: format!("Failed to stat entry: {err}"),
                    }));
                    continue;
                }
            };

            // Symlinks are skipped entirely: not followed, not emitted.
            if file_type.is_symlink() {
                continue;
            }

            let name = paths::normalize_name(
                &entry.file_name().to_string_lossy(),
                self.request.force_case_insensitive,
            );
            let child_rel = paths::join_relative(&rel, &name);

            if file_type.is_dir() {
                if self.filter.is_excluded(&child_rel) {
                    continue;
                }
                unit.subdirs.push(name);
                self.counters.folders_discovered.fetch_add(1, Ordering::Relaxed);
                in_flight.fetch_add(1, Ordering::SeqCst);
                if work_tx.send((child_rel, entry.path())).is_err() {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            } else if file_type.is_file() {
                if self.filter.is_excluded(&child_rel) || !self.filter.is_included(&child_rel) {
                    continue;
                }
                match self.process_file(&entry.path(), child_rel, result_tx, seen_inodes) {
                    FileOutcome::Emitted(fingerprint) => {
                        self.counters.files_scanned.fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .bytes_scanned
                            .fetch_add(fingerprint.size, Ordering::Relaxed);
                        unit.files.push(fingerprint);
                    }
                    FileOutcome::Unstable => unit.unstable = true,
                    FileOutcome::Skipped => {}
                }
            }
            // Sockets, fifos and other special files contribute nothing.
        }

        self.counters.folders_scanned.fetch_add(1, Ordering::Relaxed);
        let _ = result_tx.send(WalkMessage::Folder(unit));
    }

    fn process_file(
        &self,
        path: &Path,
        relative_path: String,
        result_tx: &channel::Sender<WalkMessage>,
        seen_inodes: &DashSet<(u64, u64)>,
    ) -> FileOutcome {
        self.counters.set_last_path(path);

        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(err) => {
                let kind = if err.kind() == ErrorKind::PermissionDenied {
                    WarningType::Permission
                } else {
                    WarningType::IoError
                };
                let _ = result_tx.send(WalkMessage::Warning(WarningRecord {
                    path: path.to_path_buf(),
                    kind,
                    message: format!("Failed to stat file: {err}"),
                }));
                return FileOutcome::Skipped;
            }
        };

        let (device, inode) = device_inode(&metadata);
        if let (Some(dev), Some(ino)) = (device, inode) {
            // First (device, inode) wins full weight; later links are
            // aliases with zero incremental weight.
            if !seen_inodes.insert((dev, ino)) {
                self.counters.hardlink_aliases.fetch_add(1, Ordering::Relaxed);
                return FileOutcome::Skipped;
            }
        }

        let mut size = metadata.len();
        let mut mtime_ns = mtime_nanos(&metadata);

        let digest = match self.request.file_equality {
            FileEqualityMode::NameSize => None,
            FileEqualityMode::Sha256 => {
                let cached = match (device, inode) {
                    (Some(dev), Some(ino)) => self.cache.and_then(|c| {
                        c.lookup(&CacheKey {
                            device: dev,
                            inode: ino,
                            size,
                            mtime_ns,
                        })
                    }),
                    // Without a stat identity the cache cannot be keyed.
                    _ => None,
                };

                match cached {
                    Some(digest) => Some(digest),
                    None => match self.hash_with_drift_check(path, &mut size, &mut mtime_ns) {
                        HashOutcome::Stable(digest) => {
                            if let (Some(cache), Some(dev), Some(ino)) =
                                (self.cache, device, inode)
                            {
                                cache.insert(
                                    &CacheKey {
                                        device: dev,
                                        inode: ino,
                                        size,
                                        mtime_ns,
                                    },
                                    &digest,
                                );
                            }
                            Some(digest)
                        }
                        HashOutcome::Drifting => {
                            let _ = result_tx.send(WalkMessage::Warning(WarningRecord {
                                path: path.to_path_buf(),
                                kind: WarningType::Unstable,
                                message: "File changed during hashing twice; skipping".to_string(),
                            }));
                            return FileOutcome::Unstable;
                        }
                        HashOutcome::Failed(warning) => {
                            let _ = result_tx.send(WalkMessage::Warning(warning));
                            return FileOutcome::Skipped;
                        }
                    },
                }
            }
        };

        FileOutcome::Emitted(FileFingerprint {
            relative_path,
            size,
            mtime_ns,
            device,
            inode,
            digest,
            unstable: false,
        })
    }

    /// Hash the file, then re-stat. One retry on drift; persistent drift
    /// skips the file and flags its folder unstable.
    fn hash_with_drift_check(
        &self,
        path: &Path,
        size: &mut u64,
        mtime_ns: &mut i64,
    ) -> HashOutcome {
        for _attempt in 0..2 {
            let digest = match hash_file(path) {
                Ok(digest) => digest,
                Err(err) => {
                    let kind = if err.kind() == ErrorKind::PermissionDenied {
                        WarningType::Permission
                    } else {
                        WarningType::IoError
                    };
                    return HashOutcome::Failed(WarningRecord {
                        path: path.to_path_buf(),
                        kind,
                        message: format!("Failed to hash file: {err}"),
                    });
                }
            };

            let after = match fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(err) => {
                    return HashOutcome::Failed(WarningRecord {
                        path: path.to_path_buf(),
                        kind: WarningType::IoError,
                        message: format!("File vanished during hashing: {err}"),
                    })
                }
            };

            let size_after = after.len();
            let mtime_after = mtime_nanos(&after);
            if size_after == *size && mtime_after == *mtime_ns {
                return HashOutcome::Stable(digest);
            }
            *size = size_after;
            *mtime_ns = mtime_after;
        }
        HashOutcome::Drifting
    }
}

enum FileOutcome {
    Emitted(FileFingerprint),
    Unstable,
    Skipped,
}

enum HashOutcome {
    Stable(String),
    Drifting,
    Failed(WarningRecord),
}

/// Streaming sha256 in 4 MiB chunks; files never load whole into RAM.
fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}

fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| match t.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).ok(),
            Err(_) => None,
        })
        .unwrap_or(0)
}

#[cfg(unix)]
fn device_inode(metadata: &fs::Metadata) -> (Option<u64>, Option<u64>) {
    use std::os::unix::fs::MetadataExt;
    (Some(metadata.dev()), Some(metadata.ino()))
}

#[cfg(not(unix))]
fn device_inode(_metadata: &fs::Metadata) -> (Option<u64>, Option<u64>) {
    (None, None)
}

/// Include/exclude filtering over root-relative paths. Exclusions also match
/// bare basenames so defaults like `Thumbs.db` apply at any depth.
struct GlobFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl GlobFilter {
    fn compile(include: &[String], exclude: &[String]) -> Result<Self, Error> {
        Ok(Self {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    fn is_excluded(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.exclude
            .iter()
            .any(|pattern| pattern.matches(rel) || pattern.matches(name))
    }

    fn is_included(&self, rel: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|pattern| pattern.matches(rel))
    }
}

fn compile_patterns(globs: &[String]) -> Result<Vec<Pattern>, Error> {
    globs
        .iter()
        .map(|glob| Pattern::new(glob).map_err(|_| Error::InvalidGlob(glob.clone())))
        .collect()
}
