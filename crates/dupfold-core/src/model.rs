use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How two files are judged to be "the same file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEqualityMode {
    NameSize,
    Sha256,
}

/// How identity keys are built from file paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructurePolicy {
    Relative,
    BagOfFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    Permission,
    Unstable,
    IoError,
}

/// A recoverable per-entry problem encountered during a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningRecord {
    pub path: PathBuf,
    pub kind: WarningType,
    pub message: String,
}

/// Identity of one regular file beneath the scan root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// NFC-normalized, `/`-separated, relative to the scan root.
    pub relative_path: String,
    pub size: u64,
    /// Nanoseconds since the Unix epoch, snapshotted at stat time.
    pub mtime_ns: i64,
    pub device: Option<u64>,
    pub inode: Option<u64>,
    /// Present only in `sha256` mode.
    pub digest: Option<String>,
    /// Size or mtime changed mid-read.
    pub unstable: bool,
}

impl FileFingerprint {
    /// Basename component of `relative_path`.
    pub fn basename(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// One direct file kept per folder so the deletion planner can re-stat a
/// member before moving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepresentativeFile {
    /// Relative to the owning folder.
    pub relative_path: String,
    pub size: u64,
    pub mtime_ns: i64,
}

/// Per-folder roll-up over the whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderInfo {
    pub path: PathBuf,
    /// `/`-separated, `"."` for the root itself.
    pub relative_path: String,
    pub total_bytes: u64,
    pub file_count: u64,
    /// Identity key → summed byte weight over the subtree.
    pub file_weights: AHashMap<String, u64>,
    /// XxHash64 over the sorted `(identity, weight)` pairs.
    pub fingerprint_hash: u64,
    pub unstable: bool,
    pub representative: Option<RepresentativeFile>,
}

impl FolderInfo {
    pub fn depth(&self) -> usize {
        if self.relative_path == "." {
            0
        } else {
            self.relative_path.split('/').count()
        }
    }

    pub fn summary(&self) -> FolderSummary {
        FolderSummary {
            path: self.path.clone(),
            relative_path: self.relative_path.clone(),
            total_bytes: self.total_bytes,
            file_count: self.file_count,
            unstable: self.unstable,
        }
    }
}

/// Weight-free view of a folder, used in group records and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSummary {
    pub path: PathBuf,
    pub relative_path: String,
    pub total_bytes: u64,
    pub file_count: u64,
    pub unstable: bool,
}

impl FolderSummary {
    pub fn depth(&self) -> usize {
        if self.relative_path == "." {
            0
        } else {
            self.relative_path.split('/').count()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLabel {
    Identical,
    NearDuplicate,
    PartialOverlap,
}

/// Similarity edge between two members, indices into `GroupInfo::members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseSimilarity {
    pub a: usize,
    pub b: usize,
    pub similarity: f64,
}

/// One of the largest byte deltas between the canonical and second member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub path: String,
    pub delta_bytes: u64,
}

/// A cluster of folders whose pairwise similarity meets the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub label: GroupLabel,
    /// Index of the canonical member; always 0 after ordering.
    pub canonical_index: usize,
    /// Canonical first, then by (depth, path).
    pub members: Vec<FolderSummary>,
    pub pairwise_similarity: Vec<PairwiseSimilarity>,
    pub divergences: Vec<DivergenceRecord>,
    /// True if this group caused at least one descendant group to be hidden.
    pub suppressed_descendants: bool,
}

impl GroupInfo {
    pub fn canonical(&self) -> &FolderSummary {
        &self.members[self.canonical_index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Walking,
    Aggregating,
    Grouping,
    Done,
}

/// Counter snapshot published with every progress event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStatsSnapshot {
    pub folders_scanned: u64,
    pub folders_discovered: u64,
    pub files_scanned: u64,
    pub bytes_scanned: u64,
    pub hardlink_aliases: u64,
    pub workers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
}

/// Per-phase progress line in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: ScanPhase,
    pub status: PhaseStatus,
    /// `None` when the phase total is unknowable (indeterminate).
    pub progress: Option<f64>,
}

/// Metrics recorded when a phase closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub phase: ScanPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_scanned_delta: u64,
    pub folders_processed: u64,
    pub files_processed: u64,
    pub peak_rss_bytes: Option<u64>,
    pub workers_active: u64,
}

/// Copy-on-emit progress event; observers never see live scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgressSnapshot {
    pub scan_id: String,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub phases: Vec<PhaseProgress>,
    pub stats: ScanStatsSnapshot,
    pub warnings: Vec<WarningRecord>,
    pub last_path: Option<String>,
    pub progress: Option<f64>,
    pub eta_seconds: Option<u64>,
}

/// Final report published once a scan completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: String,
    pub root_path: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub groups: Vec<GroupInfo>,
    /// Path of the spilled folder index (`store.bin`).
    pub folder_index_ref: PathBuf,
    pub metrics: Vec<PhaseMetrics>,
    pub warnings: Vec<WarningRecord>,
}

/// Staged-but-not-applied deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub plan_id: String,
    pub scan_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Relative paths queued for quarantine, each validated inside the root.
    pub queue: Vec<String>,
    pub reclaimable_bytes: u64,
    pub quarantine_root: PathBuf,
}

/// Result of confirming a deletion plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionOutcome {
    pub plan_id: String,
    pub moved: Vec<String>,
    pub failed: Vec<FailedMove>,
    pub bytes_moved: u64,
    pub quarantine_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMove {
    pub relative_path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchEntry {
    pub path: String,
    pub left_bytes: u64,
    pub right_bytes: u64,
}

/// Projection of two stored folders onto their differing entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDiff {
    pub left: FolderSummary,
    pub right: FolderSummary,
    pub only_left: Vec<DiffEntry>,
    pub only_right: Vec<DiffEntry>,
    pub mismatched: Vec<MismatchEntry>,
}

/// Per-member file listing for a group, canonical first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupContents {
    pub group_id: String,
    pub canonical: MemberContents,
    pub duplicates: Vec<MemberContents>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberContents {
    pub relative_path: String,
    pub entries: Vec<DiffEntry>,
}
