use crate::config::ScanRequest;
use crate::error::Error;
use crate::model::{
    FileEqualityMode, FileFingerprint, FolderInfo, RepresentativeFile, StructurePolicy,
};
use crate::paths;
use crate::scanner::{ScanCounters, WalkOutcome};
use ahash::AHashMap;
use std::hash::Hasher as _;
use std::sync::atomic::{AtomicBool, Ordering};
use twox_hash::XxHash64;

/// Fold walked folders into rolled-up `FolderInfo` records.
///
/// The tree is held as an arena of nodes with integer parent links and
/// processed deepest-first, so each folder's weights are the elementwise sum
/// of its direct files and its already-closed children. Under the `relative`
/// policy child identities are re-prefixed with the child's name on the way
/// up; under `bag_of_files` they merge unchanged.
pub fn aggregate(
    request: &ScanRequest,
    outcome: WalkOutcome,
    counters: &ScanCounters,
    cancel: &AtomicBool,
) -> Result<Vec<FolderInfo>, Error> {
    let mut nodes: Vec<Node> = Vec::with_capacity(outcome.folders.len());
    let mut index: AHashMap<String, usize> = AHashMap::with_capacity(outcome.folders.len());

    for unit in outcome.folders {
        let idx = nodes.len();
        index.insert(unit.relative_path.clone(), idx);
        nodes.push(Node {
            relative_path: unit.relative_path,
            path: unit.path,
            files: unit.files,
            weights: AHashMap::new(),
            total_bytes: 0,
            file_count: 0,
            unstable: unit.unstable,
            representative: None,
            parent: None,
            closed: false,
        });
    }

    // Excluded or unreadable subtrees never produced a node; their parents
    // simply have no entry to link to.
    for idx in 0..nodes.len() {
        let parent_idx = paths::parent(&nodes[idx].relative_path)
            .and_then(|parent_rel| index.get(&parent_rel).copied());
        nodes[idx].parent = parent_idx;
    }

    counters
        .total_folders
        .store(nodes.len() as u64, Ordering::Relaxed);

    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| {
        let depth_a = paths::depth(&nodes[a].relative_path);
        let depth_b = paths::depth(&nodes[b].relative_path);
        depth_b
            .cmp(&depth_a)
            .then_with(|| nodes[a].relative_path.cmp(&nodes[b].relative_path))
    });

    for &idx in &order {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        close_node(&mut nodes, idx, request);
        counters.folders_aggregated.fetch_add(1, Ordering::Relaxed);
        counters.set_last_path(&nodes[idx].path);
    }

    let mut folders: Vec<FolderInfo> = nodes.into_iter().map(Node::into_folder_info).collect();
    folders.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(folders)
}

struct Node {
    relative_path: String,
    path: std::path::PathBuf,
    files: Vec<FileFingerprint>,
    weights: AHashMap<String, u64>,
    total_bytes: u64,
    file_count: u64,
    unstable: bool,
    representative: Option<RepresentativeFile>,
    parent: Option<usize>,
    closed: bool,
}

impl Node {
    fn into_folder_info(self) -> FolderInfo {
        let fingerprint_hash = fingerprint_hash(&self.weights);
        FolderInfo {
            path: self.path,
            relative_path: self.relative_path,
            total_bytes: self.total_bytes,
            file_count: self.file_count,
            file_weights: self.weights,
            fingerprint_hash,
            unstable: self.unstable,
            representative: self.representative,
        }
    }
}

/// Fold the node's direct files into its weight map, then merge the closed
/// node upward into its parent.
fn close_node(nodes: &mut [Node], idx: usize, request: &ScanRequest) {
    let files = std::mem::take(&mut nodes[idx].files);
    for file in &files {
        let identity = file_identity(file, request);
        *nodes[idx].weights.entry(identity).or_insert(0) += file.size;
        nodes[idx].total_bytes += file.size;
        nodes[idx].file_count += 1;
    }

    // Representative: lexicographically first direct file; folders with no
    // direct files inherit one from their first-closed child below.
    if nodes[idx].representative.is_none() {
        if let Some(first) = files.iter().min_by(|a, b| a.basename().cmp(b.basename())) {
            nodes[idx].representative = Some(RepresentativeFile {
                relative_path: first.basename().to_string(),
                size: first.size,
                mtime_ns: first.mtime_ns,
            });
        }
    }
    nodes[idx].closed = true;

    let Some(parent_idx) = nodes[idx].parent else {
        return;
    };
    debug_assert!(!nodes[parent_idx].closed, "children close before parents");

    let child_name = nodes[idx]
        .relative_path
        .rsplit('/')
        .next()
        .unwrap_or(&nodes[idx].relative_path)
        .to_string();

    let (child, parent) = split_pair(nodes, idx, parent_idx);

    for (identity, weight) in &child.weights {
        let merged = match request.structure_policy {
            StructurePolicy::Relative => {
                prefix_identity(&child_name, identity, request.file_equality)
            }
            StructurePolicy::BagOfFiles => identity.clone(),
        };
        *parent.weights.entry(merged).or_insert(0) += weight;
    }
    parent.total_bytes += child.total_bytes;
    parent.file_count += child.file_count;
    parent.unstable |= child.unstable;

    if parent.representative.is_none() {
        if let Some(rep) = &child.representative {
            parent.representative = Some(RepresentativeFile {
                relative_path: format!("{}/{}", child_name, rep.relative_path),
                size: rep.size,
                mtime_ns: rep.mtime_ns,
            });
        }
    }
}

/// Two disjoint mutable borrows out of the arena.
fn split_pair(nodes: &mut [Node], a: usize, b: usize) -> (&Node, &mut Node) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = nodes.split_at_mut(b);
        (&left[a], &mut right[0])
    } else {
        let (left, right) = nodes.split_at_mut(a);
        (&right[0], &mut left[b])
    }
}

/// Identity key of a direct file, relative to its owning folder.
pub fn file_identity(file: &FileFingerprint, request: &ScanRequest) -> String {
    let base = file.basename();
    match request.file_equality {
        FileEqualityMode::Sha256 => {
            let digest = file.digest.as_deref().unwrap_or("");
            format!("{base}#{digest}")
        }
        FileEqualityMode::NameSize => format!("{base}:{}", file.size),
    }
}

/// Re-prefix a child identity with the child folder's name.
pub fn prefix_identity(prefix: &str, identity: &str, mode: FileEqualityMode) -> String {
    let split = match mode {
        FileEqualityMode::Sha256 => identity.rsplit_once('#'),
        FileEqualityMode::NameSize => identity.rsplit_once(':'),
    };
    match (mode, split) {
        (FileEqualityMode::Sha256, Some((base, digest))) => {
            format!("{prefix}/{base}#{digest}")
        }
        (FileEqualityMode::NameSize, Some((base, size))) => {
            format!("{prefix}/{base}:{size}")
        }
        _ => format!("{prefix}/{identity}"),
    }
}

/// Stable hash over the sorted `(identity, weight)` pairs.
pub fn fingerprint_hash(weights: &AHashMap<String, u64>) -> u64 {
    let mut pairs: Vec<(&String, &u64)> = weights.iter().collect();
    pairs.sort();

    let mut hasher = XxHash64::with_seed(0);
    for (identity, weight) in pairs {
        hasher.write(identity.as_bytes());
        hasher.write_u8(0);
        hasher.write_u64(*weight);
    }
    hasher.finish()
}
