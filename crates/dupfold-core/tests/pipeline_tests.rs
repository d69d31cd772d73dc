use dupfold_core::model::GroupLabel;
use dupfold_core::scanner::{ScanCounters, Walker};
use dupfold_core::{
    AppConfig, Error, FileEqualityMode, FolderStore, ScanManager, ScanRequest, SilentObserver,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

fn write_file(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn manager_for(state_dir: &Path) -> ScanManager {
    let config = AppConfig {
        state_dir: state_dir.to_path_buf(),
        cache_db: None,
        max_active_scans: 1,
        plan_ttl_minutes: 15,
    };
    ScanManager::new(config).unwrap()
}

/// Root with the same X payload at three depths, plus per-branch unique
/// files so the branches themselves stay dissimilar.
fn build_nested_x_tree(root: &Path) {
    let payload = vec![0xABu8; 1024];
    write_file(&root.join("X/file.txt"), &payload);
    write_file(&root.join("A/X/file.txt"), &payload);
    write_file(&root.join("B/nested/X/file.txt"), &payload);
    write_file(&root.join("A/unique_a.txt"), &[1u8; 300]);
    write_file(&root.join("B/nested/unique_b.txt"), &[2u8; 301]);
}

fn member_sets(report: &dupfold_core::ScanReport, label: GroupLabel) -> Vec<Vec<String>> {
    report
        .groups
        .iter()
        .filter(|g| g.label == label)
        .map(|g| {
            g.members
                .iter()
                .map(|m| m.relative_path.clone())
                .collect()
        })
        .collect()
}

#[test]
fn nested_identical_x_folders_cluster_without_root() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let identical = member_sets(&report, GroupLabel::Identical);
    assert!(
        identical.contains(&vec![
            "X".to_string(),
            "A/X".to_string(),
            "B/nested/X".to_string()
        ]),
        "identical X folders should cluster, got {identical:?}"
    );
    for members in member_sets(&report, GroupLabel::Identical)
        .into_iter()
        .chain(member_sets(&report, GroupLabel::NearDuplicate))
    {
        assert!(!members.contains(&".".to_string()), "root must never group");
    }

    let group = report
        .groups
        .iter()
        .find(|g| g.label == GroupLabel::Identical)
        .unwrap();
    assert_eq!(group.canonical().relative_path, "X");
    assert_eq!(group.group_id, "g_000001");
    for pair in &group.pairwise_similarity {
        assert_eq!(pair.similarity, 1.0);
    }
}

#[test]
fn threshold_demotes_then_drops_the_outlier() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());
    // A fourth X with a small extra file: sim(X, C/X) = 1024/1152 ≈ 0.889,
    // above 0.80 but below 0.90.
    write_file(&tree.path().join("C/X/file.txt"), &vec![0xABu8; 1024]);
    write_file(&tree.path().join("C/X/extra.txt"), &[3u8; 128]);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());

    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();
    let near = member_sets(&report, GroupLabel::NearDuplicate);
    // Members order by (depth, path): both depth-2 folders precede B/nested/X.
    assert!(
        near.contains(&vec![
            "X".to_string(),
            "A/X".to_string(),
            "C/X".to_string(),
            "B/nested/X".to_string()
        ]),
        "at 0.80 all four X folders group as near duplicates, got {near:?}"
    );

    let mut strict = ScanRequest::new(tree.path());
    strict.similarity_threshold = 0.90;
    let report = manager.run_blocking(strict, &SilentObserver).unwrap();
    let identical = member_sets(&report, GroupLabel::Identical);
    assert!(
        identical.contains(&vec![
            "X".to_string(),
            "A/X".to_string(),
            "B/nested/X".to_string()
        ]),
        "at 0.90 the outlier drops and the rest are identical, got {identical:?}"
    );
    for members in member_sets(&report, GroupLabel::NearDuplicate) {
        assert!(!members.contains(&"C/X".to_string()));
    }
}

#[test]
fn empty_folders_never_group() {
    let tree = tempfile::tempdir().unwrap();
    fs::create_dir_all(tree.path().join("empty_a")).unwrap();
    fs::create_dir_all(tree.path().join("empty_b")).unwrap();
    fs::create_dir_all(tree.path().join("empty_c/subdir")).unwrap();

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();
    assert!(report.groups.is_empty(), "got {:?}", report.groups);
}

#[test]
fn parent_group_supersedes_child_groups() {
    let tree = tempfile::tempdir().unwrap();
    for branch in ["X", "Y"] {
        write_file(&tree.path().join(branch).join("A/f1.bin"), &[7u8; 4]);
        write_file(&tree.path().join(branch).join("B/f2.bin"), &[8u8; 6]);
    }

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    assert_eq!(report.groups.len(), 1, "got {:?}", report.groups);
    let group = &report.groups[0];
    assert_eq!(group.label, GroupLabel::Identical);
    let rels: Vec<&str> = group
        .members
        .iter()
        .map(|m| m.relative_path.as_str())
        .collect();
    assert_eq!(rels, vec!["X", "Y"]);
    assert!(group.suppressed_descendants);
}

#[cfg(unix)]
#[test]
fn hardlink_aliases_collapse_to_one_weight() {
    let tree = tempfile::tempdir().unwrap();
    write_file(&tree.path().join("a/big.bin"), &[9u8; 4096]);
    fs::hard_link(
        tree.path().join("a/big.bin"),
        tree.path().join("a/alias.bin"),
    )
    .unwrap();
    write_file(&tree.path().join("b/big.bin"), &[9u8; 4096]);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let store = FolderStore::open(&report.folder_index_ref).unwrap();
    let a = store.get("a").unwrap();
    assert_eq!(a.total_bytes, 4096, "alias must not double the weight");
    assert_eq!(a.file_count, 1);

    let job = manager.job(&report.scan_id).unwrap();
    assert_eq!(
        job.counters
            .hardlink_aliases
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn consecutive_scans_produce_identical_groups() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());

    let first = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();
    let second = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    assert_eq!(
        serde_json::to_string(&first.groups).unwrap(),
        serde_json::to_string(&second.groups).unwrap()
    );
}

#[test]
fn warm_cache_reproduces_cold_digests() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());

    let mut request = ScanRequest::new(tree.path());
    request.file_equality = FileEqualityMode::Sha256;
    let cold = manager
        .run_blocking(request.clone(), &SilentObserver)
        .unwrap();
    assert!(manager.cache().len().unwrap() > 0, "cache should be warm now");

    let warm = manager.run_blocking(request, &SilentObserver).unwrap();
    assert_eq!(
        serde_json::to_string(&cold.groups).unwrap(),
        serde_json::to_string(&warm.groups).unwrap()
    );
}

#[test]
fn default_excludes_hide_node_modules() {
    let tree = tempfile::tempdir().unwrap();
    write_file(&tree.path().join("left/node_modules/pkg/index.js"), &[1; 64]);
    write_file(&tree.path().join("right/node_modules/pkg/index.js"), &[1; 64]);
    write_file(&tree.path().join("left/app.txt"), &[2; 32]);
    write_file(&tree.path().join("right/other.txt"), &[3; 48]);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();
    assert!(
        report.groups.is_empty(),
        "node_modules content must not group, got {:?}",
        report.groups
    );
}

#[test]
fn include_globs_restrict_emission() {
    let tree = tempfile::tempdir().unwrap();
    write_file(&tree.path().join("one/match.txt"), &[5; 100]);
    write_file(&tree.path().join("one/skip.bin"), &[6; 999]);
    write_file(&tree.path().join("two/match.txt"), &[5; 100]);
    write_file(&tree.path().join("two/skip.bin"), &[7; 555]);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let mut request = ScanRequest::new(tree.path());
    request.include = vec!["*.txt".to_string()];
    let report = manager.run_blocking(request, &SilentObserver).unwrap();

    // With the .bin files ignored the two folders are byte-identical.
    let identical = member_sets(&report, GroupLabel::Identical);
    assert!(identical.contains(&vec!["one".to_string(), "two".to_string()]));
}

#[test]
fn missing_root_fails_the_scan() {
    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let result = manager.run_blocking(
        ScanRequest::new("/definitely/not/here"),
        &SilentObserver,
    );
    assert!(matches!(result, Err(Error::ScanFailed(_))));
}

#[test]
fn report_snapshot_is_persisted_and_reloadable() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let report_path = state
        .path()
        .join("scans")
        .join(&report.scan_id)
        .join("report.json");
    let raw = fs::read_to_string(&report_path).unwrap();
    let reloaded: dupfold_core::ScanReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(reloaded.scan_id, report.scan_id);
    assert_eq!(reloaded.groups.len(), report.groups.len());

    // The spilled folder index is independently reopenable.
    let store = FolderStore::open(&report.folder_index_ref).unwrap();
    assert!(store.contains("."));
    assert!(store.contains("X"));
}

#[test]
fn phase_metrics_cover_all_three_phases() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let phases: Vec<_> = report.metrics.iter().map(|m| m.phase).collect();
    assert_eq!(
        phases,
        vec![
            dupfold_core::ScanPhase::Walking,
            dupfold_core::ScanPhase::Aggregating,
            dupfold_core::ScanPhase::Grouping
        ]
    );
    for metric in &report.metrics {
        assert!(metric.ended_at.is_some());
        assert!(metric.ended_at.unwrap() >= metric.started_at);
    }
    // All bytes are observed during walking.
    assert_eq!(report.metrics[0].bytes_scanned_delta, 1024 * 3 + 300 + 301);
}

#[test]
fn pre_cancelled_walk_returns_cancelled() {
    let tree = tempfile::tempdir().unwrap();
    build_nested_x_tree(tree.path());

    let request = ScanRequest::new(tree.path());
    let counters = ScanCounters::new();
    let cancel = AtomicBool::new(true);
    let walker = Walker::new(
        fs::canonicalize(tree.path()).unwrap(),
        &request,
        None,
        &counters,
        &cancel,
    )
    .unwrap();
    assert!(matches!(walker.walk(), Err(Error::Cancelled)));
}

#[test]
fn cancelled_scan_has_no_report() {
    let tree = tempfile::tempdir().unwrap();
    // Enough folders that the walk cannot finish before the flag is seen.
    for i in 0..64 {
        for j in 0..8 {
            write_file(
                &tree.path().join(format!("d{i:02}/s{j}/f.bin")),
                &[i as u8; 256],
            );
        }
    }

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let job = manager.submit(
        ScanRequest::new(tree.path()),
        std::sync::Arc::new(SilentObserver),
    );
    job.cancel();
    let status = job.wait();

    if status == dupfold_core::ScanStatus::Cancelled {
        assert!(job.report().is_none(), "cancelled scans emit no report");
    } else {
        // The scan can legitimately win the race on a fast machine.
        assert_eq!(status, dupfold_core::ScanStatus::Completed);
    }
}

#[test]
fn group_diff_is_deterministic_and_sorted() {
    let tree = tempfile::tempdir().unwrap();
    write_file(&tree.path().join("left/shared.bin"), &[1; 1000]);
    write_file(&tree.path().join("left/only_left.bin"), &[2; 80]);
    write_file(&tree.path().join("right/shared.bin"), &[1; 1000]);
    write_file(&tree.path().join("right/only_right.bin"), &[3; 90]);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let group = report
        .groups
        .iter()
        .find(|g| {
            g.members
                .iter()
                .any(|m| m.relative_path == "left" || m.relative_path == "right")
        })
        .expect("left/right should group near-duplicate");

    let diff = manager
        .group_diff(&report.scan_id, &group.group_id, "left", "right")
        .unwrap();
    assert_eq!(diff.only_left.len(), 1);
    assert_eq!(diff.only_left[0].path, "only_left.bin");
    assert_eq!(diff.only_right.len(), 1);
    assert_eq!(diff.only_right[0].path, "only_right.bin");
    assert!(diff.mismatched.is_empty());

    let again = manager
        .group_diff(&report.scan_id, &group.group_id, "left", "right")
        .unwrap();
    assert_eq!(
        serde_json::to_string(&diff).unwrap(),
        serde_json::to_string(&again).unwrap()
    );

    assert!(matches!(
        manager.group_diff(&report.scan_id, &group.group_id, "left", "nope"),
        Err(Error::MemberNotFound(_))
    ));
}

#[test]
fn group_contents_lists_canonical_first() {
    let tree = tempfile::tempdir().unwrap();
    let payload = vec![4u8; 512];
    write_file(&tree.path().join("orig/data.bin"), &payload);
    write_file(&tree.path().join("copyz/data.bin"), &payload);

    let state = tempfile::tempdir().unwrap();
    let manager = manager_for(state.path());
    let report = manager
        .run_blocking(ScanRequest::new(tree.path()), &SilentObserver)
        .unwrap();

    let group = &report.groups[0];
    let contents = manager
        .group_contents(&report.scan_id, &group.group_id)
        .unwrap();
    assert_eq!(
        contents.canonical.relative_path,
        group.canonical().relative_path
    );
    assert_eq!(contents.duplicates.len(), group.members.len() - 1);
    assert_eq!(contents.canonical.entries[0].path, "data.bin");
    assert_eq!(contents.canonical.entries[0].bytes, 512);
}
