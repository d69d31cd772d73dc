use dupfold_core::{AppConfig, Error, ScanManager, ScanRequest, SilentObserver};
use std::fs;
use std::path::Path;

fn write_file(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn manager_with_ttl(state_dir: &Path, ttl_minutes: i64) -> ScanManager {
    let config = AppConfig {
        state_dir: state_dir.to_path_buf(),
        cache_db: None,
        max_active_scans: 1,
        plan_ttl_minutes: ttl_minutes,
    };
    ScanManager::new(config).unwrap()
}

/// Two identical sibling folders; `copy` sorts before `orig`, so `copy` is
/// the canonical member and `orig` is fair game for deletion.
fn scan_duplicate_pair(
    manager: &ScanManager,
    tree: &Path,
    deletion_enabled: bool,
) -> std::sync::Arc<dupfold_core::ScanReport> {
    let payload = vec![0x5Au8; 2048];
    write_file(&tree.join("copy/data.bin"), &payload);
    write_file(&tree.join("orig/data.bin"), &payload);

    let mut request = ScanRequest::new(tree);
    request.deletion_enabled = deletion_enabled;
    manager.run_blocking(request, &SilentObserver).unwrap()
}

#[test]
fn plan_requires_deletion_enabled() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), false);

    assert!(matches!(
        manager.create_plan(&report.scan_id, &["orig".to_string()]),
        Err(Error::DeletionDisabled)
    ));
}

#[test]
fn plan_rejects_canonical_member() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    assert_eq!(report.groups[0].canonical().relative_path, "copy");
    assert!(matches!(
        manager.create_plan(&report.scan_id, &["copy".to_string()]),
        Err(Error::CannotPlanCanonical(_))
    ));
}

#[test]
fn plan_rejects_escaping_and_unknown_paths() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    assert!(matches!(
        manager.create_plan(&report.scan_id, &["../outside".to_string()]),
        Err(Error::RootEscape(_))
    ));
    assert!(matches!(
        manager.create_plan(&report.scan_id, &["/etc".to_string()]),
        Err(Error::RootEscape(_))
    ));
    assert!(matches!(
        manager.create_plan(&report.scan_id, &["never_scanned".to_string()]),
        Err(Error::FolderNotIndexed(_))
    ));
    assert!(matches!(
        manager.create_plan(&report.scan_id, &[".".to_string()]),
        Err(Error::InvalidPlanPath(_))
    ));
}

#[test]
fn confirm_moves_into_dated_quarantine() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();
    assert_eq!(plan.reclaimable_bytes, 2048);
    assert_eq!(plan.queue, vec!["orig".to_string()]);
    assert!(plan
        .quarantine_root
        .components()
        .any(|c| c.as_os_str() == ".quarantine"));

    let outcome = manager
        .confirm_plan(&report.scan_id, &plan.plan_id, &plan.token)
        .unwrap();
    assert_eq!(outcome.moved, vec!["orig".to_string()]);
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.bytes_moved, 2048);

    assert!(!tree.path().join("orig").exists());
    let quarantined = plan.quarantine_root.join("orig/data.bin");
    assert_eq!(fs::read(&quarantined).unwrap().len(), 2048);
    // The canonical stays untouched.
    assert!(tree.path().join("copy/data.bin").exists());
}

#[test]
fn wrong_token_leaves_plan_usable() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();

    assert!(matches!(
        manager.confirm_plan(&report.scan_id, &plan.plan_id, "not-the-token"),
        Err(Error::TokenInvalid)
    ));
    assert!(tree.path().join("orig").exists(), "nothing moves on bad token");

    // The real token still works afterwards.
    manager
        .confirm_plan(&report.scan_id, &plan.plan_id, &plan.token)
        .unwrap();
    assert!(!tree.path().join("orig").exists());
}

#[test]
fn token_is_single_use() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();
    manager
        .confirm_plan(&report.scan_id, &plan.plan_id, &plan.token)
        .unwrap();

    assert!(matches!(
        manager.confirm_plan(&report.scan_id, &plan.plan_id, &plan.token),
        Err(Error::PlanNotFound(_))
    ));
}

#[test]
fn expired_plan_is_rejected() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), -1);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();
    assert!(matches!(
        manager.confirm_plan(&report.scan_id, &plan.plan_id, &plan.token),
        Err(Error::TokenExpired)
    ));
    assert!(tree.path().join("orig").exists());

    // Expiry invalidates the plan outright.
    assert!(matches!(
        manager.confirm_plan(&report.scan_id, &plan.plan_id, &plan.token),
        Err(Error::PlanNotFound(_))
    ));
}

#[test]
fn drift_after_planning_aborts_all_moves() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();

    // Grow the representative file after the plan was staged.
    write_file(&tree.path().join("orig/data.bin"), &vec![0x5Au8; 4096]);

    assert!(matches!(
        manager.confirm_plan(&report.scan_id, &plan.plan_id, &plan.token),
        Err(Error::DriftDetected(_))
    ));
    assert!(
        tree.path().join("orig/data.bin").exists(),
        "no moves happen once drift is detected"
    );
}

#[test]
fn quarantine_collision_appends_numeric_suffix() {
    let tree = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let manager = manager_with_ttl(state.path(), 15);
    let report = scan_duplicate_pair(&manager, tree.path(), true);

    let plan = manager
        .create_plan(&report.scan_id, &["orig".to_string()])
        .unwrap();
    // Occupy the preferred target ahead of the move.
    fs::create_dir_all(plan.quarantine_root.join("orig")).unwrap();

    let outcome = manager
        .confirm_plan(&report.scan_id, &plan.plan_id, &plan.token)
        .unwrap();
    assert_eq!(outcome.moved, vec!["orig".to_string()]);
    assert!(plan.quarantine_root.join("orig.1/data.bin").exists());
}
