use ahash::AHashMap;
use dupfold_core::model::{FolderInfo, RepresentativeFile};
use dupfold_core::store::FolderStore;
use dupfold_core::Error;
use std::path::PathBuf;

fn folder(rel: &str, entries: &[(&str, u64)]) -> FolderInfo {
    let file_weights: AHashMap<String, u64> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
    let total_bytes = file_weights.values().sum();
    FolderInfo {
        path: PathBuf::from("/r").join(rel),
        relative_path: rel.to_string(),
        total_bytes,
        file_count: file_weights.len() as u64,
        fingerprint_hash: dupfold_core::aggregate::fingerprint_hash(&file_weights),
        file_weights,
        unstable: false,
        representative: Some(RepresentativeFile {
            relative_path: "f.bin".to_string(),
            size: 1,
            mtime_ns: 42,
        }),
    }
}

fn sample_folders() -> Vec<FolderInfo> {
    vec![
        folder(".", &[("a/f.bin:10", 10), ("b/g.bin:20", 20)]),
        folder("a", &[("f.bin:10", 10)]),
        folder("b", &[("g.bin:20", 20)]),
    ]
}

#[test]
fn ram_mode_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.bin");
    let store = FolderStore::persist(&path, &sample_folders()).unwrap();

    assert_eq!(store.len(), 3);
    assert!(store.contains("."));
    let a = store.get("a").unwrap();
    assert_eq!(a.total_bytes, 10);
    assert_eq!(a.file_weights.get("f.bin:10"), Some(&10));

    assert!(matches!(
        store.get("missing"),
        Err(Error::FolderNotIndexed(_))
    ));
}

#[test]
fn spilled_mode_serves_random_access() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.bin");
    // Threshold 0 forces every scan onto the disk path.
    let store = FolderStore::persist_with_threshold(&path, &sample_folders(), 0).unwrap();

    assert_eq!(store.len(), 3);
    // Out-of-order random access, repeated to exercise the record cache.
    for rel in ["b", ".", "a", "b", "a"] {
        let record = store.get(rel).unwrap();
        assert_eq!(record.relative_path, rel);
    }
    let root = store.get(".").unwrap();
    assert_eq!(root.total_bytes, 30);
    assert_eq!(
        root.representative.as_ref().unwrap().mtime_ns,
        42
    );
}

#[test]
fn persisted_file_reopens_after_drop() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.bin");
    {
        FolderStore::persist(&path, &sample_folders()).unwrap();
    }

    let reopened = FolderStore::open(&path).unwrap();
    assert_eq!(reopened.len(), 3);
    let b = reopened.get("b").unwrap();
    assert_eq!(b.total_bytes, 20);
    assert_eq!(b.fingerprint_hash, sample_folders()[2].fingerprint_hash);
}

#[test]
fn garbage_file_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.bin");
    std::fs::write(&path, b"not a folder index at all").unwrap();
    assert!(matches!(FolderStore::open(&path), Err(Error::Store(_))));
}

#[test]
fn empty_index_is_valid() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.bin");
    let store = FolderStore::persist(&path, &[]).unwrap();
    assert!(store.is_empty());

    let reopened = FolderStore::open(&path).unwrap();
    assert!(reopened.is_empty());
}
