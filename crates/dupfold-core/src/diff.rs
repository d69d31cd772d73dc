use crate::error::Error;
use crate::model::{
    DiffEntry, FolderInfo, GroupContents, GroupDiff, GroupInfo, MemberContents, MismatchEntry,
};
use crate::store::FolderStore;
use ahash::AHashMap;

/// Strip the identity suffix back to a display path. Identities end either
/// in `#<sha256 hex>` or `:<size>`; the checks keep filenames that happen to
/// contain those characters intact.
pub fn identity_to_path(identity: &str) -> &str {
    if let Some((base, suffix)) = identity.rsplit_once('#') {
        if suffix.len() == 64 && suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return base;
        }
    }
    if let Some((base, suffix)) = identity.rsplit_once(':') {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return base;
        }
    }
    identity
}

/// Identity weights folded down to per-path byte totals.
fn path_weights(folder: &FolderInfo) -> AHashMap<String, u64> {
    let mut map: AHashMap<String, u64> = AHashMap::with_capacity(folder.file_weights.len());
    for (identity, &weight) in &folder.file_weights {
        *map.entry(identity_to_path(identity).to_string()).or_insert(0) += weight;
    }
    map
}

/// Project two stored folders onto their differing entries.
/// Output is deterministic: weight descending, then path ascending.
pub fn compute_group_diff(left: &FolderInfo, right: &FolderInfo) -> GroupDiff {
    let left_map = path_weights(left);
    let right_map = path_weights(right);

    let mut only_left = Vec::new();
    let mut only_right = Vec::new();
    let mut mismatched = Vec::new();

    for (path, &bytes_left) in &left_map {
        match right_map.get(path) {
            None => only_left.push(DiffEntry {
                path: path.clone(),
                bytes: bytes_left,
            }),
            Some(&bytes_right) if bytes_right != bytes_left => mismatched.push(MismatchEntry {
                path: path.clone(),
                left_bytes: bytes_left,
                right_bytes: bytes_right,
            }),
            Some(_) => {}
        }
    }
    for (path, &bytes_right) in &right_map {
        if !left_map.contains_key(path) {
            only_right.push(DiffEntry {
                path: path.clone(),
                bytes: bytes_right,
            });
        }
    }

    only_left.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.path.cmp(&b.path)));
    only_right.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.path.cmp(&b.path)));
    mismatched.sort_by(|a, b| {
        let weight_a = a.left_bytes.max(a.right_bytes);
        let weight_b = b.left_bytes.max(b.right_bytes);
        weight_b.cmp(&weight_a).then_with(|| a.path.cmp(&b.path))
    });

    GroupDiff {
        left: left.summary(),
        right: right.summary(),
        only_left,
        only_right,
        mismatched,
    }
}

/// List every member's `(path, bytes)` entries, canonical first.
pub fn group_contents(group: &GroupInfo, store: &FolderStore) -> Result<GroupContents, Error> {
    let mut members = Vec::with_capacity(group.members.len());
    for member in &group.members {
        let folder = store.get(&member.relative_path)?;
        let mut entries: Vec<DiffEntry> = path_weights(&folder)
            .into_iter()
            .map(|(path, bytes)| DiffEntry { path, bytes })
            .collect();
        entries.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.path.cmp(&b.path)));
        members.push(MemberContents {
            relative_path: member.relative_path.clone(),
            entries,
        });
    }
    let canonical = members.remove(0);
    Ok(GroupContents {
        group_id: group.group_id.clone(),
        canonical,
        duplicates: members,
    })
}
