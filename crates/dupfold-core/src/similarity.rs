use crate::diff::identity_to_path;
use crate::error::Error;
use crate::model::{
    DivergenceRecord, FolderInfo, GroupInfo, GroupLabel, PairwiseSimilarity,
};
use crate::paths;
use crate::scanner::ScanCounters;
use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Components larger than this are broken up by greedy quasi-clique
/// expansion instead of being taken whole.
const MAX_WHOLE_COMPONENT: usize = 16;

/// Groups larger than this emit max-spanning edges plus the canonical's row
/// instead of the full pairwise matrix.
const FULL_MATRIX_LIMIT: usize = 8;

const DIVERGENCE_TOP_K: usize = 5;

/// Weighted Jaccard over two identity→weight maps, streaming the smaller
/// map so the union is never materialized. Two empty folders score 0.
pub fn weighted_jaccard(a: &AHashMap<String, u64>, b: &AHashMap<String, u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }

    let (smaller, larger) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    let mut intersection: u64 = 0;
    let mut union: u64 = 0;

    for (key, &wa) in smaller {
        match larger.get(key) {
            None => union += wa,
            Some(&wb) => {
                intersection += wa.min(wb);
                union += wa.max(wb);
            }
        }
    }
    for (key, &wb) in larger {
        if !smaller.contains_key(key) {
            union += wb;
        }
    }

    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn bucket_key(folder: &FolderInfo) -> (u32, u32) {
    (
        folder.total_bytes.max(1).ilog2(),
        folder.file_count.max(1).ilog2(),
    )
}

/// Cluster folders into similarity groups.
///
/// Pairwise comparison over all folders is avoided: candidates come from
/// log₂ size/count buckets (probing the +1 neighbor in each dimension, since
/// a ratio ≥ threshold pair can straddle one boundary) and must pass the
/// `min(total)/max(total) ≥ threshold` necessary condition before the
/// streaming intersection runs.
pub fn build_groups(
    folders: &[FolderInfo],
    threshold: f64,
    counters: &ScanCounters,
    cancel: &AtomicBool,
) -> Result<Vec<GroupInfo>, Error> {
    let eligible: Vec<usize> = folders
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.file_weights.is_empty())
        .map(|(i, _)| i)
        .collect();

    let mut buckets: AHashMap<(u32, u32), Vec<usize>> = AHashMap::new();
    for &idx in &eligible {
        buckets.entry(bucket_key(&folders[idx])).or_default().push(idx);
    }

    let candidates = candidate_pairs(folders, &buckets, threshold);
    counters
        .pairs_total
        .store(candidates.len() as u64, Ordering::Relaxed);
    debug!("{} candidate folder pairs", candidates.len());

    let edges: Vec<(usize, usize, f64)> = candidates
        .par_iter()
        .filter_map(|&(a, b)| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            counters.pairs_processed.fetch_add(1, Ordering::Relaxed);
            let similarity =
                weighted_jaccard(&folders[a].file_weights, &folders[b].file_weights);
            if similarity >= threshold {
                Some((a, b, similarity))
            } else {
                None
            }
        })
        .collect();

    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }

    let mut adjacency: AHashMap<usize, Vec<usize>> = AHashMap::new();
    let mut sims: AHashMap<(usize, usize), f64> = AHashMap::new();
    for &(a, b, similarity) in &edges {
        adjacency.entry(a).or_default().push(b);
        adjacency.entry(b).or_default().push(a);
        sims.insert(ordered(a, b), similarity);
    }

    let mut groups = Vec::new();
    for component in connected_components(&adjacency, folders) {
        let clusters = if component.len() > MAX_WHOLE_COMPONENT {
            split_large_component(&component, &adjacency, &sims, folders)
        } else {
            vec![component]
        };
        for cluster in clusters {
            if cluster.len() >= 2 {
                groups.push(build_group(&cluster, folders, &sims));
            }
        }
    }

    let mut surviving = suppress_descendants(groups);
    for (seq, group) in surviving.iter_mut().enumerate() {
        group.group_id = format!("g_{:06}", seq + 1);
    }

    info!(
        "Grouping complete: {} groups from {} folders",
        surviving.len(),
        eligible.len()
    );
    Ok(surviving)
}

fn ordered(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn candidate_pairs(
    folders: &[FolderInfo],
    buckets: &AHashMap<(u32, u32), Vec<usize>>,
    threshold: f64,
) -> Vec<(usize, usize)> {
    let mut seen: AHashSet<(usize, usize)> = AHashSet::new();

    let mut consider = |a: usize, b: usize| {
        let (a, b) = ordered(a, b);
        if a == b || seen.contains(&(a, b)) {
            return;
        }
        let (ta, tb) = (folders[a].total_bytes, folders[b].total_bytes);
        let (low, high) = (ta.min(tb), ta.max(tb));
        // Necessary condition: sim ≥ t requires the byte totals within ratio t.
        if high > 0 && (low as f64 / high as f64) < threshold {
            return;
        }
        if paths::is_strict_descendant(&folders[a].relative_path, &folders[b].relative_path)
            || paths::is_strict_descendant(&folders[b].relative_path, &folders[a].relative_path)
        {
            return;
        }
        seen.insert((a, b));
    };

    for (&(size_class, count_class), members) in buckets {
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                consider(members[i], members[j]);
            }
        }
        for neighbor in [
            (size_class + 1, count_class),
            (size_class, count_class + 1),
            (size_class + 1, count_class + 1),
        ] {
            if let Some(others) = buckets.get(&neighbor) {
                for &a in members {
                    for &b in others {
                        consider(a, b);
                    }
                }
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = seen.into_iter().collect();
    pairs.sort_unstable();
    pairs
}

fn connected_components(
    adjacency: &AHashMap<usize, Vec<usize>>,
    folders: &[FolderInfo],
) -> Vec<Vec<usize>> {
    let mut nodes: Vec<usize> = adjacency.keys().copied().collect();
    nodes.sort_by(|&a, &b| folders[a].relative_path.cmp(&folders[b].relative_path));

    let mut visited: AHashSet<usize> = AHashSet::new();
    let mut components = Vec::new();

    for start in nodes {
        if visited.contains(&start) {
            continue;
        }
        let mut stack = vec![start];
        let mut component = Vec::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            component.push(current);
            if let Some(neighbors) = adjacency.get(&current) {
                for &next in neighbors {
                    if !visited.contains(&next) {
                        stack.push(next);
                    }
                }
            }
        }
        component.sort_by(|&a, &b| folders[a].relative_path.cmp(&folders[b].relative_path));
        components.push(component);
    }
    components
}

/// Break a pathological transitive component into quasi-cliques: seed at the
/// highest-degree vertex, admit only vertices adjacent to every current
/// member, re-seed on the leftovers.
fn split_large_component(
    component: &[usize],
    adjacency: &AHashMap<usize, Vec<usize>>,
    sims: &AHashMap<(usize, usize), f64>,
    folders: &[FolderInfo],
) -> Vec<Vec<usize>> {
    let mut unassigned: AHashSet<usize> = component.iter().copied().collect();
    let mut clusters = Vec::new();

    while unassigned.len() >= 2 {
        let mut seeds: Vec<usize> = unassigned.iter().copied().collect();
        seeds.sort_by(|&a, &b| {
            let degree = |v: usize| {
                adjacency
                    .get(&v)
                    .map(|n| n.iter().filter(|x| unassigned.contains(x)).count())
                    .unwrap_or(0)
            };
            degree(b)
                .cmp(&degree(a))
                .then_with(|| folders[a].relative_path.cmp(&folders[b].relative_path))
        });
        let seed = seeds[0];

        let mut members = vec![seed];
        loop {
            let mut best: Option<(f64, usize)> = None;
            for &candidate in &seeds {
                if members.contains(&candidate) || !unassigned.contains(&candidate) {
                    continue;
                }
                let mut total = 0.0;
                let mut adjacent_to_all = true;
                for &member in &members {
                    match sims.get(&ordered(candidate, member)) {
                        Some(&s) => total += s,
                        None => {
                            adjacent_to_all = false;
                            break;
                        }
                    }
                }
                if !adjacent_to_all {
                    continue;
                }
                let average = total / members.len() as f64;
                let better = match best {
                    None => true,
                    Some((best_avg, best_idx)) => {
                        average > best_avg
                            || (average == best_avg
                                && folders[candidate].relative_path
                                    < folders[best_idx].relative_path)
                    }
                };
                if better {
                    best = Some((average, candidate));
                }
            }
            match best {
                Some((_, next)) => members.push(next),
                None => break,
            }
        }

        if members.len() >= 2 {
            for &member in &members {
                unassigned.remove(&member);
            }
            members.sort_by(|&a, &b| folders[a].relative_path.cmp(&folders[b].relative_path));
            clusters.push(members);
        } else {
            unassigned.remove(&seed);
        }
    }
    clusters
}

fn build_group(
    cluster: &[usize],
    folders: &[FolderInfo],
    sims: &AHashMap<(usize, usize), f64>,
) -> GroupInfo {
    // Canonical is the shallowest member, lexicographic tie-break; ordering
    // the whole cluster that way puts it first.
    let mut ordered_members: Vec<usize> = cluster.to_vec();
    ordered_members.sort_by(|&a, &b| {
        folders[a]
            .depth()
            .cmp(&folders[b].depth())
            .then_with(|| folders[a].relative_path.cmp(&folders[b].relative_path))
    });

    let first = &folders[ordered_members[0]];
    let identical = ordered_members.iter().all(|&idx| {
        let f = &folders[idx];
        f.fingerprint_hash == first.fingerprint_hash
            && f.total_bytes == first.total_bytes
            && f.file_count == first.file_count
    });
    let label = if identical {
        GroupLabel::Identical
    } else {
        GroupLabel::NearDuplicate
    };

    let sim_of = |x: usize, y: usize| {
        sims.get(&ordered(x, y)).copied().unwrap_or_else(|| {
            weighted_jaccard(&folders[x].file_weights, &folders[y].file_weights)
        })
    };

    let n = ordered_members.len();
    let mut pairwise = Vec::new();
    if n <= FULL_MATRIX_LIMIT {
        for i in 0..n {
            for j in (i + 1)..n {
                pairwise.push(PairwiseSimilarity {
                    a: i,
                    b: j,
                    similarity: sim_of(ordered_members[i], ordered_members[j]),
                });
            }
        }
    } else {
        // Canonical's row plus a maximum-spanning set over the known edges.
        let mut edge_set: AHashSet<(usize, usize)> = AHashSet::new();
        for j in 1..n {
            edge_set.insert((0, j));
        }
        for (a, b) in max_spanning_edges(&ordered_members, sims) {
            edge_set.insert(ordered(a, b));
        }
        let mut edges: Vec<(usize, usize)> = edge_set.into_iter().collect();
        edges.sort_unstable();
        for (i, j) in edges {
            pairwise.push(PairwiseSimilarity {
                a: i,
                b: j,
                similarity: sim_of(ordered_members[i], ordered_members[j]),
            });
        }
    }

    let divergences = if label == GroupLabel::Identical {
        Vec::new()
    } else {
        compute_divergences(
            &folders[ordered_members[0]],
            &folders[ordered_members[1]],
        )
    };

    GroupInfo {
        group_id: String::new(),
        label,
        canonical_index: 0,
        members: ordered_members
            .iter()
            .map(|&idx| folders[idx].summary())
            .collect(),
        pairwise_similarity: pairwise,
        divergences,
        suppressed_descendants: false,
    }
}

/// Kruskal over known edges, similarity-descending: local member indices.
fn max_spanning_edges(
    members: &[usize],
    sims: &AHashMap<(usize, usize), f64>,
) -> Vec<(usize, usize)> {
    let mut edges: Vec<(f64, usize, usize)> = Vec::new();
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            if let Some(&s) = sims.get(&ordered(members[i], members[j])) {
                edges.push((s, i, j));
            }
        }
    }
    edges.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then((a.1, a.2).cmp(&(b.1, b.2))));

    let mut parent: Vec<usize> = (0..members.len()).collect();
    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }

    let mut spanning = Vec::new();
    for (_, i, j) in edges {
        let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
        if ri != rj {
            parent[ri] = rj;
            spanning.push((i, j));
        }
    }
    spanning
}

/// Top byte deltas between the canonical and the second member.
fn compute_divergences(left: &FolderInfo, right: &FolderInfo) -> Vec<DivergenceRecord> {
    let mut deltas: Vec<(String, u64)> = Vec::new();
    for (identity, &wl) in &left.file_weights {
        let wr = right.file_weights.get(identity).copied().unwrap_or(0);
        if wl != wr {
            deltas.push((identity.clone(), wl.abs_diff(wr)));
        }
    }
    for (identity, &wr) in &right.file_weights {
        if !left.file_weights.contains_key(identity) {
            deltas.push((identity.clone(), wr));
        }
    }
    deltas.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    deltas
        .into_iter()
        .take(DIVERGENCE_TOP_K)
        .map(|(identity, delta_bytes)| DivergenceRecord {
            path: identity_to_path(&identity).to_string(),
            delta_bytes,
        })
        .collect()
}

/// Hide a group once an already-accepted shallower group covers it: every
/// member must strictly descend from some member of the accepted group.
/// Suppression crosses labels.
fn suppress_descendants(mut groups: Vec<GroupInfo>) -> Vec<GroupInfo> {
    groups.sort_by(|a, b| {
        a.canonical()
            .depth()
            .cmp(&b.canonical().depth())
            .then_with(|| a.canonical().relative_path.cmp(&b.canonical().relative_path))
    });

    let mut kept: Vec<GroupInfo> = Vec::new();
    for group in groups {
        let mut suppressed_by = None;
        for (idx, accepted) in kept.iter().enumerate() {
            let covered = group.members.iter().all(|member| {
                accepted.members.iter().any(|ancestor| {
                    paths::is_strict_descendant(
                        &member.relative_path,
                        &ancestor.relative_path,
                    )
                })
            });
            if covered {
                suppressed_by = Some(idx);
                break;
            }
        }
        match suppressed_by {
            Some(idx) => kept[idx].suppressed_descendants = true,
            None => kept.push(group),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepresentativeFile;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    fn weights(entries: &[(&str, u64)]) -> AHashMap<String, u64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn folder(rel: &str, entries: &[(&str, u64)]) -> FolderInfo {
        let file_weights = weights(entries);
        let total_bytes = file_weights.values().sum();
        let file_count = file_weights.len() as u64;
        let fingerprint_hash = crate::aggregate::fingerprint_hash(&file_weights);
        FolderInfo {
            path: PathBuf::from("/r").join(rel),
            relative_path: rel.to_string(),
            total_bytes,
            file_count,
            file_weights,
            fingerprint_hash,
            unstable: false,
            representative: Some(RepresentativeFile {
                relative_path: "f".into(),
                size: 1,
                mtime_ns: 0,
            }),
        }
    }

    fn group(folders: &[FolderInfo], threshold: f64) -> Vec<GroupInfo> {
        let counters = ScanCounters::new();
        let cancel = AtomicBool::new(false);
        build_groups(folders, threshold, &counters, &cancel).unwrap()
    }

    #[test]
    fn jaccard_is_commutative_and_reflexive() {
        let a = weights(&[("x:1", 10), ("y:2", 20)]);
        let b = weights(&[("x:1", 10), ("z:3", 5)]);
        assert_eq!(weighted_jaccard(&a, &b), weighted_jaccard(&b, &a));
        assert_eq!(weighted_jaccard(&a, &a), 1.0);
    }

    #[test]
    fn jaccard_of_two_empty_maps_is_zero() {
        let empty = AHashMap::new();
        assert_eq!(weighted_jaccard(&empty, &empty), 0.0);
    }

    #[test]
    fn jaccard_uses_min_over_max_weights() {
        let a = weights(&[("f:0", 1024)]);
        let b = weights(&[("f:0", 1024), ("extra:0", 512)]);
        let sim = weighted_jaccard(&a, &b);
        assert!((sim - 1024.0 / 1536.0).abs() < 1e-12);
    }

    #[test]
    fn identical_folders_form_identical_group() {
        let folders = vec![
            folder("left", &[("f.txt:4", 4)]),
            folder("right", &[("f.txt:4", 4)]),
            folder("other", &[("g.txt:9000", 9000)]),
        ];
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label, GroupLabel::Identical);
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(groups[0].group_id, "g_000001");
        assert!(groups[0].divergences.is_empty());
    }

    #[test]
    fn near_duplicates_straddling_a_count_bucket_are_found() {
        // 1 file vs 2 files: different log2 count classes; the +1 probe
        // must still generate the candidate.
        let folders = vec![
            folder("a", &[("f:1024", 1024)]),
            folder("b", &[("f:1024", 1024), ("extra:128", 128)]),
        ];
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label, GroupLabel::NearDuplicate);
        assert!(!groups[0].divergences.is_empty());
        assert_eq!(groups[0].divergences[0].path, "extra");
    }

    #[test]
    fn byte_ratio_prunes_before_jaccard() {
        let folders = vec![
            folder("a", &[("f:10", 10)]),
            folder("b", &[("f:10", 10), ("huge:10000", 10_000)]),
        ];
        assert!(group(&folders, 0.8).is_empty());
    }

    #[test]
    fn ancestor_descendant_pairs_never_group() {
        let folders = vec![
            folder(".", &[("x/f:8", 8)]),
            folder("x", &[("f:8", 8)]),
        ];
        // Same total bytes, would be a candidate if not related.
        assert!(group(&folders, 0.8).is_empty());
    }

    #[test]
    fn canonical_is_shallowest_then_lexicographic() {
        let folders = vec![
            folder("b/nested/x", &[("f:1", 1)]),
            folder("x", &[("f:1", 1)]),
            folder("a/x", &[("f:1", 1)]),
        ];
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical().relative_path, "x");
        assert_eq!(groups[0].canonical_index, 0);
        let rels: Vec<&str> = groups[0]
            .members
            .iter()
            .map(|m| m.relative_path.as_str())
            .collect();
        assert_eq!(rels, vec!["x", "a/x", "b/nested/x"]);
    }

    #[test]
    fn parent_group_suppresses_child_groups() {
        let folders = vec![
            folder("x", &[("a/f1:4", 4), ("b/f2:4", 4)]),
            folder("y", &[("a/f1:4", 4), ("b/f2:4", 4)]),
            folder("x/a", &[("f1:4", 4)]),
            folder("y/a", &[("f1:4", 4)]),
            folder("x/b", &[("f2:4", 4)]),
            folder("y/b", &[("f2:4", 4)]),
        ];
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 1);
        let rels: Vec<&str> = groups[0]
            .members
            .iter()
            .map(|m| m.relative_path.as_str())
            .collect();
        assert_eq!(rels, vec!["x", "y"]);
        assert!(groups[0].suppressed_descendants);
    }

    #[test]
    fn partial_suppression_keeps_groups_with_outside_members() {
        // z/a is not under x or y, so {x/a, y/a, z/a} must survive.
        let folders = vec![
            folder("x", &[("a/f1:4", 4), ("b/f2:4", 4)]),
            folder("y", &[("a/f1:4", 4), ("b/f2:4", 4)]),
            folder("x/a", &[("f1:4", 4)]),
            folder("y/a", &[("f1:4", 4)]),
            folder("z/a", &[("f1:4", 4)]),
        ];
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 2);
        let survivor = groups
            .iter()
            .find(|g| g.members.iter().any(|m| m.relative_path == "z/a"))
            .unwrap();
        assert_eq!(survivor.members.len(), 3);
    }

    #[test]
    fn pairwise_edges_meet_threshold() {
        let folders = vec![
            folder("a", &[("f:100", 100)]),
            folder("b", &[("f:100", 100)]),
            folder("c", &[("f:100", 100), ("g:10", 10)]),
        ];
        let groups = group(&folders, 0.8);
        for g in &groups {
            for pair in &g.pairwise_similarity {
                assert!(pair.similarity >= 0.8);
                assert!(pair.a < pair.b);
            }
        }
    }

    #[test]
    fn large_group_emits_sparse_edges() {
        let folders: Vec<FolderInfo> = (0..12)
            .map(|i| folder(&format!("copy_{i:02}"), &[("f:64", 64)]))
            .collect();
        let groups = group(&folders, 0.8);
        assert_eq!(groups.len(), 1);
        let n = groups[0].members.len();
        assert_eq!(n, 12);
        let full = n * (n - 1) / 2;
        assert!(groups[0].pairwise_similarity.len() < full);
        // Canonical row is always present.
        for j in 1..n {
            assert!(groups[0]
                .pairwise_similarity
                .iter()
                .any(|p| p.a == 0 && p.b == j));
        }
    }
}
