//! Density clustering in the style of HDBSCAN.
//!
//! Mutual reachability distances, a minimum spanning tree, the single-linkage
//! hierarchy, a condensed tree pruned at `min_cluster_size`, and cluster
//! selection by excess of mass (or leaves). Labels are contiguous from 0,
//! noise is -1.

use std::collections::{BTreeMap, BTreeSet};

use datamap_core::params::ClusterizerParams;

/// Below this many points every point is noise.
pub const MIN_POINTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdbscanParams {
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    pub min_samples: usize,
    pub leaf_mode: bool,
}

impl HdbscanParams {
    /// Defaults scale with the point count: `max(3, n/50)` and `n/2`.
    /// `min_samples` never exceeds `min_cluster_size`, otherwise core
    /// distances of a smallest allowed cluster reach into its neighbours.
    pub fn for_points(n: usize, params: &ClusterizerParams) -> Self {
        let min_cluster_size = params.min_cluster_size.filter(|s| *s > 0).unwrap_or_else(|| (n / 50).max(3));
        Self {
            min_cluster_size,
            max_cluster_size: params.max_cluster_size.filter(|s| *s > 0).unwrap_or(n / 2),
            min_samples: params.min_samples.min(min_cluster_size).max(1),
            leaf_mode: params.leaf_mode,
        }
    }
}

fn dist(a: &[f32; 2], b: &[f32; 2]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Distance to the `min_samples`-th nearest point, the point itself included.
fn core_distances(points: &[[f32; 2]], min_samples: usize) -> Vec<f32> {
    let k = min_samples.min(points.len()).max(1);
    points
        .iter()
        .map(|p| {
            let mut d: Vec<f32> = points.iter().map(|q| dist(p, q)).collect();
            d.sort_by(f32::total_cmp);
            d[k - 1]
        })
        .collect()
}

/// Prim's algorithm over the dense mutual reachability graph. Edges sorted by weight.
fn mst(points: &[[f32; 2]], core: &[f32]) -> Vec<(usize, usize, f32)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f32::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));
    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let mr = dist(&points[current], &points[j]).max(core[current]).max(core[j]);
            if mr < best[j] {
                best[j] = mr;
                from[j] = current;
            }
        }
        let Some(next) = (0..n).filter(|&j| !in_tree[j]).min_by(|&a, &b| best[a].total_cmp(&best[b]).then(a.cmp(&b))) else {
            break;
        };
        in_tree[next] = true;
        edges.push((from[next], next, best[next]));
        current = next;
    }
    edges.sort_by(|a, b| a.2.total_cmp(&b.2));
    edges
}

struct Merge {
    left: usize,
    right: usize,
    distance: f32,
    size: usize,
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Single-linkage dendrogram. Node ids `0..n` are points, `n + i` is merge `i`.
fn single_linkage(n: usize, edges: &[(usize, usize, f32)]) -> Vec<Merge> {
    let mut parent: Vec<usize> = (0..2 * n).collect();
    let mut size = vec![1usize; 2 * n];
    let mut merges = Vec::with_capacity(n.saturating_sub(1));
    for &(a, b, w) in edges {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra == rb {
            continue;
        }
        let node = n + merges.len();
        parent[ra] = node;
        parent[rb] = node;
        size[node] = size[ra] + size[rb];
        merges.push(Merge { left: ra, right: rb, distance: w, size: size[node] });
    }
    merges
}

/// Condensed tree row: `child` is a cluster label (>= n) or a point (< n).
#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f32,
    size: usize,
}

fn node_size(n: usize, merges: &[Merge], node: usize) -> usize {
    if node < n { 1 } else { merges[node - n].size }
}

fn leaves(n: usize, merges: &[Merge], node: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(x) = stack.pop() {
        if x < n {
            out.push(x);
        } else {
            let m = &merges[x - n];
            stack.push(m.left);
            stack.push(m.right);
        }
    }
    out
}

fn condense(n: usize, merges: &[Merge], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let root = n + merges.len() - 1;
    let mut label_of: BTreeMap<usize, usize> = BTreeMap::from([(root, n)]);
    let mut next_label = n + 1;
    let mut tree = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node < n {
            continue;
        }
        let m = &merges[node - n];
        let parent = label_of[&node];
        let lambda = if m.distance > 0.0 { 1.0 / m.distance } else { f32::INFINITY };
        let (ls, rs) = (node_size(n, merges, m.left), node_size(n, merges, m.right));
        match (ls >= min_cluster_size, rs >= min_cluster_size) {
            (true, true) => {
                for (child, size) in [(m.left, ls), (m.right, rs)] {
                    label_of.insert(child, next_label);
                    tree.push(CondensedEdge { parent, child: next_label, lambda, size });
                    next_label += 1;
                    stack.push(child);
                }
            }
            (false, false) => {
                for p in leaves(n, merges, m.left).into_iter().chain(leaves(n, merges, m.right)) {
                    tree.push(CondensedEdge { parent, child: p, lambda, size: 1 });
                }
            }
            (true, false) | (false, true) => {
                let (keep, drop) = if ls >= min_cluster_size { (m.left, m.right) } else { (m.right, m.left) };
                for p in leaves(n, merges, drop) {
                    tree.push(CondensedEdge { parent, child: p, lambda, size: 1 });
                }
                if keep < n {
                    tree.push(CondensedEdge { parent, child: keep, lambda, size: 1 });
                } else {
                    label_of.insert(keep, parent);
                    stack.push(keep);
                }
            }
        }
    }
    tree
}

fn stabilities(n: usize, tree: &[CondensedEdge]) -> BTreeMap<usize, f32> {
    let mut birth: BTreeMap<usize, f32> = BTreeMap::from([(n, 0.0)]);
    for e in tree.iter().filter(|e| e.child >= n) {
        birth.insert(e.child, e.lambda);
    }
    let mut stability: BTreeMap<usize, f32> = birth.keys().map(|&c| (c, 0.0)).collect();
    for e in tree {
        let born = birth.get(&e.parent).copied().unwrap_or(0.0);
        let lambda = if e.lambda.is_finite() { e.lambda } else { born };
        *stability.entry(e.parent).or_default() += (lambda - born) * e.size as f32;
    }
    stability
}

fn select_clusters(n: usize, tree: &[CondensedEdge], params: &HdbscanParams) -> BTreeSet<usize> {
    let mut children: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
    for e in tree.iter().filter(|e| e.child >= n) {
        children.entry(e.parent).or_default().push(e.child);
        sizes.insert(e.child, e.size);
    }
    // the root is never a candidate
    let candidates: Vec<usize> = sizes.keys().copied().collect();

    if params.leaf_mode {
        return candidates
            .into_iter()
            .filter(|c| !children.contains_key(c) && sizes[c] <= params.max_cluster_size)
            .collect();
    }

    let mut stability = stabilities(n, tree);
    let mut selected: BTreeSet<usize> = BTreeSet::new();
    // children carry larger labels than their parents
    for &c in candidates.iter().rev() {
        let subtree: f32 = children.get(&c).map_or(0.0, |kids| kids.iter().map(|k| stability.get(k).copied().unwrap_or(0.0)).sum());
        let own = stability.get(&c).copied().unwrap_or(0.0);
        if sizes[&c] > params.max_cluster_size || subtree > own {
            stability.insert(c, subtree);
        } else {
            let mut stack: Vec<usize> = children.get(&c).cloned().unwrap_or_default();
            while let Some(d) = stack.pop() {
                selected.remove(&d);
                if let Some(kids) = children.get(&d) {
                    stack.extend(kids);
                }
            }
            selected.insert(c);
        }
    }
    selected
}

/// Cluster 2-D points. Degenerate input (too few points, non-finite values)
/// yields all noise rather than an error.
pub fn cluster(points: &[[f32; 2]], params: &HdbscanParams) -> Vec<i32> {
    let n = points.len();
    let mut labels = vec![-1; n];
    if n < MIN_POINTS || points.iter().flatten().any(|x| !x.is_finite()) {
        return labels;
    }
    let core = core_distances(points, params.min_samples);
    let edges = mst(points, &core);
    let merges = single_linkage(n, &edges);
    if merges.len() != n - 1 {
        return labels;
    }
    let tree = condense(n, &merges, params.min_cluster_size.max(2));
    let selected = select_clusters(n, &tree, params);

    let parent_of: BTreeMap<usize, usize> = tree.iter().map(|e| (e.child, e.parent)).collect();
    let contiguous: BTreeMap<usize, i32> = selected.iter().enumerate().map(|(i, &c)| (c, i as i32)).collect();
    for (point, label) in labels.iter_mut().enumerate() {
        let mut node = parent_of.get(&point).copied();
        while let Some(c) = node {
            if let Some(&l) = contiguous.get(&c) {
                *label = l;
                break;
            }
            node = parent_of.get(&c).copied();
        }
    }
    tracing::debug!(points = n, clusters = contiguous.len(), "clustering finished");
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scale_with_n() {
        let p = HdbscanParams::for_points(1000, &ClusterizerParams::default());
        assert_eq!(p.min_cluster_size, 20);
        assert_eq!(p.max_cluster_size, 500);
        let small = HdbscanParams::for_points(10, &ClusterizerParams::default());
        assert_eq!(small.min_cluster_size, 3);
        assert_eq!(small.min_samples, 3);
        assert_eq!(p.min_samples, 5);
    }

    #[test]
    fn single_linkage_merges_everything() {
        let points = [[0.0, 0.0], [1.0, 0.0], [5.0, 0.0], [6.0, 0.0]];
        let core = core_distances(&points, 1);
        assert_eq!(core, vec![0.0; 4]);
        let merges = single_linkage(4, &mst(&points, &core));
        assert_eq!(merges.len(), 3);
        assert_eq!(merges[2].size, 4);
        assert!((merges[2].distance - 4.0).abs() < 1e-6);
    }
}
