//! Neighbour-graph dimensionality reduction in the style of UMAP.
//!
//! Exact k-nearest neighbours, smooth-kNN calibration, a symmetrised fuzzy
//! graph, then stochastic gradient descent with negative sampling on a
//! seeded random layout. Quadratic in the number of points, which is fine for
//! the few thousand items a map holds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use datamap_core::params::{DistanceMetric, ProjectionParams};
use datamap_core::{Error, Result};

const SMOOTH_K_TOLERANCE: f32 = 1e-5;
const MIN_K_DIST_SCALE: f32 = 1e-3;
const BINARY_SEARCH_STEPS: usize = 64;
const NEGATIVE_SAMPLE_RATE: usize = 5;
const REPULSION_STRENGTH: f32 = 1.0;
const GRAD_CLIP: f32 = 4.0;
/// Grid cells per axis in each refinement round of the curve fit.
const AB_GRID_STEPS: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct UmapParams {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub min_dist: f32,
    pub spread: f32,
    pub n_epochs: usize,
    pub learning_rate: f32,
    pub metric: DistanceMetric,
    pub random_state: u64,
}

impl UmapParams {
    pub fn from_projection(params: &ProjectionParams, n_components: usize) -> Self {
        Self {
            n_neighbors: params.n_neighbors,
            n_components,
            min_dist: params.min_dist,
            spread: 1.0,
            n_epochs: params.n_epochs,
            learning_rate: 1.0,
            metric: params.metric,
            random_state: params.random_state,
        }
    }
}

/// Called with (completed epochs, total epochs, flat embedding) every 10% of the run.
pub type ProgressFn<'a> = dyn FnMut(usize, usize, &[f32]) + 'a;

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                return 1.0;
            }
            (1.0 - dot / (na * nb)).max(0.0)
        }
    }
}

/// Exact kNN, excluding the point itself. Returns (indices, distances) per point, nearest first.
pub fn nearest_neighbors(data: &[Vec<f32>], k: usize, metric: DistanceMetric) -> (Vec<Vec<usize>>, Vec<Vec<f32>>) {
    let n = data.len();
    let mut indices = Vec::with_capacity(n);
    let mut dists = Vec::with_capacity(n);
    for i in 0..n {
        let mut row: Vec<(usize, f32)> = (0..n).filter(|&j| j != i).map(|j| (j, distance(metric, &data[i], &data[j]))).collect();
        row.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        row.truncate(k);
        indices.push(row.iter().map(|(j, _)| *j).collect());
        dists.push(row.iter().map(|(_, d)| *d).collect());
    }
    (indices, dists)
}

/// Per-point (sigma, rho) so that the fuzzy out-degree equals log2(k).
pub fn smooth_knn_dist(knn_dists: &[Vec<f32>], k: usize) -> (Vec<f32>, Vec<f32>) {
    let target = (k as f32).log2();
    let mean_all: f32 = {
        let all: Vec<f32> = knn_dists.iter().flatten().copied().collect();
        if all.is_empty() {
            0.0
        } else {
            all.iter().sum::<f32>() / all.len() as f32
        }
    };
    let mut sigmas = Vec::with_capacity(knn_dists.len());
    let mut rhos = Vec::with_capacity(knn_dists.len());
    for dists in knn_dists {
        let rho = dists.iter().copied().find(|d| *d > 0.0).unwrap_or(0.0);
        let (mut lo, mut hi, mut mid) = (0.0_f32, f32::INFINITY, 1.0_f32);
        for _ in 0..BINARY_SEARCH_STEPS {
            let psum: f32 = dists
                .iter()
                .map(|d| {
                    let d = d - rho;
                    if d > 0.0 {
                        (-d / mid).exp()
                    } else {
                        1.0
                    }
                })
                .sum();
            if (psum - target).abs() < SMOOTH_K_TOLERANCE {
                break;
            }
            if psum > target {
                hi = mid;
                mid = (lo + hi) / 2.0;
            } else {
                lo = mid;
                mid = if hi.is_infinite() {
                    mid * 2.0
                } else {
                    (lo + hi) / 2.0
                };
            }
        }
        let mean_i = if dists.is_empty() {
            0.0
        } else {
            dists.iter().sum::<f32>() / dists.len() as f32
        };
        let floor = if rho > 0.0 {
            MIN_K_DIST_SCALE * mean_i
        } else {
            MIN_K_DIST_SCALE * mean_all
        };
        sigmas.push(mid.max(floor).max(f32::MIN_POSITIVE));
        rhos.push(rho);
    }
    (sigmas, rhos)
}

/// Symmetric fuzzy graph as `(i, j) -> weight` with `i < j`, combined by the
/// probabilistic t-conorm `a + b - ab`.
pub fn fuzzy_graph(knn_indices: &[Vec<usize>], knn_dists: &[Vec<f32>], sigmas: &[f32], rhos: &[f32]) -> BTreeMap<(usize, usize), f32> {
    let mut directed: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for (i, (idx, dists)) in knn_indices.iter().zip(knn_dists).enumerate() {
        for (&j, &d) in idx.iter().zip(dists) {
            let w = if d - rhos[i] <= 0.0 {
                1.0
            } else {
                (-(d - rhos[i]) / sigmas[i]).exp()
            };
            directed.insert((i, j), w);
        }
    }
    let mut graph = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let key = (i.min(j), i.max(j));
        if graph.contains_key(&key) {
            continue;
        }
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        graph.insert(key, w + back - w * back);
    }
    graph
}

fn target_curve(x: f32, min_dist: f32, spread: f32) -> f32 {
    if x < min_dist {
        1.0
    } else {
        (-(x - min_dist) / spread).exp()
    }
}

/// Fit `1 / (1 + a x^(2b))` to the offset exponential defined by `min_dist`
/// and `spread` by least squares, refining a grid search around the best cell.
pub fn find_ab_params(spread: f32, min_dist: f32) -> (f32, f32) {
    let xs: Vec<f32> = (0..300).map(|i| i as f32 * 3.0 * spread / 299.0).collect();
    let ys: Vec<f32> = xs.iter().map(|&x| target_curve(x, min_dist, spread)).collect();
    let loss = |a: f32, b: f32| -> f32 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let f = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (f - y) * (f - y)
            })
            .sum()
    };
    let (mut log_a_lo, mut log_a_hi) = ((0.01_f32).ln(), (100.0_f32).ln());
    let (mut b_lo, mut b_hi) = (0.1_f32, 3.0_f32);
    let mut best = (1.0_f32, 1.0_f32, f32::INFINITY);
    for _ in 0..6 {
        for ia in 0..=AB_GRID_STEPS {
            let a = (log_a_lo + (log_a_hi - log_a_lo) * ia as f32 / AB_GRID_STEPS as f32).exp();
            for ib in 0..=AB_GRID_STEPS {
                let b = b_lo + (b_hi - b_lo) * ib as f32 / AB_GRID_STEPS as f32;
                let l = loss(a, b);
                if l < best.2 {
                    best = (a, b, l);
                }
            }
        }
        let a_step = (log_a_hi - log_a_lo) / AB_GRID_STEPS as f32;
        let b_step = (b_hi - b_lo) / AB_GRID_STEPS as f32;
        log_a_lo = best.0.ln() - 2.0 * a_step;
        log_a_hi = best.0.ln() + 2.0 * a_step;
        b_lo = (best.1 - 2.0 * b_step).max(0.01);
        b_hi = best.1 + 2.0 * b_step;
    }
    (best.0, best.1)
}

fn clip(v: f32) -> f32 {
    v.clamp(-GRAD_CLIP, GRAD_CLIP)
}

/// Reduce `data` to `params.n_components` dimensions. Output is row-major,
/// `n * n_components` values.
pub fn reduce(data: &[Vec<f32>], params: &UmapParams, progress: &mut ProgressFn<'_>) -> Result<Vec<f32>> {
    let n = data.len();
    let dim = params.n_components;
    if dim == 0 {
        return Err(Error::Validation("reducer needs at least one output dimension".into()));
    }
    if n < 2 {
        return Ok(vec![0.0; n * dim]);
    }
    let width = data[0].len();
    if data.iter().any(|v| v.len() != width) {
        return Err(Error::Validation("vectors passed to the reducer differ in length".into()));
    }
    if data.iter().flatten().any(|x| !x.is_finite()) {
        return Err(Error::Validation("non-finite value in reducer input".into()));
    }

    let k = params.n_neighbors.max(1).min(n - 1);
    let (knn_indices, knn_dists) = nearest_neighbors(data, k, params.metric);
    let (sigmas, rhos) = smooth_knn_dist(&knn_dists, k);
    let graph = fuzzy_graph(&knn_indices, &knn_dists, &sigmas, &rhos);
    let (a, b) = find_ab_params(params.spread, params.min_dist);

    let n_epochs = params.n_epochs.max(1);
    let max_w = graph.values().copied().fold(0.0_f32, f32::max);
    let edges: Vec<(usize, usize, f32)> = graph
        .iter()
        .filter(|(_, &w)| max_w > 0.0 && w >= max_w / n_epochs as f32)
        .map(|(&(i, j), &w)| (i, j, max_w / w))
        .collect();

    let mut rng = StdRng::seed_from_u64(params.random_state);
    let mut emb: Vec<f32> = (0..n * dim).map(|_| rng.gen_range(-10.0..10.0)).collect();

    let mut next_sample: Vec<f32> = edges.iter().map(|e| e.2).collect();
    let neg_every: Vec<f32> = edges.iter().map(|e| e.2 / NEGATIVE_SAMPLE_RATE as f32).collect();
    let mut next_negative: Vec<f32> = neg_every.clone();
    let report_every = (n_epochs / 10).max(1);

    for epoch in 0..n_epochs {
        let alpha = params.learning_rate * (1.0 - epoch as f32 / n_epochs as f32);
        let epoch_f = epoch as f32;
        for (e, &(head, tail, eps)) in edges.iter().enumerate() {
            if next_sample[e] > epoch_f {
                continue;
            }
            let dist_sq: f32 = (0..dim).map(|d| (emb[head * dim + d] - emb[tail * dim + d]).powi(2)).sum();
            if dist_sq > 0.0 {
                let coef = -2.0 * a * b * dist_sq.powf(b - 1.0) / (a * dist_sq.powf(b) + 1.0);
                for d in 0..dim {
                    let grad = clip(coef * (emb[head * dim + d] - emb[tail * dim + d])) * alpha;
                    emb[head * dim + d] += grad;
                    emb[tail * dim + d] -= grad;
                }
            }
            next_sample[e] += eps;

            let n_neg = ((epoch_f - next_negative[e]) / neg_every[e]).max(0.0) as usize;
            for _ in 0..n_neg {
                let other = rng.gen_range(0..n);
                if other == head {
                    continue;
                }
                let dist_sq: f32 = (0..dim).map(|d| (emb[head * dim + d] - emb[other * dim + d]).powi(2)).sum();
                let coef = if dist_sq > 0.0 {
                    2.0 * REPULSION_STRENGTH * b / ((0.001 + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                } else {
                    0.0
                };
                for d in 0..dim {
                    let grad = if coef > 0.0 {
                        clip(coef * (emb[head * dim + d] - emb[other * dim + d]))
                    } else {
                        GRAD_CLIP
                    };
                    emb[head * dim + d] += grad * alpha;
                }
            }
            next_negative[e] += n_neg as f32 * neg_every[e];
        }
        if (epoch + 1) % report_every == 0 {
            progress(epoch + 1, n_epochs, &emb);
        }
    }
    if emb.iter().any(|x| !x.is_finite()) {
        return Err(Error::Internal("reducer diverged".into()));
    }
    tracing::debug!(points = n, k, edges = edges.len(), a, b, "reduction finished");
    Ok(emb)
}
