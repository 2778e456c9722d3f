//! Cutting weak tails off ranked result sets.

use datamap_core::params::{AutocutStrategy, SearchParams};
use datamap_core::session::ScoreCurve;
use datamap_core::types::ResultSet;

/// Linear curves deviating less than this from the diagonal have no knee.
const KNEE_FLATNESS: f32 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct AutocutSettings {
    pub strategy: AutocutStrategy,
    pub min_results: usize,
    pub min_score: f32,
    pub max_relative_decline: f32,
}

impl From<&SearchParams> for AutocutSettings {
    fn from(params: &SearchParams) -> Self {
        Self {
            strategy: params.autocut_strategy,
            min_results: params.autocut_min_results,
            min_score: params.autocut_min_score,
            max_relative_decline: params.autocut_max_relative_decline,
        }
    }
}

/// Number of useful items and why the list was cut there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cutoff {
    pub count: usize,
    pub reason: String,
}

impl Cutoff {
    pub fn keep_all(len: usize) -> Self {
        Self { count: len, reason: "no cutoff".to_string() }
    }
}

/// Min-max normalize to `[0, 1]`. A constant list maps to all ones.
pub fn normalize(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

/// Find how many of the descending `scores` are worth keeping.
pub fn autocut(scores: &[f32], settings: &AutocutSettings) -> Cutoff {
    let len = scores.len();
    if len <= 1 || len <= settings.min_results {
        return Cutoff::keep_all(len);
    }
    if scores[0] < settings.min_score {
        return Cutoff { count: settings.min_results.min(len), reason: "top score below minimum score".into() };
    }
    let (count, reason) = match settings.strategy {
        AutocutStrategy::StaticThreshold => {
            let count = scores.iter().take_while(|s| **s >= settings.min_score).count();
            (count, format!("static threshold {}", settings.min_score))
        }
        AutocutStrategy::KneePoint => knee_point(scores),
        AutocutStrategy::NearestNeighbourDistanceRatio => relative_decline(scores, settings.max_relative_decline),
    };
    Cutoff { count: count.clamp(settings.min_results.min(len), len), reason }
}

fn knee_point(scores: &[f32]) -> (usize, String) {
    let n = scores.len();
    let normalized = normalize(scores);
    #[allow(clippy::cast_precision_loss)]
    let diff: Vec<f32> = normalized.iter().enumerate().map(|(i, s)| s - (1.0 - i as f32 / (n - 1) as f32)).collect();
    if diff.iter().all(|d| d.abs() < KNEE_FLATNESS) {
        return (n, "almost linear, no knee point".into());
    }
    if diff[n / 2] > 0.0 {
        let idx = diff.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).map_or(n - 1, |(i, _)| i);
        (idx + 1, format!("knee point at {idx}"))
    } else {
        let idx = diff.iter().enumerate().min_by(|a, b| a.1.total_cmp(b.1)).map_or(0, |(i, _)| i);
        (idx, format!("elbow point at {idx}"))
    }
}

fn relative_decline(scores: &[f32], max_relative_decline: f32) -> (usize, String) {
    let normalized = normalize(scores);
    #[allow(clippy::cast_precision_loss)]
    let max_step = max_relative_decline / (scores.len() - 1) as f32;
    match normalized.windows(2).position(|w| (w[0] - w[1]).abs() > max_step) {
        Some(idx) => (idx + 1, format!("decline above {max_step:.3} after item {idx}")),
        None => (scores.len(), "no steep decline".into()),
    }
}

/// Diagnostics of one set for the score-curve view.
pub fn score_curve(set: &ResultSet, cutoff: &Cutoff) -> Option<ScoreCurve> {
    let scores = set.scores();
    if scores.is_empty() {
        return None;
    }
    let len = scores.len();
    let (positive_examples, negative_examples) = if cutoff.count < len {
        let above = cutoff.count.saturating_sub(2)..cutoff.count;
        let below = cutoff.count..(cutoff.count + 2).min(len);
        (
            set.hits[above].iter().map(|h| h.key.clone()).collect(),
            set.hits[below].iter().map(|h| h.key.clone()).collect(),
        )
    } else {
        (Vec::new(), Vec::new())
    };
    Some(ScoreCurve {
        title: format!("{}, {}, {}", set.kind, set.field, set.query),
        normalized_scores: normalize(&scores),
        cutoff: cutoff.count,
        reason: cutoff.reason.clone(),
        max_score: scores.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        min_score: scores.iter().copied().fold(f32::INFINITY, f32::min),
        positive_examples,
        negative_examples,
    })
}
