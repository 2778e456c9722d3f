//! Reciprocal-rank fusion of ranked result sets.

use std::collections::HashMap;

use datamap_core::types::{FusedItem, ItemKey, Origin, OriginKind, ResultSet};

pub const FUSION_FIELD: &str = "reciprocal_rank_score";

/// Union `sets` by item identity and rank the union.
///
/// Origins are concatenated in set order. When more than one non-empty set
/// contributes the final score is `sqrt(sum(1/rank))`, otherwise the native
/// score of the single set is kept. The output is sorted best first with ties in
/// first-seen order, cut to `limit`, and every item gets a trailing
/// reciprocal-rank origin carrying its fused rank.
pub fn fuse(sets: &[ResultSet], limit: usize) -> Vec<FusedItem> {
    let mut position: HashMap<ItemKey, usize> = HashMap::new();
    let mut merged: Vec<FusedItem> = Vec::new();
    for set in sets {
        for hit in &set.hits {
            match position.get(&hit.key) {
                Some(&idx) => {
                    let existing = &mut merged[idx].hit;
                    existing.origins.extend(hit.origins.iter().cloned());
                    if existing.highlights.is_none() {
                        existing.highlights.clone_from(&hit.highlights);
                    }
                    existing.relevant_parts.extend(hit.relevant_parts.iter().cloned());
                }
                None => {
                    position.insert(hit.key.clone(), merged.len());
                    merged.push(FusedItem { hit: hit.clone(), reciprocal_rank_score: 0.0, score: 0.0 });
                }
            }
        }
    }

    let combined = sets.iter().filter(|s| !s.is_empty()).count() > 1;
    for item in &mut merged {
        #[allow(clippy::cast_precision_loss)]
        let rrf: f32 = item.hit.origins.iter().filter(|o| o.rank > 0).map(|o| 1.0 / o.rank as f32).sum();
        item.reciprocal_rank_score = rrf;
        item.score = if combined { rrf.sqrt() } else { item.hit.origins.first().map_or(0.0, |o| o.score) };
    }

    // stable: equal scores keep first-seen order
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(limit);
    for (idx, item) in merged.iter_mut().enumerate() {
        item.hit.origins.push(Origin {
            kind: OriginKind::ReciprocalRank,
            field: FUSION_FIELD.to_string(),
            query: String::new(),
            score: item.reciprocal_rank_score,
            rank: idx + 1,
        });
    }
    tracing::debug!(sets = sets.len(), fused = merged.len(), "rank fusion");
    merged
}

/// Interleave per-dataset lists round-robin, keeping at most `limit` items.
pub fn interleave(lists: Vec<Vec<FusedItem>>, limit: usize) -> Vec<FusedItem> {
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut out = Vec::new();
    while out.len() < limit {
        let mut progressed = false;
        for it in &mut iters {
            if out.len() == limit {
                break;
            }
            if let Some(item) = it.next() {
                out.push(item);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}
