use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, StringArray};
use std::collections::{BTreeMap, HashMap};

use datamap_core::traits::VectorQuery;
use datamap_core::types::{EngineHit, RelevantPart};
use datamap_core::{Error, Result};

use crate::schema::{ITEM_ID, PAYLOAD, SUB_INDEX, VECTOR};

/// A decoded row. `score` is set for rows coming out of a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
	pub item_id: String,
	pub sub_index: usize,
	pub payload: BTreeMap<String, String>,
	pub vector: Vec<f32>,
	pub score: Option<f32>,
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<T>())
		.ok_or_else(|| Error::upstream("lancedb", format!("{name} column missing")))
}

pub fn decode_rows(batch: &RecordBatch) -> Result<Vec<StoredRow>> {
	let ids = column::<StringArray>(batch, ITEM_ID)?;
	let subs = column::<Int32Array>(batch, SUB_INDEX)?;
	let payloads = column::<StringArray>(batch, PAYLOAD)?;
	let vectors = batch.column_by_name(VECTOR).and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());
	// cosine distance, 1 - cos
	let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());

	let mut rows = Vec::with_capacity(batch.num_rows());
	for i in 0..batch.num_rows() {
		let vector = match vectors {
			Some(fsl) if fsl.is_valid(i) => {
				let inner = fsl.value(i);
				inner.as_primitive::<Float32Type>().values().to_vec()
			}
			_ => Vec::new(),
		};
		rows.push(StoredRow {
			item_id: ids.value(i).to_string(),
			sub_index: usize::try_from(subs.value(i)).unwrap_or_default(),
			payload: serde_json::from_str(payloads.value(i)).unwrap_or_default(),
			vector,
			score: distances.map(|d| 1.0 - d.value(i)),
		});
	}
	Ok(rows)
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
	let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
	let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
	let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
	if na == 0.0 || nb == 0.0 {
		return 0.0;
	}
	dot / (na * nb)
}

/// Payload filters, per-item grouping (best sub-vector wins), threshold, then paging.
///
/// `rows` are expected best first, as returned by the nearest-neighbour search.
pub fn group_hits(rows: Vec<StoredRow>, query: &VectorQuery) -> Vec<EngineHit> {
	let mut position: HashMap<String, usize> = HashMap::new();
	let mut grouped: Vec<(String, f32, Vec<RelevantPart>)> = Vec::new();
	for row in rows {
		if !query.filters.iter().all(|f| row.payload.get(&f.field) == Some(&f.value)) {
			continue;
		}
		let score = row.score.unwrap_or_else(|| cosine(&query.vector, &row.vector));
		let part = RelevantPart { field: query.field.clone(), index: row.sub_index, score };
		match position.get(&row.item_id) {
			Some(&idx) => {
				let entry = &mut grouped[idx];
				entry.1 = entry.1.max(score);
				entry.2.push(part);
			}
			None => {
				position.insert(row.item_id.clone(), grouped.len());
				grouped.push((row.item_id, score, vec![part]));
			}
		}
	}

	let mut hits: Vec<EngineHit> = grouped
		.into_iter()
		.filter(|(_, best, _)| query.score_threshold.map_or(true, |t| *best >= t))
		.map(|(id, score, mut parts)| {
			parts.sort_by(|a, b| b.score.total_cmp(&a.score));
			let relevant_parts = if query.group_sub_items { parts } else { Vec::new() };
			EngineHit { id, score, highlights: None, relevant_parts }
		})
		.collect();
	hits.sort_by(|a, b| b.score.total_cmp(&a.score));
	hits.into_iter().skip(query.offset).take(query.limit).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use datamap_core::params::Filter;

	fn row(id: &str, sub: usize, score: f32, venue: &str) -> StoredRow {
		StoredRow {
			item_id: id.into(),
			sub_index: sub,
			payload: BTreeMap::from([("venue".to_string(), venue.to_string())]),
			vector: Vec::new(),
			score: Some(score),
		}
	}

	fn query() -> VectorQuery {
		VectorQuery {
			dataset_id: 1,
			field: "chunks".into(),
			vector: vec![1.0, 0.0],
			limit: 10,
			offset: 0,
			score_threshold: None,
			filters: Vec::new(),
			group_sub_items: true,
		}
	}

	#[test]
	fn sub_vectors_collapse_onto_their_parent() {
		let rows = vec![row("a", 2, 0.9, "x"), row("b", 0, 0.8, "x"), row("a", 0, 0.5, "x")];
		let hits = group_hits(rows, &query());
		assert_eq!(hits.len(), 2);
		assert_eq!(hits[0].id, "a");
		assert_eq!(hits[0].score, 0.9);
		let parts: Vec<usize> = hits[0].relevant_parts.iter().map(|p| p.index).collect();
		assert_eq!(parts, vec![2, 0]);
	}

	#[test]
	fn filters_threshold_and_paging() {
		let rows = vec![row("a", 0, 0.9, "x"), row("b", 0, 0.8, "y"), row("c", 0, 0.7, "x"), row("d", 0, 0.2, "x")];
		let mut q = query();
		q.filters = vec![Filter { field: "venue".into(), value: "x".into() }];
		q.score_threshold = Some(0.5);
		q.offset = 1;
		let hits = group_hits(rows, &q);
		assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["c"]);
	}

	#[test]
	fn cosine_of_zero_vector_is_zero() {
		assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
		assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
	}
}
