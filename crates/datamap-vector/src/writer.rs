use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, Int32Array, RecordBatch, RecordBatchIterator, StringArray};
use lancedb::Connection;
use std::sync::Arc;

use datamap_core::traits::VectorPoint;
use datamap_core::{Error, Result};

use crate::engine_err;
use crate::schema::{build_points_schema, row_id};

const BATCH_ROWS: usize = 1000;

/// Flatten points into rows, one per vector. Every vector must match `dim`.
pub fn points_to_record_batch(points: &[VectorPoint], dim: usize) -> Result<RecordBatch> {
	let dim_i32 = i32::try_from(dim).map_err(|_| Error::Validation(format!("vector dimension {dim} is too large")))?;
	let mut row_ids = Vec::new(); let mut item_ids = Vec::new(); let mut sub_indices = Vec::new(); let mut payloads = Vec::new();
	let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::new();
	for point in points {
		let payload = serde_json::to_string(&point.payload)?;
		for (sub_index, vector) in point.vectors.iter().enumerate() {
			if vector.len() != dim {
				return Err(Error::Validation(format!("item {} has a {}-d vector, collection expects {dim}", point.item_id, vector.len())));
			}
			row_ids.push(row_id(&point.item_id, sub_index));
			item_ids.push(point.item_id.clone());
			sub_indices.push(i32::try_from(sub_index).map_err(engine_err)?);
			payloads.push(payload.clone());
			vectors.push(Some(vector.iter().map(|&x| Some(x)).collect()));
		}
	}
	RecordBatch::try_new(build_points_schema(dim_i32), vec![
		Arc::new(StringArray::from(row_ids)),
		Arc::new(StringArray::from(item_ids)),
		Arc::new(Int32Array::from(sub_indices)),
		Arc::new(StringArray::from(payloads)),
		Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors.into_iter(), dim_i32)),
	]).map_err(engine_err)
}

/// Append points to an existing collection table in batches of `BATCH_ROWS` points.
pub async fn insert_points(conn: &Connection, table_name: &str, points: &[VectorPoint], dim: usize) -> Result<usize> {
	let table = conn.open_table(table_name).execute().await.map_err(engine_err)?;
	let mut written = 0usize;
	for chunk in points.chunks(BATCH_ROWS) {
		let record_batch = points_to_record_batch(chunk, dim)?;
		if record_batch.num_rows() == 0 { continue; }
		written += record_batch.num_rows();
		let schema = record_batch.schema();
		let reader = Box::new(RecordBatchIterator::new(vec![Ok(record_batch)].into_iter(), schema));
		table.add(reader).execute().await.map_err(engine_err)?;
	}
	tracing::debug!(table = table_name, rows = written, "vectors appended");
	Ok(written)
}
