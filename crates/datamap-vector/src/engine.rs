use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use datamap_core::traits::{CollectionSpec, VectorEngine, VectorPoint, VectorQuery};
use datamap_core::types::{DatasetId, EngineHit, FieldValue, ItemId, RelevantPart};
use datamap_core::{Error, Result};

use crate::engine_err;
use crate::index_build::{build_ivfpq_index, compute_ivfpq_params, has_vector_index, MIN_ROWS_FOR_PQ};
use crate::schema::{build_points_schema, ITEM_ID, VECTOR};
use crate::search::{cosine, decode_rows, group_hits, StoredRow};
use crate::table::{collection_table, ensure_table, get_meta, item_predicate, open_db, set_meta, table_exists};
use crate::writer::insert_points;

/// Candidate multiplier when grouping or payload filters can drop rows.
const OVERFETCH: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CollectionMeta {
	dim: usize,
	quantized: bool,
	payload_fields: Vec<String>,
}

fn meta_key(table_name: &str) -> String {
	format!("collection:{table_name}")
}

/// LanceDB database holding one table per (dataset, vector field).
pub struct LanceVectorEngine {
	conn: Connection,
	collections: RwLock<HashMap<String, CollectionMeta>>,
}

impl LanceVectorEngine {
	pub async fn open(uri: &str) -> Result<Self> {
		let conn = open_db(uri).await?;
		Ok(Self { conn, collections: RwLock::new(HashMap::new()) })
	}

	pub async fn open_path(path: &Path) -> Result<Self> {
		std::fs::create_dir_all(path).map_err(|e| Error::InvalidConfig(format!("creating {}: {e}", path.display())))?;
		Self::open(path.to_string_lossy().as_ref()).await
	}

	async fn collection(&self, table_name: &str) -> Result<Option<CollectionMeta>> {
		let cached = self.collections.read().get(table_name).cloned();
		if cached.is_some() {
			return Ok(cached);
		}
		let Some(raw) = get_meta(&self.conn, &meta_key(table_name)).await? else {
			return Ok(None);
		};
		let meta: CollectionMeta = serde_json::from_str(&raw)?;
		self.collections.write().insert(table_name.to_string(), meta.clone());
		Ok(Some(meta))
	}

	async fn require_collection(&self, dataset_id: DatasetId, field: &str) -> Result<(String, CollectionMeta)> {
		let name = collection_table(dataset_id, field);
		match self.collection(&name).await? {
			Some(meta) if table_exists(&self.conn, &name).await? => Ok((name, meta)),
			_ => Err(Error::NotFound(format!("vector collection {dataset_id}/{field}"))),
		}
	}

	async fn rows_for_items(&self, table_name: &str, ids: &[ItemId]) -> Result<Vec<StoredRow>> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}
		let table = self.conn.open_table(table_name).execute().await.map_err(engine_err)?;
		let mut stream = table.query().only_if(item_predicate(ITEM_ID, ids)).execute().await.map_err(engine_err)?;
		let mut rows = Vec::new();
		while let Some(batch) = stream.try_next().await.map_err(engine_err)? {
			rows.extend(decode_rows(&batch)?);
		}
		rows.sort_by_key(|r| r.sub_index);
		Ok(rows)
	}

	async fn maybe_build_index(&self, table_name: &str, meta: &CollectionMeta) -> Result<()> {
		if !meta.quantized {
			return Ok(());
		}
		let table = self.conn.open_table(table_name).execute().await.map_err(engine_err)?;
		let total = table.count_rows(None).await.map_err(engine_err)?;
		if total < MIN_ROWS_FOR_PQ || has_vector_index(&self.conn, table_name).await? {
			return Ok(());
		}
		build_ivfpq_index(&self.conn, table_name, &compute_ivfpq_params(total, meta.dim)).await
	}
}

#[async_trait]
impl VectorEngine for LanceVectorEngine {
	async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
		if spec.dim == 0 {
			return Err(Error::Validation(format!("collection {}/{} needs a dimension", spec.dataset_id, spec.field)));
		}
		let name = collection_table(spec.dataset_id, &spec.field);
		if let Some(existing) = self.collection(&name).await? {
			if existing.dim != spec.dim {
				return Err(Error::Validation(format!("collection {name} has dimension {}, requested {}", existing.dim, spec.dim)));
			}
		}
		let dim = i32::try_from(spec.dim).map_err(engine_err)?;
		ensure_table(&self.conn, &name, build_points_schema(dim)).await?;
		let meta = CollectionMeta { dim: spec.dim, quantized: spec.quantized, payload_fields: spec.payload_fields.clone() };
		set_meta(&self.conn, &meta_key(&name), &serde_json::to_string(&meta)?).await?;
		self.collections.write().insert(name.clone(), meta);
		tracing::debug!(table = %name, dim = spec.dim, quantized = spec.quantized, "vector collection ready");
		Ok(())
	}

	async fn upsert(&self, dataset_id: DatasetId, field: &str, points: &[VectorPoint]) -> Result<()> {
		let (name, meta) = self.require_collection(dataset_id, field).await?;
		if points.is_empty() {
			return Ok(());
		}
		// stale sub-vectors of shrunk arrays go too
		let ids: Vec<ItemId> = points.iter().map(|p| p.item_id.clone()).collect();
		let table = self.conn.open_table(&name).execute().await.map_err(engine_err)?;
		table.delete(&item_predicate(ITEM_ID, &ids)).await.map_err(engine_err)?;
		let rows = insert_points(&self.conn, &name, points, meta.dim).await?;
		tracing::debug!(dataset_id, field, items = points.len(), rows, "vector upsert");
		self.maybe_build_index(&name, &meta).await
	}

	async fn delete(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<()> {
		let (name, _) = self.require_collection(dataset_id, field).await?;
		if ids.is_empty() {
			return Ok(());
		}
		let table = self.conn.open_table(&name).execute().await.map_err(engine_err)?;
		table.delete(&item_predicate(ITEM_ID, ids)).await.map_err(engine_err)?;
		Ok(())
	}

	async fn search(&self, query: &VectorQuery) -> Result<Vec<EngineHit>> {
		let (name, meta) = self.require_collection(query.dataset_id, &query.field).await?;
		if query.vector.len() != meta.dim {
			return Err(Error::Validation(format!("query vector has {} dimensions, {name} expects {}", query.vector.len(), meta.dim)));
		}
		let table = self.conn.open_table(&name).execute().await.map_err(engine_err)?;
		let total = table.count_rows(None).await.map_err(engine_err)?;
		let wanted = query.offset + query.limit;
		if total == 0 || query.limit == 0 {
			return Ok(Vec::new());
		}
		let fetch = (if query.group_sub_items || !query.filters.is_empty() { wanted * OVERFETCH } else { wanted }).min(total);

		let mut stream = table
			.vector_search(query.vector.clone())
			.map_err(engine_err)?
			.column(VECTOR)
			.distance_type(DistanceType::Cosine)
			.limit(fetch)
			.execute()
			.await
			.map_err(engine_err)?;
		let mut rows = Vec::new();
		while let Some(batch) = stream.try_next().await.map_err(engine_err)? {
			rows.extend(decode_rows(&batch)?);
		}
		Ok(group_hits(rows, query))
	}

	async fn get_vectors(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<HashMap<ItemId, FieldValue>> {
		let name = collection_table(dataset_id, field);
		if !table_exists(&self.conn, &name).await? {
			return Ok(HashMap::new());
		}
		let mut grouped: HashMap<ItemId, Vec<Vec<f32>>> = HashMap::new();
		for row in self.rows_for_items(&name, ids).await? {
			grouped.entry(row.item_id).or_default().push(row.vector);
		}
		Ok(grouped
			.into_iter()
			.map(|(id, mut vectors)| {
				let value = if vectors.len() == 1 { FieldValue::Vector(vectors.remove(0)) } else { FieldValue::VectorList(vectors) };
				(id, value)
			})
			.collect())
	}

	async fn best_sub_items(
		&self,
		dataset_id: DatasetId,
		field: &str,
		parent_id: &str,
		vector: &[f32],
		limit: usize,
	) -> Result<Vec<RelevantPart>> {
		let (name, _) = self.require_collection(dataset_id, field).await?;
		let rows = self.rows_for_items(&name, &[parent_id.to_string()]).await?;
		if rows.is_empty() {
			return Err(Error::NotFound(format!("item {parent_id} in {dataset_id}/{field}")));
		}
		let mut parts: Vec<RelevantPart> = rows
			.iter()
			.map(|r| RelevantPart { field: field.to_string(), index: r.sub_index, score: cosine(vector, &r.vector) })
			.collect();
		parts.sort_by(|a, b| b.score.total_cmp(&a.score));
		parts.truncate(limit);
		Ok(parts)
	}
}
