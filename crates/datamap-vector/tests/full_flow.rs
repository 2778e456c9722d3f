use std::collections::BTreeMap;

use datamap_core::params::Filter;
use datamap_core::traits::{CollectionSpec, VectorEngine, VectorPoint, VectorQuery};
use datamap_core::types::FieldValue;
use datamap_core::Error;
use datamap_vector::LanceVectorEngine;

fn spec(field: &str) -> CollectionSpec {
	CollectionSpec { dataset_id: 5, field: field.into(), dim: 3, quantized: false, payload_fields: vec!["venue".into()] }
}

fn point(id: &str, vectors: Vec<Vec<f32>>, venue: &str) -> VectorPoint {
	VectorPoint { item_id: id.into(), vectors, payload: BTreeMap::from([("venue".to_string(), venue.to_string())]) }
}

fn query(field: &str, vector: Vec<f32>) -> VectorQuery {
	VectorQuery { dataset_id: 5, field: field.into(), vector, limit: 10, offset: 0, score_threshold: None, filters: Vec::new(), group_sub_items: false }
}

#[tokio::test]
async fn lancedb_full_flow() -> anyhow::Result<()> {
	let tmp = tempfile::tempdir()?;
	let engine = LanceVectorEngine::open_path(tmp.path()).await?;
	engine.ensure_collection(&spec("embedding")).await?;
	engine
		.upsert(5, "embedding", &[
			point("a", vec![vec![1.0, 0.0, 0.0]], "nature"),
			point("b", vec![vec![0.9, 0.1, 0.0]], "science"),
			point("c", vec![vec![0.0, 0.0, 1.0]], "nature"),
		])
		.await?;

	let hits = engine.search(&query("embedding", vec![1.0, 0.0, 0.0])).await?;
	assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
	assert!((hits[0].score - 1.0).abs() < 1e-4, "score is 1 - cosine distance");

	let mut filtered = query("embedding", vec![1.0, 0.0, 0.0]);
	filtered.filters = vec![Filter { field: "venue".into(), value: "nature".into() }];
	filtered.score_threshold = Some(0.5);
	let hits = engine.search(&filtered).await?;
	assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["a"]);

	let vectors = engine.get_vectors(5, "embedding", &["b".into(), "zzz".into()]).await?;
	assert_eq!(vectors.len(), 1);
	assert_eq!(vectors.get("b"), Some(&FieldValue::Vector(vec![0.9, 0.1, 0.0])));

	engine.delete(5, "embedding", &["a".into()]).await?;
	let hits = engine.search(&query("embedding", vec![1.0, 0.0, 0.0])).await?;
	assert_eq!(hits[0].id, "b");
	Ok(())
}

#[tokio::test]
async fn array_fields_group_by_parent_and_replace_on_upsert() -> anyhow::Result<()> {
	let tmp = tempfile::tempdir()?;
	let engine = LanceVectorEngine::open_path(tmp.path()).await?;
	engine.ensure_collection(&spec("chunks")).await?;
	engine
		.upsert(5, "chunks", &[
			point("doc", vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]], "x"),
			point("other", vec![vec![0.5, 0.5, 0.0]], "x"),
		])
		.await?;

	let mut grouped = query("chunks", vec![1.0, 0.0, 0.0]);
	grouped.group_sub_items = true;
	let hits = engine.search(&grouped).await?;
	assert_eq!(hits.len(), 2, "one hit per parent item");
	assert_eq!(hits[0].id, "doc");
	assert_eq!(hits[0].relevant_parts.first().map(|p| p.index), Some(1));

	let best = engine.best_sub_items(5, "chunks", "doc", &[0.0, 0.0, 1.0], 2).await?;
	assert_eq!(best.iter().map(|p| p.index).collect::<Vec<_>>().first(), Some(&2));
	assert_eq!(best.len(), 2);

	engine.upsert(5, "chunks", &[point("doc", vec![vec![0.0, 1.0, 0.0]], "x")]).await?;
	let vectors = engine.get_vectors(5, "chunks", &["doc".into()]).await?;
	assert_eq!(vectors.get("doc"), Some(&FieldValue::Vector(vec![0.0, 1.0, 0.0])), "old sub-vectors removed");
	Ok(())
}

#[tokio::test]
async fn dimension_and_missing_collection_errors() -> anyhow::Result<()> {
	let tmp = tempfile::tempdir()?;
	let engine = LanceVectorEngine::open_path(tmp.path()).await?;
	assert!(matches!(engine.search(&query("nope", vec![1.0, 0.0, 0.0])).await, Err(Error::NotFound(_))));
	assert!(engine.get_vectors(5, "nope", &["a".into()]).await?.is_empty());

	engine.ensure_collection(&spec("embedding")).await?;
	let bad = engine.upsert(5, "embedding", &[point("a", vec![vec![1.0, 0.0]], "x")]).await;
	assert!(matches!(bad, Err(Error::Validation(_))));
	assert!(matches!(engine.search(&query("embedding", vec![1.0])).await, Err(Error::Validation(_))));

	let mut wider = spec("embedding");
	wider.dim = 4;
	assert!(matches!(engine.ensure_collection(&wider).await, Err(Error::Validation(_))));
	Ok(())
}

#[tokio::test]
async fn collection_settings_survive_reopen() -> anyhow::Result<()> {
	let tmp = tempfile::tempdir()?;
	{
		let engine = LanceVectorEngine::open_path(tmp.path()).await?;
		engine.ensure_collection(&spec("embedding")).await?;
		engine.upsert(5, "embedding", &[point("a", vec![vec![0.0, 1.0, 0.0]], "x")]).await?;
	}
	let reopened = LanceVectorEngine::open_path(tmp.path()).await?;
	let hits = reopened.search(&query("embedding", vec![0.0, 1.0, 0.0])).await?;
	assert_eq!(hits.len(), 1);
	Ok(())
}
