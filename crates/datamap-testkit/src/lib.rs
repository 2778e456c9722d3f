//! In-process engines and scripted generators for tests.
//!
//! `MemoryTextEngine` scores by term occurrences, `MemoryVectorEngine` by
//! cosine similarity. Both can be switched into a failing mode to exercise
//! degraded paths.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use datamap_core::schema::Dataset;
use datamap_core::traits::{
    CollectionSpec, Generator, GeneratorInput, GeneratorOutput, KeywordQuery, TextEngine, VectorEngine, VectorPoint,
    VectorQuery,
};
use datamap_core::types::{DatasetId, EngineHit, FieldValue, Item, ItemId, RelevantPart};
use datamap_core::{Error, Result};

#[derive(Default)]
pub struct MemoryTextEngine {
    items: RwLock<HashMap<DatasetId, Vec<Item>>>,
    failing: AtomicBool,
}

impl MemoryTextEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Item>) -> Self {
        let engine = Self::new();
        {
            let mut guard = engine.items.write();
            for item in items {
                guard.entry(item.dataset_id).or_default().push(item);
            }
        }
        engine
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stored(&self, dataset_id: DatasetId, id: &str) -> Option<Item> {
        self.items.read().get(&dataset_id).and_then(|v| v.iter().find(|i| i.id == id).cloned())
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::upstream("memory-text", "engine unavailable"));
        }
        Ok(())
    }
}

fn project(item: &Item, fields: &[String]) -> Item {
    if fields.is_empty() {
        return item.clone();
    }
    let mut out = Item::new(item.dataset_id, item.id.clone());
    for f in fields {
        if let Some(v) = item.get(f) {
            out.set(f, v.clone());
        }
    }
    out
}

#[async_trait]
impl TextEngine for MemoryTextEngine {
    async fn ensure_index(&self, dataset: &Dataset) -> Result<()> {
        self.check()?;
        self.items.write().entry(dataset.id).or_default();
        Ok(())
    }

    async fn item_count(&self, dataset_id: DatasetId) -> Result<usize> {
        self.check()?;
        Ok(self.items.read().get(&dataset_id).map_or(0, Vec::len))
    }

    async fn get_by_ids(&self, dataset_id: DatasetId, ids: &[ItemId], fields: &[String]) -> Result<Vec<Item>> {
        self.check()?;
        let guard = self.items.read();
        let Some(items) = guard.get(&dataset_id) else { return Ok(Vec::new()) };
        Ok(ids.iter().filter_map(|id| items.iter().find(|i| &i.id == id)).map(|i| project(i, fields)).collect())
    }

    async fn search(&self, query: &KeywordQuery) -> Result<Vec<EngineHit>> {
        self.check()?;
        let guard = self.items.read();
        let Some(items) = guard.get(&query.dataset_id) else { return Ok(Vec::new()) };
        let terms: Vec<String> = query.query.split_whitespace().map(str::to_lowercase).collect();
        let mut hits: Vec<EngineHit> = Vec::new();
        for item in items {
            let passes = query.filters.iter().all(|f| item.get(&f.field).and_then(FieldValue::to_text).as_deref() == Some(f.value.as_str()));
            if !passes {
                continue;
            }
            let mut score = 0.0f32;
            for (field, boost) in &query.fields {
                let Some(text) = item.get(field).and_then(FieldValue::to_text) else { continue };
                let lower = text.to_lowercase();
                #[allow(clippy::cast_precision_loss)]
                let count: f32 = terms.iter().map(|t| lower.matches(t.as_str()).count() as f32).sum();
                score += count * boost;
            }
            if score > 0.0 {
                hits.push(EngineHit { id: item.id.clone(), score, highlights: None, relevant_parts: Vec::new() });
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn items_missing_field(&self, dataset_id: DatasetId, field: &str, limit: usize) -> Result<Vec<Item>> {
        self.check()?;
        let guard = self.items.read();
        Ok(guard.get(&dataset_id).map_or_else(Vec::new, |items| {
            items.iter().filter(|i| !i.has(field)).take(limit).cloned().collect()
        }))
    }

    async fn upsert(&self, dataset_id: DatasetId, items: &[Item]) -> Result<()> {
        self.check()?;
        let mut guard = self.items.write();
        let stored = guard.entry(dataset_id).or_default();
        for item in items {
            match stored.iter_mut().find(|i| i.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => stored.push(item.clone()),
            }
        }
        Ok(())
    }

    async fn delete(&self, dataset_id: DatasetId, ids: &[ItemId]) -> Result<()> {
        self.check()?;
        if let Some(stored) = self.items.write().get_mut(&dataset_id) {
            stored.retain(|i| !ids.contains(&i.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredPoint {
    item_id: ItemId,
    vectors: Vec<Vec<f32>>,
    payload: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryVectorEngine {
    collections: RwLock<HashMap<(DatasetId, String), Vec<StoredPoint>>>,
    failing: AtomicBool,
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

impl MemoryVectorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::upstream("memory-vector", "engine unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorEngine for MemoryVectorEngine {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
        self.check()?;
        self.collections.write().entry((spec.dataset_id, spec.field.clone())).or_default();
        Ok(())
    }

    async fn upsert(&self, dataset_id: DatasetId, field: &str, points: &[VectorPoint]) -> Result<()> {
        self.check()?;
        let mut guard = self.collections.write();
        let stored = guard.entry((dataset_id, field.to_string())).or_default();
        for p in points {
            stored.retain(|s| s.item_id != p.item_id);
            stored.push(StoredPoint { item_id: p.item_id.clone(), vectors: p.vectors.clone(), payload: p.payload.clone() });
        }
        Ok(())
    }

    async fn delete(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<()> {
        self.check()?;
        if let Some(stored) = self.collections.write().get_mut(&(dataset_id, field.to_string())) {
            stored.retain(|s| !ids.contains(&s.item_id));
        }
        Ok(())
    }

    async fn search(&self, query: &VectorQuery) -> Result<Vec<EngineHit>> {
        self.check()?;
        let guard = self.collections.read();
        let Some(points) = guard.get(&(query.dataset_id, query.field.clone())) else { return Ok(Vec::new()) };
        let mut hits = Vec::new();
        for p in points {
            let passes = query.filters.iter().all(|f| p.payload.get(&f.field) == Some(&f.value));
            if !passes {
                continue;
            }
            let mut parts: Vec<RelevantPart> = p
                .vectors
                .iter()
                .enumerate()
                .map(|(index, v)| RelevantPart { field: query.field.clone(), index, score: cosine(&query.vector, v) })
                .collect();
            parts.sort_by(|a, b| b.score.total_cmp(&a.score));
            let Some(best) = parts.first().map(|p| p.score) else { continue };
            if query.score_threshold.is_some_and(|t| best < t) {
                continue;
            }
            let relevant_parts = if query.group_sub_items && p.vectors.len() > 1 { parts } else { Vec::new() };
            hits.push(EngineHit { id: p.item_id.clone(), score: best, highlights: None, relevant_parts });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn get_vectors(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<HashMap<ItemId, FieldValue>> {
        self.check()?;
        let guard = self.collections.read();
        let Some(points) = guard.get(&(dataset_id, field.to_string())) else { return Ok(HashMap::new()) };
        Ok(points
            .iter()
            .filter(|p| ids.contains(&p.item_id))
            .filter_map(|p| {
                let value = match p.vectors.as_slice() {
                    [] => return None,
                    [single] => FieldValue::Vector(single.clone()),
                    many => FieldValue::VectorList(many.to_vec()),
                };
                Some((p.item_id.clone(), value))
            })
            .collect())
    }

    async fn best_sub_items(&self, dataset_id: DatasetId, field: &str, parent_id: &str, vector: &[f32], limit: usize) -> Result<Vec<RelevantPart>> {
        self.check()?;
        let guard = self.collections.read();
        let Some(point) = guard.get(&(dataset_id, field.to_string())).and_then(|p| p.iter().find(|p| p.item_id == parent_id)) else {
            return Err(Error::NotFound(format!("item {parent_id} in {dataset_id}/{field}")));
        };
        let mut parts: Vec<RelevantPart> = point
            .vectors
            .iter()
            .enumerate()
            .map(|(index, v)| RelevantPart { field: field.to_string(), index, score: cosine(vector, v) })
            .collect();
        parts.sort_by(|a, b| b.score.total_cmp(&a.score));
        parts.truncate(limit);
        Ok(parts)
    }
}

type GenerateFn = dyn Fn(&GeneratorInput) -> Option<GeneratorOutput> + Send + Sync;

/// Generator backed by a per-item closure. Counts batches it has served.
pub struct FnGenerator {
    id: String,
    f: Box<GenerateFn>,
    calls: AtomicUsize,
    fail_batches_containing: Option<String>,
}

impl FnGenerator {
    pub fn new(id: &str, f: impl Fn(&GeneratorInput) -> Option<GeneratorOutput> + Send + Sync + 'static) -> Self {
        Self { id: id.to_string(), f: Box::new(f), calls: AtomicUsize::new(0), fail_batches_containing: None }
    }

    /// Text generator producing `<prefix><joined sources>`.
    pub fn text(id: &str, prefix: &'static str) -> Self {
        Self::new(id, move |input| Some(GeneratorOutput::value(FieldValue::Text(format!("{prefix}{}", input.joined_text())))))
    }

    /// Fails any batch with an input whose text contains `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_batches_containing = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FnGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, batch: &[GeneratorInput]) -> Result<Vec<GeneratorOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_batches_containing {
            if batch.iter().any(|i| i.joined_text().contains(needle.as_str())) {
                return Err(Error::upstream(&self.id, "scripted failure"));
            }
        }
        Ok(batch.iter().map(|input| (self.f)(input).unwrap_or_default()).collect())
    }
}
