use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::params::Filter;
use crate::schema::Dataset;
use crate::session::ThumbnailAtlas;
use crate::types::{DatasetId, EngineHit, FieldValue, Item, ItemId, RelevantPart};

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordQuery {
    pub dataset_id: DatasetId,
    pub query: String,
    /// Searched fields with their boosts.
    pub fields: Vec<(String, f32)>,
    pub filters: Vec<Filter>,
    pub limit: usize,
    pub highlight: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub dataset_id: DatasetId,
    pub field: String,
    pub vector: Vec<f32>,
    pub limit: usize,
    pub offset: usize,
    pub score_threshold: Option<f32>,
    pub filters: Vec<Filter>,
    /// Collapse sub-item vectors of array fields onto their parent item.
    pub group_sub_items: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub dataset_id: DatasetId,
    pub field: String,
    pub dim: usize,
    pub quantized: bool,
    pub payload_fields: Vec<String>,
}

/// A vector (or one vector per element of an array field) with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub item_id: ItemId,
    pub vectors: Vec<Vec<f32>>,
    pub payload: BTreeMap<String, String>,
}

#[async_trait]
pub trait TextEngine: Send + Sync {
    async fn ensure_index(&self, dataset: &Dataset) -> Result<()>;
    async fn item_count(&self, dataset_id: DatasetId) -> Result<usize>;
    /// Items in request order; unknown ids are skipped. Empty `fields` returns every stored field.
    async fn get_by_ids(&self, dataset_id: DatasetId, ids: &[ItemId], fields: &[String]) -> Result<Vec<Item>>;
    async fn search(&self, query: &KeywordQuery) -> Result<Vec<EngineHit>>;
    async fn items_missing_field(&self, dataset_id: DatasetId, field: &str, limit: usize) -> Result<Vec<Item>>;
    async fn upsert(&self, dataset_id: DatasetId, items: &[Item]) -> Result<()>;
    async fn delete(&self, dataset_id: DatasetId, ids: &[ItemId]) -> Result<()>;
}

#[async_trait]
pub trait VectorEngine: Send + Sync {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()>;
    async fn upsert(&self, dataset_id: DatasetId, field: &str, points: &[VectorPoint]) -> Result<()>;
    async fn delete(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<()>;
    async fn search(&self, query: &VectorQuery) -> Result<Vec<EngineHit>>;
    /// Stored vectors per item: `Vector` for scalar fields, `VectorList` for array fields.
    async fn get_vectors(&self, dataset_id: DatasetId, field: &str, ids: &[ItemId]) -> Result<HashMap<ItemId, FieldValue>>;
    async fn best_sub_items(
        &self,
        dataset_id: DatasetId,
        field: &str,
        parent_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RelevantPart>>;
}

/// Per-item input to a generator.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorInput {
    /// Non-null values of the listed source fields, in declaration order.
    Values(Vec<FieldValue>),
    /// Named generator inputs; absent sources are `None`.
    Named(BTreeMap<String, Option<FieldValue>>),
}

impl GeneratorInput {
    pub fn text(text: &str) -> Self {
        Self::Values(vec![FieldValue::Text(text.to_string())])
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Values(v) => v.is_empty(),
            Self::Named(m) => m.values().all(Option::is_none),
        }
    }

    /// All textual content joined by spaces.
    pub fn joined_text(&self) -> String {
        let values: Vec<String> = match self {
            Self::Values(v) => v.iter().filter_map(FieldValue::to_text).collect(),
            Self::Named(m) => m.values().flatten().filter_map(FieldValue::to_text).collect(),
        };
        values.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorOutput {
    pub value: Option<FieldValue>,
    /// Secondary outputs of multi-output generators, keyed by output name.
    pub extra: BTreeMap<String, FieldValue>,
}

impl GeneratorOutput {
    pub fn value(value: FieldValue) -> Self {
        Self { value: Some(value), extra: BTreeMap::new() }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn id(&self) -> &str;
    /// One output per input, in order.
    async fn generate(&self, batch: &[GeneratorInput]) -> Result<Vec<GeneratorOutput>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionVector {
    pub vector: Vec<f32>,
    pub threshold: Option<f32>,
    pub highest_score: Option<f32>,
}

impl DecisionVector {
    /// Dot-product score; with a threshold, negatives clamp to 0 and
    /// positives shift so the threshold maps to the top score's offset.
    pub fn score(&self, vector: &[f32]) -> f32 {
        let raw: f32 = self.vector.iter().zip(vector).map(|(a, b)| a * b).sum();
        match (self.threshold, self.highest_score) {
            (Some(threshold), Some(highest)) => {
                if raw < threshold {
                    0.0
                } else {
                    raw - threshold + (highest - threshold)
                }
            }
            _ => raw,
        }
    }
}

pub trait MetadataStore: Send + Sync {
    fn dataset(&self, id: DatasetId) -> Result<Dataset>;
    fn classifier_decision_vector(&self, collection_id: u32, class_name: &str, field: &str) -> Result<DecisionVector>;
    fn stored_map(&self, id: &str) -> Result<Option<Vec<u8>>>;
    fn store_map(&self, id: &str, blob: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait ThumbnailRenderer: Send + Sync {
    async fn render_atlas(&self, name: &str, uris: Vec<Option<String>>, sprite_size: u32) -> Result<ThumbnailAtlas>;
}

#[async_trait]
pub trait QuestionAnswerer: Send + Sync {
    async fn answer(&self, question: &str, context: &[Item]) -> Result<String>;
}
