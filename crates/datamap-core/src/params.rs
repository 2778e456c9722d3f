//! Map request parameters and their prefix hashes.
//!
//! A [`ParameterSet`] has four sections that feed the map stages in order.
//! Each stage's output depends only on its own section and the sections
//! before it, so hashing growing prefixes of the set tells whether two
//! requests can share a stage's output.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DatasetId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub search: SearchParams,
    #[serde(default)]
    pub vectorize: VectorizeParams,
    #[serde(default)]
    pub projection: ProjectionParams,
    #[serde(default)]
    pub rendering: RenderingParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAlgorithm {
    Keyword,
    Vector,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutocutStrategy {
    StaticThreshold,
    #[default]
    KneePoint,
    NearestNeighbourDistanceRatio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldQuery {
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    pub field: String,
    pub query: String,
}

/// Exact-match filter on a filterable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub dataset_ids: Vec<DatasetId>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub negative_query: String,
    #[serde(default)]
    pub field_queries: Vec<FieldQuery>,
    #[serde(default)]
    pub search_algorithm: SearchAlgorithm,
    /// Restricts the searched fields; empty means the dataset defaults.
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub use_autocut: bool,
    #[serde(default)]
    pub autocut_strategy: AutocutStrategy,
    #[serde(default = "default_autocut_min_results")]
    pub autocut_min_results: usize,
    #[serde(default)]
    pub autocut_min_score: f32,
    #[serde(default = "default_max_relative_decline")]
    pub autocut_max_relative_decline: f32,
    #[serde(default = "default_true")]
    pub use_similarity_thresholds: bool,
    #[serde(default)]
    pub question: Option<String>,
    /// Sprite edge length in pixels; `None` picks one from the item count.
    #[serde(default)]
    pub thumbnail_sprite_size: Option<u32>,
}

fn default_max_items() -> usize {
    2000
}

fn default_autocut_min_results() -> usize {
    10
}

fn default_max_relative_decline() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            dataset_ids: Vec::new(),
            query: String::new(),
            negative_query: String::new(),
            field_queries: Vec::new(),
            search_algorithm: SearchAlgorithm::default(),
            search_fields: Vec::new(),
            filters: Vec::new(),
            max_items: default_max_items(),
            use_autocut: false,
            autocut_strategy: AutocutStrategy::default(),
            autocut_min_results: default_autocut_min_results(),
            autocut_min_score: 0.0,
            autocut_max_relative_decline: default_max_relative_decline(),
            use_similarity_thresholds: true,
            question: None,
            thumbnail_sprite_size: None,
        }
    }
}

impl SearchParams {
    /// The raw query split on ` OR ` into independent sub-queries.
    pub fn queries(&self) -> Vec<String> {
        self.query
            .split(" OR ")
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorizeParams {
    #[serde(default)]
    pub map_vector_field: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRef {
    pub collection_id: u32,
    pub class_name: String,
    /// Vector field the decision vector was trained on.
    pub field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisSpec {
    #[default]
    Embedding,
    NumberField { field: String },
    Count { field: String },
    Rank,
    Score,
    Classifier(ClassifierRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    #[serde(default)]
    pub x_axis: AxisSpec,
    #[serde(default)]
    pub y_axis: AxisSpec,
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: usize,
    #[serde(default = "default_min_dist")]
    pub min_dist: f32,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default)]
    pub metric: DistanceMetric,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    #[serde(default)]
    pub invert_x_axis: bool,
    #[serde(default)]
    pub use_polar_coordinates: bool,
}

fn default_n_neighbors() -> usize {
    15
}

fn default_min_dist() -> f32 {
    0.17
}

fn default_n_epochs() -> usize {
    500
}

fn default_random_state() -> u64 {
    99
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            x_axis: AxisSpec::Embedding,
            y_axis: AxisSpec::Embedding,
            n_neighbors: default_n_neighbors(),
            min_dist: default_min_dist(),
            n_epochs: default_n_epochs(),
            metric: DistanceMetric::default(),
            random_state: default_random_state(),
            invert_x_axis: false,
            use_polar_coordinates: false,
        }
    }
}

impl ProjectionParams {
    pub fn uses_embedding(&self) -> bool {
        matches!(self.x_axis, AxisSpec::Embedding) || matches!(self.y_axis, AxisSpec::Embedding)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeSpec {
    Constant { value: f32 },
    NumberField { field: String },
    Count { field: String },
    Rank,
    Score,
    ClusterIdx,
    Classifier(ClassifierRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterizerParams {
    #[serde(default)]
    pub min_cluster_size: Option<usize>,
    #[serde(default)]
    pub max_cluster_size: Option<usize>,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub leaf_mode: bool,
}

fn default_min_samples() -> usize {
    5
}

impl Default for ClusterizerParams {
    fn default() -> Self {
        Self { min_cluster_size: None, max_cluster_size: None, min_samples: default_min_samples(), leaf_mode: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderingParams {
    #[serde(default = "default_size")]
    pub size: AttributeSpec,
    #[serde(default = "default_hue")]
    pub hue: AttributeSpec,
    #[serde(default = "default_sat")]
    pub sat: AttributeSpec,
    #[serde(default = "default_val")]
    pub val: AttributeSpec,
    #[serde(default = "default_opacity")]
    pub opacity: AttributeSpec,
    #[serde(default)]
    pub secondary_hue: Option<AttributeSpec>,
    #[serde(default)]
    pub flatness: Option<AttributeSpec>,
    #[serde(default)]
    pub clusterizer: ClusterizerParams,
}

fn default_size() -> AttributeSpec {
    AttributeSpec::Constant { value: 0.5 }
}

fn default_hue() -> AttributeSpec {
    AttributeSpec::ClusterIdx
}

fn default_sat() -> AttributeSpec {
    AttributeSpec::Constant { value: 0.9 }
}

fn default_val() -> AttributeSpec {
    AttributeSpec::Score
}

fn default_opacity() -> AttributeSpec {
    AttributeSpec::Constant { value: 1.0 }
}

impl Default for RenderingParams {
    fn default() -> Self {
        Self {
            size: default_size(),
            hue: default_hue(),
            sat: default_sat(),
            val: default_val(),
            opacity: default_opacity(),
            secondary_hue: None,
            flatness: None,
            clusterizer: ClusterizerParams::default(),
        }
    }
}

impl RenderingParams {
    /// Every configured style attribute with its output name.
    pub fn attributes(&self) -> Vec<(&'static str, &AttributeSpec)> {
        let mut out = vec![
            ("size", &self.size),
            ("hue", &self.hue),
            ("sat", &self.sat),
            ("val", &self.val),
            ("opacity", &self.opacity),
        ];
        if let Some(spec) = &self.secondary_hue {
            out.push(("secondary_hue", spec));
        }
        if let Some(spec) = &self.flatness {
            out.push(("flatness", spec));
        }
        out
    }
}

/// Hex digests of the growing parameter prefixes plus the full set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHashes {
    pub search: String,
    pub vectorize: String,
    pub projection: String,
    pub session: String,
}

#[derive(Serialize)]
struct Prefix<'a> {
    search: &'a SearchParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    vectorize: Option<&'a VectorizeParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    projection: Option<&'a ProjectionParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rendering: Option<&'a RenderingParams>,
}

fn digest<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::Internal(format!("hashing parameters: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

impl ParameterSet {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let params: Self = serde_json::from_slice(bytes)?;
        Ok(params)
    }

    pub fn stage_hashes(&self) -> Result<StageHashes> {
        let mut prefix = Prefix { search: &self.search, vectorize: None, projection: None, rendering: None };
        let search = digest(&prefix)?;
        prefix.vectorize = Some(&self.vectorize);
        let vectorize = digest(&prefix)?;
        prefix.projection = Some(&self.projection);
        let projection = digest(&prefix)?;
        prefix.rendering = Some(&self.rendering);
        let session = digest(&prefix)?;
        Ok(StageHashes { search, vectorize, projection, session })
    }

    pub fn session_id(&self) -> Result<String> {
        Ok(self.stage_hashes()?.session)
    }

    /// Rejects malformed requests before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.search.dataset_ids.is_empty() {
            return Err(Error::Validation("search.dataset_ids must not be empty".into()));
        }
        if self.search.queries().is_empty() && self.search.field_queries.is_empty() {
            return Err(Error::Validation("a query or at least one field query is required".into()));
        }
        if self.search.max_items == 0 {
            return Err(Error::Validation("search.max_items must be positive".into()));
        }
        if self.projection.uses_embedding() && self.vectorize.map_vector_field.is_empty() {
            return Err(Error::Validation("an embedding axis requires vectorize.map_vector_field".into()));
        }
        if self.projection.n_neighbors < 2 {
            return Err(Error::Validation("projection.n_neighbors must be at least 2".into()));
        }
        let min_dist = self.projection.min_dist;
        if self.projection.n_epochs == 0 || min_dist.is_nan() || min_dist <= 0.0 {
            return Err(Error::Validation("projection.n_epochs and projection.min_dist must be positive".into()));
        }
        if self.rendering.clusterizer.min_samples == 0 {
            return Err(Error::Validation("rendering.clusterizer.min_samples must be positive".into()));
        }
        Ok(())
    }
}
