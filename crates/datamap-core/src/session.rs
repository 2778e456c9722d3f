//! Map session state as seen by pollers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::params::ParameterSet;
use crate::types::ItemKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapState {
    Preparation,
    Search,
    Vectorize,
    Project,
    ClusterRender,
    Finished,
    Error,
}

impl MapState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Preparation => "preparation",
            Self::Search => "search",
            Self::Vectorize => "vectorize",
            Self::Project => "project",
            Self::ClusterRender => "cluster_render",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub step: String,
    pub fraction: f32,
    pub current: usize,
    pub total: usize,
    pub embeddings_available: bool,
    pub positions_available: bool,
}

/// Autocut diagnostics for one result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCurve {
    pub title: String,
    pub normalized_scores: Vec<f32>,
    pub cutoff: usize,
    pub reason: String,
    pub max_score: f32,
    pub min_score: f32,
    pub positive_examples: Vec<ItemKey>,
    pub negative_examples: Vec<ItemKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: i32,
    pub title: String,
    pub title_html: String,
    pub centroid: [f32; 2],
    pub min_score: f32,
    pub avg_score: f32,
    pub max_score: f32,
    pub member_count: usize,
    #[serde(default)]
    pub important_words: Vec<(String, f32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailAtlas {
    pub filename: String,
    pub sprite_size: u32,
    pub aspect_ratios: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub part: String,
    pub millis: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointResults {
    pub ids: Vec<ItemKey>,
    pub scores: Vec<f32>,
    pub positions: Vec<[f32; 2]>,
    pub raw_projections: Vec<[f32; 2]>,
    pub cluster_ids: Vec<i32>,
    pub attributes: BTreeMap<String, Vec<f32>>,
    /// Map vectors the projection ran on, empty where a point had none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub map_vectors: Vec<Vec<f32>>,
}

impl PointResults {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapResults {
    pub per_point: PointResults,
    pub clusters: Vec<ClusterSummary>,
    pub score_info: Vec<ScoreCurve>,
    #[serde(default)]
    pub thumbnail_atlas: Option<ThumbnailAtlas>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub timings: Vec<Timing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSession {
    pub id: String,
    pub parameters: ParameterSet,
    pub state: MapState,
    pub finished: bool,
    pub errors: Vec<String>,
    pub progress: Progress,
    pub results: MapResults,
    #[serde(default)]
    pub reused_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl MapSession {
    pub fn new(id: String, parameters: ParameterSet) -> Self {
        let now = Utc::now();
        Self {
            id,
            parameters,
            state: MapState::Preparation,
            finished: false,
            errors: Vec::new(),
            progress: Progress { step: MapState::Preparation.label().to_string(), ..Progress::default() },
            results: MapResults::default(),
            reused_from: None,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn enter(&mut self, state: MapState) {
        self.state = state;
        self.progress.step = state.label().to_string();
        self.progress.fraction = 0.0;
        self.progress.current = 0;
        self.progress.total = 0;
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Terminal failure: pollers see the message and stop waiting.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.push_error(message);
        self.state = MapState::Error;
        self.progress.step = MapState::Error.label().to_string();
        self.finished = true;
    }

    pub fn finish(&mut self) {
        self.state = MapState::Finished;
        self.progress.step = MapState::Finished.label().to_string();
        self.progress.fraction = 1.0;
        self.finished = true;
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}
