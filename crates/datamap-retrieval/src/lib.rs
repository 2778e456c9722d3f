//! datamap-retrieval
//!
//! Fans a search request out over the text and vector engines, cuts and
//! fuses the per-field result sets and loads the payloads the map needs.

pub mod autocut;
pub mod fusion;

use std::sync::Arc;

use futures::future::join_all;

use datamap_core::params::{SearchAlgorithm, SearchParams};
use datamap_core::schema::{Dataset, FieldSpec};
use datamap_core::session::ScoreCurve;
use datamap_core::traits::{GeneratorInput, KeywordQuery, TextEngine, VectorEngine, VectorQuery};
use datamap_core::types::{EngineHit, FieldValue, FusedItem, Item, ItemId, OriginKind, ResultSet};
use datamap_core::{Error, Result};
use datamap_fields::GeneratorRegistry;

pub use autocut::{autocut, score_curve, AutocutSettings, Cutoff};
pub use fusion::{fuse, interleave};

/// Fused hits of every requested dataset plus per-set diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    pub hits: Vec<FusedItem>,
    pub score_info: Vec<ScoreCurve>,
    /// Degraded engine calls; the affected sets are empty.
    pub errors: Vec<String>,
}

enum SetRequest<'a> {
    Keyword { fields: Vec<&'a FieldSpec>, query: String },
    Vector { field: &'a FieldSpec, query: String },
}

pub struct Retriever {
    text: Arc<dyn TextEngine>,
    vector: Arc<dyn VectorEngine>,
    generators: GeneratorRegistry,
}

impl Retriever {
    pub fn new(text: Arc<dyn TextEngine>, vector: Arc<dyn VectorEngine>, generators: GeneratorRegistry) -> Self {
        Self { text, vector, generators }
    }

    pub async fn search(&self, datasets: &[Dataset], params: &SearchParams) -> RetrievalOutput {
        let mut output = RetrievalOutput::default();
        let mut per_dataset = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            let (fused, curves, errors) = self.search_dataset(dataset, params).await;
            tracing::info!(dataset_id = dataset.id, hits = fused.len(), "dataset searched");
            per_dataset.push(fused);
            output.score_info.extend(curves);
            output.errors.extend(errors);
        }
        output.hits = interleave(per_dataset, params.max_items);
        output
    }

    async fn search_dataset(&self, dataset: &Dataset, params: &SearchParams) -> (Vec<FusedItem>, Vec<ScoreCurve>, Vec<String>) {
        let requests = plan_requests(dataset, params);
        let results = join_all(requests.iter().map(|req| self.run_request(dataset, req, params))).await;

        let settings = AutocutSettings::from(params);
        let mut sets = Vec::with_capacity(results.len());
        let mut curves = Vec::new();
        let mut errors = Vec::new();
        for (req, result) in requests.iter().zip(results) {
            let mut set = match result {
                Ok(set) => set,
                Err(e) => {
                    tracing::warn!(dataset_id = dataset.id, error = %e, "engine call failed, using empty result set");
                    errors.push(e.to_string());
                    empty_set(dataset, req)
                }
            };
            let cutoff = if params.use_autocut { autocut(&set.scores(), &settings) } else { Cutoff::keep_all(set.len()) };
            curves.extend(score_curve(&set, &cutoff));
            set.truncate(cutoff.count);
            sets.push(set);
        }
        (fuse(&sets, params.max_items), curves, errors)
    }

    async fn run_request(&self, dataset: &Dataset, req: &SetRequest<'_>, params: &SearchParams) -> Result<ResultSet> {
        match req {
            SetRequest::Keyword { fields, query } => {
                let keyword = KeywordQuery {
                    dataset_id: dataset.id,
                    query: query.clone(),
                    fields: fields.iter().map(|f| (f.identifier.clone(), f.search.boost)).collect(),
                    filters: params.filters.clone(),
                    limit: params.max_items,
                    highlight: true,
                };
                let hits = self.text.search(&keyword).await?;
                Ok(ResultSet::from_ranked(OriginKind::Keyword, dataset.id, &keyword_label(fields), query, hits))
            }
            SetRequest::Vector { field, query } => {
                let mut vector = self.embed_query(field, query).await?;
                if !params.negative_query.trim().is_empty() {
                    let negative = self.embed_query(field, &params.negative_query).await?;
                    for (v, n) in vector.iter_mut().zip(&negative) {
                        *v -= n;
                    }
                }
                let search = VectorQuery {
                    dataset_id: dataset.id,
                    field: field.identifier.clone(),
                    vector,
                    limit: params.max_items,
                    offset: 0,
                    score_threshold: field.search.similarity_threshold.filter(|_| params.use_similarity_thresholds),
                    filters: params.filters.clone(),
                    group_sub_items: field.is_array,
                };
                let hits: Vec<EngineHit> = self.vector.search(&search).await?;
                Ok(ResultSet::from_ranked(OriginKind::Vector, dataset.id, &field.identifier, query, hits))
            }
        }
    }

    /// Embed a query string with the generator that fills `field`.
    pub async fn embed_query(&self, field: &FieldSpec, query: &str) -> Result<Vec<f32>> {
        let generator_id = field
            .generator
            .as_ref()
            .map(|g| g.id.as_str())
            .ok_or_else(|| Error::NotFound(format!("query embedder for field '{}'", field.identifier)))?;
        let generator = self.generators.get(generator_id)?;
        let mut outputs = generator.generate(&[GeneratorInput::text(query)]).await?;
        match outputs.pop().and_then(|o| o.value) {
            Some(FieldValue::Vector(v)) => Ok(v),
            _ => Err(Error::generation(&field.identifier, "query embedding produced no vector")),
        }
    }

    /// Load `ids` with the given stored fields, plus `vector_field` from the
    /// vector engine when set. Items keep the order of `ids`.
    pub async fn load_items(&self, dataset: &Dataset, ids: &[ItemId], fields: &[String], vector_field: Option<&str>) -> Result<Vec<Item>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut items = self.text.get_by_ids(dataset.id, ids, fields).await?;
        if let Some(name) = vector_field.filter(|f| dataset.field(f).is_some_and(FieldSpec::is_vector)) {
            let mut vectors = self.vector.get_vectors(dataset.id, name, ids).await?;
            for item in &mut items {
                if let Some(v) = vectors.remove(&item.id) {
                    item.set(name, v);
                }
            }
        }
        Ok(items)
    }
}

fn keyword_label(fields: &[&FieldSpec]) -> String {
    fields.iter().map(|f| f.identifier.as_str()).collect::<Vec<_>>().join("+")
}

fn empty_set(dataset: &Dataset, req: &SetRequest<'_>) -> ResultSet {
    match req {
        SetRequest::Keyword { fields, query } => ResultSet::from_ranked(OriginKind::Keyword, dataset.id, &keyword_label(fields), query, Vec::new()),
        SetRequest::Vector { field, query } => ResultSet::from_ranked(OriginKind::Vector, dataset.id, &field.identifier, query, Vec::new()),
    }
}

/// One keyword set over all keyword fields and one set per vector field, for
/// every sub-query; field queries add sets for their own field only.
fn plan_requests<'a>(dataset: &'a Dataset, params: &SearchParams) -> Vec<SetRequest<'a>> {
    let fields: Vec<&FieldSpec> = if params.search_fields.is_empty() {
        dataset.search_fields()
    } else {
        params.search_fields.iter().filter_map(|name| dataset.field(name)).collect()
    };
    let use_keyword = params.search_algorithm != SearchAlgorithm::Vector;
    let use_vector = params.search_algorithm != SearchAlgorithm::Keyword;
    let keyword_fields: Vec<&FieldSpec> = fields.iter().copied().filter(|f| f.search.keyword && !f.is_vector()).collect();

    let mut requests = Vec::new();
    for query in params.queries() {
        if use_vector {
            for field in fields.iter().copied().filter(|f| f.search.vector && f.is_vector()) {
                requests.push(SetRequest::Vector { field, query: query.clone() });
            }
        }
        if use_keyword && !keyword_fields.is_empty() {
            requests.push(SetRequest::Keyword { fields: keyword_fields.clone(), query });
        }
    }
    for fq in params.field_queries.iter().filter(|fq| fq.dataset_id.map_or(true, |d| d == dataset.id)) {
        let Some(field) = dataset.field(&fq.field) else {
            tracing::warn!(dataset_id = dataset.id, field = %fq.field, "field query on unknown field ignored");
            continue;
        };
        if field.is_vector() {
            requests.push(SetRequest::Vector { field, query: fq.query.clone() });
        } else {
            requests.push(SetRequest::Keyword { fields: vec![field], query: fq.query.clone() });
        }
    }
    requests
}
