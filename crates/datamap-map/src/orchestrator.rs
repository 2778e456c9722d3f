//! Map sessions: request, background run, polling and persistence.
//!
//! A request returns its session id at once. The stages run on a spawned
//! task and publish progress into the shared session so pollers can render a
//! partial map while it is still being computed.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use datamap_core::config::MapSettings;
use datamap_core::params::{AttributeSpec, AxisSpec, ParameterSet, StageHashes};
use datamap_core::schema::Dataset;
use datamap_core::session::{ClusterSummary, MapResults, MapSession, MapState, ThumbnailAtlas, Timing};
use datamap_core::traits::{DecisionVector, MetadataStore, QuestionAnswerer, TextEngine, ThumbnailRenderer, VectorEngine};
use datamap_core::types::{FieldValue, Item, ItemKey};
use datamap_core::{Error, Result};
use datamap_fields::GeneratorRegistry;
use datamap_projection::{
    cluster, cluster_summaries, descriptive_text, project, selection_summary, HdbscanParams, Projection, ProjectionInput,
    TitleSettings,
};
use datamap_retrieval::Retriever;

use crate::cache::{MapCache, ReuseLevel, ReuseLookup, SharedSession};
use crate::stages::{
    attach_vectors, attribute_values, dataset_of, decision_vector, fill_missing_field, load_items, map_vector, MapData,
};

pub const NO_RESULTS: &str = "No results found";

fn update(shared: &SharedSession, f: impl FnOnce(&mut MapSession)) {
    f(&mut shared.write());
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("background task failed: {e}"))
}

fn sprite_size_for(n: usize) -> u32 {
    match n {
        0..=100 => 256,
        101..=1000 => 128,
        _ => 64,
    }
}

/// Thumbnail and answer tasks running beside the stages. Dropping it without
/// [`Background::join`] aborts whatever is still running.
struct Background {
    thumbnails: Option<JoinHandle<Result<ThumbnailAtlas>>>,
    answer: Option<JoinHandle<Result<String>>>,
}

type Joined = (Option<Result<ThumbnailAtlas>>, Option<Result<String>>);

impl Background {
    async fn join(mut self) -> Joined {
        let atlas = match self.thumbnails.take() {
            Some(handle) => Some(handle.await.map_err(join_error).and_then(|r| r)),
            None => None,
        };
        let answer = match self.answer.take() {
            Some(handle) => Some(handle.await.map_err(join_error).and_then(|r| r)),
            None => None,
        };
        (atlas, answer)
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        if let Some(handle) = &self.thumbnails {
            handle.abort();
        }
        if let Some(handle) = &self.answer {
            handle.abort();
        }
    }
}

/// Earlier session whose outputs a run takes over.
struct Reused {
    session: MapSession,
    level: ReuseLevel,
}

#[derive(Clone)]
pub struct MapOrchestrator {
    metadata: Arc<dyn MetadataStore>,
    text: Arc<dyn TextEngine>,
    vector: Arc<dyn VectorEngine>,
    generators: GeneratorRegistry,
    retriever: Arc<Retriever>,
    cache: Arc<MapCache>,
    settings: MapSettings,
    batch_size: usize,
    thumbnails: Option<Arc<dyn ThumbnailRenderer>>,
    answerer: Option<Arc<dyn QuestionAnswerer>>,
}

impl MapOrchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        text: Arc<dyn TextEngine>,
        vector: Arc<dyn VectorEngine>,
        generators: GeneratorRegistry,
        cache: Arc<MapCache>,
        settings: MapSettings,
        batch_size: usize,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(Arc::clone(&text), Arc::clone(&vector), generators.clone()));
        Self { metadata, text, vector, generators, retriever, cache, settings, batch_size, thumbnails: None, answerer: None }
    }

    pub fn with_thumbnails(mut self, renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        self.thumbnails = Some(renderer);
        self
    }

    pub fn with_answerer(mut self, answerer: Arc<dyn QuestionAnswerer>) -> Self {
        self.answerer = Some(answerer);
        self
    }

    pub fn cache(&self) -> &MapCache {
        &self.cache
    }

    fn datasets(&self, params: &ParameterSet) -> Result<Vec<Dataset>> {
        params.search.dataset_ids.iter().map(|&id| self.metadata.dataset(id)).collect()
    }

    fn stored_session(&self, id: &str) -> Result<Option<MapSession>> {
        match self.metadata.stored_map(id)? {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    /// Start (or find) the map for `params` and return its session id.
    ///
    /// Malformed parameters and unknown datasets are rejected before any
    /// stage runs. With `ignore_cache` an existing session is recomputed.
    pub fn request_map(&self, params: ParameterSet, ignore_cache: bool) -> Result<String> {
        params.validate()?;
        let datasets = self.datasets(&params)?;
        if params.projection.uses_embedding() {
            let field = &params.vectorize.map_vector_field;
            let known = datasets.iter().any(|d| d.field(field).is_some_and(|f| f.is_vector()));
            if !known {
                return Err(Error::Validation(format!("map vector field '{field}' is not a vector field of any requested dataset")));
            }
        }
        let hashes = params.stage_hashes()?;
        let id = hashes.session.clone();

        if !ignore_cache {
            if self.cache.get(&id).is_some() {
                tracing::debug!(session_id = %id, "returning cached map session");
                return Ok(id);
            }
            if let Some(stored) = self.stored_session(&id)? {
                tracing::info!(session_id = %id, "restored stored map");
                self.cache.insert(stored);
                return Ok(id);
            }
        }

        let shared = self.cache.insert(MapSession::new(id.clone(), params.clone()));
        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            if let Err(e) = this.run(&shared, &params, &datasets, &hashes, ignore_cache).await {
                tracing::error!(session_id = %hashes.session, error = %e, "map session failed");
                update(&shared, |s| s.fail(e.to_string()));
            }
            tracing::info!(session_id = %hashes.session, millis = started.elapsed().as_millis() as u64, "map session done");
        });
        Ok(id)
    }

    /// Snapshot of a session for pollers.
    pub fn poll(&self, id: &str) -> Result<MapSession> {
        self.cache.snapshot(id).ok_or_else(|| Error::NotFound(format!("map session {id}")))
    }

    /// Results of a session, from the cache or from the stored map.
    pub fn results(&self, id: &str) -> Result<MapResults> {
        if let Some(session) = self.cache.snapshot(id) {
            return Ok(session.results);
        }
        self.stored_session(id)?.map(|s| s.results).ok_or_else(|| Error::NotFound(format!("map session {id}")))
    }

    /// Persist a finished session in the metadata store.
    pub fn store_map(&self, id: &str) -> Result<()> {
        let session = self.poll(id)?;
        if !session.finished {
            return Err(Error::Validation(format!("map session {id} is still running")));
        }
        self.metadata.store_map(id, serde_json::to_vec(&session)?)
    }

    /// Title and statistics for a subset of a finished map's points.
    pub async fn selection_summary(&self, id: &str, selected: &[ItemKey]) -> Result<Option<ClusterSummary>> {
        let session = self.poll(id)?;
        let datasets = self.datasets(&session.parameters)?;
        let points = &session.results.per_point;
        let items = load_items(self.text.as_ref(), &points.ids).await?;
        let texts = descriptive_texts(&datasets, &items);
        let mask: Vec<bool> = points.ids.iter().map(|k| selected.contains(k)).collect();
        Ok(selection_summary(&texts, &points.positions, &points.scores, &mask, &TitleSettings::for_datasets(&datasets)))
    }

    fn reusable(&self, shared: &SharedSession, hashes: &StageHashes, ignore_cache: bool) -> Option<Reused> {
        if ignore_cache {
            return None;
        }
        match self.cache.find_reusable(hashes) {
            ReuseLookup::Miss => None,
            ReuseLookup::Missing { session_id } => {
                tracing::warn!(%session_id, "reusable session was evicted, recomputing");
                update(shared, |s| s.push_error(format!("session {session_id} to reuse is no longer available")));
                None
            }
            ReuseLookup::Found { session_id, level } => {
                let session = self.cache.get(&session_id)?.read().clone();
                tracing::info!(%session_id, ?level, "reusing earlier map session");
                update(shared, |s| s.reused_from = Some(session_id));
                Some(Reused { session, level })
            }
        }
    }

    async fn run(
        &self,
        shared: &SharedSession,
        params: &ParameterSet,
        datasets: &[Dataset],
        hashes: &StageHashes,
        ignore_cache: bool,
    ) -> Result<()> {
        let reused = self.reusable(shared, hashes, ignore_cache);
        let mut timings = Vec::new();

        let stage = Instant::now();
        let Some(mut data) = self.search_stage(shared, params, datasets, reused.as_ref()).await? else {
            update(shared, |s| {
                s.push_error(NO_RESULTS);
                s.finish();
            });
            return Ok(());
        };
        timings.push(timing("search", stage));
        let background =
            Background { thumbnails: self.spawn_thumbnails(params, datasets, &data), answer: self.spawn_answer(params, &data) };

        let stage = Instant::now();
        self.vectorize_stage(shared, params, datasets, &mut data, reused.as_ref()).await?;
        timings.push(timing("vectorize", stage));

        let stage = Instant::now();
        let projection = self.project_stage(shared, params, datasets, &mut data, reused.as_ref()).await?;
        timings.push(timing("project", stage));

        let stage = Instant::now();
        self.cluster_render_stage(shared, params, datasets, &mut data, &projection).await?;
        timings.push(timing("cluster_render", stage));

        let stage = Instant::now();
        let (atlas, answer) = background.join().await;
        timings.push(timing("background", stage));

        // reuse indices must be visible before pollers see `finished`
        self.cache.register(hashes, &hashes.session);
        update(shared, |s| {
            match atlas {
                Some(Ok(atlas)) => s.results.thumbnail_atlas = Some(atlas),
                Some(Err(e)) => s.push_error(format!("thumbnails: {e}")),
                None => {}
            }
            match answer {
                Some(Ok(text)) => s.results.answer = Some(text),
                Some(Err(e)) => s.push_error(format!("question answering: {e}")),
                None => {}
            }
            s.results.timings = timings;
            s.finish();
        });
        Ok(())
    }

    async fn search_stage(
        &self,
        shared: &SharedSession,
        params: &ParameterSet,
        datasets: &[Dataset],
        reused: Option<&Reused>,
    ) -> Result<Option<MapData>> {
        update(shared, |s| s.enter(MapState::Search));
        let (keys, scores, score_info, errors) = match reused {
            Some(r) => {
                let points = &r.session.results.per_point;
                (points.ids.clone(), points.scores.clone(), r.session.results.score_info.clone(), Vec::new())
            }
            None => {
                let output = self.retriever.search(datasets, &params.search).await;
                let keys: Vec<ItemKey> = output.hits.iter().map(|h| h.hit.key.clone()).collect();
                let scores: Vec<f32> = output.hits.iter().map(|h| h.score).collect();
                (keys, scores, output.score_info, output.errors)
            }
        };
        update(shared, |s| {
            s.errors.extend(errors);
            s.results.score_info = score_info;
        });
        if keys.is_empty() {
            return Ok(None);
        }
        let items = load_items(self.text.as_ref(), &keys).await?;
        tracing::info!(points = keys.len(), reused = reused.is_some(), "search stage done");
        update(shared, |s| {
            s.results.per_point.ids = keys.clone();
            s.results.per_point.scores = scores.clone();
            s.progress.fraction = 1.0;
        });
        Ok(Some(MapData { keys, scores, items, vectors: Vec::new() }))
    }

    async fn vectorize_stage(
        &self,
        shared: &SharedSession,
        params: &ParameterSet,
        datasets: &[Dataset],
        data: &mut MapData,
        reused: Option<&Reused>,
    ) -> Result<()> {
        let field = params.vectorize.map_vector_field.as_str();
        if field.is_empty() {
            return Ok(());
        }
        update(shared, |s| {
            s.enter(MapState::Vectorize);
            s.progress.total = data.len();
        });
        if let Err(e) = attach_vectors(self.vector.as_ref(), datasets, &mut data.items, field).await {
            tracing::warn!(error = %e, "loading map vectors failed");
            update(shared, |s| s.push_error(e.to_string()));
        }
        if let Some(r) = reused {
            let earlier = &r.session.results.per_point.map_vectors;
            if earlier.len() == data.len() {
                for (item, v) in data.items.iter_mut().zip(earlier) {
                    if !item.has(field) && !v.is_empty() {
                        item.set(field, FieldValue::Vector(v.clone()));
                    }
                }
            }
        }
        let errors = fill_missing_field(
            datasets,
            &mut data.items,
            field,
            &self.generators,
            self.batch_size,
            self.text.as_ref(),
            self.vector.as_ref(),
        )
        .await;
        update(shared, |s| s.errors.extend(errors));
        data.vectors = data.items.iter().map(|item| map_vector(item, field)).collect();
        let available = data.vectors.iter().filter(|v| !v.is_empty()).count();
        tracing::info!(field, available, points = data.len(), "vectorize stage done");
        update(shared, |s| {
            s.results.per_point.map_vectors = data.vectors.clone();
            s.progress.current = available;
            s.progress.fraction = 1.0;
            s.progress.embeddings_available = available > 0;
        });
        Ok(())
    }

    fn axis_decision(&self, axis: &AxisSpec, errors: &mut Vec<String>) -> Option<DecisionVector> {
        match axis {
            AxisSpec::Classifier(c) => decision_vector(self.metadata.as_ref(), c.collection_id, &c.class_name, &c.field, errors),
            _ => None,
        }
    }

    async fn project_stage(
        &self,
        shared: &SharedSession,
        params: &ParameterSet,
        datasets: &[Dataset],
        data: &mut MapData,
        reused: Option<&Reused>,
    ) -> Result<Projection> {
        update(shared, |s| s.enter(MapState::Project));
        if let Some(r) = reused.filter(|r| r.level == ReuseLevel::Projection) {
            let points = &r.session.results.per_point;
            let projection = Projection { raw: points.raw_projections.clone(), positions: points.positions.clone() };
            update(shared, |s| {
                s.results.per_point.positions = projection.positions.clone();
                s.results.per_point.raw_projections = projection.raw.clone();
                s.progress.fraction = 1.0;
                s.progress.positions_available = true;
            });
            return Ok(projection);
        }

        let mut errors = Vec::new();
        let x_decision = self.axis_decision(&params.projection.x_axis, &mut errors);
        let y_decision = self.axis_decision(&params.projection.y_axis, &mut errors);
        for axis in [&params.projection.x_axis, &params.projection.y_axis] {
            if let AxisSpec::Classifier(c) = axis {
                if let Err(e) = attach_vectors(self.vector.as_ref(), datasets, &mut data.items, &c.field).await {
                    errors.push(e.to_string());
                }
            }
        }
        update(shared, |s| s.errors.extend(errors));

        let projection_params = params.projection.clone();
        let min_points = self.settings.min_points_for_reduction;
        let (items, scores, vectors) = (data.items.clone(), data.scores.clone(), data.vectors.clone());
        let progress_session = Arc::clone(shared);
        let projection = tokio::task::spawn_blocking(move || {
            let input = ProjectionInput {
                items: &items,
                scores: &scores,
                vectors: &vectors,
                x_decision: x_decision.as_ref(),
                y_decision: y_decision.as_ref(),
            };
            let mut on_progress = |step: usize, total: usize, positions: &[[f32; 2]]| {
                update(&progress_session, |s| {
                    s.progress.current = step;
                    s.progress.total = total;
                    s.progress.fraction = step as f32 / total.max(1) as f32;
                    s.progress.positions_available = true;
                    s.results.per_point.positions = positions.to_vec();
                });
            };
            project(&projection_params, &input, min_points, &mut on_progress)
        })
        .await
        .map_err(join_error)??;

        update(shared, |s| {
            s.results.per_point.positions = projection.positions.clone();
            s.results.per_point.raw_projections = projection.raw.clone();
            s.progress.positions_available = true;
        });
        Ok(projection)
    }

    async fn cluster_render_stage(
        &self,
        shared: &SharedSession,
        params: &ParameterSet,
        datasets: &[Dataset],
        data: &mut MapData,
        projection: &Projection,
    ) -> Result<()> {
        update(shared, |s| s.enter(MapState::ClusterRender));

        let positions = projection.positions.clone();
        let scores = data.scores.clone();
        let texts = descriptive_texts(datasets, &data.items);
        let title_settings = TitleSettings::for_datasets(datasets);
        let clusterizer = HdbscanParams::for_points(positions.len(), &params.rendering.clusterizer);
        let (cluster_ids, clusters) = tokio::task::spawn_blocking(move || {
            let labels = cluster(&positions, &clusterizer);
            let clusters = cluster_summaries(&texts, &positions, &scores, &labels, &title_settings);
            (labels, clusters)
        })
        .await
        .map_err(join_error)?;
        tracing::info!(points = cluster_ids.len(), clusters = clusters.len(), "clustering done");

        let mut errors = Vec::new();
        let mut attributes = std::collections::BTreeMap::new();
        for (name, spec) in params.rendering.attributes() {
            let decision = match spec {
                AttributeSpec::Classifier(c) => {
                    if let Err(e) = attach_vectors(self.vector.as_ref(), datasets, &mut data.items, &c.field).await {
                        errors.push(e.to_string());
                    }
                    decision_vector(self.metadata.as_ref(), c.collection_id, &c.class_name, &c.field, &mut errors)
                }
                _ => None,
            };
            let values = attribute_values(spec, data, &cluster_ids, decision.as_ref()).unwrap_or_else(|e| {
                errors.push(format!("{name}: {e}"));
                vec![0.0; data.len()]
            });
            attributes.insert(name.to_string(), values);
        }

        update(shared, |s| {
            s.errors.extend(errors);
            s.results.per_point.cluster_ids = cluster_ids;
            s.results.per_point.attributes = attributes;
            s.results.clusters = clusters;
            s.progress.fraction = 1.0;
        });
        Ok(())
    }

    fn spawn_thumbnails(&self, params: &ParameterSet, datasets: &[Dataset], data: &MapData) -> Option<JoinHandle<Result<ThumbnailAtlas>>> {
        let renderer = Arc::clone(self.thumbnails.as_ref()?);
        if !datasets.iter().any(|d| d.thumbnail_field.is_some()) {
            return None;
        }
        let this = self.clone();
        let datasets = datasets.to_vec();
        let mut items = data.items.clone();
        let sprite_size = params.search.thumbnail_sprite_size.unwrap_or_else(|| sprite_size_for(items.len()));
        let name = params.stage_hashes().map(|h| h.search).unwrap_or_default();
        Some(tokio::spawn(async move {
            let fields: Vec<String> = datasets.iter().filter_map(|d| d.thumbnail_field.clone()).collect();
            for field in &fields {
                let errors = fill_missing_field(
                    &datasets,
                    &mut items,
                    field,
                    &this.generators,
                    this.batch_size,
                    this.text.as_ref(),
                    this.vector.as_ref(),
                )
                .await;
                for e in errors {
                    tracing::warn!(error = %e, "thumbnail field generation");
                }
            }
            let uris: Vec<Option<String>> = items
                .iter()
                .map(|item| {
                    dataset_of(&datasets, item.dataset_id)
                        .and_then(|d| d.thumbnail_field.as_deref())
                        .and_then(|f| item.get(f))
                        .and_then(|v| v.to_text())
                })
                .collect();
            renderer.render_atlas(&name, uris, sprite_size).await
        }))
    }

    fn spawn_answer(&self, params: &ParameterSet, data: &MapData) -> Option<JoinHandle<Result<String>>> {
        let answerer = Arc::clone(self.answerer.as_ref()?);
        let question = params.search.question.clone().filter(|q| !q.trim().is_empty())?;
        let context: Vec<Item> = data.items.iter().take(self.settings.question_top_k).cloned().collect();
        Some(tokio::spawn(async move { answerer.answer(&question, &context).await }))
    }
}

fn timing(part: &str, started: Instant) -> Timing {
    Timing { part: part.to_string(), millis: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX) }
}

fn descriptive_texts(datasets: &[Dataset], items: &[Item]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            dataset_of(datasets, item.dataset_id).map_or_else(String::new, |d| descriptive_text(item, &d.descriptive_text_fields))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn pending_answer(dropped: &Arc<AtomicBool>) -> JoinHandle<Result<String>> {
        let guard = SetOnDrop(Arc::clone(dropped));
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        })
    }

    #[tokio::test]
    async fn unjoined_background_tasks_are_aborted() {
        let dropped = Arc::new(AtomicBool::new(false));
        let background = Background { thumbnails: None, answer: Some(pending_answer(&dropped)) };
        drop(background);
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn joined_background_tasks_report_their_results() {
        let answer = tokio::spawn(async { Ok("42".to_string()) });
        let (atlas, answer) = Background { thumbnails: None, answer: Some(answer) }.join().await;
        assert!(atlas.is_none());
        assert_eq!(answer.and_then(|r| r.ok()).as_deref(), Some("42"));
    }
}
