use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use datamap_core::config::MapSettings;
use datamap_core::metadata::InMemoryMetadataStore;
use datamap_core::params::{AttributeSpec, ParameterSet, SearchAlgorithm, SearchParams, VectorizeParams};
use datamap_core::schema::{Dataset, FieldSpec, FieldType};
use datamap_core::session::{MapSession, MapState, ThumbnailAtlas};
use datamap_core::traits::{GeneratorOutput, QuestionAnswerer, ThumbnailRenderer, VectorEngine, VectorPoint};
use datamap_core::types::{FieldValue, Item};
use datamap_core::{Error, Result};
use datamap_fields::GeneratorRegistry;
use datamap_map::{MapCache, MapOrchestrator, NO_RESULTS};
use datamap_testkit::{FnGenerator, MemoryTextEngine, MemoryVectorEngine};

fn papers() -> Dataset {
    let mut dataset = Dataset::new(
        7,
        "papers",
        vec![
            FieldSpec::new("title", FieldType::Text).keyword_searchable(),
            FieldSpec::new("embedding", FieldType::Vector).generated_by("embed", &["title"]).vector_searchable(2),
        ],
    );
    dataset.descriptive_text_fields = vec!["title".into()];
    dataset
}

fn toy_vector(title: &str) -> Vec<f32> {
    if title.to_lowercase().contains("graphene") {
        vec![1.0, 0.1]
    } else {
        vec![0.1, 1.0]
    }
}

fn toy_embedder() -> FnGenerator {
    FnGenerator::new("embed", |input| Some(GeneratorOutput::value(FieldValue::Vector(toy_vector(&input.joined_text())))))
}

struct Fixture {
    metadata: Arc<InMemoryMetadataStore>,
    text: Arc<MemoryTextEngine>,
    vector: Arc<MemoryVectorEngine>,
    orchestrator: MapOrchestrator,
}

fn build(metadata: &Arc<InMemoryMetadataStore>, text: &Arc<MemoryTextEngine>, vector: &Arc<MemoryVectorEngine>) -> MapOrchestrator {
    build_with(metadata, text, vector, GeneratorRegistry::new().with(Arc::new(toy_embedder())))
}

fn build_with(
    metadata: &Arc<InMemoryMetadataStore>,
    text: &Arc<MemoryTextEngine>,
    vector: &Arc<MemoryVectorEngine>,
    generators: GeneratorRegistry,
) -> MapOrchestrator {
    MapOrchestrator::new(
        metadata.clone(),
        text.clone(),
        vector.clone(),
        generators,
        Arc::new(MapCache::new(&MapSettings::default())),
        MapSettings::default(),
        16,
    )
}

impl Fixture {
    /// A second orchestrator over the same stores with an empty cache.
    fn orchestrator(&self) -> MapOrchestrator {
        build(&self.metadata, &self.text, &self.vector)
    }
}

/// `indexed` titles are stored in both engines, `text_only` ones lack a vector.
async fn fixture(indexed: &[(&str, &str)], text_only: &[(&str, &str)]) -> anyhow::Result<Fixture> {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.put_dataset(papers());
    let all = indexed.iter().chain(text_only);
    let text = Arc::new(MemoryTextEngine::with_items(
        all.map(|(id, t)| Item::new(7, *id).with_field("title", FieldValue::Text((*t).into()))).collect(),
    ));
    let vector = Arc::new(MemoryVectorEngine::new());
    let points: Vec<VectorPoint> = indexed
        .iter()
        .map(|(id, t)| VectorPoint { item_id: (*id).to_string(), vectors: vec![toy_vector(t)], payload: BTreeMap::new() })
        .collect();
    vector.upsert(7, "embedding", &points).await?;

    let orchestrator = build(&metadata, &text, &vector);
    Ok(Fixture { metadata, text, vector, orchestrator })
}

const FOUR: [(&str, &str); 4] =
    [("1", "Graphene transistors"), ("2", "Graphene oxide membranes"), ("3", "Protein folding"), ("4", "Soil bacteria")];

fn params(query: &str) -> ParameterSet {
    ParameterSet {
        search: SearchParams { dataset_ids: vec![7], query: query.into(), ..SearchParams::default() },
        vectorize: VectorizeParams { map_vector_field: "embedding".into() },
        ..ParameterSet::default()
    }
}

async fn wait_finished(orchestrator: &MapOrchestrator, id: &str) -> anyhow::Result<MapSession> {
    for _ in 0..500 {
        let session = orchestrator.poll(id)?;
        if session.finished {
            return Ok(session);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("map session {id} did not finish")
}

#[tokio::test]
async fn small_map_is_laid_out_without_clusters() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    assert!(session.errors.is_empty(), "{:?}", session.errors);
    let points = &session.results.per_point;
    assert_eq!(points.len(), 4);
    assert_eq!(points.positions.len(), 4);
    assert_eq!(points.cluster_ids, vec![-1; 4]);
    assert!(session.results.clusters.is_empty());
    assert!(session.progress.embeddings_available && session.progress.positions_available);
    assert_eq!(points.attributes["size"], vec![0.5; 4]);
    assert_eq!(points.attributes["hue"], vec![-1.0; 4]);
    let parts: Vec<&str> = session.results.timings.iter().map(|t| t.part.as_str()).collect();
    assert_eq!(parts, vec!["search", "vectorize", "project", "cluster_render", "background"]);
    Ok(())
}

#[tokio::test]
async fn larger_map_runs_the_reducer_and_clusterer() -> anyhow::Result<()> {
    let titles: Vec<(String, String)> = (0..12)
        .map(|i| {
            let title = if i % 2 == 0 {
                format!("Graphene sample {i}")
            } else {
                format!("Soil bacteria {i}")
            };
            (i.to_string(), title)
        })
        .collect();
    let refs: Vec<(&str, &str)> = titles.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let fx = fixture(&refs, &[]).await?;
    let mut p = params("graphene");
    p.projection.n_epochs = 50;
    let id = fx.orchestrator.request_map(p, false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    let points = &session.results.per_point;
    assert_eq!(points.len(), 12);
    assert!(points.positions.iter().flatten().all(|x| x.is_finite()));
    assert_eq!(points.cluster_ids.len(), 12);
    let hue: Vec<f32> = points.cluster_ids.iter().map(|&c| c as f32).collect();
    assert_eq!(points.attributes["hue"], hue);
    Ok(())
}

#[tokio::test]
async fn rendering_change_reuses_positions() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let first = fx.orchestrator.request_map(params("graphene"), false)?;
    let first = wait_finished(&fx.orchestrator, &first).await?;

    let mut restyled = params("graphene");
    restyled.rendering.size = AttributeSpec::Constant { value: 0.8 };
    let second = fx.orchestrator.request_map(restyled, false)?;
    assert_ne!(second, first.id);
    let second = wait_finished(&fx.orchestrator, &second).await?;

    assert_eq!(second.reused_from.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.results.per_point.ids, first.results.per_point.ids);
    assert_eq!(second.results.per_point.positions, first.results.per_point.positions);
    assert_eq!(second.results.per_point.attributes["size"], vec![0.8; 4]);
    Ok(())
}

#[tokio::test]
async fn identical_request_returns_the_cached_session() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    wait_finished(&fx.orchestrator, &id).await?;
    assert_eq!(fx.orchestrator.request_map(params("graphene"), false)?, id);
    assert_eq!(fx.orchestrator.cache().len(), 1);

    let again = fx.orchestrator.request_map(params("graphene"), true)?;
    assert_eq!(again, id);
    let session = wait_finished(&fx.orchestrator, &again).await?;
    assert!(session.reused_from.is_none());
    Ok(())
}

#[tokio::test]
async fn missing_map_vectors_are_generated_and_stored() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[("5", "Graphene aerogels")]).await?;
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    assert!(session.results.per_point.ids.iter().any(|k| k.item_id == "5"));
    let stored = fx.vector.get_vectors(7, "embedding", &["5".to_string()]).await?;
    assert_eq!(stored.get("5"), Some(&FieldValue::Vector(vec![1.0, 0.1])));
    Ok(())
}

#[tokio::test]
async fn empty_search_finishes_with_an_error() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let mut p = params("perovskite");
    p.search.search_algorithm = SearchAlgorithm::Keyword;
    let id = fx.orchestrator.request_map(p, false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    assert!(session.errors.iter().any(|e| e == NO_RESULTS));
    assert!(session.results.per_point.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected_up_front() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    assert!(matches!(fx.orchestrator.request_map(ParameterSet::default(), false), Err(Error::Validation(_))));

    let mut unknown = params("graphene");
    unknown.search.dataset_ids = vec![99];
    assert!(matches!(fx.orchestrator.request_map(unknown, false), Err(Error::NotFound(_))));

    let mut no_vectors = params("graphene");
    no_vectors.vectorize.map_vector_field = "title".into();
    assert!(matches!(fx.orchestrator.request_map(no_vectors, false), Err(Error::Validation(_))));

    assert!(matches!(fx.orchestrator.poll("nope"), Err(Error::NotFound(_))));
    assert!(fx.orchestrator.cache().is_empty());
    Ok(())
}

#[tokio::test]
async fn stored_maps_outlive_the_cache() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;
    fx.orchestrator.store_map(&id)?;

    let fresh = fx.orchestrator();
    assert!(matches!(fresh.poll(&id), Err(Error::NotFound(_))));
    assert_eq!(fresh.results(&id)?, session.results);

    assert_eq!(fresh.request_map(params("graphene"), false)?, id);
    let restored = fresh.poll(&id)?;
    assert!(restored.finished);
    assert_eq!(restored.results.per_point.positions, session.results.per_point.positions);
    Ok(())
}

#[tokio::test]
async fn selection_gets_a_summary() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    let selected: Vec<_> = session.results.per_point.ids.iter().filter(|k| k.item_id == "1" || k.item_id == "2").cloned().collect();
    let summary = fx.orchestrator.selection_summary(&id, &selected).await?;
    let summary = summary.ok_or_else(|| anyhow::anyhow!("no summary"))?;
    assert_eq!(summary.member_count, 2);
    Ok(())
}

struct CountingAnswerer;

#[async_trait]
impl QuestionAnswerer for CountingAnswerer {
    async fn answer(&self, question: &str, context: &[Item]) -> Result<String> {
        Ok(format!("{question} ({} sources)", context.len()))
    }
}

#[tokio::test]
async fn question_is_answered_from_the_top_results() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let orchestrator = fx.orchestrator().with_answerer(Arc::new(CountingAnswerer));
    let mut p = params("graphene");
    p.search.question = Some("What is graphene used for?".into());
    let id = orchestrator.request_map(p, false)?;
    let session = wait_finished(&orchestrator, &id).await?;

    assert_eq!(session.results.answer.as_deref(), Some("What is graphene used for? (4 sources)"));
    Ok(())
}

#[tokio::test]
async fn projection_change_keeps_the_generated_map_vectors() -> anyhow::Result<()> {
    let titles: Vec<(String, String)> = (0..8).map(|i| (i.to_string(), format!("Graphene film {i}"))).collect();
    let refs: Vec<(&str, &str)> = titles.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let fx = fixture(&[], &refs).await?;
    fx.vector.set_failing(true);
    let embedded = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&embedded);
    let embedder = FnGenerator::new("embed", move |input| {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(GeneratorOutput::value(FieldValue::Vector(toy_vector(&input.joined_text()))))
    });
    let orchestrator = build_with(&fx.metadata, &fx.text, &fx.vector, GeneratorRegistry::new().with(Arc::new(embedder)));

    let mut p = params("graphene");
    p.search.search_algorithm = SearchAlgorithm::Keyword;
    let first = orchestrator.request_map(p.clone(), false)?;
    let first = wait_finished(&orchestrator, &first).await?;
    assert!(first.progress.embeddings_available, "{:?}", first.errors);
    assert_eq!(first.results.per_point.map_vectors.len(), 8);
    let generated = embedded.load(Ordering::SeqCst);
    assert_eq!(generated, 8);

    p.projection.n_epochs = 120;
    let second = orchestrator.request_map(p, false)?;
    let second = wait_finished(&orchestrator, &second).await?;

    assert_eq!(second.reused_from.as_deref(), Some(first.id.as_str()));
    assert!(second.progress.embeddings_available);
    assert_eq!(second.results.per_point.ids, first.results.per_point.ids);
    assert_eq!(second.results.per_point.map_vectors, first.results.per_point.map_vectors);
    assert_eq!(embedded.load(Ordering::SeqCst), generated);
    Ok(())
}

#[tokio::test]
async fn failing_stage_ends_the_session_in_error() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    fx.text.set_failing(true);
    let id = fx.orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&fx.orchestrator, &id).await?;

    assert_eq!(session.state, MapState::Error);
    assert!(session.finished);
    assert!(!session.errors.is_empty());
    Ok(())
}

fn illustrated() -> Dataset {
    let mut dataset = papers();
    dataset.fields.push(FieldSpec::new("thumb", FieldType::Text).generated_by("thumb", &["title"]));
    dataset.thumbnail_field = Some("thumb".into());
    dataset
}

/// Lays out one sprite per point; points without an image get a zero aspect ratio.
struct StubRenderer;

#[async_trait]
impl ThumbnailRenderer for StubRenderer {
    async fn render_atlas(&self, name: &str, uris: Vec<Option<String>>, sprite_size: u32) -> Result<ThumbnailAtlas> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let aspect_ratios = uris
            .iter()
            .map(|u| match u {
                Some(uri) if uri.starts_with("thumbs/") => 1.0,
                _ => 0.0,
            })
            .collect();
        Ok(ThumbnailAtlas { filename: format!("{name}.jpg"), sprite_size, aspect_ratios })
    }
}

struct BrokenRenderer;

#[async_trait]
impl ThumbnailRenderer for BrokenRenderer {
    async fn render_atlas(&self, _name: &str, _uris: Vec<Option<String>>, _sprite_size: u32) -> Result<ThumbnailAtlas> {
        Err(Error::upstream("renderer", "atlas service unavailable"))
    }
}

fn illustrated_orchestrator(fx: &Fixture, renderer: Arc<dyn ThumbnailRenderer>) -> MapOrchestrator {
    fx.metadata.put_dataset(illustrated());
    let generators = GeneratorRegistry::new().with(Arc::new(toy_embedder())).with(Arc::new(FnGenerator::text("thumb", "thumbs/")));
    build_with(&fx.metadata, &fx.text, &fx.vector, generators).with_thumbnails(renderer)
}

#[tokio::test]
async fn thumbnail_atlas_is_ready_when_the_map_finishes() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let orchestrator = illustrated_orchestrator(&fx, Arc::new(StubRenderer));
    let id = orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&orchestrator, &id).await?;

    assert!(session.errors.is_empty(), "{:?}", session.errors);
    let atlas = session.results.thumbnail_atlas.ok_or_else(|| anyhow::anyhow!("no atlas"))?;
    assert_eq!(atlas.sprite_size, 256);
    assert_eq!(atlas.aspect_ratios, vec![1.0; session.results.per_point.len()]);
    Ok(())
}

#[tokio::test]
async fn thumbnail_failure_is_reported_and_the_map_still_finishes() -> anyhow::Result<()> {
    let fx = fixture(&FOUR, &[]).await?;
    let orchestrator = illustrated_orchestrator(&fx, Arc::new(BrokenRenderer));
    let id = orchestrator.request_map(params("graphene"), false)?;
    let session = wait_finished(&orchestrator, &id).await?;

    assert_eq!(session.state, MapState::Finished);
    assert!(session.results.thumbnail_atlas.is_none());
    assert!(session.errors.iter().any(|e| e.starts_with("thumbnails:")), "{:?}", session.errors);
    assert_eq!(session.results.per_point.positions.len(), 4);
    Ok(())
}
