use std::collections::BTreeMap;
use std::sync::Arc;

use datamap_core::params::{AutocutStrategy, SearchAlgorithm, SearchParams};
use datamap_core::schema::{Dataset, FieldSpec, FieldType};
use datamap_core::traits::{GeneratorOutput, VectorEngine, VectorPoint};
use datamap_core::types::{EngineHit, FieldValue, Item, OriginKind, ResultSet};
use datamap_fields::GeneratorRegistry;
use datamap_retrieval::{autocut, fuse, score_curve, AutocutSettings, Cutoff, Retriever};
use datamap_testkit::{FnGenerator, MemoryTextEngine, MemoryVectorEngine};

fn set(kind: OriginKind, field: &str, ids_scores: &[(&str, f32)]) -> ResultSet {
    let hits = ids_scores
        .iter()
        .map(|(id, score)| EngineHit { id: (*id).to_string(), score: *score, highlights: None, relevant_parts: Vec::new() })
        .collect();
    ResultSet::from_ranked(kind, 1, field, "graphene", hits)
}

#[test]
fn single_set_keeps_native_scores() {
    let only = set(OriginKind::Vector, "embedding", &[("a", 0.91), ("b", 0.74), ("c", 0.12)]);
    let fused = fuse(&[only], 10);
    let scores: Vec<f32> = fused.iter().map(|f| f.score).collect();
    assert_eq!(scores, vec![0.91, 0.74, 0.12]);
    let last = fused[1].hit.origins.last().expect("fusion origin");
    assert_eq!(last.kind, OriginKind::ReciprocalRank);
    assert_eq!(last.rank, 2);
}

#[test]
fn item_ranked_first_twice_scores_sqrt_two() {
    let keyword = set(OriginKind::Keyword, "title", &[("x", 12.0), ("y", 3.0)]);
    let vector = set(OriginKind::Vector, "embedding", &[("x", 0.8), ("z", 0.7)]);
    let fused = fuse(&[keyword, vector], 10);
    assert_eq!(fused[0].hit.key.item_id, "x");
    assert!((fused[0].score - 2.0_f32.sqrt()).abs() < 1e-6);
    assert!((fused[0].reciprocal_rank_score - 2.0).abs() < 1e-6);
    let kinds: Vec<OriginKind> = fused[0].hit.origins.iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OriginKind::Keyword, OriginKind::Vector, OriginKind::ReciprocalRank]);
}

#[test]
fn fusion_is_bounded_and_ties_keep_first_seen_order() {
    let a = set(OriginKind::Keyword, "title", &[("a", 4.0), ("b", 3.0), ("c", 2.0), ("d", 1.0)]);
    let b = set(OriginKind::Vector, "embedding", &[("e", 0.9), ("f", 0.8), ("g", 0.7), ("h", 0.6)]);
    let fused = fuse(&[a, b], 5);
    let ids: Vec<&str> = fused.iter().map(|f| f.hit.key.item_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "e", "b", "f", "c"]);
    assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn empty_input_fuses_to_nothing() {
    assert!(fuse(&[], 10).is_empty());
    let empty = set(OriginKind::Keyword, "title", &[]);
    assert!(fuse(&[empty], 10).is_empty());
}

#[test]
fn autocut_never_cuts_below_min_results() {
    let mut scores = vec![0.99, 0.98];
    scores.extend((0..30).map(|i| 0.1 - i as f32 * 0.001));
    for strategy in [AutocutStrategy::KneePoint, AutocutStrategy::NearestNeighbourDistanceRatio, AutocutStrategy::StaticThreshold] {
        for k in [0, 1, 5, 10, 40] {
            let settings = AutocutSettings { strategy, min_results: k, min_score: 0.5, max_relative_decline: 1.0 };
            let cut = autocut(&scores, &settings);
            assert!(cut.count >= k.min(scores.len()), "{strategy:?} k={k} cut={}", cut.count);
            assert!(cut.count <= scores.len());
        }
    }
    let settings = AutocutSettings { strategy: AutocutStrategy::KneePoint, min_results: 1, min_score: 0.0, max_relative_decline: 1.0 };
    assert_eq!(autocut(&[], &settings).count, 0);
    assert_eq!(autocut(&[0.3], &settings).count, 1);
}

#[test]
fn score_curve_reports_boundary_examples() {
    let s = set(OriginKind::Vector, "embedding", &[("a", 0.9), ("b", 0.88), ("c", 0.87), ("d", 0.2), ("e", 0.19)]);
    let curve = score_curve(&s, &Cutoff { count: 3, reason: "test".into() }).expect("curve");
    assert_eq!(curve.title, "vector, embedding, graphene");
    let pos: Vec<&str> = curve.positive_examples.iter().map(|k| k.item_id.as_str()).collect();
    let neg: Vec<&str> = curve.negative_examples.iter().map(|k| k.item_id.as_str()).collect();
    assert_eq!(pos, vec!["b", "c"]);
    assert_eq!(neg, vec!["d", "e"]);

    let uncut = score_curve(&s, &Cutoff::keep_all(5)).expect("curve");
    assert_eq!(uncut.cutoff, 5);
    assert!(uncut.positive_examples.is_empty());
}

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

fn toy_embedder() -> FnGenerator {
    FnGenerator::new("embed", |input| {
        let text = input.joined_text().to_lowercase();
        let v = if text.contains("graphene") { vec![1.0, 0.1] } else { vec![0.1, 1.0] };
        Some(GeneratorOutput::value(FieldValue::Vector(v)))
    })
}

async fn engines() -> anyhow::Result<(Arc<MemoryTextEngine>, Arc<MemoryVectorEngine>)> {
    let titles = [("1", "Graphene transistors"), ("2", "Graphene oxide membranes"), ("3", "Protein folding"), ("4", "Soil bacteria")];
    let text = Arc::new(MemoryTextEngine::with_items(
        titles.iter().map(|(id, t)| Item::new(7, *id).with_field("title", FieldValue::Text((*t).into()))).collect(),
    ));
    let vector = Arc::new(MemoryVectorEngine::new());
    let points: Vec<VectorPoint> = titles
        .iter()
        .map(|(id, t)| VectorPoint {
            item_id: (*id).to_string(),
            vectors: vec![if t.contains("Graphene") { vec![1.0, 0.1] } else { vec![0.1, 1.0] }],
            payload: BTreeMap::new(),
        })
        .collect();
    vector.upsert(7, "embedding", &points).await?;
    Ok((text, vector))
}

#[tokio::test]
async fn hybrid_search_fuses_keyword_and_vector_sets() -> anyhow::Result<()> {
    let (text, vector) = engines().await?;
    let retriever = Retriever::new(text, vector, GeneratorRegistry::new().with(Arc::new(toy_embedder())));
    let params = SearchParams { dataset_ids: vec![7], query: "graphene".into(), ..SearchParams::default() };

    let out = retriever.search(&[papers()], &params).await;
    assert!(out.errors.is_empty());
    assert_eq!(out.score_info.len(), 2);
    let top: Vec<&str> = out.hits.iter().take(2).map(|h| h.hit.key.item_id.as_str()).collect();
    assert!(top.contains(&"1") && top.contains(&"2"));
    let kinds: Vec<OriginKind> = out.hits[0].hit.origins.iter().map(|o| o.kind).collect();
    assert!(kinds.contains(&OriginKind::Keyword) && kinds.contains(&OriginKind::Vector));
    Ok(())
}

#[tokio::test]
async fn failing_engine_degrades_to_an_empty_set() -> anyhow::Result<()> {
    let (text, vector) = engines().await?;
    text.set_failing(true);
    let retriever = Retriever::new(text, vector, GeneratorRegistry::new().with(Arc::new(toy_embedder())));
    let params = SearchParams { dataset_ids: vec![7], query: "graphene".into(), ..SearchParams::default() };

    let out = retriever.search(&[papers()], &params).await;
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.hits.len(), 4, "vector set still contributes");
    assert!((out.hits[0].score - 1.0).abs() < 1e-5, "single contributing set keeps cosine scores");
    Ok(())
}

#[tokio::test]
async fn or_queries_and_max_items() -> anyhow::Result<()> {
    let (text, vector) = engines().await?;
    let retriever = Retriever::new(text, vector, GeneratorRegistry::new());
    let params = SearchParams {
        dataset_ids: vec![7],
        query: "graphene OR protein".into(),
        search_algorithm: SearchAlgorithm::Keyword,
        max_items: 2,
        ..SearchParams::default()
    };
    let out = retriever.search(&[papers()], &params).await;
    assert_eq!(out.score_info.len(), 2);
    assert_eq!(out.hits.len(), 2);
    Ok(())
}
