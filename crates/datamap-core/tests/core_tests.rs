use std::fs;

use datamap_core::metadata::InMemoryMetadataStore;
use datamap_core::params::{AttributeSpec, AxisSpec, ParameterSet};
use datamap_core::schema::{Dataset, FieldSpec, FieldType};
use datamap_core::traits::{DecisionVector, MetadataStore};
use datamap_core::Error;

fn graphene_params() -> ParameterSet {
    let raw = br#"{
        "search": {"dataset_ids": [7], "query": "graphene", "use_autocut": false},
        "vectorize": {"map_vector_field": "embedding"},
        "projection": {"x_axis": {"type": "embedding"}, "y_axis": {"type": "embedding"}}
    }"#;
    ParameterSet::from_json(raw).expect("valid params")
}

#[test]
fn identical_bytes_give_identical_hashes() {
    let a = graphene_params().stage_hashes().expect("hash");
    let b = graphene_params().stage_hashes().expect("hash");
    assert_eq!(a, b);
}

#[test]
fn hashes_diverge_from_the_changed_prefix_onward() {
    let base = graphene_params();
    let base_h = base.stage_hashes().expect("hash");

    let mut render_changed = base.clone();
    render_changed.rendering.size = AttributeSpec::Score;
    let h = render_changed.stage_hashes().expect("hash");
    assert_eq!(h.search, base_h.search);
    assert_eq!(h.vectorize, base_h.vectorize);
    assert_eq!(h.projection, base_h.projection);
    assert_ne!(h.session, base_h.session, "rendering is part of the session id");

    let mut projection_changed = base.clone();
    projection_changed.projection.n_neighbors = 30;
    let h = projection_changed.stage_hashes().expect("hash");
    assert_eq!(h.vectorize, base_h.vectorize);
    assert_ne!(h.projection, base_h.projection);

    let mut search_changed = base;
    search_changed.search.query = "graphite".into();
    let h = search_changed.stage_hashes().expect("hash");
    assert_ne!(h.search, base_h.search);
    assert_ne!(h.vectorize, base_h.vectorize);
    assert_ne!(h.projection, base_h.projection);
}

#[test]
fn validation_rejects_malformed_requests() {
    let mut p = graphene_params();
    p.search.dataset_ids.clear();
    assert!(matches!(p.validate(), Err(Error::Validation(_))));

    let mut p = graphene_params();
    p.vectorize.map_vector_field.clear();
    assert!(matches!(p.validate(), Err(Error::Validation(_))), "embedding axis needs a vector field");

    let mut p = graphene_params();
    p.vectorize.map_vector_field.clear();
    p.projection.x_axis = AxisSpec::Rank;
    p.projection.y_axis = AxisSpec::Score;
    assert!(p.validate().is_ok(), "non-embedding axes do not need vectors");

    assert!(matches!(ParameterSet::from_json(b"{not json"), Err(Error::Validation(_))));
}

#[test]
fn or_queries_are_split() {
    let mut p = graphene_params();
    p.search.query = "graphene OR carbon nanotubes".into();
    assert_eq!(p.search.queries(), vec!["graphene".to_string(), "carbon nanotubes".to_string()]);
}

#[test]
fn classifier_scores_clamp_below_threshold() {
    let d = DecisionVector { vector: vec![1.0, 0.0], threshold: Some(0.5), highest_score: Some(2.0) };
    assert_eq!(d.score(&[0.2, 3.0]), 0.0);
    assert!((d.score(&[1.0, 0.0]) - 2.0).abs() < 1e-6);
    let raw = DecisionVector { vector: vec![1.0, 2.0], threshold: None, highest_score: None };
    assert!((raw.score(&[1.0, 1.0]) - 3.0).abs() < 1e-6);
}

#[test]
fn metadata_store_loads_dataset_dir() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dataset = Dataset::new(
        7,
        "papers",
        vec![FieldSpec::new("title", FieldType::Text).keyword_searchable()],
    );
    fs::write(tmp.path().join("papers.json"), serde_json::to_vec(&dataset).expect("json")).expect("write");
    fs::write(tmp.path().join("notes.txt"), "ignored").expect("write");

    let store = InMemoryMetadataStore::load_dir(tmp.path()).expect("load");
    assert_eq!(store.dataset(7).expect("dataset").name, "papers");
    assert!(matches!(store.dataset(8), Err(Error::NotFound(_))));

    store.store_map("abc", b"blob".to_vec()).expect("store");
    assert_eq!(store.stored_map("abc").expect("get").as_deref(), Some(&b"blob"[..]));
}
