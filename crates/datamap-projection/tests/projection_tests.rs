use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

use datamap_core::params::{AxisSpec, ClusterizerParams, ProjectionParams};
use datamap_core::types::{FieldValue, Item};
use datamap_projection::{
    cluster, cluster_summaries, descriptive_text, project, selection_summary, HdbscanParams, ProjectionInput,
    TitleSettings,
};

fn blob(rng: &mut StdRng, center: [f32; 2], n: usize) -> Vec<[f32; 2]> {
    (0..n).map(|_| [center[0] + rng.gen_range(-1.0..1.0), center[1] + rng.gen_range(-1.0..1.0)]).collect()
}

#[test]
fn fewer_than_six_points_are_all_noise() {
    let points = [[0.0, 0.0], [0.1, 0.0], [0.0, 0.1], [10.0, 10.0], [10.1, 10.0]];
    let params = HdbscanParams::for_points(points.len(), &ClusterizerParams::default());
    assert_eq!(cluster(&points, &params), vec![-1; 5]);
}

#[test]
fn two_separated_blobs_give_two_clusters() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut points = blob(&mut rng, [0.0, 0.0], 12);
    points.extend(blob(&mut rng, [50.0, 50.0], 12));
    let clusterizer = ClusterizerParams { min_cluster_size: Some(7), ..ClusterizerParams::default() };
    let labels = cluster(&points, &HdbscanParams::for_points(points.len(), &clusterizer));

    let found: BTreeSet<i32> = labels.iter().copied().filter(|l| *l >= 0).collect();
    assert_eq!(found.len(), 2, "labels: {labels:?}");
    let left: BTreeSet<i32> = labels[..12].iter().copied().filter(|l| *l >= 0).collect();
    let right: BTreeSet<i32> = labels[12..].iter().copied().filter(|l| *l >= 0).collect();
    assert!(left.is_disjoint(&right));
}

#[test]
fn tiny_blobs_split_with_default_parameters() {
    for per_blob in [3, 4] {
        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut points = blob(&mut rng, [0.0, 0.0], per_blob);
            points.extend(blob(&mut rng, [50.0, 50.0], per_blob));
            let labels = cluster(&points, &HdbscanParams::for_points(points.len(), &ClusterizerParams::default()));

            let found: BTreeSet<i32> = labels.iter().copied().filter(|l| *l >= 0).collect();
            assert_eq!(found.len(), 2, "n = {}, seed {seed}: {labels:?}", points.len());
            let left: BTreeSet<i32> = labels[..per_blob].iter().copied().collect();
            let right: BTreeSet<i32> = labels[per_blob..].iter().copied().collect();
            assert_eq!(left.len(), 1);
            assert_eq!(right.len(), 1);
            assert!(left.is_disjoint(&right));
        }
    }
}

#[test]
fn non_finite_positions_are_noise() {
    let mut points = vec![[0.0, 0.0]; 8];
    points[3] = [f32::NAN, 1.0];
    let params = HdbscanParams::for_points(points.len(), &ClusterizerParams::default());
    assert!(cluster(&points, &params).iter().all(|l| *l == -1));
}

#[test]
fn embedding_projection_is_seeded_and_finite() {
    let mut rng = StdRng::seed_from_u64(3);
    let items: Vec<Item> = (0..20).map(|i| Item::new(1, format!("p{i}"))).collect();
    let vectors: Vec<Vec<f32>> = (0..20)
        .map(|i| {
            let base = if i < 10 { 0.0 } else { 5.0 };
            (0..8).map(|_| base + rng.gen_range(-0.1..0.1)).collect()
        })
        .collect();
    let scores = vec![1.0; 20];
    let params = ProjectionParams { n_epochs: 60, ..ProjectionParams::default() };
    let input = ProjectionInput { items: &items, scores: &scores, vectors: &vectors, x_decision: None, y_decision: None };

    let mut updates = 0;
    let first = project(&params, &input, 6, &mut |_, _, _| updates += 1).unwrap();
    let second = project(&params, &input, 6, &mut |_, _, _| {}).unwrap();
    assert_eq!(first.positions.len(), 20);
    assert!(first.positions.iter().flatten().all(|x| x.is_finite()));
    assert_eq!(first.positions, second.positions);
    assert!(updates >= 10);
}

#[test]
fn small_maps_use_the_fallback_grid() {
    let items: Vec<Item> = (0..4).map(|i| Item::new(7, format!("g{i}"))).collect();
    let vectors = vec![vec![1.0, 0.0]; 4];
    let input = ProjectionInput { items: &items, scores: &[0.9, 0.8, 0.7, 0.6], vectors: &vectors, x_decision: None, y_decision: None };
    let out = project(&ProjectionParams::default(), &input, 6, &mut |_, _, _| {}).unwrap();
    assert_eq!(out.positions, vec![[1.0, 1.0], [2.0, 1.0], [1.0, 2.0], [2.0, 2.0]]);
}

#[test]
fn polar_layout_stays_within_the_unit_circle() {
    let items: Vec<Item> =
        (0..5).map(|i| Item::new(1, format!("y{i}")).with_field("year", FieldValue::Number(i as f64))).collect();
    let params = ProjectionParams {
        x_axis: AxisSpec::Score,
        y_axis: AxisSpec::NumberField { field: "year".into() },
        use_polar_coordinates: true,
        ..ProjectionParams::default()
    };
    let input = ProjectionInput { items: &items, scores: &[1.0, 0.8, 0.6, 0.4, 0.2], vectors: &[], x_decision: None, y_decision: None };
    let out = project(&params, &input, 6, &mut |_, _, _| {}).unwrap();
    assert!(out.positions.iter().all(|p| (p[0] * p[0] + p[1] * p[1]).sqrt() <= 1.0 + 1e-5));
    // highest score sits in the centre
    assert!(out.positions[0][0].abs() < 1e-6 && out.positions[0][1].abs() < 1e-6);
}

fn paper(id: &str, title: &str) -> Item {
    Item::new(1, id).with_field("title", FieldValue::Text(title.to_string()))
}

#[test]
fn clusters_get_titles_without_substring_duplicates() {
    let items = vec![
        paper("a", "Graphene oxide membranes for water filtration"),
        paper("b", "Reduced graphene oxide membranes"),
        paper("c", "Graphene oxide membranes and desalination"),
        paper("d", "Perovskite solar cells with high efficiency"),
        paper("e", "Stable perovskite solar cells"),
        paper("f", "Perovskite solar cells under humidity"),
    ];
    let fields = vec!["title".to_string()];
    let texts: Vec<String> = items.iter().map(|i| descriptive_text(i, &fields)).collect();
    let positions = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [10.0, 10.0], [11.0, 10.0], [10.0, 11.0]];
    let scores = [1.0, 0.9, 0.8, 0.3, 0.2, 0.0];
    let labels = [0, 0, 0, 1, 1, 1];
    let settings = TitleSettings::for_datasets(&[datamap_core::schema::Dataset::new(1, "papers", Vec::new())]);

    let clusters = cluster_summaries(&texts, &positions, &scores, &labels, &settings);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].id, 0);
    assert!(clusters[0].avg_score > clusters[1].avg_score);
    assert_eq!(clusters[0].member_count, 3);
    assert!((clusters[0].centroid[0] - 1.0 / 3.0).abs() < 1e-6);
    assert!(clusters[0].title.ends_with("(3x, 90%)"), "{}", clusters[0].title);
    assert!(clusters[0].title_html.starts_with("<span style=\"font-weight: bold;\">"));

    for c in &clusters {
        let words: Vec<&str> = c.title.split(" (").next().unwrap_or_default().split(", ").collect();
        for (i, w) in words.iter().enumerate() {
            for (j, other) in words.iter().enumerate() {
                assert!(i == j || !other.contains(w), "{w} is part of {other} in {}", c.title);
            }
        }
    }
}

#[test]
fn selection_is_titled_as_one_cluster() {
    let items = vec![paper("a", "Graphene sensors"), paper("b", "Graphene sensors array"), paper("c", "Battery anodes")];
    let fields = vec!["title".to_string()];
    let texts: Vec<String> = items.iter().map(|i| descriptive_text(i, &fields)).collect();
    let summary = selection_summary(
        &texts,
        &[[0.0, 0.0], [2.0, 0.0], [9.0, 9.0]],
        &[1.0, 0.5, 0.0],
        &[true, true, false],
        &TitleSettings::default(),
    )
    .unwrap();
    assert_eq!(summary.member_count, 2);
    assert_eq!(summary.centroid, [1.0, 0.0]);
}
