//! Helpers shared by the map stages: loading items, filling map vectors and
//! computing render attributes.

use std::collections::{BTreeMap, HashMap};

use datamap_core::params::AttributeSpec;
use datamap_core::schema::{Dataset, FieldSpec};
use datamap_core::traits::{DecisionVector, MetadataStore, TextEngine, VectorEngine};
use datamap_core::types::{DatasetId, FieldValue, Item, ItemKey};
use datamap_core::{Error, Result};
use datamap_fields::backfill::persist_items;
use datamap_fields::{plan_for_schema, FieldSelection, GeneratorRegistry, PipelineExecutor};
use datamap_projection::{source_values, ValueSource};

/// Items, fused scores and map vectors of one session, in rank order.
#[derive(Debug, Clone, Default)]
pub struct MapData {
    pub keys: Vec<ItemKey>,
    pub scores: Vec<f32>,
    pub items: Vec<Item>,
    pub vectors: Vec<Vec<f32>>,
}

impl MapData {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub fn dataset_of<'a>(datasets: &'a [Dataset], id: DatasetId) -> Option<&'a Dataset> {
    datasets.iter().find(|d| d.id == id)
}

fn positions_by_dataset(keys: &[ItemKey]) -> BTreeMap<DatasetId, Vec<usize>> {
    let mut grouped: BTreeMap<DatasetId, Vec<usize>> = BTreeMap::new();
    for (i, key) in keys.iter().enumerate() {
        grouped.entry(key.dataset_id).or_default().push(i);
    }
    grouped
}

/// Load every stored field of `keys`, keeping their order. Ids the text
/// engine no longer knows come back as empty items.
pub async fn load_items(text: &dyn TextEngine, keys: &[ItemKey]) -> Result<Vec<Item>> {
    let mut items: Vec<Item> = keys.iter().map(|k| Item::new(k.dataset_id, k.item_id.clone())).collect();
    for (dataset_id, positions) in positions_by_dataset(keys) {
        let ids: Vec<String> = positions.iter().map(|&i| keys[i].item_id.clone()).collect();
        let mut loaded: HashMap<String, Item> =
            text.get_by_ids(dataset_id, &ids, &[]).await?.into_iter().map(|item| (item.id.clone(), item)).collect();
        for i in positions {
            if let Some(item) = loaded.remove(&keys[i].item_id) {
                items[i] = item;
            }
        }
    }
    Ok(items)
}

/// Attach `field` from the vector engine to items of datasets that declare it as a vector field.
pub async fn attach_vectors(vector: &dyn VectorEngine, datasets: &[Dataset], items: &mut [Item], field: &str) -> Result<()> {
    let keys: Vec<ItemKey> = items.iter().map(Item::key).collect();
    for (dataset_id, positions) in positions_by_dataset(&keys) {
        let declared = dataset_of(datasets, dataset_id).and_then(|d| d.field(field)).is_some_and(FieldSpec::is_vector);
        if !declared {
            continue;
        }
        let ids: Vec<String> = positions.iter().filter(|&&i| !items[i].has(field)).map(|&i| keys[i].item_id.clone()).collect();
        if ids.is_empty() {
            continue;
        }
        let mut vectors = vector.get_vectors(dataset_id, field, &ids).await?;
        for i in positions {
            if let Some(v) = vectors.remove(&keys[i].item_id) {
                items[i].set(field, v);
            }
        }
    }
    Ok(())
}

/// Generate `field` for items that lack it and write the results back to
/// the engines. Returns recoverable error messages.
pub async fn fill_missing_field(
    datasets: &[Dataset],
    items: &mut [Item],
    field: &str,
    registry: &GeneratorRegistry,
    batch_size: usize,
    text: &dyn TextEngine,
    vector: &dyn VectorEngine,
) -> Vec<String> {
    let mut errors = Vec::new();
    let keys: Vec<ItemKey> = items.iter().map(Item::key).collect();
    for (dataset_id, positions) in positions_by_dataset(&keys) {
        let Some(dataset) = dataset_of(datasets, dataset_id) else {
            continue;
        };
        let missing: Vec<usize> = positions.into_iter().filter(|&i| !items[i].has(field)).collect();
        if missing.is_empty() || !dataset.field(field).is_some_and(FieldSpec::has_generator) {
            continue;
        }
        let plan = match plan_for_schema(dataset, &FieldSelection::Only(vec![field.to_string()])) {
            Ok(plan) => plan,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };
        let mut batch: Vec<Item> = missing.iter().map(|&i| items[i].clone()).collect();
        let report = PipelineExecutor::new(registry, batch_size).run(&plan, &mut batch).await;
        errors.extend(report.error_messages());

        let changed: Vec<Item> = report.changed_fields.keys().map(|&b| batch[b].clone()).collect();
        tracing::info!(dataset_id, field, missing = missing.len(), generated = changed.len(), "filled missing map field");
        if let Err(e) = persist_items(dataset, &changed, text, vector).await {
            tracing::warn!(dataset_id, error = %e, "storing generated values failed");
            errors.push(e.to_string());
        }
        for (item, i) in batch.into_iter().zip(missing) {
            items[i] = item;
        }
    }
    errors
}

/// The vector an item is placed by: the value itself, or the mean of an
/// array field's element vectors. Empty when the item has none.
pub fn map_vector(item: &Item, field: &str) -> Vec<f32> {
    match item.get(field) {
        Some(FieldValue::Vector(v)) => v.clone(),
        Some(FieldValue::VectorList(list)) if !list.is_empty() => {
            let width = list[0].len();
            let mut mean = vec![0.0; width];
            let mut summed = 0usize;
            for v in list.iter().filter(|v| v.len() == width) {
                for (m, x) in mean.iter_mut().zip(v) {
                    *m += x;
                }
                summed += 1;
            }
            mean.iter_mut().for_each(|m| *m /= summed as f32);
            mean
        }
        _ => Vec::new(),
    }
}

/// Decision vector for a classifier attribute or axis; failures are logged and reported.
pub fn decision_vector(
    metadata: &dyn MetadataStore,
    collection_id: u32,
    class_name: &str,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<DecisionVector> {
    match metadata.classifier_decision_vector(collection_id, class_name, field) {
        Ok(decision) => Some(decision),
        Err(e) => {
            tracing::warn!(collection_id, class_name, error = %e, "decision vector unavailable");
            errors.push(e.to_string());
            None
        }
    }
}

/// Raw per-point values of one render attribute.
pub fn attribute_values(
    spec: &AttributeSpec,
    data: &MapData,
    cluster_ids: &[i32],
    decision: Option<&DecisionVector>,
) -> Result<Vec<f32>> {
    let n = data.len();
    let values = match spec {
        AttributeSpec::Constant { value } => vec![*value; n],
        AttributeSpec::NumberField { field } => source_values(ValueSource::NumberField(field), &data.items, &data.scores),
        AttributeSpec::Count { field } => source_values(ValueSource::Count(field), &data.items, &data.scores),
        AttributeSpec::Rank => source_values(ValueSource::Rank, &data.items, &data.scores),
        AttributeSpec::Score => source_values(ValueSource::Score, &data.items, &data.scores),
        AttributeSpec::ClusterIdx => cluster_ids.iter().map(|&c| c as f32).collect(),
        AttributeSpec::Classifier(classifier) => {
            let decision = decision.ok_or_else(|| {
                Error::NotFound(format!("decision vector {}/{}", classifier.collection_id, classifier.class_name))
            })?;
            source_values(ValueSource::Classifier { field: &classifier.field, decision }, &data.items, &data.scores)
        }
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamap_core::params::ClassifierRef;

    fn data() -> MapData {
        let items = vec![
            Item::new(1, "a").with_field("year", FieldValue::Number(2020.0)).with_field("emb", FieldValue::Vector(vec![1.0, 0.0])),
            Item::new(1, "b").with_field("emb", FieldValue::VectorList(vec![vec![0.0, 1.0], vec![0.0, 3.0]])),
        ];
        MapData { keys: items.iter().map(Item::key).collect(), scores: vec![0.9, 0.4], items, vectors: Vec::new() }
    }

    #[test]
    fn array_fields_are_placed_by_their_mean() {
        let d = data();
        assert_eq!(map_vector(&d.items[1], "emb"), vec![0.0, 2.0]);
        assert!(map_vector(&d.items[0], "missing").is_empty());
    }

    #[test]
    fn array_elements_of_another_width_are_left_out_of_the_mean() {
        let item = Item::new(1, "ragged").with_field("emb", FieldValue::VectorList(vec![vec![0.0, 1.0], vec![0.0, 3.0], vec![5.0]]));
        assert_eq!(map_vector(&item, "emb"), vec![0.0, 2.0]);
    }

    #[test]
    fn attributes_from_fields_clusters_and_classifiers() -> Result<()> {
        let d = data();
        assert_eq!(attribute_values(&AttributeSpec::NumberField { field: "year".into() }, &d, &[0, -1], None)?, vec![2020.0, 0.0]);
        assert_eq!(attribute_values(&AttributeSpec::ClusterIdx, &d, &[0, -1], None)?, vec![0.0, -1.0]);
        assert_eq!(attribute_values(&AttributeSpec::Rank, &d, &[], None)?, vec![0.0, 1.0]);

        let classifier = AttributeSpec::Classifier(ClassifierRef { collection_id: 3, class_name: "relevant".into(), field: "emb".into() });
        let decision = DecisionVector { vector: vec![0.5, 0.5], threshold: None, highest_score: None };
        assert_eq!(attribute_values(&classifier, &d, &[], Some(&decision))?, vec![0.5, 0.0]);
        assert!(attribute_values(&classifier, &d, &[], None).is_err());
        Ok(())
    }
}
