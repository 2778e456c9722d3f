//! Backfill of a single generated field over stored items.
//!
//! Items missing the field are scanned from the text engine (vector targets
//! are checked against the vector engine), the field is generated through
//! the pipeline, and changed items are written back to both engines.

use std::collections::BTreeMap;

use datamap_core::schema::Dataset;
use datamap_core::traits::{CollectionSpec, TextEngine, VectorEngine, VectorPoint};
use datamap_core::types::{FieldValue, Item, ItemId};
use datamap_core::{Error, Result};

use crate::executor::PipelineExecutor;
use crate::plan::{plan_for_schema, FieldSelection, PlanDisabled};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub generated: usize,
    pub errors: Vec<String>,
}

pub async fn backfill_field(
    dataset: &Dataset,
    field: &str,
    text: &dyn TextEngine,
    vector: &dyn VectorEngine,
    executor: &PipelineExecutor<'_>,
    limit: usize,
) -> Result<BackfillReport> {
    let spec = dataset.field(field).ok_or_else(|| Error::NotFound(format!("field '{field}' in dataset {}", dataset.id)))?;
    let plan = plan_for_schema(dataset, &FieldSelection::Only(vec![field.to_string()]))?;
    if let Some(PlanDisabled::Cycle { fields }) = &plan.disabled {
        return Err(Error::SchemaCycle { fields: fields.clone() });
    }

    let mut items = text.items_missing_field(dataset.id, field, limit).await?;
    if spec.is_vector() && !items.is_empty() {
        let ids: Vec<ItemId> = items.iter().map(|i| i.id.clone()).collect();
        let existing = vector.get_vectors(dataset.id, field, &ids).await?;
        items.retain(|i| !existing.contains_key(&i.id));
    }
    let mut report = BackfillReport { scanned: items.len(), ..BackfillReport::default() };
    if items.is_empty() {
        return Ok(report);
    }
    load_vector_sources(dataset, &plan.required_fields, vector, &mut items).await?;

    let generation = executor.run(&plan, &mut items).await;
    report.errors = generation.error_messages();
    let changed: Vec<Item> = generation.changed_fields.keys().filter_map(|&idx| items.get(idx).cloned()).collect();
    report.generated = changed.len();
    persist_items(dataset, &changed, text, vector).await?;
    tracing::info!(dataset_id = dataset.id, field, scanned = report.scanned, generated = report.generated, "backfill done");
    Ok(report)
}

async fn load_vector_sources(
    dataset: &Dataset,
    required: &std::collections::BTreeSet<String>,
    vector: &dyn VectorEngine,
    items: &mut [Item],
) -> Result<()> {
    let ids: Vec<ItemId> = items.iter().map(|i| i.id.clone()).collect();
    for name in required {
        if !dataset.field(name).is_some_and(|f| f.is_vector()) {
            continue;
        }
        let mut vectors = vector.get_vectors(dataset.id, name, &ids).await?;
        for item in items.iter_mut() {
            if let Some(v) = vectors.remove(&item.id) {
                item.set(name, v);
            }
        }
    }
    Ok(())
}

/// Write items to the text engine (non-vector fields) and every populated
/// vector field to its collection.
pub async fn persist_items(dataset: &Dataset, items: &[Item], text: &dyn TextEngine, vector: &dyn VectorEngine) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let stripped: Vec<Item> = items
        .iter()
        .map(|item| {
            let mut clean = item.clone();
            clean.fields.retain(|_, v| !matches!(v, FieldValue::Vector(_) | FieldValue::VectorList(_)));
            clean
        })
        .collect();
    text.upsert(dataset.id, &stripped).await?;

    let payload_fields: Vec<String> = dataset.fields.iter().filter(|f| f.filterable).map(|f| f.identifier.clone()).collect();
    for spec in dataset.fields.iter().filter(|f| f.is_vector()) {
        let points: Vec<VectorPoint> = items
            .iter()
            .filter_map(|item| {
                let vectors = match item.get(&spec.identifier)? {
                    FieldValue::Vector(v) => vec![v.clone()],
                    FieldValue::VectorList(v) => v.clone(),
                    _ => return None,
                };
                let payload: BTreeMap<String, String> = payload_fields
                    .iter()
                    .filter_map(|f| item.get(f).and_then(FieldValue::to_text).map(|t| (f.clone(), t)))
                    .collect();
                Some(VectorPoint { item_id: item.id.clone(), vectors, payload })
            })
            .collect();
        let Some(dim) = spec.vector_dim.or_else(|| points.first().and_then(|p| p.vectors.first()).map(Vec::len)) else {
            continue;
        };
        if points.is_empty() {
            continue;
        }
        vector
            .ensure_collection(&CollectionSpec {
                dataset_id: dataset.id,
                field: spec.identifier.clone(),
                dim,
                quantized: spec.search.quantized,
                payload_fields: payload_fields.clone(),
            })
            .await?;
        vector.upsert(dataset.id, &spec.identifier, &points).await?;
    }
    Ok(())
}
