//! Process-local metadata store.
//!
//! Holds dataset schemas, classifier decision vectors and stored-map blobs.
//! Datasets can be loaded from a directory of `*.json` schema files.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::schema::Dataset;
use crate::traits::{DecisionVector, MetadataStore};
use crate::types::DatasetId;

#[derive(Default)]
pub struct InMemoryMetadataStore {
    datasets: RwLock<HashMap<DatasetId, Dataset>>,
    classifiers: RwLock<HashMap<(u32, String, String), DecisionVector>>,
    stored_maps: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_dir(dir: &Path) -> Result<Self> {
        let store = Self::new();
        for entry in walkdir::WalkDir::new(dir).max_depth(1).into_iter().filter_map(std::result::Result::ok) {
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(path)
                .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", path.display())))?;
            let dataset: Dataset = serde_json::from_slice(&raw)
                .map_err(|e| Error::InvalidConfig(format!("parsing {}: {e}", path.display())))?;
            tracing::debug!(dataset_id = dataset.id, path = %path.display(), "loaded dataset schema");
            store.put_dataset(dataset);
        }
        Ok(store)
    }

    pub fn put_dataset(&self, dataset: Dataset) {
        self.datasets.write().insert(dataset.id, dataset);
    }

    pub fn put_classifier(&self, collection_id: u32, class_name: &str, field: &str, decision: DecisionVector) {
        self.classifiers.write().insert((collection_id, class_name.to_string(), field.to_string()), decision);
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn dataset(&self, id: DatasetId) -> Result<Dataset> {
        self.datasets.read().get(&id).cloned().ok_or_else(|| Error::NotFound(format!("dataset {id}")))
    }

    fn classifier_decision_vector(&self, collection_id: u32, class_name: &str, field: &str) -> Result<DecisionVector> {
        self.classifiers
            .read()
            .get(&(collection_id, class_name.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("classifier {collection_id}/{class_name} on {field}")))
    }

    fn stored_map(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.stored_maps.read().get(id).cloned())
    }

    fn store_map(&self, id: &str, blob: Vec<u8>) -> Result<()> {
        self.stored_maps.write().insert(id.to_string(), blob);
        Ok(())
    }
}
