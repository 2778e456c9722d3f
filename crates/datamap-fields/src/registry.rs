use std::collections::HashMap;
use std::sync::Arc;

use datamap_core::traits::Generator;
use datamap_core::{Error, Result};

/// Generators by id, as referenced from field schemas.
#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        self.generators.insert(generator.id().to_string(), generator);
    }

    pub fn with(mut self, generator: Arc<dyn Generator>) -> Self {
        self.register(generator);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Generator>> {
        self.generators.get(id).cloned().ok_or_else(|| Error::NotFound(format!("generator '{id}'")))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.generators.keys().map(String::as_str).collect()
    }
}
