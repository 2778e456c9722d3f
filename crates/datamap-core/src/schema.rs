//! Dataset schema: field declarations, generator bindings and search options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::DatasetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Identifier,
    Number,
    Bool,
    Vector,
}

/// Sources of a generated field: a plain list, or named generator inputs
/// mapped to source fields for multi-input generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceFields {
    List(Vec<String>),
    Named(BTreeMap<String, String>),
}

impl Default for SourceFields {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl SourceFields {
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::List(v) => v.iter().map(String::as_str).collect(),
            Self::Named(m) => m.values().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(v) => v.is_empty(),
            Self::Named(m) => m.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRef {
    pub id: String,
    /// Secondary generator outputs copied to item fields: output key -> field.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSearchSettings {
    #[serde(default)]
    pub keyword: bool,
    #[serde(default)]
    pub vector: bool,
    #[serde(default = "default_boost")]
    pub boost: f32,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    /// Product-quantize the vector collection once it is large enough.
    #[serde(default)]
    pub quantized: bool,
}

fn default_boost() -> f32 {
    1.0
}

impl Default for FieldSearchSettings {
    fn default() -> Self {
        Self { keyword: false, vector: false, boost: default_boost(), similarity_threshold: None, quantized: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub identifier: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub vector_dim: Option<usize>,
    #[serde(default)]
    pub search: FieldSearchSettings,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub generator: Option<GeneratorRef>,
    #[serde(default)]
    pub source_fields: SourceFields,
    #[serde(default)]
    pub guard: Option<String>,
}

impl FieldSpec {
    pub fn new(identifier: &str, field_type: FieldType) -> Self {
        Self {
            identifier: identifier.to_string(),
            field_type,
            is_array: false,
            vector_dim: None,
            search: FieldSearchSettings::default(),
            filterable: false,
            generated: false,
            generator: None,
            source_fields: SourceFields::default(),
            guard: None,
        }
    }

    /// A field whose values come from a generator rather than from import.
    pub fn generated_by(mut self, generator_id: &str, sources: &[&str]) -> Self {
        self.generated = true;
        self.generator = Some(GeneratorRef { id: generator_id.to_string(), output_mapping: BTreeMap::new() });
        self.source_fields = SourceFields::List(sources.iter().map(|s| (*s).to_string()).collect());
        self
    }

    pub fn with_guard(mut self, guard: &str) -> Self {
        self.guard = Some(guard.to_string());
        self
    }

    pub fn keyword_searchable(mut self) -> Self {
        self.search.keyword = true;
        self
    }

    pub fn vector_searchable(mut self, dim: usize) -> Self {
        self.search.vector = true;
        self.vector_dim = Some(dim);
        self
    }

    pub fn is_vector(&self) -> bool {
        self.field_type == FieldType::Vector
    }

    pub fn has_generator(&self) -> bool {
        self.generated && self.generator.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub descriptive_text_fields: Vec<String>,
    #[serde(default)]
    pub default_search_fields: Vec<String>,
    #[serde(default)]
    pub hover_fields: Vec<String>,
    #[serde(default)]
    pub thumbnail_field: Option<String>,
    #[serde(default)]
    pub ignore_words: Vec<String>,
    #[serde(default)]
    pub use_lower_case: bool,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl Dataset {
    pub fn new(id: DatasetId, name: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            id,
            name: name.to_string(),
            fields,
            descriptive_text_fields: Vec::new(),
            default_search_fields: Vec::new(),
            hover_fields: Vec::new(),
            thumbnail_field: None,
            ignore_words: Vec::new(),
            use_lower_case: false,
            language: default_language(),
        }
    }

    pub fn field(&self, identifier: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.identifier == identifier)
    }

    pub fn keyword_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.search.keyword)
    }

    pub fn vector_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.search.vector && f.is_vector())
    }

    /// Fields searched when a request does not name any explicitly.
    pub fn search_fields(&self) -> Vec<&FieldSpec> {
        if self.default_search_fields.is_empty() {
            return self.fields.iter().filter(|f| f.search.keyword || f.search.vector).collect();
        }
        self.default_search_fields.iter().filter_map(|name| self.field(name)).collect()
    }
}
