//! Domain types shared by the engines, the field pipeline and the map stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type DatasetId = u32;
pub type ItemId = String;

/// Identity of an item across datasets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub dataset_id: DatasetId,
    pub item_id: ItemId,
}

impl ItemKey {
    pub fn new(dataset_id: DatasetId, item_id: impl Into<ItemId>) -> Self {
        Self { dataset_id, item_id: item_id.into() }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dataset_id, self.item_id)
    }
}

/// A typed field value. Absence is modelled by the key not being present on
/// the item, never by a sentinel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    TextList(Vec<String>),
    Number(f64),
    Bool(bool),
    Vector(Vec<f32>),
    VectorList(Vec<Vec<f32>>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Truthiness used by guard predicates and "is populated" checks.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Text(s) => !s.is_empty(),
            Self::TextList(v) => !v.is_empty(),
            Self::Number(n) => *n != 0.0,
            Self::Bool(b) => *b,
            Self::Vector(v) => !v.is_empty(),
            Self::VectorList(v) => !v.is_empty(),
        }
    }

    /// Number of elements for list-like values, 1 for scalars.
    pub fn element_count(&self) -> usize {
        match self {
            Self::TextList(v) => v.len(),
            Self::VectorList(v) => v.len(),
            Self::Text(s) if s.is_empty() => 0,
            _ => 1,
        }
    }

    /// Flattened text content, used for titles, hover labels and embeddings.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::TextList(v) => Some(v.join(" ")),
            Self::Number(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Vector(_) | Self::VectorList(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub dataset_id: DatasetId,
    pub id: ItemId,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Item {
    pub fn new(dataset_id: DatasetId, id: impl Into<ItemId>) -> Self {
        Self { dataset_id, id: id.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.dataset_id, self.id.clone())
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some_and(FieldValue::is_truthy)
    }

    pub fn set(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }
}

/// Which retrieval path produced an origin record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Keyword,
    Vector,
    ReciprocalRank,
}

impl std::fmt::Display for OriginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::ReciprocalRank => "reciprocal_rank",
        };
        f.write_str(s)
    }
}

/// One engine's opinion about a hit. `rank` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub kind: OriginKind,
    pub field: String,
    pub query: String,
    pub score: f32,
    pub rank: usize,
}

/// Best matching element of an array-valued field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevantPart {
    pub field: String,
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: ItemKey,
    pub origins: Vec<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_parts: Vec<RelevantPart>,
}

/// Raw hit as returned by an engine before it is wrapped into a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHit {
    pub id: ItemId,
    pub score: f32,
    #[serde(default)]
    pub highlights: Option<String>,
    #[serde(default)]
    pub relevant_parts: Vec<RelevantPart>,
}

/// Ranked hits of a single (engine, field, query) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub kind: OriginKind,
    pub dataset_id: DatasetId,
    pub field: String,
    pub query: String,
    pub hits: Vec<SearchHit>,
}

impl ResultSet {
    /// Build a set from engine hits already sorted best first. Duplicate ids
    /// keep their first (best) occurrence.
    pub fn from_ranked(
        kind: OriginKind,
        dataset_id: DatasetId,
        field: &str,
        query: &str,
        engine_hits: Vec<EngineHit>,
    ) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::with_capacity(engine_hits.len());
        for h in engine_hits {
            if !seen.insert(h.id.clone()) {
                continue;
            }
            let rank = hits.len() + 1;
            hits.push(SearchHit {
                key: ItemKey::new(dataset_id, h.id),
                origins: vec![Origin {
                    kind,
                    field: field.to_string(),
                    query: query.to_string(),
                    score: h.score,
                    rank,
                }],
                highlights: h.highlights,
                relevant_parts: h.relevant_parts,
            });
        }
        Self { kind, dataset_id, field: field.to_string(), query: query.to_string(), hits }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Native scores of the set in rank order.
    pub fn scores(&self) -> Vec<f32> {
        self.hits.iter().map(|h| h.origins.first().map_or(0.0, |o| o.score)).collect()
    }

    pub fn truncate(&mut self, len: usize) {
        self.hits.truncate(len);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    pub hit: SearchHit,
    pub reciprocal_rank_score: f32,
    pub score: f32,
}
