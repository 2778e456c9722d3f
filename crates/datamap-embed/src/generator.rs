use async_trait::async_trait;
use std::sync::Arc;

use datamap_core::traits::{Generator, GeneratorInput, GeneratorOutput};
use datamap_core::types::FieldValue;
use datamap_core::{Error, Result};

use crate::Embedder;

/// Exposes an [`Embedder`] as a field generator.
///
/// A single list-valued source is embedded element by element into a
/// `VectorList`; anything else is joined into one text and becomes a `Vector`.
/// Inputs without text produce no value.
pub struct EmbeddingGenerator {
    id: String,
    embedder: Arc<dyn Embedder>,
}

enum Shape {
    Skip,
    Single(usize),
    Elements(std::ops::Range<usize>),
}

impl EmbeddingGenerator {
    pub fn new(id: &str, embedder: Arc<dyn Embedder>) -> Self {
        Self { id: id.to_string(), embedder }
    }

    pub fn dim(&self) -> usize {
        self.embedder.dim()
    }
}

#[async_trait]
impl Generator for EmbeddingGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, batch: &[GeneratorInput]) -> Result<Vec<GeneratorOutput>> {
        let mut texts: Vec<String> = Vec::new();
        let mut shapes = Vec::with_capacity(batch.len());
        for input in batch {
            if let GeneratorInput::Values(values) = input {
                if let [FieldValue::TextList(elements)] = values.as_slice() {
                    let start = texts.len();
                    texts.extend(elements.iter().cloned());
                    shapes.push(Shape::Elements(start..texts.len()));
                    continue;
                }
            }
            let text = input.joined_text();
            if text.trim().is_empty() {
                shapes.push(Shape::Skip);
            } else {
                shapes.push(Shape::Single(texts.len()));
                texts.push(text);
            }
        }

        let embedder = self.embedder.clone();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
                .await
                .map_err(|e| Error::Internal(format!("embedding task panicked: {e}")))?
                .map_err(|e| Error::upstream(&self.id, format!("{e:#}")))?
        };

        Ok(shapes
            .into_iter()
            .map(|shape| match shape {
                Shape::Skip => GeneratorOutput::default(),
                Shape::Single(i) => vectors.get(i).map_or_else(GeneratorOutput::default, |v| GeneratorOutput::value(FieldValue::Vector(v.clone()))),
                Shape::Elements(range) => GeneratorOutput::value(FieldValue::VectorList(vectors.get(range).map(<[Vec<f32>]>::to_vec).unwrap_or_default())),
            })
            .collect())
    }
}
