//! datamap-embed
//!
//! Text embedders: the BGE-M3 model on candle, a deterministic hashing
//! embedder for tests and offline runs, and a generator adapter so either can
//! fill vector fields through the field pipeline.

pub mod device;
pub mod fake;
pub mod generator;
pub mod model;
pub mod pool;
pub mod tokenize;

use anyhow::Result;
use datamap_core::config::EmbeddingSettings;

pub use device::select_device;
pub use fake::FakeEmbedder;
pub use generator::EmbeddingGenerator;
pub use model::{EmbeddingModel, BGE_M3_DIM};
pub use pool::masked_mean_l2;
pub use tokenize::tokenize_batch_on_device;

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

fn fake_requested() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS").ok().is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Honors `APP_USE_FAKE_EMBEDDINGS`; otherwise loads BGE-M3 from the usual locations.
pub fn get_default_embedder() -> Result<Box<dyn Embedder>> {
    get_embedder(&EmbeddingSettings::default())
}

pub fn get_embedder(settings: &EmbeddingSettings) -> Result<Box<dyn Embedder>> {
    if settings.use_fake || fake_requested() {
        tracing::info!(dim = BGE_M3_DIM, "using fake embedder");
        return Ok(Box::new(FakeEmbedder::new(BGE_M3_DIM)));
    }
    Ok(Box::new(EmbeddingModel::new(settings.model_dir.as_deref())?))
}
