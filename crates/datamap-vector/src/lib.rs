//! datamap-vector
//!
//! LanceDB implementation of the vector engine: one table per dataset field,
//! cosine nearest-neighbour search with payload filters and sub-item grouping,
//! and IVF_PQ indexing for quantized collections.

pub mod engine;
pub mod index_build;
pub mod schema;
pub mod search;
pub mod table;
pub mod writer;

pub use engine::LanceVectorEngine;

pub(crate) fn engine_err(e: impl std::fmt::Display) -> datamap_core::Error {
    datamap_core::Error::upstream("lancedb", e)
}
