//! datamap-text
//!
//! Tantivy implementation of the text engine: one index per dataset built from
//! its field schema, keyword search with boosts, filters and highlights, and
//! missing-field scans for backfills.

pub mod engine;
pub mod tantivy_utils;

pub use engine::TantivyTextEngine;
