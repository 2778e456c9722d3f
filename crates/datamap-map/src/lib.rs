//! Map orchestration.
//!
//! A map request runs search, vectorize, project and cluster/render stages
//! on a background task. Sessions are cached by parameter hash, and a new
//! request takes over the outputs of an earlier session that shares its
//! search+vectorize or search+vectorize+projection parameters.

pub mod cache;
pub mod orchestrator;
pub mod stages;

pub use cache::{MapCache, ReuseLevel, ReuseLookup, SharedSession};
pub use orchestrator::{MapOrchestrator, NO_RESULTS};
