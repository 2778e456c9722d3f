//! Map geometry: reduce map vectors to 2-D positions, cluster them and title
//! the clusters.
//!
//! Everything here is synchronous and CPU bound; callers run it on a blocking
//! thread.

pub mod axes;
pub mod hdbscan;
pub mod titles;
pub mod umap;

pub use axes::{normalize, project, source_values, Projection, ProjectionInput, ValueSource};
pub use hdbscan::{cluster, HdbscanParams};
pub use titles::{cluster_summaries, descriptive_text, selection_summary, TitleSettings};
