//! datamap-fields
//!
//! Field Generation Pipeline: plans dependency-ordered phases for generated
//! fields and runs them over items, filling in whatever is missing.

pub mod backfill;
pub mod executor;
pub mod guard;
pub mod plan;
pub mod registry;

pub use executor::{GenerationReport, PipelineExecutor};
pub use guard::Guard;
pub use plan::{find_cycle, plan_for_schema, ExecutionPlan, FieldPipelineStep, FieldSelection, GenerationPhase, PlanDisabled};
pub use registry::GeneratorRegistry;
