//! Dependency-ordered generation plans.
//!
//! Phases come out of a fixed-point scan over the schema: a generated field is
//! schedulable once all of its sources are either imported fields or were
//! scheduled in an earlier phase. A cycle anywhere in the schema disables the
//! plan as a whole.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use datamap_core::schema::{Dataset, FieldSpec, SourceFields};
use datamap_core::{Error, Result};

use crate::guard::Guard;

/// Which generated fields a plan should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldSelection {
    /// Every generated field of the schema.
    #[default]
    All,
    /// Every generated field except the listed ones.
    AllExcept(Vec<String>),
    /// Only these fields, plus whatever generated sources they need.
    Only(Vec<String>),
}

impl FieldSelection {
    fn selects(&self, field: &FieldSpec) -> bool {
        match self {
            Self::All => field.generated,
            Self::AllExcept(ignored) => field.generated && !ignored.contains(&field.identifier),
            Self::Only(only) => only.contains(&field.identifier),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldPipelineStep {
    pub target: String,
    pub sources: SourceFields,
    pub generator_id: String,
    pub guard: Option<Guard>,
    /// Generator output key -> item field for multi-output generators.
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationPhase {
    pub steps: Vec<FieldPipelineStep>,
}

impl GenerationPhase {
    pub fn targets(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.target.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDisabled {
    Cycle { fields: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub phases: Vec<GenerationPhase>,
    /// Fields that must be loaded on items before the plan runs.
    pub required_fields: BTreeSet<String>,
    /// Fields the plan may write, including multi-output targets.
    pub potentially_changed_fields: BTreeSet<String>,
    pub disabled: Option<PlanDisabled>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn cycle_detected(&self) -> bool {
        matches!(self.disabled, Some(PlanDisabled::Cycle { .. }))
    }

    pub fn phase_targets(&self) -> Vec<Vec<&str>> {
        self.phases.iter().map(GenerationPhase::targets).collect()
    }
}

fn is_generated(dataset: &Dataset, name: &str) -> bool {
    dataset.field(name).is_some_and(FieldSpec::has_generator)
}

/// Generated fields that can never be resolved, or `None` when the schema
/// is acyclic. Sources that are not declared count as unresolvable.
pub fn find_cycle(dataset: &Dataset) -> Option<Vec<String>> {
    let mut resolved: HashSet<&str> = dataset
        .fields
        .iter()
        .filter(|f| !f.has_generator())
        .map(|f| f.identifier.as_str())
        .collect();
    let mut pending: Vec<&FieldSpec> = dataset.fields.iter().filter(|f| f.has_generator()).collect();
    loop {
        let before = pending.len();
        pending.retain(|f| {
            let ready = f.source_fields.field_names().iter().all(|s| resolved.contains(s));
            if ready {
                resolved.insert(f.identifier.as_str());
            }
            !ready
        });
        if pending.is_empty() {
            return None;
        }
        if pending.len() == before {
            return Some(pending.iter().map(|f| f.identifier.clone()).collect());
        }
    }
}

/// Build the phases needed to generate `selection` on items of `dataset`.
///
/// Cycles are reported through [`ExecutionPlan::disabled`], never as an
/// error. Only an unparsable guard is an error.
pub fn plan_for_schema(dataset: &Dataset, selection: &FieldSelection) -> Result<ExecutionPlan> {
    if let Some(fields) = find_cycle(dataset) {
        tracing::warn!(dataset_id = dataset.id, fields = ?fields, "dependency cycle, generation disabled for schema");
        return Ok(ExecutionPlan { disabled: Some(PlanDisabled::Cycle { fields }), ..ExecutionPlan::default() });
    }

    let mut enabled: Vec<&str> = dataset
        .fields
        .iter()
        .filter(|f| f.has_generator() && selection.selects(f))
        .map(|f| f.identifier.as_str())
        .collect();
    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut plan = ExecutionPlan::default();

    loop {
        let mut phase = GenerationPhase::default();
        let mut added_this_phase: Vec<&str> = Vec::new();
        let enabled_before = enabled.len();
        let mut waiting = false;
        for field in &dataset.fields {
            let name = field.identifier.as_str();
            if scheduled.contains(name) || !enabled.contains(&name) || !field.has_generator() {
                continue;
            }
            let mut blocked = false;
            for source in field.source_fields.field_names() {
                if is_generated(dataset, source) && !scheduled.contains(source) {
                    blocked = true;
                    if !enabled.contains(&source) {
                        enabled.push(source);
                    }
                } else if !is_generated(dataset, source) {
                    plan.required_fields.insert(source.to_string());
                }
            }
            if blocked {
                waiting = true;
                continue;
            }
            phase.steps.push(build_step(field)?);
            added_this_phase.push(name);
        }
        if phase.steps.is_empty() {
            if !waiting {
                break;
            }
            if enabled.len() > enabled_before {
                continue;
            }
            // acyclic schemas never stall
            return Err(Error::Internal(format!("planner stalled on dataset {}", dataset.id)));
        }
        for step in &phase.steps {
            plan.potentially_changed_fields.insert(step.target.clone());
            plan.potentially_changed_fields.extend(step.output_mapping.values().cloned());
            if let Some(guard) = &step.guard {
                plan.required_fields.extend(guard.fields().into_iter().map(str::to_string));
            }
        }
        scheduled.extend(added_this_phase);
        plan.phases.push(phase);
    }
    for changed in &plan.potentially_changed_fields {
        plan.required_fields.insert(changed.clone());
    }
    Ok(plan)
}

fn build_step(field: &FieldSpec) -> Result<FieldPipelineStep> {
    let generator = field
        .generator
        .as_ref()
        .ok_or_else(|| Error::Internal(format!("field '{}' has no generator", field.identifier)))?;
    let guard = field.guard.as_deref().map(Guard::parse).transpose()?;
    Ok(FieldPipelineStep {
        target: field.identifier.clone(),
        sources: field.source_fields.clone(),
        generator_id: generator.id.clone(),
        guard,
        output_mapping: generator.output_mapping.clone(),
    })
}
