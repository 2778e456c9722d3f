//! Runs an [`ExecutionPlan`] over a batch of items.
//!
//! Steps of a phase run concurrently against a snapshot of the items; their
//! outputs are applied once the whole phase has returned. Targets are only
//! filled in, never overwritten. A failed generator batch is recorded and
//! leaves just that batch's targets unset.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;

use datamap_core::schema::SourceFields;
use datamap_core::traits::{GeneratorInput, GeneratorOutput};
use datamap_core::types::Item;
use datamap_core::Error;

use crate::plan::{ExecutionPlan, FieldPipelineStep, PlanDisabled};
use crate::registry::GeneratorRegistry;

#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Item index -> fields written on it.
    pub changed_fields: BTreeMap<usize, BTreeSet<String>>,
    pub errors: Vec<Error>,
}

impl GenerationReport {
    pub fn changed_items(&self) -> usize {
        self.changed_fields.len()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

struct StepOutcome {
    outputs: Vec<(usize, GeneratorOutput)>,
    errors: Vec<Error>,
}

pub struct PipelineExecutor<'a> {
    registry: &'a GeneratorRegistry,
    batch_size: usize,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(registry: &'a GeneratorRegistry, batch_size: usize) -> Self {
        Self { registry, batch_size: batch_size.max(1) }
    }

    pub async fn run(&self, plan: &ExecutionPlan, items: &mut [Item]) -> GenerationReport {
        let mut report = GenerationReport::default();
        if let Some(PlanDisabled::Cycle { fields }) = &plan.disabled {
            report.errors.push(Error::SchemaCycle { fields: fields.clone() });
            return report;
        }
        for (phase_idx, phase) in plan.phases.iter().enumerate() {
            let snapshot: &[Item] = &*items;
            let outcomes = join_all(phase.steps.iter().map(|step| self.run_step(step, snapshot))).await;
            for (step, outcome) in phase.steps.iter().zip(outcomes) {
                for (idx, output) in outcome.outputs {
                    apply_output(step, &mut items[idx], output, idx, &mut report);
                }
                report.errors.extend(outcome.errors);
            }
            tracing::debug!(phase = phase_idx, steps = phase.steps.len(), "generation phase done");
        }
        report
    }

    async fn run_step(&self, step: &FieldPipelineStep, items: &[Item]) -> StepOutcome {
        let mut outcome = StepOutcome { outputs: Vec::new(), errors: Vec::new() };
        let generator = match self.registry.get(&step.generator_id) {
            Ok(g) => g,
            Err(e) => {
                outcome.errors.push(Error::generation(&step.target, e));
                return outcome;
            }
        };

        let mut pending: Vec<(usize, GeneratorInput)> = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            if item.has(&step.target) {
                continue;
            }
            if step.guard.as_ref().is_some_and(|g| !g.evaluate(item)) {
                continue;
            }
            let input = gather_input(&step.sources, item);
            if input.is_empty() {
                continue;
            }
            pending.push((idx, input));
        }
        if pending.is_empty() {
            return outcome;
        }

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<GeneratorInput> = batch.iter().map(|(_, input)| input.clone()).collect();
            match generator.generate(&inputs).await {
                Ok(outputs) if outputs.len() == inputs.len() => {
                    outcome.outputs.extend(batch.iter().map(|(idx, _)| *idx).zip(outputs));
                }
                Ok(outputs) => {
                    let message = format!("generator '{}' returned {} outputs for {} inputs", step.generator_id, outputs.len(), inputs.len());
                    tracing::warn!(field = %step.target, "{message}");
                    outcome.errors.push(Error::generation(&step.target, message));
                }
                Err(e) => {
                    tracing::warn!(field = %step.target, error = %e, batch = inputs.len(), "generator batch failed");
                    outcome.errors.push(Error::generation(&step.target, e));
                }
            }
        }
        outcome
    }
}

fn gather_input(sources: &SourceFields, item: &Item) -> GeneratorInput {
    match sources {
        SourceFields::List(fields) => {
            GeneratorInput::Values(fields.iter().filter_map(|f| item.get(f)).cloned().collect())
        }
        SourceFields::Named(map) => {
            GeneratorInput::Named(map.iter().map(|(input, field)| (input.clone(), item.get(field).cloned())).collect())
        }
    }
}

fn apply_output(step: &FieldPipelineStep, item: &mut Item, output: GeneratorOutput, idx: usize, report: &mut GenerationReport) {
    let mut written = Vec::new();
    if let Some(value) = output.value {
        item.set(&step.target, value);
        written.push(step.target.clone());
    }
    for (key, value) in output.extra {
        let field = step.output_mapping.get(&key).cloned().unwrap_or(key);
        if item.has(&field) {
            continue;
        }
        item.set(&field, value);
        written.push(field);
    }
    if !written.is_empty() {
        report.changed_fields.entry(idx).or_default().extend(written);
    }
}
