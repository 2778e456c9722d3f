//! Map axes: reduced embeddings or per-item values read straight off the items.

use std::f32::consts::PI;

use datamap_core::params::{AxisSpec, ProjectionParams};
use datamap_core::traits::DecisionVector;
use datamap_core::types::Item;
use datamap_core::Result;

use crate::umap::{reduce, UmapParams};

/// A per-item scalar shared by axes and render attributes.
#[derive(Debug, Clone, Copy)]
pub enum ValueSource<'a> {
    NumberField(&'a str),
    Count(&'a str),
    Rank,
    Score,
    Classifier { field: &'a str, decision: &'a DecisionVector },
}

/// One value per item, in item order. Missing fields count as 0.
pub fn source_values(source: ValueSource<'_>, items: &[Item], scores: &[f32]) -> Vec<f32> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| match source {
            ValueSource::NumberField(field) => item.get(field).and_then(|v| v.as_number()).unwrap_or(0.0) as f32,
            ValueSource::Count(field) => item.get(field).map_or(0, |v| v.element_count()) as f32,
            ValueSource::Rank => i as f32,
            ValueSource::Score => scores.get(i).copied().unwrap_or(0.0),
            ValueSource::Classifier { field, decision } => {
                item.get(field).and_then(|v| v.as_vector()).map_or(0.0, |v| decision.score(v))
            }
        })
        .collect()
}

/// Scale to [0, 1]; a constant series maps to 0.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    values.iter().map(|v| if span > 0.0 { (v - min) / span } else { 0.0 }).collect()
}

pub struct ProjectionInput<'a> {
    pub items: &'a [Item],
    pub scores: &'a [f32],
    /// Map vectors in item order; empty entries are items without one.
    pub vectors: &'a [Vec<f32>],
    pub x_decision: Option<&'a DecisionVector>,
    pub y_decision: Option<&'a DecisionVector>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    /// Axis values before inversion and polar mapping.
    pub raw: Vec<[f32; 2]>,
    pub positions: Vec<[f32; 2]>,
}

/// Called with (step, total steps, intermediate positions).
pub type ProjectionProgress<'a> = dyn FnMut(usize, usize, &[[f32; 2]]) + 'a;

fn axis_source<'a>(axis: &'a AxisSpec, decision: Option<&'a DecisionVector>) -> Option<ValueSource<'a>> {
    match axis {
        AxisSpec::Embedding => None,
        AxisSpec::NumberField { field } => Some(ValueSource::NumberField(field)),
        AxisSpec::Count { field } => Some(ValueSource::Count(field)),
        AxisSpec::Rank => Some(ValueSource::Rank),
        AxisSpec::Score => Some(ValueSource::Score),
        AxisSpec::Classifier(classifier) => match decision {
            Some(decision) => Some(ValueSource::Classifier { field: &classifier.field, decision }),
            None => {
                tracing::warn!(class = %classifier.class_name, "no decision vector for classifier axis, using zeros");
                None
            }
        },
    }
}

/// Deterministic layout for maps too small to reduce.
pub fn fallback_positions(n: usize, embedding_axes: usize) -> Vec<Vec<f32>> {
    if embedding_axes >= 2 {
        let cols = (n as f32).sqrt().ceil().max(1.0) as usize;
        (0..n).map(|i| vec![(1 + i % cols) as f32, (1 + i / cols) as f32]).collect()
    } else {
        (0..n).map(|i| vec![if n > 1 { i as f32 / (n - 1) as f32 } else { 0.0 }]).collect()
    }
}

fn reduce_embeddings(
    params: &ProjectionParams,
    vectors: &[Vec<f32>],
    components: usize,
    min_points: usize,
    progress: &mut dyn FnMut(usize, usize, &[Vec<f32>]),
) -> Vec<Vec<f32>> {
    let n = vectors.len();
    if n < min_points {
        return fallback_positions(n, components);
    }
    let width = vectors.iter().map(Vec::len).max().unwrap_or(0);
    let filled: Vec<Vec<f32>> = vectors
        .iter()
        .map(|v| if v.len() == width { v.clone() } else { vec![0.0; width] })
        .collect();
    let missing = vectors.iter().filter(|v| v.len() != width).count();
    if missing > 0 {
        tracing::warn!(missing, "items without a map vector are placed at the origin of the input space");
    }

    let umap = UmapParams::from_projection(params, components);
    let rows = |flat: &[f32]| -> Vec<Vec<f32>> { flat.chunks(components).map(<[f32]>::to_vec).collect() };
    let mut on_epoch = |epoch: usize, total: usize, flat: &[f32]| progress(epoch, total, &rows(flat));
    match reduce(&filled, &umap, &mut on_epoch) {
        Ok(flat) => rows(&flat),
        Err(e) => {
            tracing::warn!(error = %e, points = n, "dimensionality reduction failed, positions set to zero");
            vec![vec![0.0; components]; n]
        }
    }
}

fn finish_positions(params: &ProjectionParams, raw: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let mut positions: Vec<[f32; 2]> = raw
        .iter()
        .map(|p| if params.invert_x_axis { [-p[0], p[1]] } else { *p })
        .collect();
    if params.use_polar_coordinates {
        let xs: Vec<f32> = positions.iter().map(|p| p[0]).collect();
        let ys: Vec<f32> = positions.iter().map(|p| p[1]).collect();
        let (radius, angle) = (normalize(&xs), normalize(&ys));
        positions = radius
            .iter()
            .zip(&angle)
            .map(|(r, a)| {
                let (r, theta) = (1.0 - r, a * 2.0 * PI);
                [r * theta.cos(), r * theta.sin()]
            })
            .collect();
    }
    positions
}

/// Compute 2-D positions for `input.items`.
///
/// Embedding axes share one reduction (1 or 2 components); other axes are
/// read from the items. Reducer failures degrade to zeros rather than erroring.
pub fn project(
    params: &ProjectionParams,
    input: &ProjectionInput<'_>,
    min_points: usize,
    progress: &mut ProjectionProgress<'_>,
) -> Result<Projection> {
    let n = input.items.len();
    let x_source = axis_source(&params.x_axis, input.x_decision);
    let y_source = axis_source(&params.y_axis, input.y_decision);
    let x_values = x_source.map(|s| source_values(s, input.items, input.scores));
    let y_values = y_source.map(|s| source_values(s, input.items, input.scores));
    let x_embedded = matches!(params.x_axis, AxisSpec::Embedding);
    let y_embedded = matches!(params.y_axis, AxisSpec::Embedding);
    let components = usize::from(x_embedded) + usize::from(y_embedded);

    let assemble = |reduced: &[Vec<f32>]| -> Vec<[f32; 2]> {
        (0..n)
            .map(|i| {
                let reduced_at = |c: usize| reduced.get(i).and_then(|r| r.get(c)).copied().unwrap_or(0.0);
                let x = if x_embedded { reduced_at(0) } else { x_values.as_ref().map_or(0.0, |v| v[i]) };
                let y = if y_embedded {
                    reduced_at(usize::from(x_embedded))
                } else {
                    y_values.as_ref().map_or(0.0, |v| v[i])
                };
                [x, y]
            })
            .collect()
    };

    let reduced = if components > 0 {
        let mut on_epoch = |epoch: usize, total: usize, partial: &[Vec<f32>]| {
            let raw = assemble(partial);
            progress(epoch, total, &finish_positions(params, &raw));
        };
        reduce_embeddings(params, input.vectors, components, min_points, &mut on_epoch)
    } else {
        Vec::new()
    };
    let raw = assemble(&reduced);
    let positions = finish_positions(params, &raw);
    progress(1, 1, &positions);
    Ok(Projection { raw, positions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamap_core::types::FieldValue;

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| {
                Item::new(1, format!("i{i}"))
                    .with_field("year", FieldValue::Number(2000.0 + i as f64))
                    .with_field("authors", FieldValue::TextList(vec!["a".into(); i]))
            })
            .collect()
    }

    #[test]
    fn fallback_grid_and_ramp() {
        let grid = fallback_positions(4, 2);
        assert_eq!(grid, vec![vec![1.0, 1.0], vec![2.0, 1.0], vec![1.0, 2.0], vec![2.0, 2.0]]);
        let ramp = fallback_positions(3, 1);
        assert_eq!(ramp, vec![vec![0.0], vec![0.5], vec![1.0]]);
    }

    #[test]
    fn field_axes_skip_the_reducer() {
        let items = items(3);
        let params = ProjectionParams {
            x_axis: AxisSpec::NumberField { field: "year".into() },
            y_axis: AxisSpec::Count { field: "authors".into() },
            invert_x_axis: true,
            ..ProjectionParams::default()
        };
        let input = ProjectionInput { items: &items, scores: &[1.0, 0.5, 0.2], vectors: &[], x_decision: None, y_decision: None };
        let out = project(&params, &input, 6, &mut |_, _, _| {}).unwrap();
        assert_eq!(out.raw, vec![[2000.0, 0.0], [2001.0, 1.0], [2002.0, 2.0]]);
        assert_eq!(out.positions[2], [-2002.0, 2.0]);
    }

    #[test]
    fn classifier_values_use_the_decision_vector() {
        let items = vec![
            Item::new(1, "a").with_field("embedding", FieldValue::Vector(vec![1.0, 0.0])),
            Item::new(1, "b"),
        ];
        let decision = DecisionVector { vector: vec![2.0, 1.0], threshold: None, highest_score: None };
        let values = source_values(ValueSource::Classifier { field: "embedding", decision: &decision }, &items, &[]);
        assert_eq!(values, vec![2.0, 0.0]);
    }
}
