//! Joining consecutive trajectory segments into one cumulative trajectory.

use crate::RunnerError;
use kmc_common::{TrajectoryError, TrajectorySegment};
use tracing::debug;

fn offset_rows(rows: &[Vec<f64>], offset: &[f64], columns: std::ops::Range<usize>) -> Vec<Vec<f64>> {
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(j, v)| match offset.get(j) {
                    Some(o) if columns.contains(&j) => v + o,
                    _ => *v,
                })
                .collect()
        })
        .collect()
}

/// Cumulative series of `a` followed by `b` offset by the last row of `a`.
///
/// Empty when either segment lacks the series.
fn offset_series(label: &str, a: &[Vec<f64>], b: &[Vec<f64>], n_steps: usize) -> Vec<Vec<f64>> {
    let (Some(offset), false) = (a.last(), b.is_empty()) else {
        if !a.is_empty() || !b.is_empty() {
            debug!("{label} missing from one segment, dropped from stitched trajectory");
        }
        return Vec::new();
    };
    let mut out = a.to_vec();
    out.extend(offset_rows(&b[1..], offset, 0..n_steps));
    out
}

/// Append segment `b`, which continued from the final state of `a`.
///
/// The first point of `b` duplicates the last point of `a` and is dropped, so
/// the result has `a.len() + b.len() - 1` points. Time, cumulative event
/// counts, integral propensities and gas-phase species counts of `b` are
/// offset by the final values of `a`, as are the sensitivity derivatives;
/// surface populations and instantaneous propensities are appended unchanged.
/// Only the first snapshot of `a` and the last snapshot of `b` are kept.
pub fn time_sandwich(a: &TrajectorySegment, b: &TrajectorySegment) -> Result<TrajectorySegment, RunnerError> {
    if a.is_empty() || b.is_empty() {
        return Err(TrajectoryError::Empty.into());
    }
    a.validate()?;
    b.validate()?;
    if a.n_steps() != b.n_steps() {
        return Err(RunnerError::StitchIncompatible(format!(
            "{} step directions vs {}",
            a.n_steps(),
            b.n_steps()
        )));
    }
    if a.species.n_surface() != b.species.n_surface() || a.species.n_gas() != b.species.n_gas() {
        return Err(RunnerError::StitchIncompatible(format!(
            "{}+{} species vs {}+{}",
            a.species.n_surface(),
            a.species.n_gas(),
            b.species.n_surface(),
            b.species.n_gas()
        )));
    }

    let n_steps = a.n_steps();
    let n_surface = a.species.n_surface();
    let n_species = a.species.len();
    let t_offset = a.final_time();

    let mut out = TrajectorySegment {
        step_names: if a.step_names.is_empty() {
            b.step_names.clone()
        } else {
            a.step_names.clone()
        },
        species: a.species.clone(),
        performance: a.performance + b.performance,
        ..Default::default()
    };

    out.time = a.time.clone();
    out.time.extend(b.time[1..].iter().map(|t| t + t_offset));

    let gas_offset = a.species_counts.last().cloned().unwrap_or_default();
    out.species_counts = a.species_counts.clone();
    if gas_offset.len() == n_species {
        out.species_counts
            .extend(offset_rows(&b.species_counts[1..], &gas_offset, n_surface..n_species));
    } else {
        out.species_counts.extend_from_slice(&b.species_counts[1..]);
    }

    let event_offset = a.final_events()?;
    out.events = a.events.clone();
    out.events.extend(offset_rows(&b.events[1..], event_offset, 0..n_steps));

    out.integral_propensities = offset_series(
        "integral propensities",
        &a.integral_propensities,
        &b.integral_propensities,
        n_steps,
    );
    out.sensitivity =
        offset_series("sensitivity derivatives", &a.sensitivity, &b.sensitivity, n_steps);

    if !a.propensities.is_empty() && !b.propensities.is_empty() {
        out.propensities = a.propensities.clone();
        out.propensities.extend_from_slice(&b.propensities[1..]);
    }

    out.history = a
        .history
        .first()
        .into_iter()
        .chain(b.history.last())
        .cloned()
        .collect();

    out.validate()?;
    Ok(out)
}

/// Stitch a sequence of segments in order.
pub fn stitch_all<'a, I>(segments: I) -> Result<TrajectorySegment, RunnerError>
where
    I: IntoIterator<Item = &'a TrajectorySegment>,
{
    let mut iter = segments.into_iter();
    let first = iter.next().ok_or(RunnerError::NoReplicates)?;
    iter.try_fold(first.clone(), |acc, next| time_sandwich(&acc, next))
}
