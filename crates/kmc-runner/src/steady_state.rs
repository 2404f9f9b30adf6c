//! Steady-state tests on the product rate trajectory.
//!
//! Two tests must both pass: the product rates sampled at two fractions of
//! the run must be uncorrelated across replicates, and the averaged rate must
//! show no significant linear trend over the trend window.

use crate::RunnerError;
use kmc_common::stats::{covariance, linear_fit, mean, variance};
use kmc_common::TrajectorySegment;
use kmc_model::SteadyStateSettings;
use serde::Serialize;

/// Relative size below which a variance or a rate change counts as rounding
/// noise.
const RELATIVE_TOLERANCE: f64 = 1e-12;

/// Finite-difference rate of species `column` between consecutive points.
///
/// The result has one entry fewer than the segment. Zero-width intervals
/// contribute a rate of 0.
pub fn rate_trajectory(segment: &TrajectorySegment, column: usize) -> Vec<f64> {
    let counts = segment.species_series(column);
    segment
        .time
        .windows(2)
        .zip(counts.windows(2))
        .map(|(t, n)| {
            let dt = t[1] - t[0];
            if dt > 0.0 {
                (n[1] - n[0]) / dt
            } else {
                0.0
            }
        })
        .collect()
}

fn sample_rate(segment: &TrajectorySegment, column: usize, fraction: f64) -> Result<f64, RunnerError> {
    let rate = rate_trajectory(segment, column);
    if rate.is_empty() {
        return Err(RunnerError::DimensionMismatch(format!(
            "rate trajectory needs at least 2 points, segment has {}",
            segment.len()
        )));
    }
    let idx = segment.fraction_search(fraction)?;
    Ok(rate[idx.saturating_sub(1).min(rate.len() - 1)])
}

/// Correlation of the product rate at `window[0]` against `window[1]` of
/// each replicate's final time.
///
/// The value is the population covariance of the two samples divided by the
/// population variance of the later one. `None` when the later samples have
/// no spread (a single replicate, a product that never forms, or replicates
/// equal up to rounding); such a batch cannot show decorrelation.
pub fn autocorrelation(
    segments: &[&TrajectorySegment],
    column: usize,
    window: [f64; 2],
) -> Result<Option<f64>, RunnerError> {
    if segments.is_empty() {
        return Err(RunnerError::NoReplicates);
    }
    let mut early = Vec::with_capacity(segments.len());
    let mut late = Vec::with_capacity(segments.len());
    for segment in segments {
        early.push(sample_rate(segment, column, window[0])?);
        late.push(sample_rate(segment, column, window[1])?);
    }

    let (Some(var), Some(cov)) = (variance(&late), covariance(&early, &late)) else {
        return Ok(None);
    };
    let scale = mean(&late).unwrap_or(0.0).powi(2);
    if var <= RELATIVE_TOLERANCE * scale || var <= 0.0 {
        return Ok(None);
    }
    Ok(Some(cov / var))
}

/// Slope of the averaged rate over the trend window, and whether its
/// confidence interval contains zero.
///
/// Fewer than three rate points in the window fails the test.
pub fn no_trend(
    average: &TrajectorySegment,
    column: usize,
    window: [f64; 2],
    confidence: f64,
) -> (Option<f64>, bool) {
    let rate = rate_trajectory(average, column);
    let t_final = average.final_time();
    let (lo, hi) = (window[0] * t_final, window[1] * t_final);

    let (xs, ys): (Vec<f64>, Vec<f64>) = average.time[1.min(average.len())..]
        .iter()
        .zip(&rate)
        .filter(|(t, _)| **t >= lo && **t <= hi)
        .map(|(t, r)| (*t, *r))
        .unzip();

    let Some(fit) = linear_fit(&xs, &ys) else {
        return (None, false);
    };
    // a rate that is constant up to rounding has no trend
    let level = mean(&ys).unwrap_or(0.0).abs();
    let flat = (fit.slope * (hi - lo)).abs() <= RELATIVE_TOLERANCE.sqrt() * level;
    (
        Some(fit.slope),
        flat || fit.slope_ci_contains_zero(confidence).unwrap_or(false),
    )
}

/// Outcome of both steady-state tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteadyStateVerdict {
    /// `None` when the correlation is undefined, which fails the test.
    pub autocorrelation: Option<f64>,
    pub autocorrelation_ok: bool,
    pub trend_slope: Option<f64>,
    pub no_trend: bool,
}

impl SteadyStateVerdict {
    pub fn is_steady(&self) -> bool {
        self.autocorrelation_ok && self.no_trend
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyStateDetector {
    pub autocorrelation_window: [f64; 2],
    pub autocorrelation_threshold: f64,
    pub trend_window: [f64; 2],
    pub confidence: f64,
}

impl From<&SteadyStateSettings> for SteadyStateDetector {
    fn from(settings: &SteadyStateSettings) -> Self {
        Self {
            autocorrelation_window: settings.autocorrelation_window,
            autocorrelation_threshold: settings.autocorrelation_threshold,
            trend_window: settings.trend_window,
            confidence: settings.confidence,
        }
    }
}

impl SteadyStateDetector {
    /// Run both tests on the replicate trajectories and their average.
    pub fn evaluate(
        &self,
        replicates: &[&TrajectorySegment],
        average: &TrajectorySegment,
        column: usize,
    ) -> Result<SteadyStateVerdict, RunnerError> {
        let autocorrelation = autocorrelation(replicates, column, self.autocorrelation_window)?;
        let (trend_slope, no_trend) = no_trend(average, column, self.trend_window, self.confidence);
        Ok(SteadyStateVerdict {
            autocorrelation,
            autocorrelation_ok: autocorrelation
                .map_or(false, |c| c.abs() < self.autocorrelation_threshold),
            trend_slope,
            no_trend,
        })
    }
}
