//! Fast/slow classification of reaction channels and per-channel step
//! frequencies.

use crate::RunnerError;
use kmc_common::{sci, TrajectorySegment};
use kmc_model::StiffnessSettings;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::Path;

pub const RXN_FREQS_FILE: &str = "rxn_freqs.txt";

/// Speed label of a reaction channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    Slow,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::Fast => write!(f, "fast"),
            Speed::Slow => write!(f, "slow"),
        }
    }
}

/// Result of one stiffness analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StiffnessReport {
    /// Per-channel scale-down correction in (0, 1].
    pub delta_sdf: Vec<f64>,
    pub speeds: Vec<Speed>,
    /// Largest total event count among slow channels, at least 1.
    pub slow_scale: f64,
}

impl StiffnessReport {
    /// Smallest correction factor, 1 for an empty report.
    pub fn min_delta(&self) -> f64 {
        self.delta_sdf.iter().copied().fold(1.0, f64::min)
    }

    /// Whether every correction is within `cutoff` decades of 1.
    pub fn is_unstiff(&self, cutoff: f64) -> bool {
        self.delta_sdf.iter().all(|d| d.log10().abs() < cutoff)
    }
}

/// Classify channels from final cumulative event counts.
///
/// `final_events` interleaves forward and backward counts per channel. A
/// channel is fast when its net flux is below `equilib_cut` of its total
/// flux; fast channels are scaled so that their total approaches
/// `stiff_cut` times the busiest slow channel.
pub fn process_step_freqs(
    final_events: &[f64],
    stiff_cut: f64,
    equilib_cut: f64,
) -> Result<StiffnessReport, RunnerError> {
    if final_events.len() % 2 != 0 {
        return Err(RunnerError::DimensionMismatch(format!(
            "{} event columns cannot be paired into forward/backward channels",
            final_events.len()
        )));
    }

    let totals: Vec<(f64, Speed)> = final_events
        .chunks_exact(2)
        .map(|pair| {
            let net = pair[0] - pair[1];
            let total = pair[0] + pair[1];
            let speed = if total == 0.0 || (net / total).abs() >= equilib_cut {
                Speed::Slow
            } else {
                Speed::Fast
            };
            (total, speed)
        })
        .collect();

    let slow_scale = totals
        .iter()
        .filter(|(_, speed)| *speed == Speed::Slow)
        .map(|(total, _)| *total)
        .fold(1.0, f64::max);

    let delta_sdf = totals
        .iter()
        .map(|&(total, speed)| match speed {
            Speed::Fast => (stiff_cut * slow_scale / total).min(1.0),
            Speed::Slow => 1.0,
        })
        .collect();

    Ok(StiffnessReport {
        delta_sdf,
        speeds: totals.into_iter().map(|(_, speed)| speed).collect(),
        slow_scale,
    })
}

/// Stiffness analysis with fixed cut-offs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepFrequencyAnalyzer {
    pub stiff_cut: f64,
    pub equilib_cut: f64,
}

impl From<&StiffnessSettings> for StepFrequencyAnalyzer {
    fn from(settings: &StiffnessSettings) -> Self {
        Self {
            stiff_cut: settings.stiff_cut,
            equilib_cut: settings.equilib_cut,
        }
    }
}

impl StepFrequencyAnalyzer {
    /// Analyse the final event counts of `segment`.
    pub fn analyze(&self, segment: &TrajectorySegment) -> Result<StiffnessReport, RunnerError> {
        process_step_freqs(segment.final_events()?, self.stiff_cut, self.equilib_cut)
    }
}

// ============================================================================
// Step Frequency Report
// ============================================================================

/// Forward, reverse and net event counts of one channel over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFrequency {
    pub name: String,
    pub forward: f64,
    pub reverse: f64,
    pub net: f64,
}

/// Event counts per channel between two fractions of the final time.
///
/// Counts are divided by `site_norm` and, with `time_norm`, by the window
/// length.
pub fn step_frequencies(
    segment: &TrajectorySegment,
    window: [f64; 2],
    time_norm: bool,
    site_norm: f64,
) -> Result<Vec<StepFrequency>, RunnerError> {
    if segment.n_steps() % 2 != 0 {
        return Err(RunnerError::DimensionMismatch(format!(
            "{} event columns cannot be paired into forward/backward channels",
            segment.n_steps()
        )));
    }
    if site_norm <= 0.0 {
        return Err(RunnerError::ConfigError(format!(
            "site normalisation must be positive, got {site_norm}"
        )));
    }

    let start = segment.fraction_search(window[0])?;
    let end = segment.fraction_search(window[1])?;
    let mut norm = site_norm;
    if time_norm {
        let dt = segment.time[end] - segment.time[start];
        if dt <= 0.0 {
            return Err(RunnerError::ConfigError(format!(
                "time window [{}, {}] is empty",
                window[0], window[1]
            )));
        }
        norm *= dt;
    }

    let first = &segment.events[start];
    let last = &segment.events[end];
    let names = segment.channel_names();
    Ok(names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let forward = (last[2 * i] - first[2 * i]) / norm;
            let reverse = (last[2 * i + 1] - first[2 * i + 1]) / norm;
            StepFrequency {
                name,
                forward,
                reverse,
                net: (forward - reverse).abs(),
            }
        })
        .collect())
}

/// Write `rxn_freqs.txt` into `dir`.
pub fn write_rxn_freqs(dir: &Path, freqs: &[StepFrequency]) -> Result<(), RunnerError> {
    let mut file = std::fs::File::create(dir.join(RXN_FREQS_FILE))?;
    writeln!(file, "----- Elementary reaction frequencies -----")?;
    writeln!(file, "Reaction Name \t Forward \t Reverse \t Net ")?;
    for freq in freqs {
        writeln!(
            file,
            "{} \t {} \t {} \t {} \t",
            freq.name,
            sci(freq.forward, 3, true),
            sci(freq.reverse, 3, true),
            sci(freq.net, 3, true)
        )?;
    }
    Ok(())
}
