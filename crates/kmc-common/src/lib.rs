//! # kmc-common
//!
//! Common types for the KMC rate-rescaling workspace.
//!
//! This crate provides the data shared by the deck, output and runner crates:
//! - Reaction channels and networks ([`ReactionChannel`], [`ReactionNetwork`])
//! - Species bookkeeping ([`SpeciesTable`])
//! - Run results ([`TrajectorySegment`], [`Performance`], [`LatticeSnapshot`])
//! - Small statistics helpers ([`stats`])
//!
//! Every numeric series in a [`TrajectorySegment`] is stored as `f64`, so a
//! replicate average has the same shape and type as a single run.

pub mod stats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised when a trajectory is queried or checked for consistency.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// Trajectory has no time points.
    #[error("Trajectory has no time points")]
    Empty,

    /// Time query outside of the sampled range.
    #[error("Time {time} is outside the trajectory range [0, {t_final}]")]
    TimeOutOfRange {
        /// Requested time.
        time: f64,
        /// Last sampled time.
        t_final: f64,
    },

    /// Species name not present in the species table.
    #[error("Unknown species: {0}")]
    UnknownSpecies(String),

    /// A series has the wrong number of rows.
    #[error("Series '{series}' has {found} rows, expected {expected}")]
    RowCount {
        /// Series name.
        series: &'static str,
        /// Expected number of rows.
        expected: usize,
        /// Actual number of rows.
        found: usize,
    },

    /// A row of a series has the wrong number of columns.
    #[error("Series '{series}' row {row} has {found} columns, expected {expected}")]
    ColumnCount {
        /// Series name.
        series: &'static str,
        /// Offending row.
        row: usize,
        /// Expected number of columns.
        expected: usize,
        /// Actual number of columns.
        found: usize,
    },

    /// Time axis goes backwards.
    #[error("Time axis decreases at index {0}")]
    TimeNotMonotonic(usize),

    /// A rate was requested over a trajectory that spans no simulated time.
    #[error("Trajectory spans no simulated time")]
    ZeroDuration,
}

// ============================================================================
// Reaction Types
// ============================================================================

/// One elementary reaction channel (a mechanism step variant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionChannel {
    /// Channel name, `<step>_<variant>`.
    pub name: String,
    /// Whether the channel has a reverse direction.
    pub reversible: bool,
    /// Number of lattice sites the step spans.
    pub site_count: usize,
    /// Current (already scaled) pre-exponential factor.
    pub pre_expon: f64,
    /// Partial-equilibrium ratio, present for reversible channels.
    pub pe_ratio: Option<f64>,
    /// Activation energy.
    pub activation_energy: f64,
    /// Cumulative scale-down factor applied to the pre-exponential.
    pub scaledown: f64,
    /// Gas species produced (positive) or consumed (negative) by the
    /// forward direction.
    #[serde(default)]
    pub gas_stoichiometry: Vec<(String, f64)>,
}

impl ReactionChannel {
    /// Pre-exponential before any scale-down was applied.
    pub fn unscaled_pre_expon(&self) -> f64 {
        if self.scaledown > 0.0 {
            self.pre_expon / self.scaledown
        } else {
            self.pre_expon
        }
    }
}

/// Ordered list of reaction channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactionNetwork {
    /// Channels in mechanism order.
    pub channels: Vec<ReactionChannel>,
}

impl ReactionNetwork {
    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Check if the network has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel names in order.
    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    /// Cumulative scale-down factors in channel order.
    pub fn scaledown_factors(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.scaledown).collect()
    }

    /// Net production of gas species `species` per event, one entry per step
    /// direction: forward then reverse for each channel.
    pub fn direction_stoichiometry(&self, species: &str) -> Vec<f64> {
        self.channels
            .iter()
            .flat_map(|c| {
                let nu: f64 = c
                    .gas_stoichiometry
                    .iter()
                    .filter(|(name, _)| name == species)
                    .map(|(_, n)| n)
                    .sum();
                [nu, -nu]
            })
            .collect()
    }

    /// Whether any channel carries a scale-down other than 1.
    pub fn is_rescaled(&self) -> bool {
        self.channels.iter().any(|c| c.scaledown != 1.0)
    }
}

// ============================================================================
// Species Types
// ============================================================================

/// Surface and gas species names, in the column order used by species counts.
///
/// Surface species come first, gas species after them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesTable {
    /// Surface (adsorbed) species.
    pub surface: Vec<String>,
    /// Gas-phase species.
    pub gas: Vec<String>,
}

impl SpeciesTable {
    /// Create a species table.
    pub fn new(surface: Vec<String>, gas: Vec<String>) -> Self {
        SpeciesTable { surface, gas }
    }

    /// Number of surface species.
    pub fn n_surface(&self) -> usize {
        self.surface.len()
    }

    /// Number of gas species.
    pub fn n_gas(&self) -> usize {
        self.gas.len()
    }

    /// Total number of species columns.
    pub fn len(&self) -> usize {
        self.surface.len() + self.gas.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column of a gas species within the species-count rows.
    pub fn gas_column(&self, name: &str) -> Result<usize, TrajectoryError> {
        self.gas
            .iter()
            .position(|g| g == name)
            .map(|i| self.surface.len() + i)
            .ok_or_else(|| TrajectoryError::UnknownSpecies(name.to_string()))
    }

    /// Column of any species (surface or gas) within the species-count rows.
    pub fn column(&self, name: &str) -> Result<usize, TrajectoryError> {
        if let Some(i) = self.surface.iter().position(|s| s == name) {
            return Ok(i);
        }
        self.gas_column(name)
    }
}

// ============================================================================
// Run Results
// ============================================================================

/// Final performance metrics reported by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Final simulated time.
    pub t_final: f64,
    /// Number of KMC events executed.
    pub events_occurred: f64,
    /// CPU time in seconds.
    pub cpu_time: f64,
}

impl std::ops::Add for Performance {
    type Output = Performance;

    fn add(self, rhs: Self) -> Self::Output {
        Performance {
            t_final: self.t_final + rhs.t_final,
            events_occurred: self.events_occurred + rhs.events_occurred,
            cpu_time: self.cpu_time + rhs.cpu_time,
        }
    }
}

/// Occupancy of one lattice site in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteOccupancy {
    /// Site number (1-based).
    pub site: usize,
    /// Adsorbate entity number (0 for empty sites).
    pub entity: usize,
    /// Surface species index (1-based, 0 for empty).
    pub species: usize,
    /// Dentate of the adsorbate occupying this site.
    pub dentate: usize,
}

/// Lattice state at one point in simulated time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatticeSnapshot {
    /// Simulated time of the snapshot.
    pub time: f64,
    /// Per-site occupancy.
    pub sites: Vec<SiteOccupancy>,
}

/// Time series produced by one simulation run (or an average of runs).
///
/// Rows of every series align with `time`. Event counts and propensities have
/// one column per step direction, interleaved forward/backward per channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySegment {
    /// Step direction names, one per event column.
    pub step_names: Vec<String>,
    /// Species column layout.
    pub species: SpeciesTable,
    /// Elapsed simulated time at each point.
    pub time: Vec<f64>,
    /// Species populations at each point.
    pub species_counts: Vec<Vec<f64>>,
    /// Cumulative event counts at each point.
    pub events: Vec<Vec<f64>>,
    /// Instantaneous propensities (may be empty).
    pub propensities: Vec<Vec<f64>>,
    /// Cumulative integral propensities (may be empty).
    pub integral_propensities: Vec<Vec<f64>>,
    /// Likelihood-ratio trajectory derivatives `W` (may be empty).
    #[serde(default)]
    pub sensitivity: Vec<Vec<f64>>,
    /// Final performance metrics.
    pub performance: Performance,
    /// Lattice snapshots, oldest first.
    pub history: Vec<LatticeSnapshot>,
}

impl TrajectorySegment {
    /// Number of time points.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Check if the segment has no time points.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Number of event columns (step directions).
    pub fn n_steps(&self) -> usize {
        self.events
            .first()
            .map(|row| row.len())
            .unwrap_or(self.step_names.len())
    }

    /// Last sampled time, or 0 for an empty segment.
    pub fn final_time(&self) -> f64 {
        self.time.last().copied().unwrap_or(0.0)
    }

    /// Cumulative event counts at the last point.
    pub fn final_events(&self) -> Result<&[f64], TrajectoryError> {
        self.events
            .last()
            .map(|row| row.as_slice())
            .ok_or(TrajectoryError::Empty)
    }

    /// Most recent lattice snapshot, if any.
    pub fn last_snapshot(&self) -> Option<&LatticeSnapshot> {
        self.history.last()
    }

    /// Channel names derived from the forward step names.
    ///
    /// `CO_ads_fwd_top` becomes `CO_ads_top`; names without a direction
    /// marker are kept unchanged.
    pub fn channel_names(&self) -> Vec<String> {
        self.step_names
            .iter()
            .step_by(2)
            .map(|name| name.replacen("_fwd", "", 1))
            .collect()
    }

    /// Gain of species `column` over the segment divided by its final time.
    pub fn turnover_frequency(&self, column: usize) -> Result<f64, TrajectoryError> {
        let series = self.species_series(column);
        let (Some(first), Some(last)) = (series.first(), series.last()) else {
            return Err(TrajectoryError::Empty);
        };
        let t_final = self.final_time();
        if t_final <= 0.0 {
            return Err(TrajectoryError::ZeroDuration);
        }
        Ok((last - first) / t_final)
    }

    /// Population series for one species column.
    pub fn species_series(&self, column: usize) -> Vec<f64> {
        self.species_counts
            .iter()
            .map(|row| row.get(column).copied().unwrap_or(0.0))
            .collect()
    }

    /// Index of the first time point at or after `t`.
    pub fn time_search(&self, t: f64) -> Result<usize, TrajectoryError> {
        let t_final = self.time.last().copied().ok_or(TrajectoryError::Empty)?;
        if t > t_final || t < 0.0 {
            return Err(TrajectoryError::TimeOutOfRange { time: t, t_final });
        }
        Ok(self.time.partition_point(|&x| x < t))
    }

    /// Index of the first time point at or after `fraction` of the final time.
    pub fn fraction_search(&self, fraction: f64) -> Result<usize, TrajectoryError> {
        let fraction = fraction.clamp(0.0, 1.0);
        self.time_search(self.final_time() * fraction)
    }

    /// Check that every series is aligned with the time axis.
    pub fn validate(&self) -> Result<(), TrajectoryError> {
        let n = self.time.len();
        if let Some(i) = self.time.windows(2).position(|w| w[1] < w[0]) {
            return Err(TrajectoryError::TimeNotMonotonic(i + 1));
        }

        check_matrix("species_counts", &self.species_counts, n, self.species.len())?;
        let n_steps = self.n_steps();
        check_matrix("events", &self.events, n, n_steps)?;
        if !self.propensities.is_empty() {
            check_matrix("propensities", &self.propensities, n, n_steps)?;
        }
        if !self.integral_propensities.is_empty() {
            check_matrix("integral_propensities", &self.integral_propensities, n, n_steps)?;
        }
        if !self.sensitivity.is_empty() {
            check_matrix("sensitivity", &self.sensitivity, n, n_steps)?;
        }
        Ok(())
    }
}

// ============================================================================
// Number Formatting
// ============================================================================

/// Format `value` in scientific notation with a signed two-digit exponent,
/// e.g. `sci(25000.0, 3, true)` gives `2.500E+04`.
pub fn sci(value: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{:.*e}", precision, value);
    let Some((mantissa, exponent)) = raw.split_once('e') else {
        return raw;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{:02}", exponent.abs())
}

/// Round to `digits` significant figures.
pub fn round_sig(value: f64, digits: usize) -> f64 {
    if digits == 0 || !value.is_finite() {
        return value;
    }
    format!("{:.*e}", digits - 1, value).parse().unwrap_or(value)
}

fn check_matrix(
    series: &'static str,
    rows: &[Vec<f64>],
    expected_rows: usize,
    expected_cols: usize,
) -> Result<(), TrajectoryError> {
    if rows.len() != expected_rows {
        return Err(TrajectoryError::RowCount {
            series,
            expected: expected_rows,
            found: rows.len(),
        });
    }
    for (row, values) in rows.iter().enumerate() {
        if values.len() != expected_cols {
            return Err(TrajectoryError::ColumnCount {
                series,
                row,
                expected: expected_cols,
                found: values.len(),
            });
        }
    }
    Ok(())
}
