//! # kmc-output
//!
//! Readers for the files the simulator writes into a run directory:
//!
//! | file | reader |
//! |------|--------|
//! | `general_output.txt` | [`read_general`] |
//! | `procstat_output.txt` | [`read_procstat`] |
//! | `specnum_output.txt` | [`read_specnum`] |
//! | `history_output.txt` | [`read_history`] |
//! | `Prop_output.bin`, `PropCounter_output.bin` | [`read_f64_matrix`] |
//!
//! [`load_run_result`] combines them into a [`TrajectorySegment`]. Long
//! outputs are thinned to at most [`MAX_ROWS`] reporting points with a uniform
//! spacing that is also applied to the propensity binaries.

mod binary;
mod general;
mod history;
mod procstat;
mod specnum;

pub use binary::{read_f64_matrix, PROP_COUNTER_FILE, PROP_FILE, SENSITIVITY_FILE};
pub use general::{check_complete, read_general, GeneralOutput, GENERAL_FILE};
pub use history::{read_history, HISTORY_FILE};
pub use procstat::{read_procstat, ProcstatOutput, PROCSTAT_FILE};
pub use specnum::{read_specnum, SpecnumOutput, SPECNUM_FILE};

use kmc_common::{TrajectoryError, TrajectorySegment};
use kmc_model::{ModelError, SimulationSettings};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on reporting points kept from one output file.
pub const MAX_ROWS: usize = 20_000;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while reading simulator output.
#[derive(Debug, Error)]
pub enum OutputError {
    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Run directory lacks the completion marker.
    #[error("Run in {path} did not terminate normally")]
    IncompleteRun {
        /// Run directory.
        path: PathBuf,
    },

    /// Required output file is missing.
    #[error("Missing output file: {0}")]
    MissingFile(PathBuf),

    /// Malformed line in an output file.
    #[error("Parse error in {file} line {line}: {message}")]
    Parse {
        /// Output file name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Input deck of the run could not be read.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Assembled trajectory is inconsistent.
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrajectoryError),
}

impl OutputError {
    pub(crate) fn parse(file: &str, line: usize, message: impl Into<String>) -> Self {
        OutputError::Parse {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }
}

pub(crate) fn read_file(dir: &Path, name: &str) -> Result<String, OutputError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(OutputError::MissingFile(path));
    }
    Ok(std::fs::read_to_string(path)?)
}

pub(crate) fn parse_field(file: &str, line: usize, token: Option<&str>) -> Result<f64, OutputError> {
    let token = token.ok_or_else(|| OutputError::parse(file, line, "missing field"))?;
    token
        .parse()
        .map_err(|_| OutputError::parse(file, line, format!("invalid number '{token}'")))
}

/// Spacing that keeps at most [`MAX_ROWS`] of `n` records.
pub(crate) fn thinning_spacing(n: usize) -> usize {
    if n > MAX_ROWS {
        n / MAX_ROWS
    } else {
        1
    }
}

// ============================================================================
// Run Loading
// ============================================================================

/// Read everything a finished run produced.
///
/// Fails with [`OutputError::IncompleteRun`] when the general output lacks
/// the completion marker. If the process-statistics and species-number files
/// disagree on the number of reporting points, both are cut to the shorter.
pub fn load_run_result(dir: &Path) -> Result<TrajectorySegment, OutputError> {
    if !check_complete(dir) {
        return Err(OutputError::IncompleteRun {
            path: dir.to_path_buf(),
        });
    }

    let settings = SimulationSettings::load(&dir.join(kmc_model::deck::SIMULATION_FILE))?;
    let general = read_general(dir)?;
    let mut procstat = read_procstat(dir)?;
    let mut specnum = read_specnum(dir)?;

    let n = procstat.time.len().min(specnum.time.len());
    if procstat.time.len() != specnum.time.len() {
        warn!(
            dir = %dir.display(),
            procstat = procstat.time.len(),
            specnum = specnum.time.len(),
            "Reporting point counts differ; truncating to the shorter"
        );
        procstat.truncate(n);
        specnum.truncate(n);
    }

    let n_steps = general.step_names.len();
    let propensities = read_binary_series(dir, PROP_FILE, n_steps, procstat.spacing, n)?;
    let integral_propensities = read_binary_series(dir, PROP_COUNTER_FILE, n_steps, procstat.spacing, n)?;
    let sensitivity = read_binary_series(dir, SENSITIVITY_FILE, n_steps, procstat.spacing, n)?;
    if sensitivity.is_empty() {
        debug!(dir = %dir.display(), "No sensitivity analysis output");
    }
    let history = read_history(dir)?;

    let segment = TrajectorySegment {
        step_names: general.step_names,
        species: settings.species_table(),
        time: specnum.time,
        species_counts: specnum.species,
        events: procstat.events,
        propensities,
        integral_propensities,
        sensitivity,
        performance: general.performance,
        history,
    };
    segment.validate()?;

    debug!(
        dir = %dir.display(),
        points = segment.len(),
        t_final = segment.performance.t_final,
        "Loaded run result"
    );
    Ok(segment)
}

/// Read a propensity binary aligned to `n` reporting points.
///
/// A missing file gives an empty series. A file with fewer rows than `n`
/// after thinning is dropped with a warning.
fn read_binary_series(
    dir: &Path,
    name: &str,
    n_steps: usize,
    spacing: usize,
    n: usize,
) -> Result<Vec<Vec<f64>>, OutputError> {
    let path = dir.join(name);
    if !path.is_file() || n_steps == 0 {
        return Ok(Vec::new());
    }
    let rows: Vec<Vec<f64>> = read_f64_matrix(&path, n_steps)?
        .into_iter()
        .step_by(spacing.max(1))
        .take(n)
        .collect();
    if rows.len() < n {
        warn!(file = %path.display(), rows = rows.len(), expected = n, "Binary output too short; ignoring");
        return Ok(Vec::new());
    }
    Ok(rows)
}
