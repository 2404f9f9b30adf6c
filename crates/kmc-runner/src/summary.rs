//! Iteration log of the rescaling loop and its read-back.
//!
//! `rescaling_output.txt` starts with three header lines followed by one
//! eight-line block per iteration:
//!
//! ```text
//! ----- Iteration #2 -----
//! t_final: 1.250E+01
//! stiff: false
//! steady-state: true
//! autocorrelation: 1.000E-02
//! CO_adsorption_top	O2_adsorption_bridge
//! 1.000E+00 	3.000E-02
//! slow	fast
//! ```
//!
//! The same block is written to `Iteration_<n>/Iteration_summary.txt`, and
//! the full record history is mirrored as JSON in `rescaling_history.json`.

use crate::stiffness::Speed;
use crate::RunnerError;
use kmc_common::sci;
use kmc_output::OutputError;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

pub const SUMMARY_FILE: &str = "rescaling_output.txt";
pub const ITERATION_SUMMARY_FILE: &str = "Iteration_summary.txt";
pub const HISTORY_JSON_FILE: &str = "rescaling_history.json";

const HEADER_LINES: usize = 3;
const LINES_PER_ITERATION: usize = 8;

/// Directory of iteration `n` below `dir`.
pub fn iteration_dir(dir: &Path, iteration: u32) -> PathBuf {
    dir.join(format!("Iteration_{iteration}"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactionDelta {
    pub name: String,
    pub delta_sdf: f64,
    pub speed: Speed,
}

/// Outcome of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    /// Final time of the batch average.
    pub t_final: f64,
    pub stiff: bool,
    pub steady_state: bool,
    /// Absent in the first iteration.
    pub autocorrelation: Option<f64>,
    pub reactions: Vec<ReactionDelta>,
}

impl IterationRecord {
    fn render(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "----- Iteration #{} -----", self.iteration);
        let _ = writeln!(out, "t_final: {}", sci(self.t_final, 3, true));
        let _ = writeln!(out, "stiff: {}", self.stiff);
        let _ = writeln!(out, "steady-state: {}", self.steady_state);
        match self.autocorrelation {
            Some(value) => {
                let _ = writeln!(out, "autocorrelation: {}", sci(value, 3, true));
            }
            None => out.push_str("autocorrelation: n/a\n"),
        }
        let names: Vec<&str> = self.reactions.iter().map(|r| r.name.as_str()).collect();
        let _ = writeln!(out, "{}", names.join("\t"));
        let sdf: Vec<String> = self.reactions.iter().map(|r| sci(r.delta_sdf, 3, true)).collect();
        let _ = writeln!(out, "{}", sdf.join(" \t"));
        let speeds: Vec<String> = self.reactions.iter().map(|r| r.speed.to_string()).collect();
        let _ = writeln!(out, "{}", speeds.join("\t"));
        out
    }
}

/// Append-only record of a rescaling run.
#[derive(Debug)]
pub struct IterationLog {
    dir: PathBuf,
    records: Vec<IterationRecord>,
}

impl IterationLog {
    /// Start a new log in `dir`, replacing any previous summary file.
    pub fn create(dir: &Path, product: &str, channel_names: &[String]) -> Result<Self, RunnerError> {
        std::fs::create_dir_all(dir)?;
        let mut file = std::fs::File::create(dir.join(SUMMARY_FILE))?;
        writeln!(file, "----- Rate rescaling -----")?;
        writeln!(file, "product: {product}")?;
        writeln!(file, "reactions: {}", channel_names.len())?;
        debug!(dir = %dir.display(), "iteration log created");
        Ok(Self {
            dir: dir.to_path_buf(),
            records: Vec::new(),
        })
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<IterationRecord> {
        self.records
    }

    /// Write the record of one iteration to every log file.
    pub fn record(&mut self, record: IterationRecord) -> Result<(), RunnerError> {
        let block = record.render();

        let iter_dir = iteration_dir(&self.dir, record.iteration);
        std::fs::create_dir_all(&iter_dir)?;
        std::fs::write(iter_dir.join(ITERATION_SUMMARY_FILE), &block)?;

        let mut summary = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.dir.join(SUMMARY_FILE))?;
        summary.write_all(block.as_bytes())?;

        self.records.push(record);
        let json = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(self.dir.join(HISTORY_JSON_FILE), json)?;
        Ok(())
    }

    /// Append an abort line after a fatal error.
    pub fn abort(&self, iteration: u32, err: &RunnerError) {
        error!(iteration, error = %err, "rescaling aborted");
        let appended = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.dir.join(SUMMARY_FILE))
            .and_then(|mut file| writeln!(file, "Aborted at iteration {iteration}: {err}"));
        if let Err(e) = appended {
            error!(error = %e, "cannot append abort line to summary");
        }
    }
}

// ============================================================================
// Read-back
// ============================================================================

/// Contents of a summary file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryReadback {
    pub names: Vec<String>,
    /// Final time of each iteration.
    pub t_finals: Vec<f64>,
    /// Cumulative scale-down factors; row 0 is all ones, row `k` holds the
    /// factors after iteration `k`.
    pub sdf_matrix: Vec<Vec<f64>>,
}

fn summary_error(line: usize, message: impl Into<String>) -> RunnerError {
    OutputError::Parse {
        file: SUMMARY_FILE.to_string(),
        line,
        message: message.into(),
    }
    .into()
}

fn parse_number(token: Option<&str>, line: usize) -> Result<f64, RunnerError> {
    let token = token.ok_or_else(|| summary_error(line, "missing value"))?;
    token
        .parse()
        .map_err(|_| summary_error(line, format!("invalid number '{token}'")))
}

/// Parse a summary file written by [`IterationLog`].
///
/// A trailing abort line is ignored.
pub fn read_summary(path: &Path) -> Result<SummaryReadback, RunnerError> {
    let text = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = text
        .lines()
        .skip(HEADER_LINES)
        .take_while(|l| !l.starts_with("Aborted"))
        .collect();

    let mut readback = SummaryReadback {
        names: Vec::new(),
        t_finals: Vec::new(),
        sdf_matrix: Vec::new(),
    };
    let mut cumulative: Vec<f64> = Vec::new();

    for (k, block) in lines.chunks(LINES_PER_ITERATION).enumerate() {
        let base = HEADER_LINES + k * LINES_PER_ITERATION + 1;
        if block.len() < LINES_PER_ITERATION {
            return Err(summary_error(base, "truncated iteration block"));
        }
        readback
            .t_finals
            .push(parse_number(block[1].split_whitespace().nth(1), base + 1)?);

        let names: Vec<String> = block[5].split_whitespace().map(str::to_string).collect();
        let deltas = block[6]
            .split_whitespace()
            .map(|tok| parse_number(Some(tok), base + 6))
            .collect::<Result<Vec<f64>, _>>()?;
        if deltas.len() != names.len() {
            return Err(summary_error(
                base + 6,
                format!("{} factors for {} reactions", deltas.len(), names.len()),
            ));
        }

        if k == 0 {
            readback.names = names;
            cumulative = vec![1.0; deltas.len()];
            readback.sdf_matrix.push(cumulative.clone());
        } else if names != readback.names {
            return Err(summary_error(base + 5, "reaction names changed between iterations"));
        }
        for (cum, delta) in cumulative.iter_mut().zip(&deltas) {
            *cum *= delta;
        }
        readback.sdf_matrix.push(cumulative.clone());
    }

    Ok(readback)
}
