//! Normalized sensitivity coefficients (NSC) of the turnover frequency.
//!
//! The likelihood-ratio estimate lives on
//! [`ReplicateBatch`](crate::ReplicateBatch); this module holds the report
//! types, the `SA_output.txt` writer and the finite-difference estimate,
//! which runs two extra batches with the pre-exponentials of some channels
//! scaled up and down.

use crate::executor::Simulator;
use crate::replicates::{build_run_configs, BatchRunner, ReplicateBatch};
use crate::RunnerError;
use kmc_common::sci;
use kmc_common::stats::{diff_ci, mean};
use kmc_model::{RunOverrides, RunTemplate};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const SENSITIVITY_OUTPUT_FILE: &str = "SA_output.txt";

/// Sensitivity of the turnover frequency to one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensitivityCoefficient {
    pub name: String,
    /// d ln TOF / d ln k.
    pub nsc: f64,
    pub half_width: f64,
}

/// Likelihood-ratio sensitivities of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensitivityReport {
    pub product: String,
    pub confidence: f64,
    pub tof: f64,
    pub tof_half_width: f64,
    pub coefficients: Vec<SensitivityCoefficient>,
}

/// Write `SA_output.txt` into `dir`.
pub fn write_sensitivity_output(dir: &Path, report: &SensitivityReport) -> Result<(), RunnerError> {
    let mut file = std::fs::File::create(dir.join(SENSITIVITY_OUTPUT_FILE))?;
    writeln!(file, "Normalized sensitivity coefficients \n")?;
    writeln!(
        file,
        "Turnover frequency: \t{} \t+- {} \t\n",
        sci(report.tof, 3, true),
        sci(report.tof_half_width, 3, true)
    )?;
    writeln!(file, "Reaction name \t NSC \t NSC confidence ")?;
    for c in &report.coefficients {
        writeln!(file, "{}\t{:.3} +- \t{:.3}", c.name, c.nsc, c.half_width)?;
    }
    Ok(())
}

// ============================================================================
// Finite Differences
// ============================================================================

/// Central finite-difference sensitivity of a group of channels.
#[derive(Debug, Clone, PartialEq)]
pub struct FiniteDifference {
    /// Zero-based channels perturbed together.
    pub channels: Vec<usize>,
    /// Fractional increase of the pre-exponentials in the upper batch; the
    /// lower batch divides by the same factor.
    pub perturbation: f64,
    pub n_runs: usize,
}

/// Outcome of a finite-difference estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiniteDifferenceResult {
    pub channels: Vec<String>,
    pub perturbation: f64,
    pub nsc: f64,
    pub half_width: f64,
    pub tof_plus: f64,
    pub tof_minus: f64,
    /// Completed runs of the upper and lower batch.
    pub runs: [usize; 2],
}

impl FiniteDifference {
    /// Per-channel factors of the upper and lower batch.
    pub fn factors(&self, n_channels: usize) -> Result<(Vec<f64>, Vec<f64>), RunnerError> {
        if self.channels.is_empty() {
            return Err(RunnerError::ConfigError("no channels to perturb".into()));
        }
        if !(self.perturbation > 0.0) {
            return Err(RunnerError::ConfigError(format!(
                "perturbation must be positive, got {}",
                self.perturbation
            )));
        }
        let up = 1.0 + self.perturbation;
        let mut plus = vec![1.0; n_channels];
        let mut minus = vec![1.0; n_channels];
        for &c in &self.channels {
            if c >= n_channels {
                return Err(RunnerError::ConfigError(format!(
                    "channel {} out of range, the mechanism has {n_channels}",
                    c + 1
                )));
            }
            plus[c] = up;
            minus[c] = 1.0 / up;
        }
        Ok((plus, minus))
    }

    /// Directory suffix naming the perturbed channels, one-based.
    fn label(&self) -> String {
        self.channels
            .iter()
            .map(|c| (c + 1).to_string())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Run the upper and lower batches under `dir` and difference their
    /// turnover frequencies of species column `product_col`.
    ///
    /// Both batches start from the template with `base` applied and share
    /// the same seeds. Their metrics carry iteration label 0.
    #[allow(clippy::too_many_arguments)]
    pub fn run<S: Simulator>(
        &self,
        runner: &BatchRunner<'_, S>,
        template: &RunTemplate,
        base: &RunOverrides,
        dir: &Path,
        base_seed: u64,
        product_col: usize,
        confidence: f64,
    ) -> Result<FiniteDifferenceResult, RunnerError> {
        let names = template.channel_names();
        let (plus, minus) = self.factors(names.len())?;
        let label = self.label();

        let run_side = |side: &str, factors: Vec<f64>| -> Result<ReplicateBatch, RunnerError> {
            let mut overrides = base.clone();
            overrides.scaledown = Some(match &base.scaledown {
                Some(sdf) => sdf.iter().zip(&factors).map(|(s, f)| s * f).collect(),
                None => factors,
            });
            let batch_dir = dir.join(format!("{side}_{label}"));
            let configs = build_run_configs(
                template,
                &overrides,
                &batch_dir,
                base_seed,
                (0..self.n_runs).map(|i| (i, None)),
            )?;
            runner.run(0, configs)
        };
        let upper = run_side("plus", plus)?;
        let lower = run_side("minus", minus)?;

        let tofs = |batch: &ReplicateBatch| -> Result<Vec<f64>, RunnerError> {
            batch
                .replicates
                .iter()
                .map(|r| r.segment.turnover_frequency(product_col).map_err(RunnerError::from))
                .collect()
        };
        let tof_plus = tofs(&upper)?;
        let tof_minus = tofs(&lower)?;

        let all: Vec<f64> = tof_plus.iter().chain(&tof_minus).copied().collect();
        let tof_mean = mean(&all).ok_or(RunnerError::NoReplicates)?;
        if tof_mean == 0.0 {
            return Err(RunnerError::SensitivityUnavailable(
                "mean turnover frequency of the perturbed batches is zero".into(),
            ));
        }
        let diff = diff_ci(&tof_plus, &tof_minus, confidence).ok_or(RunnerError::NoReplicates)?;
        // ln k spans 2 ln(1 + p) between the two batches
        let span = 2.0 * (1.0 + self.perturbation).ln();

        let result = FiniteDifferenceResult {
            channels: self.channels.iter().map(|&c| names[c].clone()).collect(),
            perturbation: self.perturbation,
            nsc: diff.mean / tof_mean / span,
            half_width: diff.half_width / tof_mean / span,
            tof_plus: mean(&tof_plus).unwrap_or(0.0),
            tof_minus: mean(&tof_minus).unwrap_or(0.0),
            runs: [upper.len(), lower.len()],
        };
        info!(
            channels = %label,
            nsc = result.nsc,
            half_width = result.half_width,
            "finite-difference sensitivity"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmc_common::{SpeciesTable, TrajectorySegment};
    use kmc_model::{InitialState, InputDeck, Mechanism, RunConfig, SimulationSettings};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const MECHANISM: &str = "mechanism
reversible_step A
  gas_reacs_prods  P 1
  sites 1
  initial
    1 * 1
  final
    1 * 1
  variant top
    site_types  1
    pre_expon   10.0
    pe_ratio    1.0
    activ_eng   0.0
  end_variant
end_reversible_step
reversible_step B
  sites 1
  initial
    1 * 1
  final
    1 * 1
  variant top
    site_types  1
    pre_expon   1.0
    pe_ratio    1.0
    activ_eng   0.0
  end_variant
end_reversible_step
end_mechanism
";

    const SIMULATION: &str = "random_seed 5
temperature 500.0
pressure 1.0
gas_specs_names P
gas_energies 0.0
gas_molec_weights 1.0
gas_molar_fracs 0.0
surf_specs_names X*
surf_specs_dent 1
finish
";

    /// Produces `P` at a rate equal to channel A's pre-exponential.
    struct RateFromMechanism {
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl Simulator for RateFromMechanism {
        fn simulate(&self, config: &RunConfig) -> Result<TrajectorySegment, RunnerError> {
            let k = config.deck.mechanism.steps[0].variants[0].pre_expon;
            let dir = config.workdir.parent().and_then(|p| p.file_name());
            let side = dir.map(|d| d.to_string_lossy().into_owned()).unwrap_or_default();
            self.seen.lock().unwrap().push((side, config.seed));
            Ok(TrajectorySegment {
                step_names: vec!["A_fwd".into(), "A_rev".into(), "B_fwd".into(), "B_rev".into()],
                species: SpeciesTable::new(vec!["X*".into()], vec!["P".into()]),
                time: vec![0.0, 2.0],
                species_counts: vec![vec![0.0, 0.0], vec![0.0, 2.0 * k]],
                events: vec![vec![0.0; 4], vec![1.0; 4]],
                ..Default::default()
            })
        }
    }

    fn template() -> RunTemplate {
        RunTemplate::from_deck(InputDeck {
            mechanism: Mechanism::parse(MECHANISM).unwrap(),
            simulation: SimulationSettings::parse(SIMULATION).unwrap(),
            initial_state: InitialState::Empty,
            verbatim: Vec::new(),
        })
    }

    #[test]
    fn test_factors() {
        let fd = FiniteDifference {
            channels: vec![1],
            perturbation: 0.25,
            n_runs: 2,
        };
        let (plus, minus) = fd.factors(3).unwrap();
        assert_eq!(plus, vec![1.0, 1.25, 1.0]);
        assert_eq!(minus, vec![1.0, 0.8, 1.0]);
        assert!(matches!(fd.factors(1), Err(RunnerError::ConfigError(_))));

        let none = FiniteDifference { channels: vec![], ..fd };
        assert!(none.factors(3).is_err());
    }

    #[test]
    fn test_first_order_rate_has_unit_sensitivity() {
        let dir = TempDir::new().unwrap();
        let sim = RateFromMechanism {
            seen: Mutex::new(Vec::new()),
        };
        let runner = BatchRunner::new(&sim, Some(2), 1).unwrap();
        let fd = FiniteDifference {
            channels: vec![0],
            perturbation: 0.05,
            n_runs: 3,
        };
        let base = RunOverrides::time_sampling(2.0, 10, None);
        let result = fd.run(&runner, &template(), &base, dir.path(), 40, 1, 0.95).unwrap();

        // TOF = k, so d ln TOF / d ln k = 1 up to the secant error
        assert!((result.nsc - 1.0).abs() < 2e-3);
        assert_eq!(result.half_width, 0.0);
        assert!((result.tof_plus - 10.5).abs() < 1e-9);
        assert_eq!(result.runs, [3, 3]);
        assert_eq!(result.channels, vec!["A_top"]);

        // both sides use the same seeds
        let seen = sim.seen.lock().unwrap();
        let seeds = |side: &str| {
            let mut s: Vec<u64> = seen.iter().filter(|(d, _)| d == side).map(|(_, s)| *s).collect();
            s.sort();
            s
        };
        assert_eq!(seeds("plus_1"), vec![40, 41, 42]);
        assert_eq!(seeds("minus_1"), vec![40, 41, 42]);
    }

    #[test]
    fn test_sensitivity_output_format() {
        let dir = TempDir::new().unwrap();
        let report = SensitivityReport {
            product: "P".into(),
            confidence: 0.95,
            tof: 12.5,
            tof_half_width: 0.5,
            coefficients: vec![SensitivityCoefficient {
                name: "A_top".into(),
                nsc: 0.98765,
                half_width: 0.0421,
            }],
        };
        write_sensitivity_output(dir.path(), &report).unwrap();
        let text = std::fs::read_to_string(dir.path().join(SENSITIVITY_OUTPUT_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Normalized sensitivity coefficients ");
        assert_eq!(lines[2], "Turnover frequency: \t1.250E+01 \t+- 5.000E-01 \t");
        assert_eq!(lines[4], "Reaction name \t NSC \t NSC confidence ");
        assert_eq!(lines[5], "A_top\t0.988 +- \t0.042");
    }
}
