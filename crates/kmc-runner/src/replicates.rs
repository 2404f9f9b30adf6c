//! Replicate batches: building run configurations, running them in
//! parallel, averaging and stitching their trajectories.

use crate::executor::Simulator;
use crate::metric_defs;
use crate::stitch::time_sandwich;
use crate::RunnerError;
use crate::sensitivity::{SensitivityCoefficient, SensitivityReport};
use kmc_common::stats::{covariance_ci, mean_ci, MeanCi};
use kmc_common::{sci, LatticeSnapshot, Performance, ReactionNetwork, TrajectoryError, TrajectorySegment};
use kmc_model::{RunConfig, RunOverrides, RunTemplate};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const PERFORMANCE_FILE: &str = "Performance_summary.txt";

/// One completed run of a batch.
#[derive(Debug, Clone)]
pub struct Replicate {
    /// Zero-based replicate index, stable across iterations.
    pub index: usize,
    pub workdir: PathBuf,
    pub segment: TrajectorySegment,
}

/// Completed runs of one batch, ordered by replicate index.
#[derive(Debug, Clone, Default)]
pub struct ReplicateBatch {
    pub replicates: Vec<Replicate>,
    /// Number of runs dispatched.
    pub requested: usize,
}

impl ReplicateBatch {
    pub fn len(&self) -> usize {
        self.replicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicates.is_empty()
    }

    pub fn segments(&self) -> Vec<&TrajectorySegment> {
        self.replicates.iter().map(|r| &r.segment).collect()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.replicates.iter().map(|r| r.index).collect()
    }

    /// Point-wise mean trajectory of the batch.
    pub fn average(&self) -> Result<TrajectorySegment, RunnerError> {
        average_segments(&self.segments())
    }

    /// Sum of the performance metrics of every replicate.
    pub fn performance_totals(&self) -> Performance {
        self.replicates
            .iter()
            .fold(Performance::default(), |acc, r| acc + r.segment.performance)
    }

    /// Turnover frequency of species `column` with a confidence half-width.
    ///
    /// Each replicate contributes the product gained over its run divided by
    /// its final time.
    pub fn tof(&self, column: usize, confidence: f64) -> Result<MeanCi, RunnerError> {
        let samples = self
            .replicates
            .iter()
            .map(|r| r.segment.turnover_frequency(column))
            .collect::<Result<Vec<_>, _>>()?;
        mean_ci(&samples, confidence).ok_or(RunnerError::NoReplicates)
    }

    /// Likelihood-ratio normalized sensitivity coefficients of the turnover
    /// frequency of gas species `product`, one per channel of `network`.
    ///
    /// A replicate's turnover frequency is its final integral propensities
    /// weighted by the net production of `product` per step direction,
    /// divided by its final time. The coefficient of a channel is the
    /// covariance of its summed forward and reverse derivative `W` with the
    /// normalized turnover frequency, plus the share of the mean turnover
    /// frequency the channel carries directly.
    pub fn likelihood_ratio_sensitivities(
        &self,
        product: &str,
        network: &ReactionNetwork,
        confidence: f64,
    ) -> Result<SensitivityReport, RunnerError> {
        if self.is_empty() {
            return Err(RunnerError::NoReplicates);
        }
        let nu = network.direction_stoichiometry(product);
        if nu.iter().all(|n| *n == 0.0) {
            return Err(RunnerError::SensitivityUnavailable(format!(
                "no channel produces or consumes {product}"
            )));
        }

        // per replicate: final W row and TOF contribution per direction
        let mut derivatives = Vec::with_capacity(self.len());
        let mut contributions = Vec::with_capacity(self.len());
        for replicate in &self.replicates {
            let seg = &replicate.segment;
            let (Some(w), Some(props)) =
                (seg.sensitivity.last(), seg.integral_propensities.last())
            else {
                return Err(RunnerError::SensitivityUnavailable(format!(
                    "replicate {} has no sensitivity or integral propensity output",
                    replicate.index + 1
                )));
            };
            if w.len() != nu.len() || props.len() != nu.len() {
                return Err(RunnerError::DimensionMismatch(format!(
                    "replicate {} has {} step directions, the mechanism has {}",
                    replicate.index + 1,
                    w.len(),
                    nu.len()
                )));
            }
            let t_final = seg.final_time();
            if t_final <= 0.0 {
                return Err(TrajectoryError::ZeroDuration.into());
            }
            derivatives.push(w.clone());
            let per_direction: Vec<f64> = props.iter().zip(&nu).map(|(p, n)| p * n / t_final).collect();
            contributions.push(per_direction);
        }

        let tofs: Vec<f64> = contributions.iter().map(|c| c.iter().sum()).collect();
        let tof = mean_ci(&tofs, confidence).ok_or(RunnerError::NoReplicates)?;
        if tof.mean == 0.0 {
            return Err(RunnerError::SensitivityUnavailable(format!(
                "mean turnover frequency of {product} is zero"
            )));
        }
        let normalized: Vec<f64> = tofs.iter().map(|t| t / tof.mean).collect();
        let share = |j: usize| {
            contributions.iter().map(|c| c[j]).sum::<f64>() / self.len() as f64 / tof.mean
        };

        let mut coefficients = Vec::with_capacity(network.len());
        for (i, name) in network.names().into_iter().enumerate() {
            let w: Vec<f64> = derivatives.iter().map(|row| row[2 * i] + row[2 * i + 1]).collect();
            let ci = covariance_ci(&w, &normalized, confidence).ok_or(RunnerError::NoReplicates)?;
            coefficients.push(SensitivityCoefficient {
                name,
                nsc: ci.mean + share(2 * i) + share(2 * i + 1),
                half_width: ci.half_width,
            });
        }
        debug!(product, replicates = self.len(), tof = tof.mean, "likelihood-ratio sensitivities");

        Ok(SensitivityReport {
            product: product.to_string(),
            confidence,
            tof: tof.mean,
            tof_half_width: tof.half_width,
            coefficients,
        })
    }

    /// Append this batch onto the matching replicates of `previous`.
    ///
    /// Replicates present in only one of the two batches are dropped.
    pub fn stitch_onto(&self, previous: &ReplicateBatch) -> Result<ReplicateBatch, RunnerError> {
        let mut replicates = Vec::with_capacity(self.len());
        for replicate in &self.replicates {
            match previous.replicates.iter().find(|p| p.index == replicate.index) {
                Some(prev) => replicates.push(Replicate {
                    index: replicate.index,
                    workdir: replicate.workdir.clone(),
                    segment: time_sandwich(&prev.segment, &replicate.segment)?,
                }),
                None => warn!(
                    replicate = replicate.index + 1,
                    "no earlier trajectory to stitch onto, dropping replicate"
                ),
            }
        }
        if replicates.is_empty() {
            return Err(RunnerError::NoReplicates);
        }
        Ok(ReplicateBatch {
            replicates,
            requested: self.requested,
        })
    }
}

// ============================================================================
// Averaging
// ============================================================================

fn mean_rows(rows: &[&Vec<Vec<f64>>]) -> Vec<Vec<f64>> {
    let n = rows.len() as f64;
    let mut sum = rows[0].clone();
    for other in &rows[1..] {
        for (acc_row, row) in sum.iter_mut().zip(other.iter()) {
            for (acc, v) in acc_row.iter_mut().zip(row) {
                *acc += v;
            }
        }
    }
    for row in &mut sum {
        for v in row.iter_mut() {
            *v /= n;
        }
    }
    sum
}

/// One series from every segment, or `None` if any segment lacks it.
fn gather<'a>(
    segments: &[&'a TrajectorySegment],
    series: fn(&TrajectorySegment) -> &Vec<Vec<f64>>,
) -> Option<Vec<&'a Vec<Vec<f64>>>> {
    let rows: Vec<&'a Vec<Vec<f64>>> = segments.iter().map(|&s| series(s)).collect();
    if rows.iter().any(|r| r.is_empty()) {
        None
    } else {
        Some(rows)
    }
}

fn check_shape(
    name: &str,
    first: &[Vec<f64>],
    other: &[Vec<f64>],
    replicate: usize,
) -> Result<(), RunnerError> {
    let same = first.len() == other.len() && first.iter().zip(other).all(|(a, b)| a.len() == b.len());
    if same {
        Ok(())
    } else {
        Err(RunnerError::DimensionMismatch(format!(
            "{name} of replicate {replicate} differs in shape from replicate 0"
        )))
    }
}

/// Point-wise arithmetic mean of aligned segments.
///
/// Every segment must have the same number of reporting points, steps and
/// species. Propensities are averaged only when every segment has them.
/// Lattice history is taken from the first segment.
pub fn average_segments(segments: &[&TrajectorySegment]) -> Result<TrajectorySegment, RunnerError> {
    let Some(first) = segments.first() else {
        return Err(RunnerError::NoReplicates);
    };

    for (i, seg) in segments.iter().enumerate().skip(1) {
        if seg.len() != first.len() {
            return Err(RunnerError::DimensionMismatch(format!(
                "replicate {i} has {} reporting points, replicate 0 has {}",
                seg.len(),
                first.len()
            )));
        }
        check_shape("species counts", &first.species_counts, &seg.species_counts, i)?;
        check_shape("event counts", &first.events, &seg.events, i)?;
    }

    let n = segments.len() as f64;
    let time = (0..first.len())
        .map(|j| segments.iter().map(|s| s.time[j]).sum::<f64>() / n)
        .collect();

    let species_counts = gather(segments, |s| &s.species_counts)
        .map(|r| mean_rows(&r))
        .unwrap_or_default();
    let events = gather(segments, |s| &s.events)
        .map(|r| mean_rows(&r))
        .unwrap_or_default();

    let mut propensities = Vec::new();
    if let Some(series) = gather(segments, |s| &s.propensities) {
        for (i, rows) in series.iter().enumerate().skip(1) {
            check_shape("propensities", series[0], rows, i)?;
        }
        propensities = mean_rows(&series);
    }
    let mut integral_propensities = Vec::new();
    if let Some(series) = gather(segments, |s| &s.integral_propensities) {
        for (i, rows) in series.iter().enumerate().skip(1) {
            check_shape("integral propensities", series[0], rows, i)?;
        }
        integral_propensities = mean_rows(&series);
    }

    let total = segments
        .iter()
        .fold(Performance::default(), |acc, s| acc + s.performance);
    let performance = Performance {
        t_final: total.t_final / n,
        events_occurred: total.events_occurred / n,
        cpu_time: total.cpu_time / n,
    };

    Ok(TrajectorySegment {
        step_names: first.step_names.clone(),
        species: first.species.clone(),
        time,
        species_counts,
        events,
        propensities,
        integral_propensities,
        // derivatives are only meaningful per replicate
        sensitivity: Vec::new(),
        performance,
        history: first.history.clone(),
    })
}

// ============================================================================
// Batch Execution
// ============================================================================

/// Run configurations for one batch.
///
/// `replicates` pairs each replicate index with the snapshot it continues
/// from. Run directories are `batch_dir/<index + 1>`.
pub fn build_run_configs<'a, I>(
    template: &RunTemplate,
    overrides: &RunOverrides,
    batch_dir: &Path,
    base_seed: u64,
    replicates: I,
) -> Result<Vec<RunConfig>, RunnerError>
where
    I: IntoIterator<Item = (usize, Option<&'a LatticeSnapshot>)>,
{
    replicates
        .into_iter()
        .map(|(index, restart_from)| {
            let workdir = batch_dir.join((index + 1).to_string());
            Ok(template.build(overrides, index, workdir, base_seed, restart_from)?)
        })
        .collect()
}

/// Runs batches of replicates on a dedicated thread pool.
pub struct BatchRunner<'a, S: Simulator> {
    simulator: &'a S,
    pool: rayon::ThreadPool,
    min_replicates: usize,
}

impl<'a, S: Simulator> BatchRunner<'a, S> {
    /// Create a runner with `workers` threads (rayon's default when `None`).
    pub fn new(simulator: &'a S, workers: Option<usize>, min_replicates: usize) -> Result<Self, RunnerError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = workers {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| RunnerError::ConfigError(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            simulator,
            pool,
            min_replicates: min_replicates.max(1),
        })
    }

    /// Run every configuration and collect the completed replicates.
    ///
    /// Failed runs are logged and excluded. Fewer than the minimum number of
    /// completed replicates is an error.
    pub fn run(&self, iteration: u32, configs: Vec<RunConfig>) -> Result<ReplicateBatch, RunnerError> {
        let requested = configs.len();
        let labels = [("iteration", iteration.to_string())];
        info!(iteration, runs = requested, "dispatching batch");

        let results: Vec<(RunConfig, Result<TrajectorySegment, RunnerError>)> = self.pool.install(|| {
            configs
                .into_par_iter()
                .map(|config| {
                    metrics::counter!(metric_defs::RUNS_DISPATCHED.name, &labels).increment(1);
                    let start = Instant::now();
                    let result = self.simulator.simulate(&config);
                    metrics::histogram!(metric_defs::RUN_WALL_TIME.name, &labels)
                        .record(start.elapsed().as_millis() as f64);
                    (config, result)
                })
                .collect()
        });

        let mut replicates = Vec::with_capacity(requested);
        for (config, result) in results {
            match result {
                Ok(segment) => {
                    metrics::counter!(metric_defs::RUNS_COMPLETED.name, &labels).increment(1);
                    debug!(
                        iteration,
                        replicate = config.replicate + 1,
                        points = segment.len(),
                        t_final = segment.final_time(),
                        "run completed"
                    );
                    replicates.push(Replicate {
                        index: config.replicate,
                        workdir: config.workdir,
                        segment,
                    });
                }
                Err(e) => {
                    metrics::counter!(metric_defs::RUNS_INCOMPLETE.name, &labels).increment(1);
                    warn!(
                        iteration,
                        replicate = config.replicate + 1,
                        workdir = %config.workdir.display(),
                        error = %e,
                        "run excluded from batch"
                    );
                }
            }
        }

        if replicates.len() < self.min_replicates {
            return Err(RunnerError::InsufficientReplicates {
                completed: replicates.len(),
                required: self.min_replicates,
            });
        }
        replicates.sort_by_key(|r| r.index);
        Ok(ReplicateBatch {
            replicates,
            requested,
        })
    }
}

// ============================================================================
// Batch Directories
// ============================================================================

/// Load every completed run found in the numbered subdirectories of `dir`.
///
/// Incomplete runs are skipped with a warning.
pub fn load_batch_dir(dir: &Path) -> Result<ReplicateBatch, RunnerError> {
    let mut numbered: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let n: usize = entry.file_name().to_str()?.parse().ok()?;
            (n > 0).then(|| (n - 1, entry.path()))
        })
        .collect();
    numbered.sort_by_key(|(index, _)| *index);

    let requested = numbered.len();
    let mut replicates = Vec::with_capacity(requested);
    for (index, workdir) in numbered {
        match kmc_output::load_run_result(&workdir) {
            Ok(segment) => replicates.push(Replicate {
                index,
                workdir,
                segment,
            }),
            Err(e) => warn!(workdir = %workdir.display(), error = %e, "skipping run"),
        }
    }
    if replicates.is_empty() {
        return Err(RunnerError::NoReplicates);
    }
    Ok(ReplicateBatch {
        replicates,
        requested,
    })
}

/// Write `Performance_summary.txt` with the totals of `batch` into `dir`.
pub fn write_performance_summary(dir: &Path, batch: &ReplicateBatch) -> Result<Performance, RunnerError> {
    let totals = batch.performance_totals();
    let mut file = std::fs::File::create(dir.join(PERFORMANCE_FILE))?;
    writeln!(file, "----- Performance totals -----")?;
    writeln!(file, "number of runs: {}", batch.len())?;
    writeln!(file, "KMC time: {} ", sci(totals.t_final, 3, true))?;
    writeln!(file, "events: {}", totals.events_occurred)?;
    writeln!(file, "CPU time: {} ", sci(totals.cpu_time, 3, true))?;
    Ok(totals)
}
