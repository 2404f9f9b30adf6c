//! The rate-rescaling control loop.

use crate::executor::Simulator;
use crate::metric_defs;
use crate::replicates::{build_run_configs, write_performance_summary, BatchRunner, ReplicateBatch};
use crate::steady_state::{SteadyStateDetector, SteadyStateVerdict};
use crate::stiffness::StepFrequencyAnalyzer;
use crate::summary::{iteration_dir, IterationLog, IterationRecord, ReactionDelta};
use crate::RunnerError;
use kmc_common::round_sig;
use kmc_model::deck::MECHANISM_FILE;
use kmc_model::{random_base_seed, RescalingConfig, RunOverrides, RunTemplate};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Phase of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// First batch, stopped after a fixed event count.
    SamplingEvents,
    /// Later batches, stopped at a simulated time.
    SamplingTime,
    Converged,
    MaxIterationsExceeded,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::SamplingEvents => write!(f, "sampling events"),
            ControllerState::SamplingTime => write!(f, "sampling time"),
            ControllerState::Converged => write!(f, "converged"),
            ControllerState::MaxIterationsExceeded => write!(f, "max iterations exceeded"),
        }
    }
}

/// Result of a rescaling run.
///
/// Running out of iterations is reported through `converged`, not as an
/// error.
#[derive(Debug, Clone, Serialize)]
pub struct RescalingOutcome {
    pub converged: bool,
    pub final_state: ControllerState,
    pub iterations: u32,
    pub channel_names: Vec<String>,
    /// Cumulative scale-down factor per channel.
    pub scaledown: Vec<f64>,
    pub history: Vec<IterationRecord>,
}

/// Drives replicate batches until the system is unstiff and at steady
/// state.
pub struct RescalingController<S: Simulator> {
    config: RescalingConfig,
    template: RunTemplate,
    simulator: S,
}

/// State carried from one iteration to the next.
struct LoopState {
    iteration: u32,
    scaledown: Vec<f64>,
    scale_final_time: f64,
    previous: Option<(ReplicateBatch, f64)>,
    cumulative: Option<ReplicateBatch>,
}

impl<S: Simulator> RescalingController<S> {
    pub fn new(config: RescalingConfig, template: RunTemplate, simulator: S) -> Self {
        Self {
            config,
            template,
            simulator,
        }
    }

    pub fn config(&self) -> &RescalingConfig {
        &self.config
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }

    /// Run the loop to convergence or the iteration limit.
    ///
    /// A fatal error is appended to the iteration log before it is returned.
    pub fn run(&self) -> Result<RescalingOutcome, RunnerError> {
        let names = self.template.channel_names();
        let product_col = self.template.species().gas_column(&self.config.product)?;
        let base_seed = self
            .config
            .runner
            .seed
            .or_else(|| self.template.seed())
            .unwrap_or_else(random_base_seed);
        info!(
            product = %self.config.product,
            channels = names.len(),
            base_seed,
            "starting rate rescaling"
        );

        let mut log = IterationLog::create(&self.config.output_dir, &self.config.product, &names)?;
        let mut state = LoopState {
            iteration: 1,
            scaledown: vec![1.0; names.len()],
            scale_final_time: self.config.rescaling.ss_inc,
            previous: None,
            cumulative: None,
        };

        match self.iterate(&mut log, &mut state, &names, product_col, base_seed) {
            Ok(final_state) => {
                self.save_mechanism(&state.scaledown)?;
                Ok(RescalingOutcome {
                    converged: final_state == ControllerState::Converged,
                    final_state,
                    iterations: state.iteration,
                    channel_names: names,
                    scaledown: state.scaledown,
                    history: log.into_records(),
                })
            }
            Err(e) => {
                log.abort(state.iteration, &e);
                Err(e)
            }
        }
    }

    fn iterate(
        &self,
        log: &mut IterationLog,
        state: &mut LoopState,
        names: &[String],
        product_col: usize,
        base_seed: u64,
    ) -> Result<ControllerState, RunnerError> {
        let settings = &self.config.rescaling;
        let runner = BatchRunner::new(
            &self.simulator,
            self.config.runner.workers,
            self.config.runner.min_replicates,
        )?;
        let analyzer = StepFrequencyAnalyzer::from(&self.config.stiffness);
        let detector = SteadyStateDetector::from(&self.config.steady_state);

        for iteration in 1..=settings.max_iterations {
            state.iteration = iteration;
            let phase = if iteration == 1 {
                ControllerState::SamplingEvents
            } else {
                ControllerState::SamplingTime
            };
            let batch_dir = iteration_dir(&self.config.output_dir, iteration);
            let seed = base_seed.wrapping_add(u64::from(iteration - 1) * settings.n_runs as u64);

            let configs = match &state.previous {
                None => {
                    let overrides = RunOverrides::event_sampling(settings.max_events, settings.n_samples);
                    let replicates = (0..settings.n_runs).map(|i| (i, None));
                    build_run_configs(&self.template, &overrides, &batch_dir, seed, replicates)?
                }
                Some((prev, prev_t_final)) => {
                    let t_max = round_sig(prev_t_final * state.scale_final_time, 4);
                    let scaledown = settings
                        .include_stiffness_reduction
                        .then(|| state.scaledown.clone());
                    let overrides = RunOverrides::time_sampling(t_max, settings.n_samples, scaledown);
                    let replicates = prev.replicates.iter().map(|r| {
                        let snapshot = r.segment.last_snapshot();
                        if snapshot.is_none() {
                            warn!(replicate = r.index + 1, "no final snapshot, restarting from template state");
                        }
                        (r.index, snapshot)
                    });
                    info!(iteration, t_max, "time budget for batch");
                    build_run_configs(&self.template, &overrides, &batch_dir, seed, replicates)?
                }
            };
            debug!(iteration, state = %phase, runs = configs.len(), "batch built");

            let current = runner.run(iteration, configs)?;
            write_performance_summary(&batch_dir, &current)?;
            let average = current.average()?;

            let report = analyzer.analyze(&average)?;
            if report.delta_sdf.len() != names.len() {
                return Err(RunnerError::DimensionMismatch(format!(
                    "{} channels in the mechanism, {} in the simulator output",
                    names.len(),
                    report.delta_sdf.len()
                )));
            }
            let unstiff = !settings.include_stiffness_reduction || report.is_unstiff(settings.stiff_cutoff);

            // the first batch only equilibrates; steady state is judged on
            // everything sampled from the second batch on
            let verdict: Option<SteadyStateVerdict> = if iteration == 1 {
                None
            } else {
                let cumulative = match state.cumulative.take() {
                    None => current.clone(),
                    Some(cum) => current.stitch_onto(&cum)?,
                };
                let cum_average = cumulative.average()?;
                let verdict = detector.evaluate(&cumulative.segments(), &cum_average, product_col)?;
                state.cumulative = Some(cumulative);
                Some(verdict)
            };
            let steady = verdict.map_or(false, |v| v.is_steady());

            log.record(IterationRecord {
                iteration,
                t_final: average.final_time(),
                stiff: !unstiff,
                steady_state: steady,
                autocorrelation: verdict.and_then(|v| v.autocorrelation),
                reactions: names
                    .iter()
                    .zip(report.delta_sdf.iter().zip(&report.speeds))
                    .map(|(name, (delta, speed))| ReactionDelta {
                        name: name.clone(),
                        delta_sdf: *delta,
                        speed: *speed,
                    })
                    .collect(),
            })?;
            metrics::counter!(metric_defs::ITERATIONS.name).increment(1);
            info!(
                iteration,
                t_final = average.final_time(),
                stiff = !unstiff,
                steady_state = steady,
                completed = current.len(),
                "iteration finished"
            );

            if settings.include_stiffness_reduction {
                for (cum, delta) in state.scaledown.iter_mut().zip(&report.delta_sdf) {
                    *cum *= delta;
                }
                state.scale_final_time = (1.0 / report.min_delta()).max(settings.ss_inc);
            } else {
                state.scale_final_time = settings.ss_inc;
            }
            state.previous = Some((current, average.performance.t_final));

            if unstiff && steady {
                info!(iteration, "converged");
                return Ok(ControllerState::Converged);
            }
        }

        warn!(max_iterations = settings.max_iterations, "rescaling did not converge");
        Ok(ControllerState::MaxIterationsExceeded)
    }

    /// Write the template mechanism with the final scale-down factors into
    /// the output directory.
    fn save_mechanism(&self, scaledown: &[f64]) -> Result<(), RunnerError> {
        let mut mechanism = self.template.deck().mechanism.clone();
        mechanism.apply_scaledown(scaledown)?;
        mechanism.save(&self.config.output_dir.join(MECHANISM_FILE))?;
        Ok(())
    }
}
