//! # kmc-runner library
//!
//! Replicate batches, trajectory analysis and the rate-rescaling control loop.
//!
//! ## Control loop
//!
//! [`RescalingController`] runs batches of independently seeded replicates.
//! The first batch stops after a fixed number of events; every later batch
//! continues each replicate from its last lattice snapshot for a simulated
//! time window derived from the previous batch. After each batch:
//!
//! - the batch average is classified into fast and slow channels
//!   ([`stiffness`]) and fast channels get a scale-down factor,
//! - the cumulative (stitched) trajectories are tested for steady state
//!   ([`steady_state`]),
//! - an [`summary::IterationRecord`] is appended to the iteration log.
//!
//! The loop stops once the batch is both unstiff and at steady state, or when
//! the iteration limit is reached.
//!
//! ## Sensitivity analysis
//!
//! Normalized sensitivity coefficients of the turnover frequency come either
//! from the likelihood-ratio derivatives Zacros writes alongside a batch
//! ([`ReplicateBatch::likelihood_ratio_sensitivities`]) or from paired batches
//! with perturbed pre-exponentials ([`FiniteDifference`]).
//!
//! ## Parallelism
//!
//! Replicates of a batch run on a rayon thread pool. Results are gathered
//! before any analysis, and the scale-down vector changes only between
//! batches.

pub mod controller;
pub mod executor;
pub mod metric_defs;
pub mod replicates;
pub mod sensitivity;
pub mod steady_state;
pub mod stiffness;
pub mod stitch;
pub mod summary;

pub use controller::{ControllerState, RescalingController, RescalingOutcome};
pub use executor::{execute_run, Simulator, ZacrosSimulator};
pub use replicates::{
    average_segments, build_run_configs, load_batch_dir, write_performance_summary, BatchRunner,
    Replicate, ReplicateBatch,
};
pub use sensitivity::{
    write_sensitivity_output, FiniteDifference, FiniteDifferenceResult, SensitivityCoefficient,
    SensitivityReport,
};
pub use steady_state::{SteadyStateDetector, SteadyStateVerdict};
pub use stiffness::{
    process_step_freqs, step_frequencies, write_rxn_freqs, Speed, StepFrequency,
    StepFrequencyAnalyzer, StiffnessReport,
};
pub use stitch::{stitch_all, time_sandwich};
pub use summary::{read_summary, IterationLog, IterationRecord, ReactionDelta, SummaryReadback};

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while running or analysing replicate batches.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] kmc_model::ModelError),

    /// Output error.
    #[error("Output error: {0}")]
    Output(#[from] kmc_output::OutputError),

    /// Trajectory error.
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] kmc_common::TrajectoryError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Too few replicates of a batch completed.
    #[error("Only {completed} replicates completed, at least {required} required")]
    InsufficientReplicates {
        /// Replicates that produced a result.
        completed: usize,
        /// Minimum accepted.
        required: usize,
    },

    /// Averaging over an empty set of replicates.
    #[error("No replicates to average")]
    NoReplicates,

    /// Series shapes that must agree do not.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Segments cannot be stitched together.
    #[error("Cannot stitch trajectories: {0}")]
    StitchIncompatible(String),

    /// Sensitivity coefficients cannot be computed from the batch.
    #[error("Sensitivity analysis unavailable: {0}")]
    SensitivityUnavailable(String),

    /// The simulator process could not be run or failed.
    #[error("Simulator failed in {workdir}: {message}")]
    ExternalProcess {
        /// Run directory.
        workdir: PathBuf,
        /// Failure description.
        message: String,
    },
}
