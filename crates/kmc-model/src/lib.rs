//! # kmc-model
//!
//! Configuration loading and input-deck handling for KMC rate rescaling.
//!
//! This crate provides:
//! - The YAML configuration schema ([`RescalingConfig`]) and merge-loading
//! - Input-deck read/write for the simulator ([`deck`])
//! - Immutable run templates and per-iteration overrides ([`RunTemplate`],
//!   [`RunOverrides`], [`RunConfig`])
//!
//! ## Configuration layering
//!
//! Several YAML files can be given; they are merged in order with later keys
//! overriding earlier ones recursively. Every tunable has a built-in default,
//! so a minimal file only names the template directory and the product.

pub mod config;
pub mod deck;
pub mod run;

pub use config::{
    load_config, load_configs, load_configs_from_str, ConfigOverrides, RescalingConfig,
    RescalingSettings, RunnerSettings, SteadyStateSettings, StiffnessSettings,
};
pub use deck::{
    load_reaction_network, InitialState, InputDeck, Mechanism, MechanismStep, SamplingMode,
    SimulationSettings, StepVariant, Temperature, VerbatimFile,
};
pub use run::{derive_seed, random_base_seed, RunConfig, RunOverrides, RunTemplate, StopCondition};

use kmc_common::TrajectoryError;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading configuration or input decks.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed line in an input deck.
    #[error("Parse error in {file} line {line}: {message}")]
    Parse {
        /// Deck file name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Required template file is missing.
    #[error("Missing input file: {0}")]
    MissingFile(PathBuf),

    /// Scale-down vector does not match the number of reaction channels.
    #[error("Scale-down vector has {found} entries, mechanism has {expected} channels")]
    ScaledownLength {
        /// Number of channels.
        expected: usize,
        /// Length of the supplied vector.
        found: usize,
    },

    /// Trajectory or snapshot inconsistency.
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrajectoryError),
}

impl ModelError {
    pub(crate) fn parse(file: &str, line: usize, message: impl Into<String>) -> Self {
        ModelError::Parse {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }
}
