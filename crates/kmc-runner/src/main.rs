//! # kmcsim
//!
//! CLI for rate rescaling and post-processing of Zacros runs.

use kmc_common::{Performance, TrajectorySegment};
use kmc_model::deck::MECHANISM_FILE;
use kmc_model::{
    load_configs, load_reaction_network, random_base_seed, ConfigOverrides, RunOverrides,
    RunTemplate,
};
use kmc_runner::metric_defs;
use kmc_runner::replicates::PERFORMANCE_FILE;
use kmc_runner::stiffness::RXN_FREQS_FILE;
use kmc_runner::sensitivity::SENSITIVITY_OUTPUT_FILE;
use kmc_runner::summary::SUMMARY_FILE;
use kmc_runner::{
    load_batch_dir, read_summary, step_frequencies, stitch_all, write_performance_summary,
    write_rxn_freqs, write_sensitivity_output, BatchRunner, FiniteDifference, RescalingController,
    RunnerError, SensitivityReport, StepFrequency, ZacrosSimulator,
};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// KMCsim - rate rescaling for Zacros kinetic Monte Carlo
#[derive(Parser, Debug)]
#[command(name = "kmcsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at info level when RUST_LOG is not set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rescale fast reactions until the system is unstiff and at steady state
    Rescale(RescaleConfig),
    /// Join consecutive run directories into one trajectory
    Stitch(StitchConfig),
    /// Average the completed runs of a batch directory
    Average(AverageConfig),
    /// Performance totals, step frequencies and turnover frequency of a batch
    Analyze(AnalyzeConfig),
    /// Finite-difference sensitivity of the turnover frequency to some channels
    FiniteDifference(FiniteDifferenceConfig),
    /// Read a rescaling summary back
    Summary(SummaryConfig),
    /// List all emitted metrics with descriptions
    Metrics,
}

/// Configuration for a rescaling run
#[derive(Args, Debug)]
pub struct RescaleConfig {
    /// Path(s) to YAML configuration file(s), merged in order
    #[arg(short, long = "config", value_name = "FILE", required = true)]
    pub configs: Vec<PathBuf>,

    /// Template run directory (overrides the configuration)
    #[arg(long, value_name = "DIR")]
    pub template: Option<PathBuf>,

    /// Simulator executable
    #[arg(long, value_name = "PATH")]
    pub executable: Option<PathBuf>,

    /// Output directory for iteration folders and logs
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Gas-phase product species
    #[arg(long)]
    pub product: Option<String>,

    /// Replicates per batch
    #[arg(long)]
    pub runs: Option<usize>,

    /// Iteration limit
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Worker threads (default: one per CPU)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Base random seed (default: template seed, else random)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Only run to steady state, never rescale
    #[arg(long)]
    pub no_stiffness_reduction: bool,
}

impl RescaleConfig {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            template_dir: self.template.clone(),
            executable: self.executable.clone(),
            output_dir: self.output.clone(),
            product: self.product.clone(),
            n_runs: self.runs,
            max_iterations: self.max_iterations,
            workers: self.workers,
            seed: self.seed,
            no_stiffness_reduction: self.no_stiffness_reduction,
        }
    }
}

/// Configuration for stitching runs
#[derive(Args, Debug)]
pub struct StitchConfig {
    /// Run directories in chronological order
    #[arg(value_name = "RUN_DIR", num_args = 2.., required = true)]
    pub run_dirs: Vec<PathBuf>,

    /// Write the stitched trajectory as JSON to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Configuration for averaging a batch
#[derive(Args, Debug)]
pub struct AverageConfig {
    /// Directory with numbered run subdirectories
    pub batch_dir: PathBuf,

    /// Write the average trajectory as JSON to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Configuration for analysing a batch
#[derive(Args, Debug)]
pub struct AnalyzeConfig {
    /// Directory with numbered run subdirectories
    pub batch_dir: PathBuf,

    /// Gas-phase product for the turnover frequency
    #[arg(long)]
    pub product: Option<String>,

    /// Fractions of the final time bounding the frequency window
    #[arg(long, num_args = 2, value_names = ["FROM", "TO"], default_values_t = [0.0, 1.0])]
    pub window: Vec<f64>,

    /// Divide step frequencies by the window length
    #[arg(long)]
    pub time_norm: bool,

    /// Divide step frequencies by this site count
    #[arg(long, default_value_t = 1.0)]
    pub site_norm: f64,

    /// Confidence level of the turnover frequency interval
    #[arg(long, default_value_t = 0.95)]
    pub confidence: f64,

    /// Likelihood-ratio sensitivity coefficients of the product's turnover
    /// frequency (needs SA_output.bin in every run)
    #[arg(long, requires = "product")]
    pub sensitivity: bool,
}

/// Configuration for a finite-difference sensitivity estimate
#[derive(Args, Debug)]
pub struct FiniteDifferenceConfig {
    /// Path(s) to YAML configuration file(s), merged in order
    #[arg(short, long = "config", value_name = "FILE", required = true)]
    pub configs: Vec<PathBuf>,

    /// One-based channel to perturb (repeat to perturb several together)
    #[arg(long = "channel", value_name = "N", required = true)]
    pub channels: Vec<usize>,

    /// Fractional perturbation of the pre-exponentials
    #[arg(long, default_value_t = 0.05)]
    pub perturbation: f64,

    /// Runs per perturbed batch
    #[arg(long, default_value_t = 20)]
    pub runs: usize,

    /// Stop each run at this simulated time instead of the event limit
    #[arg(long, value_name = "T")]
    pub max_time: Option<f64>,

    /// Output directory for the perturbed batches (overrides the configuration)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

/// Configuration for reading a summary
#[derive(Args, Debug)]
pub struct SummaryConfig {
    /// Rescaling output directory or summary file
    pub path: PathBuf,
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Serialize)]
struct TofReport {
    product: String,
    mean: f64,
    half_width: f64,
    confidence: f64,
}

#[derive(Debug, Serialize)]
struct AnalysisReport {
    runs: usize,
    requested: usize,
    performance: Performance,
    tof: Option<TofReport>,
    step_frequencies: Vec<StepFrequency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensitivity: Option<SensitivityReport>,
}

// ============================================================================
// Commands
// ============================================================================

fn rescale_command(config: RescaleConfig) -> Result<(), RunnerError> {
    let paths: Vec<&Path> = config.configs.iter().map(|p| p.as_path()).collect();
    let settings = load_configs(&paths)?.with_overrides(&config.overrides())?;
    let template = RunTemplate::load(&settings.template_dir)?;
    let simulator = ZacrosSimulator::new(settings.executable.clone());

    let controller = RescalingController::new(settings, template, simulator);
    let outcome = controller.run()?;
    info!(
        converged = outcome.converged,
        iterations = outcome.iterations,
        "rescaling finished"
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn emit_segment(segment: &TrajectorySegment, output: Option<&Path>) -> Result<(), RunnerError> {
    let json = serde_json::to_string_pretty(segment)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            info!(path = %path.display(), points = segment.len(), "trajectory written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn stitch_command(config: StitchConfig) -> Result<(), RunnerError> {
    let segments = config
        .run_dirs
        .iter()
        .map(|dir| kmc_output::load_run_result(dir))
        .collect::<Result<Vec<_>, _>>()?;
    let stitched = stitch_all(&segments)?;
    emit_segment(&stitched, config.output.as_deref())
}

fn average_command(config: AverageConfig) -> Result<(), RunnerError> {
    let batch = load_batch_dir(&config.batch_dir)?;
    info!(completed = batch.len(), requested = batch.requested, "batch loaded");
    emit_segment(&batch.average()?, config.output.as_deref())
}

fn analyze_command(config: AnalyzeConfig) -> Result<(), RunnerError> {
    let batch = load_batch_dir(&config.batch_dir)?;
    let performance = write_performance_summary(&config.batch_dir, &batch)?;
    let average = batch.average()?;

    let window = [config.window[0], config.window[1]];
    let frequencies = step_frequencies(&average, window, config.time_norm, config.site_norm)?;
    write_rxn_freqs(&config.batch_dir, &frequencies)?;

    let tof = match &config.product {
        Some(product) => {
            let column = average.species.gas_column(product)?;
            let ci = batch.tof(column, config.confidence)?;
            Some(TofReport {
                product: product.clone(),
                mean: ci.mean,
                half_width: ci.half_width,
                confidence: config.confidence,
            })
        }
        None => None,
    };
    info!(
        dir = %config.batch_dir.display(),
        "wrote {PERFORMANCE_FILE} and {RXN_FREQS_FILE}"
    );

    let sensitivity = match (&config.product, config.sensitivity) {
        (Some(product), true) => {
            let first = batch.replicates.first().ok_or(RunnerError::NoReplicates)?;
            let network = load_reaction_network(&first.workdir.join(MECHANISM_FILE))?;
            let report =
                batch.likelihood_ratio_sensitivities(product, &network, config.confidence)?;
            write_sensitivity_output(&config.batch_dir, &report)?;
            info!(dir = %config.batch_dir.display(), "wrote {SENSITIVITY_OUTPUT_FILE}");
            Some(report)
        }
        _ => None,
    };

    let report = AnalysisReport {
        runs: batch.len(),
        requested: batch.requested,
        performance,
        tof,
        step_frequencies: frequencies,
        sensitivity,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn finite_difference_command(config: FiniteDifferenceConfig) -> Result<(), RunnerError> {
    let paths: Vec<&Path> = config.configs.iter().map(|p| p.as_path()).collect();
    let overrides = ConfigOverrides {
        output_dir: config.output.clone(),
        ..Default::default()
    };
    let settings = load_configs(&paths)?.with_overrides(&overrides)?;
    let template = RunTemplate::load(&settings.template_dir)?;
    let product_col = template.species().gas_column(&settings.product)?;

    if config.channels.contains(&0) {
        return Err(RunnerError::ConfigError("channels are numbered from 1".into()));
    }
    let fd = FiniteDifference {
        channels: config.channels.iter().map(|c| c - 1).collect(),
        perturbation: config.perturbation,
        n_runs: config.runs,
    };
    let r = &settings.rescaling;
    let base = match config.max_time {
        Some(t_max) => RunOverrides::time_sampling(t_max, r.n_samples, None),
        None => RunOverrides::event_sampling(r.max_events, r.n_samples),
    };
    let base_seed = settings
        .runner
        .seed
        .or_else(|| template.seed())
        .unwrap_or_else(random_base_seed);

    let simulator = ZacrosSimulator::new(settings.executable.clone());
    let runner = BatchRunner::new(
        &simulator,
        settings.runner.workers,
        settings.runner.min_replicates,
    )?;
    let result = fd.run(
        &runner,
        &template,
        &base,
        &settings.output_dir,
        base_seed,
        product_col,
        settings.steady_state.confidence,
    )?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn summary_command(config: SummaryConfig) -> Result<(), RunnerError> {
    let path = if config.path.is_dir() {
        config.path.join(SUMMARY_FILE)
    } else {
        config.path
    };
    let readback = read_summary(&path)?;
    println!("{}", serde_json::to_string_pretty(&readback)?);
    Ok(())
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default_level = if cli.verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    metric_defs::describe_metrics();

    match cli.command {
        Commands::Rescale(config) => rescale_command(config)?,
        Commands::Stitch(config) => stitch_command(config)?,
        Commands::Average(config) => average_command(config)?,
        Commands::Analyze(config) => analyze_command(config)?,
        Commands::FiniteDifference(config) => finite_difference_command(config)?,
        Commands::Summary(config) => summary_command(config)?,
        Commands::Metrics => print_metrics_info(),
    }

    Ok(())
}

/// Print information about all emitted metrics
fn print_metrics_info() {
    println!("KMCsim Metrics");
    println!("==============\n");
    for metric in metric_defs::ALL {
        let unit = if metric.unit.is_empty() {
            String::new()
        } else {
            format!(" [{}]", metric.unit)
        };
        println!("{} ({}){}", metric.name, metric.kind, unit);
        println!("  {}", metric.description);
        if !metric.labels.is_empty() {
            println!("  labels: {}", metric.labels.join(", "));
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rescale_overrides() {
        let cli = Cli::parse_from([
            "kmcsim",
            "rescale",
            "-c",
            "base.yaml",
            "-c",
            "local.yaml",
            "--runs",
            "4",
            "--seed",
            "42",
            "--no-stiffness-reduction",
        ]);
        let Commands::Rescale(config) = cli.command else {
            panic!("expected rescale");
        };
        assert_eq!(config.configs.len(), 2);
        let overrides = config.overrides();
        assert_eq!(overrides.n_runs, Some(4));
        assert_eq!(overrides.seed, Some(42));
        assert!(overrides.no_stiffness_reduction);
        assert!(overrides.product.is_none());
    }

    #[test]
    fn test_analyze_defaults() {
        let cli = Cli::parse_from(["kmcsim", "-v", "analyze", "Iteration_1"]);
        assert!(cli.verbose);
        let Commands::Analyze(config) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(config.window, vec![0.0, 1.0]);
        assert_eq!(config.site_norm, 1.0);
        assert!(!config.time_norm);
    }

    #[test]
    fn test_sensitivity_needs_product() {
        assert!(Cli::try_parse_from(["kmcsim", "analyze", "b", "--sensitivity"]).is_err());
        assert!(Cli::try_parse_from(["kmcsim", "analyze", "b", "--sensitivity", "--product", "CO2"]).is_ok());
    }

    #[test]
    fn test_finite_difference_channels() {
        let cli = Cli::parse_from([
            "kmcsim",
            "finite-difference",
            "-c",
            "job.yaml",
            "--channel",
            "2",
            "--channel",
            "5",
        ]);
        let Commands::FiniteDifference(config) = cli.command else {
            panic!("expected finite-difference");
        };
        assert_eq!(config.channels, vec![2, 5]);
        assert_eq!(config.perturbation, 0.05);
        assert_eq!(config.runs, 20);
        assert!(config.max_time.is_none());
    }

    #[test]
    fn test_stitch_needs_two_dirs() {
        assert!(Cli::try_parse_from(["kmcsim", "stitch", "a"]).is_err());
        assert!(Cli::try_parse_from(["kmcsim", "stitch", "a", "b"]).is_ok());
    }
}
