//! YAML configuration for the rescaling loop.

use crate::ModelError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

// ============================================================================
// Schema
// ============================================================================

/// Complete, validated configuration of one rescaling job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RescalingConfig {
    /// Directory holding the template input deck.
    pub template_dir: PathBuf,
    /// Simulator executable, run inside each replicate directory.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Parent directory for iteration folders and summary files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Gas species whose production rate is tracked.
    pub product: String,
    #[serde(default)]
    pub rescaling: RescalingSettings,
    #[serde(default)]
    pub stiffness: StiffnessSettings,
    #[serde(default)]
    pub steady_state: SteadyStateSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
}

fn default_executable() -> PathBuf {
    PathBuf::from("zacros.x")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("rescaling")
}

/// Outer-loop constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RescalingSettings {
    /// Apply scale-down factors between iterations.
    pub include_stiffness_reduction: bool,
    /// Event budget of the first (event-sampled) iteration.
    pub max_events: u64,
    /// Upper bound on iterations.
    pub max_iterations: u32,
    /// Unstiff when every |log10(delta_sdf)| is below this.
    pub stiff_cutoff: f64,
    /// Minimum growth factor of the simulated time window.
    pub ss_inc: f64,
    /// Reporting points per run.
    pub n_samples: u64,
    /// Replicates per batch.
    pub n_runs: usize,
}

impl Default for RescalingSettings {
    fn default() -> Self {
        RescalingSettings {
            include_stiffness_reduction: true,
            max_events: 10_000,
            max_iterations: 15,
            stiff_cutoff: 1.0,
            ss_inc: 2.0,
            n_samples: 100,
            n_runs: 10,
        }
    }
}

/// Fast/slow classification constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StiffnessSettings {
    /// Target ratio of a fast channel's frequency to the slow scale.
    pub stiff_cut: f64,
    /// A channel is quasi-equilibrated when |net/total| is below this.
    pub equilib_cut: f64,
}

impl Default for StiffnessSettings {
    fn default() -> Self {
        StiffnessSettings {
            stiff_cut: 100.0,
            equilib_cut: 0.05,
        }
    }
}

/// Steady-state test constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SteadyStateSettings {
    /// Fractions of t_final at which the rate is sampled per replicate.
    pub autocorrelation_window: [f64; 2],
    /// Autocorrelation passes when its magnitude is below this.
    pub autocorrelation_threshold: f64,
    /// Fraction window of the averaged rate used for the trend fit.
    pub trend_window: [f64; 2],
    /// Confidence level of the trend slope interval.
    pub confidence: f64,
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        SteadyStateSettings {
            autocorrelation_window: [0.5, 1.0],
            autocorrelation_threshold: 0.05,
            trend_window: [0.5, 1.0],
            confidence: 0.95,
        }
    }
}

/// Replicate dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    /// Worker threads (defaults to the number of CPUs).
    pub workers: Option<usize>,
    /// Base random seed; replicate `i` uses `seed + i`.
    pub seed: Option<u64>,
    /// Minimum number of complete replicates a batch needs.
    pub min_replicates: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings {
            workers: None,
            seed: None,
            min_replicates: 1,
        }
    }
}

/// Command-line overrides applied on top of the merged files.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub template_dir: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub product: Option<String>,
    pub n_runs: Option<usize>,
    pub max_iterations: Option<u32>,
    pub workers: Option<usize>,
    pub seed: Option<u64>,
    pub no_stiffness_reduction: bool,
}

impl RescalingConfig {
    /// Apply command-line overrides and validate the result.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self, ModelError> {
        if let Some(dir) = &overrides.template_dir {
            self.template_dir = dir.clone();
        }
        if let Some(exe) = &overrides.executable {
            self.executable = exe.clone();
        }
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(product) = &overrides.product {
            self.product = product.clone();
        }
        if let Some(n) = overrides.n_runs {
            self.rescaling.n_runs = n;
        }
        if let Some(n) = overrides.max_iterations {
            self.rescaling.max_iterations = n;
        }
        if let Some(w) = overrides.workers {
            self.runner.workers = Some(w);
        }
        if let Some(seed) = overrides.seed {
            self.runner.seed = Some(seed);
        }
        if overrides.no_stiffness_reduction {
            self.rescaling.include_stiffness_reduction = false;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check every constant for a usable value.
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.product.trim().is_empty() {
            return invalid("product species must be named".into());
        }
        if self.template_dir.as_os_str().is_empty() {
            return invalid("template_dir must be set".into());
        }

        let r = &self.rescaling;
        if r.max_events == 0 {
            return invalid("rescaling.max_events must be positive".into());
        }
        if r.max_iterations == 0 {
            return invalid("rescaling.max_iterations must be at least 1".into());
        }
        if r.n_samples == 0 {
            return invalid("rescaling.n_samples must be positive".into());
        }
        if r.n_runs == 0 {
            return invalid("rescaling.n_runs must be positive".into());
        }
        if !(r.stiff_cutoff > 0.0) {
            return invalid(format!("rescaling.stiff_cutoff must be positive, got {}", r.stiff_cutoff));
        }
        if !(r.ss_inc >= 1.0) {
            return invalid(format!("rescaling.ss_inc must be at least 1, got {}", r.ss_inc));
        }

        let s = &self.stiffness;
        if !(s.stiff_cut > 0.0) {
            return invalid(format!("stiffness.stiff_cut must be positive, got {}", s.stiff_cut));
        }
        if !(s.equilib_cut > 0.0 && s.equilib_cut <= 1.0) {
            return invalid(format!("stiffness.equilib_cut must be in (0, 1], got {}", s.equilib_cut));
        }

        let ss = &self.steady_state;
        check_window("steady_state.autocorrelation_window", ss.autocorrelation_window)?;
        check_window("steady_state.trend_window", ss.trend_window)?;
        if !(ss.autocorrelation_threshold > 0.0) {
            return invalid("steady_state.autocorrelation_threshold must be positive".into());
        }
        if !(ss.confidence > 0.0 && ss.confidence < 1.0) {
            return invalid(format!("steady_state.confidence must be in (0, 1), got {}", ss.confidence));
        }

        let run = &self.runner;
        if run.workers == Some(0) {
            return invalid("runner.workers must be at least 1".into());
        }
        if run.min_replicates == 0 || run.min_replicates > r.n_runs {
            return invalid(format!(
                "runner.min_replicates must be in 1..={}, got {}",
                r.n_runs, run.min_replicates
            ));
        }
        Ok(())
    }
}

fn check_window(name: &str, window: [f64; 2]) -> Result<(), ModelError> {
    let [lo, hi] = window;
    if (0.0..=1.0).contains(&lo) && (0.0..=1.0).contains(&hi) && lo < hi {
        Ok(())
    } else {
        Err(ModelError::InvalidConfig(format!(
            "{name} must satisfy 0 <= lo < hi <= 1, got [{lo}, {hi}]"
        )))
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load a configuration from a single YAML file.
pub fn load_config(path: &Path) -> Result<RescalingConfig, ModelError> {
    load_configs(&[path])
}

/// Load and merge several YAML files; later files override earlier ones.
pub fn load_configs(paths: &[&Path]) -> Result<RescalingConfig, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No configuration files provided".to_string()));
    }

    let yaml_strings: Result<Vec<String>, std::io::Error> =
        paths.iter().map(|path| std::fs::read_to_string(path)).collect();
    let yaml_strings = yaml_strings?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_configs_from_str(&yaml_strs)
}

/// Merge several YAML documents and deserialize the result.
///
/// Mappings merge key by key; any other value in a later document replaces
/// the earlier one. Validation runs only on the merged configuration.
pub fn load_configs_from_str(yaml_strs: &[&str]) -> Result<RescalingConfig, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No configuration strings provided".to_string()));
    }

    let mut merged = Value::Mapping(Default::default());
    for yaml_str in yaml_strs {
        let value: Value = serde_yaml::from_str(yaml_str)?;
        if value.is_null() {
            continue;
        }
        merge_values(&mut merged, value);
    }

    let config: RescalingConfig = serde_yaml::from_value(merged)?;
    config.validate()?;
    Ok(config)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
template_dir: template
product: CO2
"#;

    #[test]
    fn test_defaults_applied() {
        let config = load_configs_from_str(&[MINIMAL]).unwrap();
        assert_eq!(config.rescaling.max_events, 10_000);
        assert_eq!(config.rescaling.max_iterations, 15);
        assert_eq!(config.rescaling.n_runs, 10);
        assert_eq!(config.rescaling.n_samples, 100);
        assert_eq!(config.rescaling.ss_inc, 2.0);
        assert_eq!(config.stiffness.stiff_cut, 100.0);
        assert_eq!(config.stiffness.equilib_cut, 0.05);
        assert_eq!(config.steady_state.autocorrelation_window, [0.5, 1.0]);
        assert_eq!(config.runner.min_replicates, 1);
        assert_eq!(config.output_dir, PathBuf::from("rescaling"));
    }

    #[test]
    fn test_later_file_overrides_nested_keys() {
        let overlay = r#"
rescaling:
  n_runs: 4
stiffness:
  stiff_cut: 50.0
"#;
        let config = load_configs_from_str(&[MINIMAL, overlay]).unwrap();
        assert_eq!(config.rescaling.n_runs, 4);
        assert_eq!(config.rescaling.max_events, 10_000);
        assert_eq!(config.stiffness.stiff_cut, 50.0);
        assert_eq!(config.stiffness.equilib_cut, 0.05);
        assert_eq!(config.product, "CO2");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = r#"
template_dir: template
product: CO2
rescaling:
  n_rnus: 3
"#;
        assert!(matches!(
            load_configs_from_str(&[bad]),
            Err(ModelError::YamlError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_window() {
        let bad = r#"
template_dir: template
product: CO2
steady_state:
  trend_window: [0.8, 0.2]
"#;
        assert!(matches!(
            load_configs_from_str(&[bad]),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_min_replicates_bounded_by_runs() {
        let bad = r#"
template_dir: template
product: CO2
rescaling:
  n_runs: 2
runner:
  min_replicates: 3
"#;
        assert!(load_configs_from_str(&[bad]).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = load_configs_from_str(&[MINIMAL]).unwrap();
        let overrides = ConfigOverrides {
            n_runs: Some(3),
            seed: Some(42),
            no_stiffness_reduction: true,
            ..Default::default()
        };
        let config = config.with_overrides(&overrides).unwrap();
        assert_eq!(config.rescaling.n_runs, 3);
        assert_eq!(config.runner.seed, Some(42));
        assert!(!config.rescaling.include_stiffness_reduction);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("base.yaml");
        let extra = dir.path().join("extra.yaml");
        std::fs::write(&base, MINIMAL).unwrap();
        std::fs::write(&extra, "product: H2O\n").unwrap();
        let config = load_configs(&[base.as_path(), extra.as_path()]).unwrap();
        assert_eq!(config.product, "H2O");
    }
}
