use kmc_common::{LatticeSnapshot, Performance, TrajectorySegment};
use kmc_model::{load_configs_from_str, RescalingConfig, RunConfig, RunTemplate};
use kmc_runner::summary::{HISTORY_JSON_FILE, SUMMARY_FILE};
use kmc_runner::{read_summary, ControllerState, RescalingController, RunnerError, Simulator};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

const MECHANISM: &str = r#"mechanism

reversible_step CO_diffusion
  sites 2
  neighboring 1-2
  initial
    1 CO* 1
    2 * 1
  final
    1 * 1
    2 CO* 1
  variant top
    site_types     1 1
    pre_expon      1.0e12
    pe_ratio       1.0
    activ_eng      0.1
  end_variant
end_reversible_step

reversible_step CO_oxidation
  gas_reacs_prods  CO2 1
  sites 1
  initial
    1 CO* 1
  final
    1 * 1
  variant top
    site_types     1
    pre_expon      1.0e8
    pe_ratio       0.5
    activ_eng      0.9
  end_variant
end_reversible_step

end_mechanism
"#;

const SIMULATION: &str = r#"random_seed         1234
temperature         500.0
pressure            1.0
n_gas_species       2
gas_specs_names     CO    CO2
gas_energies        0.0   -2.337
gas_molec_weights   28.0  44.0
gas_molar_fracs     1.0   0.0
n_surf_species      1
surf_specs_names    CO*
surf_specs_dent     1
snapshots           on event 1000
process_statistics  on event 100
species_numbers     on event 100
event_report        off
max_steps           1000
max_time            infinity
wall_time           3600
finish
"#;

/// How the fake simulator generates event counts and products.
#[derive(Clone, Copy)]
enum Kinetics {
    /// Both channels slow, product linear in time.
    Slow,
    /// Channel 0 equilibrated at a high rate, channel 1 slow.
    Stiff,
    /// Both channels slow, product accelerating within each run.
    Accelerating,
    /// Every run fails.
    Broken,
    /// Like `Slow`, but the replicate with this 0-based index fails.
    FailingReplicate(usize),
}

/// Late-phase product rate offset by `seed % 3`.
///
/// Replicate seeds are consecutive, so any three replicates of a batch cover
/// every offset and their mean rate stays at the noiseless value.
const LATE_RATE_NOISE: [f64; 3] = [0.0, 1.0, -1.0];

/// Produces analytic trajectories instead of launching Zacros.
///
/// The product rate is the same for every replicate over the first half of a
/// run and shifts by a seed-dependent offset over the second half, so early
/// and late rates are uncorrelated across replicates while the late rates
/// still spread.
struct FakeSimulator {
    kinetics: Kinetics,
    /// Stop time (or `None` for an event limit) of every run, in call order.
    stops: Mutex<Vec<Option<f64>>>,
}

impl FakeSimulator {
    fn new(kinetics: Kinetics) -> Self {
        Self {
            kinetics,
            stops: Mutex::new(Vec::new()),
        }
    }
}

impl Simulator for FakeSimulator {
    fn simulate(&self, config: &RunConfig) -> Result<TrajectorySegment, RunnerError> {
        config.write_inputs()?;
        let sim = &config.deck.simulation;
        self.stops.lock().unwrap().push(sim.max_time);

        let fails = match self.kinetics {
            Kinetics::Broken => true,
            Kinetics::FailingReplicate(index) => config.replicate == index,
            _ => false,
        };
        if fails {
            return Err(RunnerError::ExternalProcess {
                workdir: config.workdir.clone(),
                message: "exited with status 1".into(),
            });
        }

        let t_final = sim.max_time.unwrap_or(1.0);
        let sdf = config.deck.mechanism.scaledown_factors();
        let n = 9;
        let time: Vec<f64> = (0..n).map(|i| t_final * i as f64 / (n - 1) as f64).collect();

        let (fast_fwd, fast_rev, slow_fwd, slow_rev) = match self.kinetics {
            Kinetics::Stiff => (1e5 * sdf[0], 1e5 * sdf[0], 20.0, 10.0),
            _ => (20.0, 10.0, 20.0, 10.0),
        };
        let noise = LATE_RATE_NOISE[(config.seed % 3) as usize];
        let half = t_final / 2.0;
        let product = |t: f64| {
            let base = match self.kinetics {
                Kinetics::Accelerating => t * t,
                _ => 10.0 * t,
            };
            base + noise * (t - half).max(0.0)
        };

        Ok(TrajectorySegment {
            step_names: vec![
                "CO_diffusion_fwd_top".into(),
                "CO_diffusion_rev_top".into(),
                "CO_oxidation_fwd_top".into(),
                "CO_oxidation_rev_top".into(),
            ],
            species: template().species(),
            species_counts: time.iter().map(|&t| vec![5.0, -product(t), product(t)]).collect(),
            events: time
                .iter()
                .map(|&t| vec![fast_fwd * t, fast_rev * t, slow_fwd * t, slow_rev * t])
                .collect(),
            performance: Performance {
                t_final,
                events_occurred: (fast_fwd + fast_rev + slow_fwd + slow_rev) * t_final,
                cpu_time: 0.5,
            },
            history: vec![LatticeSnapshot {
                time: t_final,
                sites: vec![],
            }],
            time,
            ..Default::default()
        })
    }
}

fn template() -> RunTemplate {
    use kmc_model::{InitialState, InputDeck, Mechanism, SimulationSettings};
    RunTemplate::from_deck(InputDeck {
        mechanism: Mechanism::parse(MECHANISM).unwrap(),
        simulation: SimulationSettings::parse(SIMULATION).unwrap(),
        initial_state: InitialState::Empty,
        verbatim: Vec::new(),
    })
}

fn config(output: &Path, extra: &str) -> RescalingConfig {
    let base = format!(
        r#"
template_dir: template
output_dir: {}
product: CO2
rescaling:
  n_runs: 3
  max_iterations: 5
runner:
  workers: 2
  seed: 100
"#,
        output.display()
    );
    load_configs_from_str(&[&base, extra]).unwrap()
}

#[test]
fn test_unstiff_steady_system_converges_at_second_iteration() {
    let out = TempDir::new().unwrap();
    let controller = RescalingController::new(
        config(out.path(), "{}"),
        template(),
        FakeSimulator::new(Kinetics::Slow),
    );
    let outcome = controller.run().unwrap();

    assert!(outcome.converged);
    assert_eq!(outcome.final_state, ControllerState::Converged);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.scaledown, vec![1.0, 1.0]);
    assert_eq!(outcome.channel_names, vec!["CO_diffusion_top", "CO_oxidation_top"]);
    assert_eq!(outcome.history.len(), 2);
    assert!(!outcome.history[0].steady_state);
    assert!(outcome.history[0].autocorrelation.is_none());
    assert!(outcome.history[1].steady_state);
    // replicates differ late in the run, so the correlation is defined
    let autocorrelation = outcome.history[1].autocorrelation.unwrap();
    assert!(autocorrelation.abs() < 0.05);

    assert!(out.path().join("Iteration_1").join("1").is_dir());
    assert!(out.path().join("Iteration_2").join("Performance_summary.txt").is_file());
    assert!(out.path().join(HISTORY_JSON_FILE).is_file());
    assert!(out.path().join("mechanism_input.dat").is_file());

    let back = read_summary(&out.path().join(SUMMARY_FILE)).unwrap();
    assert_eq!(back.t_finals.len(), 2);
    assert_eq!(back.sdf_matrix.len(), 3);
}

#[test]
fn test_stiff_channel_is_scaled_down() {
    let out = TempDir::new().unwrap();
    let simulator = FakeSimulator::new(Kinetics::Stiff);
    let controller = RescalingController::new(config(out.path(), "{}"), template(), simulator);
    let outcome = controller.run().unwrap();

    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.history[0].stiff);
    assert!(!outcome.history[1].stiff);
    // 100 * 30 slow events / 2e5 fast events
    assert!((outcome.scaledown[0] - 0.015).abs() < 1e-9);
    assert_eq!(outcome.scaledown[1], 1.0);

    // the rescaled mechanism is written with its scale-down header
    let mechanism = std::fs::read_to_string(out.path().join("mechanism_input.dat")).unwrap();
    assert!(mechanism.contains("# SDF:"));
}

#[test]
fn test_time_budget_grows_with_correction() {
    let out = TempDir::new().unwrap();
    let simulator = FakeSimulator::new(Kinetics::Stiff);
    let controller = RescalingController::new(config(out.path(), "{}"), template(), simulator);
    controller.run().unwrap();

    // first batch stops on events, second on 1.0 * (1 / 0.015) rounded to 4 digits
    let stops = controller_stops(&controller);
    assert_eq!(stops.len(), 6);
    assert!(stops[..3].iter().all(|s| s.is_none()));
    assert!(stops[3..].iter().all(|s| *s == Some(66.67)));
}

fn controller_stops(controller: &RescalingController<FakeSimulator>) -> Vec<Option<f64>> {
    controller.simulator().stops.lock().unwrap().clone()
}

#[test]
fn test_trend_without_rescaling_hits_iteration_limit() {
    let out = TempDir::new().unwrap();
    let extra = "rescaling:\n  include_stiffness_reduction: false\n  max_iterations: 3\n";
    let controller = RescalingController::new(
        config(out.path(), extra),
        template(),
        FakeSimulator::new(Kinetics::Accelerating),
    );
    let outcome = controller.run().unwrap();

    assert!(!outcome.converged);
    assert_eq!(outcome.final_state, ControllerState::MaxIterationsExceeded);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.history.iter().all(|r| !r.stiff && !r.steady_state));

    // without rescaling each batch doubles the previous time
    let stops = controller_stops(&controller);
    assert!(stops[3..6].iter().all(|s| *s == Some(2.0)));
    assert!(stops[6..].iter().all(|s| *s == Some(4.0)));
}

#[test]
fn test_all_runs_failing_is_fatal() {
    let out = TempDir::new().unwrap();
    let controller = RescalingController::new(
        config(out.path(), "{}"),
        template(),
        FakeSimulator::new(Kinetics::Broken),
    );
    let err = controller.run().unwrap_err();
    assert!(matches!(
        err,
        RunnerError::InsufficientReplicates { completed: 0, required: 1 }
    ));

    let summary = std::fs::read_to_string(out.path().join(SUMMARY_FILE)).unwrap();
    assert!(summary.lines().last().unwrap().starts_with("Aborted at iteration 1"));
}

#[test]
fn test_failed_replicate_is_dropped_from_later_batches() {
    let out = TempDir::new().unwrap();
    let controller = RescalingController::new(
        config(out.path(), "{}"),
        template(),
        FakeSimulator::new(Kinetics::FailingReplicate(2)),
    );
    let outcome = controller.run().unwrap();

    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.history[1].autocorrelation.unwrap().abs() < 0.05);

    let first = out.path().join("Iteration_1");
    let summary = std::fs::read_to_string(first.join("Performance_summary.txt")).unwrap();
    assert!(summary.contains("number of runs: 2"));

    // only the two survivors are continued
    let second = out.path().join("Iteration_2");
    assert!(second.join("1").is_dir());
    assert!(second.join("2").is_dir());
    assert!(!second.join("3").exists());
    assert_eq!(controller_stops(&controller).len(), 5);
}

#[test]
fn test_failures_below_minimum_are_fatal() {
    let out = TempDir::new().unwrap();
    let controller = RescalingController::new(
        config(out.path(), "runner:\n  min_replicates: 3\n"),
        template(),
        FakeSimulator::new(Kinetics::FailingReplicate(0)),
    );
    let err = controller.run().unwrap_err();
    assert!(matches!(
        err,
        RunnerError::InsufficientReplicates { completed: 2, required: 3 }
    ));
}

#[test]
fn test_unknown_product_rejected_before_any_run() {
    let out = TempDir::new().unwrap();
    let simulator = FakeSimulator::new(Kinetics::Slow);
    let controller =
        RescalingController::new(config(out.path(), "product: H2O\n"), template(), simulator);
    assert!(matches!(controller.run(), Err(RunnerError::Trajectory(_))));
    assert!(controller_stops(&controller).is_empty());
}

// ============================================================================
// CLI
// ============================================================================

const GENERAL: &str = "\
Number of elementary steps:                 4

Reaction network:

    1. CO_adsorption_fwd_top:    A(Tini) =  2.5000E+08;  Ea       =  0.00
    2. CO_adsorption_rev_top:    A(Tini) =  2.5000E+11;  Ea       =  0.00
    3. O2_adsorption_fwd_bridge: A(Tini) =  1.0000E+08;  Ea       =  0.00
    4. O2_adsorption_rev_bridge: A(Tini) =  1.0000E+10;  Ea       =  0.50

Current KMC time: 2.0000E+00
Events occurred:  120

Elapsed CPU time:         0.8125 seconds

> Normal termination <
";

const PROCSTAT: &str = "\
Overall  CO_adsorption_fwd_top CO_adsorption_rev_top O2_adsorption_fwd_bridge O2_adsorption_rev_bridge
configuration  1  0  0.0000E+00
               0.0  0.0  0.0  0.0
               0  0  0  0  0
configuration  2  60  1.0000E+00
               0.1  0.1  0.2  0.2
               60  20  18  12  10
configuration  3  120  2.0000E+00
               0.1  0.1  0.2  0.2
               120  40  36  24  20
";

const SPECNUM: &str = "\
Entry  Nevents  Time  Temperature  Energy  CO*  O*  CO  O2
1  0  0.0000E+00  500.0  0.0  0  0  0  0
2  60  1.0000E+00  500.0  -1.0  2  6  -2  -3
3  120  2.0000E+00  500.0  -2.0  4  12  -4  -6
";

const RUN_SIMULATION: &str = "\
random_seed         1
temperature         500.0
pressure            1.0
gas_specs_names     CO  O2
gas_energies        0.0 0.0
gas_molec_weights   28.0 32.0
gas_molar_fracs     0.5 0.5
surf_specs_names    CO* O*
surf_specs_dent     1 1
finish
";

fn write_run(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("general_output.txt"), GENERAL).unwrap();
    std::fs::write(dir.join("procstat_output.txt"), PROCSTAT).unwrap();
    std::fs::write(dir.join("specnum_output.txt"), SPECNUM).unwrap();
    std::fs::write(dir.join("simulation_input.dat"), RUN_SIMULATION).unwrap();
}

fn kmcsim(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_kmcsim"))
        .args(args)
        .output()
        .expect("failed to run kmcsim")
}

#[test]
fn test_cli_analyze_batch() {
    let batch = TempDir::new().unwrap();
    write_run(&batch.path().join("1"));
    write_run(&batch.path().join("2"));
    // an unfinished run is skipped
    std::fs::create_dir_all(batch.path().join("3")).unwrap();

    let dir = batch.path().to_str().unwrap();
    let output = kmcsim(&["analyze", dir, "--product", "O2"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["runs"], 2);
    assert_eq!(report["requested"], 3);
    assert_eq!(report["performance"]["t_final"], 4.0);
    assert_eq!(report["tof"]["mean"], -3.0);
    assert_eq!(report["tof"]["half_width"], 0.0);
    assert_eq!(report["step_frequencies"][0]["name"], "CO_adsorption_top");
    assert_eq!(report["step_frequencies"][0]["forward"], 40.0);
    assert_eq!(report["step_frequencies"][1]["net"], 4.0);

    let summary = std::fs::read_to_string(batch.path().join("Performance_summary.txt")).unwrap();
    assert!(summary.contains("number of runs: 2"));
    assert!(batch.path().join("rxn_freqs.txt").is_file());
}

#[test]
fn test_cli_stitch_runs() {
    let runs = TempDir::new().unwrap();
    write_run(&runs.path().join("a"));
    write_run(&runs.path().join("b"));
    let a = runs.path().join("a");
    let b = runs.path().join("b");
    let out_file = runs.path().join("stitched.json");

    let output = kmcsim(&[
        "stitch",
        a.to_str().unwrap(),
        b.to_str().unwrap(),
        "--output",
        out_file.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let seg: TrajectorySegment =
        serde_json::from_str(&std::fs::read_to_string(&out_file).unwrap()).unwrap();
    assert_eq!(seg.len(), 5);
    assert_eq!(seg.final_time(), 4.0);
    assert_eq!(seg.final_events().unwrap(), &[80.0, 72.0, 48.0, 40.0]);
}

#[test]
fn test_cli_summary_readback() {
    let out = TempDir::new().unwrap();
    let controller = RescalingController::new(
        config(out.path(), "{}"),
        template(),
        FakeSimulator::new(Kinetics::Stiff),
    );
    controller.run().unwrap();

    let output = kmcsim(&["summary", out.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let back: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(back["names"][0], "CO_diffusion_top");
    assert_eq!(back["t_finals"].as_array().unwrap().len(), 2);
    assert_eq!(back["sdf_matrix"][0][0], 1.0);
}

#[test]
fn test_cli_missing_batch_fails() {
    let output = kmcsim(&["average", "/nonexistent/batch"]);
    assert!(!output.status.success());
}
