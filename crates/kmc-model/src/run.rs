//! Run templates, per-iteration overrides and concrete run configurations.
//!
//! A [`RunTemplate`] is read once from the template directory and never
//! changes. Each iteration describes how its runs differ from the template
//! with a [`RunOverrides`] value, and [`RunTemplate::build`] produces a fresh
//! [`RunConfig`] per replicate.

use crate::deck::{InitialState, InputDeck, SamplingMode};
use crate::ModelError;
use kmc_common::{LatticeSnapshot, SpeciesTable};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Seed of replicate `replicate` in a batch with base seed `base`.
pub fn derive_seed(base: u64, replicate: usize) -> u64 {
    base.wrapping_add(replicate as u64)
}

/// A five-digit base seed for templates that do not name one.
pub fn random_base_seed() -> u64 {
    rand::thread_rng().gen_range(10_000..100_000)
}

/// How a run is stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopCondition {
    MaxEvents(u64),
    MaxTime(f64),
}

/// Settings an iteration changes relative to the template.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOverrides {
    pub stop: StopCondition,
    pub process_statistics: SamplingMode,
    pub species_numbers: SamplingMode,
    pub snapshots: SamplingMode,
    pub restart: bool,
    /// Cumulative scale-down factors to apply to the template mechanism.
    pub scaledown: Option<Vec<f64>>,
}

impl RunOverrides {
    /// Stop after `max_events` events, reporting `n_samples` times.
    ///
    /// Snapshots are only taken at the start and the end.
    pub fn event_sampling(max_events: u64, n_samples: u64) -> Self {
        let every = (max_events / n_samples.max(1)).max(1);
        RunOverrides {
            stop: StopCondition::MaxEvents(max_events),
            process_statistics: SamplingMode::OnEvent(every),
            species_numbers: SamplingMode::OnEvent(every),
            snapshots: SamplingMode::OnEvent(max_events),
            restart: false,
            scaledown: None,
        }
    }

    /// Stop at simulated time `t_max`, reporting `n_samples` times.
    pub fn time_sampling(t_max: f64, n_samples: u64, scaledown: Option<Vec<f64>>) -> Self {
        let every = t_max / n_samples.max(1) as f64;
        RunOverrides {
            stop: StopCondition::MaxTime(t_max),
            process_statistics: SamplingMode::OnTime(every),
            species_numbers: SamplingMode::OnTime(every),
            snapshots: SamplingMode::OnTime(t_max),
            restart: false,
            scaledown,
        }
    }
}

/// Everything needed to write and launch one replicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Replicate index within the batch (0-based).
    pub replicate: usize,
    pub workdir: PathBuf,
    pub seed: u64,
    pub deck: InputDeck,
}

impl RunConfig {
    /// Create the work directory and write the input deck into it.
    pub fn write_inputs(&self) -> Result<(), ModelError> {
        self.deck.write(&self.workdir)
    }
}

/// Immutable input deck every run of a job starts from.
#[derive(Debug, Clone)]
pub struct RunTemplate {
    deck: InputDeck,
}

impl RunTemplate {
    /// Read the template deck from a directory.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        Ok(Self::from_deck(InputDeck::load(dir)?))
    }

    pub fn from_deck(deck: InputDeck) -> Self {
        RunTemplate { deck }
    }

    pub fn deck(&self) -> &InputDeck {
        &self.deck
    }

    /// Seed written in the template, if any.
    pub fn seed(&self) -> Option<u64> {
        self.deck.simulation.seed
    }

    pub fn channel_count(&self) -> usize {
        self.deck.mechanism.channel_count()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.deck.mechanism.network().names()
    }

    pub fn species(&self) -> SpeciesTable {
        self.deck.simulation.species_table()
    }

    /// Build the configuration of one replicate.
    ///
    /// The template is cloned; `overrides` and the optional restart snapshot
    /// are applied to the clone only.
    pub fn build(
        &self,
        overrides: &RunOverrides,
        replicate: usize,
        workdir: PathBuf,
        base_seed: u64,
        restart_from: Option<&LatticeSnapshot>,
    ) -> Result<RunConfig, ModelError> {
        let mut deck = self.deck.clone();
        if let Some(sdf) = &overrides.scaledown {
            deck.mechanism.apply_scaledown(sdf)?;
        }

        let seed = derive_seed(base_seed, replicate);
        let sim = &mut deck.simulation;
        sim.seed = Some(seed);
        match overrides.stop {
            StopCondition::MaxEvents(n) => {
                sim.max_steps = Some(n);
                sim.max_time = None;
            }
            StopCondition::MaxTime(t) => {
                sim.max_steps = None;
                sim.max_time = Some(t);
            }
        }
        sim.wall_time = None;
        sim.restart = overrides.restart;
        sim.process_statistics = overrides.process_statistics;
        sim.species_numbers = overrides.species_numbers;
        sim.snapshots = overrides.snapshots;

        if let Some(snapshot) = restart_from {
            deck.initial_state = InitialState::Snapshot(snapshot.clone());
        }

        Ok(RunConfig {
            replicate,
            workdir,
            seed,
            deck,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::fixtures::{MECHANISM, SIMULATION};
    use crate::deck::{Mechanism, SimulationSettings};
    use kmc_common::SiteOccupancy;

    fn template() -> RunTemplate {
        RunTemplate::from_deck(InputDeck {
            mechanism: Mechanism::parse(MECHANISM).unwrap(),
            simulation: SimulationSettings::parse(SIMULATION).unwrap(),
            initial_state: InitialState::Empty,
            verbatim: Vec::new(),
        })
    }

    #[test]
    fn test_derive_seed() {
        assert_eq!(derive_seed(100, 0), 100);
        assert_eq!(derive_seed(100, 7), 107);
        assert_eq!(derive_seed(u64::MAX, 1), 0);
    }

    #[test]
    fn test_random_base_seed_range() {
        for _ in 0..20 {
            let seed = random_base_seed();
            assert!((10_000..100_000).contains(&seed));
        }
    }

    #[test]
    fn test_event_sampling_overrides() {
        let overrides = RunOverrides::event_sampling(10_000, 100);
        let config = template()
            .build(&overrides, 3, PathBuf::from("run/4"), 500, None)
            .unwrap();
        let sim = &config.deck.simulation;
        assert_eq!(config.seed, 503);
        assert_eq!(sim.seed, Some(503));
        assert_eq!(sim.max_steps, Some(10_000));
        assert_eq!(sim.max_time, None);
        assert_eq!(sim.wall_time, None);
        assert!(!sim.restart);
        assert_eq!(sim.process_statistics, SamplingMode::OnEvent(100));
        assert_eq!(sim.snapshots, SamplingMode::OnEvent(10_000));
    }

    #[test]
    fn test_time_sampling_applies_scaledown_to_clone() {
        let template = template();
        let overrides = RunOverrides::time_sampling(50.0, 100, Some(vec![0.1, 1.0, 1.0]));
        let snapshot = LatticeSnapshot {
            time: 10.0,
            sites: vec![SiteOccupancy { site: 1, entity: 1, species: 1, dentate: 1 }],
        };
        let config = template
            .build(&overrides, 0, PathBuf::from("run/1"), 1, Some(&snapshot))
            .unwrap();

        assert_eq!(config.deck.mechanism.scaledown_factors(), vec![0.1, 1.0, 1.0]);
        assert_eq!(template.deck().mechanism.scaledown_factors(), vec![1.0, 1.0, 1.0]);
        assert_eq!(config.deck.simulation.max_time, Some(50.0));
        assert_eq!(config.deck.simulation.max_steps, None);
        assert_eq!(config.deck.simulation.species_numbers, SamplingMode::OnTime(0.5));
        assert_eq!(config.deck.initial_state, InitialState::Snapshot(snapshot));
    }

    #[test]
    fn test_write_inputs_creates_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let workdir = dir.path().join("Iteration_1").join("1");
        let config = template()
            .build(&RunOverrides::event_sampling(1000, 10), 0, workdir.clone(), 42, None)
            .unwrap();
        config.write_inputs().unwrap();
        let sim = SimulationSettings::load(&workdir.join("simulation_input.dat")).unwrap();
        assert_eq!(sim.seed, Some(42));
        assert_eq!(sim.max_steps, Some(1000));
    }
}
