//! Simulator input decks.
//!
//! A run directory holds `mechanism_input.dat`, `simulation_input.dat`, an
//! optional `state_input.dat` and the verbatim energetics and lattice files.
//! [`InputDeck`] reads all of them from a template directory and writes them
//! into a run directory.

mod mechanism;
mod simulation;
mod state;

pub use mechanism::{Mechanism, MechanismStep, StepVariant, MECHANISM_FILE};
pub use simulation::{
    GasSpecies, SamplingMode, SimulationSettings, SurfaceSpecies, Temperature, SIMULATION_FILE,
};
pub use state::{InitialState, STATE_FILE};

use crate::ModelError;
use kmc_common::ReactionNetwork;
use std::path::Path;
use tracing::debug;

/// Template files copied into each run directory unchanged.
pub const VERBATIM_FILES: [&str; 2] = ["energetics_input.dat", "lattice_input.dat"];

/// A template file whose contents are not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerbatimFile {
    pub name: String,
    pub contents: String,
}

/// Everything needed to start one simulator run.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDeck {
    pub mechanism: Mechanism,
    pub simulation: SimulationSettings,
    pub initial_state: InitialState,
    pub verbatim: Vec<VerbatimFile>,
}

impl InputDeck {
    /// Read a deck from a template directory.
    ///
    /// The mechanism and simulation files are required; the state file and
    /// the verbatim files are picked up when present.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let mechanism = Mechanism::load(&dir.join(MECHANISM_FILE))?;
        let simulation = SimulationSettings::load(&dir.join(SIMULATION_FILE))?;
        let initial_state = InitialState::load(&dir.join(STATE_FILE))?;

        let mut verbatim = Vec::new();
        for name in VERBATIM_FILES {
            let path = dir.join(name);
            if path.is_file() {
                verbatim.push(VerbatimFile {
                    name: name.to_string(),
                    contents: std::fs::read_to_string(&path)?,
                });
            }
        }

        debug!(
            dir = %dir.display(),
            channels = mechanism.channel_count(),
            verbatim = verbatim.len(),
            "Loaded input deck"
        );

        Ok(InputDeck {
            mechanism,
            simulation,
            initial_state,
            verbatim,
        })
    }

    /// Write every deck file into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<(), ModelError> {
        std::fs::create_dir_all(dir)?;
        self.mechanism.save(&dir.join(MECHANISM_FILE))?;
        self.simulation.save(&dir.join(SIMULATION_FILE))?;
        self.initial_state
            .save(&dir.join(STATE_FILE), &self.simulation.surface_names())?;
        for file in &self.verbatim {
            std::fs::write(dir.join(&file.name), &file.contents)?;
        }
        Ok(())
    }
}

/// Read the reaction channels of a mechanism file.
pub fn load_reaction_network(path: &Path) -> Result<ReactionNetwork, ModelError> {
    Ok(Mechanism::load(path)?.network())
}

/// Split a deck line into its code part and trailing comment.
pub(crate) fn split_comment(line: &str) -> (&str, Option<&str>) {
    match line.find('#') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    }
}

pub(crate) fn parse_f64(file: &str, line: usize, token: Option<&str>) -> Result<f64, ModelError> {
    let token = token.ok_or_else(|| ModelError::parse(file, line, "missing numeric value"))?;
    token
        .parse()
        .map_err(|_| ModelError::parse(file, line, format!("invalid number '{token}'")))
}

pub(crate) fn parse_u64(file: &str, line: usize, token: Option<&str>) -> Result<u64, ModelError> {
    let token = token.ok_or_else(|| ModelError::parse(file, line, "missing integer value"))?;
    token
        .parse()
        .map_err(|_| ModelError::parse(file, line, format!("invalid integer '{token}'")))
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const MECHANISM: &str = r#"mechanism

############################################################################

reversible_step CO_adsorption

  gas_reacs_prods  CO -1
  sites 1
  initial
    1 * 1
  final
    1 CO* 1

  variant top
    site_types     1
    pre_expon      2.5e8
    pe_ratio       1.0e-3
    activ_eng      0.0
  end_variant

end_reversible_step

############################################################################

step CO_oxidation

  gas_reacs_prods  CO2 1
  sites 2
  neighboring 1-2
  initial
    1 CO* 1
    2 O* 1
  final
    1 * 1
    2 * 1

  variant fcc
    site_types     1 1
    pre_expon      1.0e13
    activ_eng      1.2
  end_variant

  variant hcp
    site_types     1 2
    pre_expon      5.0e12
    activ_eng      1.3
  end_variant

end_step

end_mechanism
"#;

    pub const SIMULATION: &str = r#"random_seed         8949

temperature         500.0
pressure            2.0

n_gas_species       2
gas_specs_names     CO    CO2
gas_energies        0.0   -2.337
gas_molec_weights   28.0  44.0
gas_molar_fracs     1.0   0.0

n_surf_species      2
surf_specs_names    CO*   O*
surf_specs_dent     1     1

snapshots           on event 10000
process_statistics  on event 100
species_numbers     on event 100
event_report        off

max_steps           10000
max_time            infinity

wall_time           3600

enable_stiffness_scaling
finish
"#;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_template(dir: &Path) {
        std::fs::write(dir.join(MECHANISM_FILE), fixtures::MECHANISM).unwrap();
        std::fs::write(dir.join(SIMULATION_FILE), fixtures::SIMULATION).unwrap();
        std::fs::write(dir.join("lattice_input.dat"), "lattice periodic_cell\nend_lattice\n")
            .unwrap();
    }

    #[test]
    fn test_load_and_write_deck() {
        let template = TempDir::new().unwrap();
        write_template(template.path());

        let deck = InputDeck::load(template.path()).unwrap();
        assert_eq!(deck.mechanism.channel_count(), 3);
        assert_eq!(deck.verbatim.len(), 1);
        assert_eq!(deck.initial_state, InitialState::Empty);

        let run_dir = template.path().join("run").join("1");
        deck.write(&run_dir).unwrap();
        assert!(run_dir.join(MECHANISM_FILE).is_file());
        assert!(run_dir.join(SIMULATION_FILE).is_file());
        assert!(!run_dir.join(STATE_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(run_dir.join("lattice_input.dat")).unwrap(),
            "lattice periodic_cell\nend_lattice\n"
        );

        let reread = InputDeck::load(&run_dir).unwrap();
        assert_eq!(reread.mechanism.network().names(), deck.mechanism.network().names());
        assert_eq!(reread.simulation.seed, deck.simulation.seed);
    }

    #[test]
    fn test_missing_mechanism_reported() {
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join(SIMULATION_FILE), fixtures::SIMULATION).unwrap();
        assert!(matches!(
            InputDeck::load(template.path()),
            Err(ModelError::MissingFile(_))
        ));
    }

    #[test]
    fn test_split_comment() {
        assert_eq!(split_comment("pre_expon 1.0 # note"), ("pre_expon 1.0 ", Some(" note")));
        assert_eq!(split_comment("sites 2"), ("sites 2", None));
    }
}
