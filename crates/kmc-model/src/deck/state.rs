//! `state_input.dat`: the initial lattice occupation.

use crate::ModelError;
use kmc_common::{LatticeSnapshot, TrajectoryError};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// File name inside a run directory.
pub const STATE_FILE: &str = "state_input.dat";

/// Where the initial lattice state comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialState {
    /// No state file; the simulator starts from an empty lattice.
    Empty,
    /// Lines copied from the template.
    Verbatim(Vec<String>),
    /// Continue from a lattice snapshot of an earlier run.
    Snapshot(LatticeSnapshot),
}

impl InitialState {
    /// Read a state file if it exists.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.is_file() {
            return Ok(InitialState::Empty);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(InitialState::Verbatim(text.lines().map(String::from).collect()))
    }

    /// Write the state file. Nothing is written for an empty state or a
    /// snapshot without adsorbates.
    pub fn save(&self, path: &Path, surface_species: &[String]) -> Result<(), ModelError> {
        let text = match self {
            InitialState::Empty => return Ok(()),
            InitialState::Verbatim(lines) => {
                let mut text = lines.join("\n");
                text.push('\n');
                text
            }
            InitialState::Snapshot(snapshot) => match render_snapshot(snapshot, surface_species)? {
                Some(text) => text,
                None => return Ok(()),
            },
        };
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// One `seed_on_sites` line per adsorbate entity, sites listed by dentate.
fn render_snapshot(
    snapshot: &LatticeSnapshot,
    surface_species: &[String],
) -> Result<Option<String>, TrajectoryError> {
    let mut entities: BTreeMap<usize, (usize, Vec<(usize, usize)>)> = BTreeMap::new();
    for occ in snapshot.sites.iter().filter(|o| o.species != 0) {
        let entry = entities.entry(occ.entity).or_insert((occ.species, Vec::new()));
        entry.0 = occ.species;
        entry.1.push((occ.dentate, occ.site));
    }
    if entities.is_empty() {
        return Ok(None);
    }

    let mut text = String::from("initial_state\n");
    for (species, mut sites) in entities.into_values() {
        let name = surface_species
            .get(species - 1)
            .ok_or_else(|| TrajectoryError::UnknownSpecies(format!("surface species #{species}")))?;
        sites.sort_unstable();
        let _ = write!(text, "  seed_on_sites  {name:10}");
        for (_, site) in sites {
            let _ = write!(text, "{site}  ");
        }
        text.push('\n');
    }
    text.push_str("end_initial_state\n");
    Ok(Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmc_common::SiteOccupancy;
    use tempfile::TempDir;

    fn occ(site: usize, entity: usize, species: usize, dentate: usize) -> SiteOccupancy {
        SiteOccupancy { site, entity, species, dentate }
    }

    #[test]
    fn test_snapshot_rendered_per_entity() {
        let snapshot = LatticeSnapshot {
            time: 2.0,
            sites: vec![
                occ(1, 0, 0, 0),
                occ(2, 5, 2, 2),
                occ(3, 5, 2, 1),
                occ(4, 3, 1, 1),
            ],
        };
        let species = vec!["CO*".to_string(), "O2*".to_string()];
        let text = render_snapshot(&snapshot, &species).unwrap().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "initial_state");
        assert_eq!(lines[1].split_whitespace().collect::<Vec<_>>(), vec!["seed_on_sites", "CO*", "4"]);
        assert_eq!(
            lines[2].split_whitespace().collect::<Vec<_>>(),
            vec!["seed_on_sites", "O2*", "3", "2"]
        );
        assert_eq!(lines[3], "end_initial_state");
    }

    #[test]
    fn test_empty_snapshot_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE);
        let state = InitialState::Snapshot(LatticeSnapshot {
            time: 0.0,
            sites: vec![occ(1, 0, 0, 0)],
        });
        state.save(&path, &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_unknown_species_index() {
        let snapshot = LatticeSnapshot {
            time: 0.0,
            sites: vec![occ(1, 1, 3, 1)],
        };
        assert!(matches!(
            render_snapshot(&snapshot, &["A*".to_string()]),
            Err(TrajectoryError::UnknownSpecies(_))
        ));
    }

    #[test]
    fn test_verbatim_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(&path, "initial_state\n  seed_on_sites CO* 1\nend_initial_state\n").unwrap();
        let state = InitialState::load(&path).unwrap();
        let out = dir.path().join("copy.dat");
        state.save(&out, &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            std::fs::read_to_string(&path).unwrap()
        );
    }
}
