//! `simulation_input.dat`: conditions, species and reporting settings.

use super::{parse_f64, parse_u64, split_comment};
use crate::ModelError;
use kmc_common::SpeciesTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// File name inside a run directory.
pub const SIMULATION_FILE: &str = "simulation_input.dat";

/// When the simulator writes a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SamplingMode {
    Off,
    /// Every N events.
    OnEvent(u64),
    /// Every T units of simulated time.
    OnTime(f64),
}

impl SamplingMode {
    fn parse(lineno: usize, tokens: &[&str]) -> Result<Self, ModelError> {
        match tokens {
            ["off", ..] => Ok(SamplingMode::Off),
            ["on", "event", n, ..] => Ok(SamplingMode::OnEvent(parse_u64(SIMULATION_FILE, lineno, Some(*n))?)),
            ["on", "time", t, ..] => Ok(SamplingMode::OnTime(parse_f64(SIMULATION_FILE, lineno, Some(*t))?)),
            _ => Err(ModelError::parse(
                SIMULATION_FILE,
                lineno,
                format!("unsupported sampling '{}'", tokens.join(" ")),
            )),
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingMode::Off => write!(f, "off"),
            SamplingMode::OnEvent(n) => write!(f, "on event {n}"),
            SamplingMode::OnTime(t) => write!(f, "on time {t:?}"),
        }
    }
}

/// Constant temperature or a linear ramp (temperature-programmed mode).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temperature {
    Constant(f64),
    Ramp { start: f64, rate: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GasSpecies {
    pub name: String,
    pub energy: f64,
    pub molecular_weight: f64,
    pub molar_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSpecies {
    pub name: String,
    pub dentate: u32,
}

/// Parsed simulation settings.
///
/// Lines with keywords not modelled here are kept in `extra` and written back
/// before `finish`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub seed: Option<u64>,
    pub temperature: Temperature,
    pub pressure: f64,
    pub gas: Vec<GasSpecies>,
    pub surface: Vec<SurfaceSpecies>,
    pub snapshots: SamplingMode,
    pub process_statistics: SamplingMode,
    pub species_numbers: SamplingMode,
    pub event_report: String,
    /// `None` means infinity.
    pub max_steps: Option<u64>,
    /// `None` means infinity.
    pub max_time: Option<f64>,
    pub wall_time: Option<u64>,
    pub restart: bool,
    pub extra: Vec<String>,
}

impl SimulationSettings {
    /// Read and parse a simulation settings file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.is_file() {
            return Err(ModelError::MissingFile(path.to_path_buf()));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Write the simulation settings file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Surface species names in column order.
    pub fn surface_names(&self) -> Vec<String> {
        self.surface.iter().map(|s| s.name.clone()).collect()
    }

    /// Species column layout of the species-number output.
    pub fn species_table(&self) -> SpeciesTable {
        SpeciesTable::new(
            self.surface_names(),
            self.gas.iter().map(|g| g.name.clone()).collect(),
        )
    }

    /// Parse settings text.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let mut seed = None;
        let mut temperature = None;
        let mut pressure = None;
        let mut gas_names: Vec<String> = Vec::new();
        let mut gas_energies = Vec::new();
        let mut gas_weights = Vec::new();
        let mut gas_fractions = Vec::new();
        let mut surf_names: Vec<String> = Vec::new();
        let mut surf_dent = Vec::new();
        let mut snapshots = SamplingMode::Off;
        let mut process_statistics = SamplingMode::Off;
        let mut species_numbers = SamplingMode::Off;
        let mut event_report = "off".to_string();
        let mut max_steps = None;
        let mut max_time = None;
        let mut wall_time = None;
        let mut restart = true;
        let mut extra = Vec::new();

        let floats = |lineno: usize, tokens: &[&str]| -> Result<Vec<f64>, ModelError> {
            tokens
                .iter()
                .map(|t| parse_f64(SIMULATION_FILE, lineno, Some(*t)))
                .collect()
        };

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let (code, _) = split_comment(raw);
            let tokens: Vec<&str> = code.split_whitespace().collect();
            let Some((&keyword, rest)) = tokens.split_first() else {
                continue;
            };

            match keyword {
                "random_seed" => seed = Some(parse_u64(SIMULATION_FILE, lineno, rest.first().copied())?),
                "temperature" => {
                    temperature = Some(if rest.first() == Some(&"ramp") {
                        Temperature::Ramp {
                            start: parse_f64(SIMULATION_FILE, lineno, rest.get(1).copied())?,
                            rate: parse_f64(SIMULATION_FILE, lineno, rest.get(2).copied())?,
                        }
                    } else {
                        Temperature::Constant(parse_f64(SIMULATION_FILE, lineno, rest.first().copied())?)
                    })
                }
                "pressure" => pressure = Some(parse_f64(SIMULATION_FILE, lineno, rest.first().copied())?),
                "gas_specs_names" => gas_names = rest.iter().map(|s| s.to_string()).collect(),
                "gas_energies" => gas_energies = floats(lineno, rest)?,
                "gas_molec_weights" => gas_weights = floats(lineno, rest)?,
                "gas_molar_fracs" => gas_fractions = floats(lineno, rest)?,
                "surf_specs_names" => surf_names = rest.iter().map(|s| s.to_string()).collect(),
                "surf_specs_dent" => {
                    surf_dent = rest
                        .iter()
                        .map(|t| parse_u64(SIMULATION_FILE, lineno, Some(*t)).map(|d| d as u32))
                        .collect::<Result<Vec<_>, _>>()?
                }
                "snapshots" => snapshots = SamplingMode::parse(lineno, rest)?,
                "process_statistics" => process_statistics = SamplingMode::parse(lineno, rest)?,
                "species_numbers" => species_numbers = SamplingMode::parse(lineno, rest)?,
                "event_report" => event_report = rest.join(" "),
                "max_steps" => max_steps = parse_limit(lineno, rest, |t| parse_u64(SIMULATION_FILE, lineno, t))?,
                "max_time" => max_time = parse_limit(lineno, rest, |t| parse_f64(SIMULATION_FILE, lineno, t))?,
                "wall_time" => wall_time = parse_limit(lineno, rest, |t| parse_u64(SIMULATION_FILE, lineno, t))?,
                "no_restart" => restart = false,
                "finish" | "n_gas_species" | "n_surf_species" => {}
                _ => extra.push(raw.trim().to_string()),
            }
        }

        let n_gas = gas_names.len();
        for (name, values) in [
            ("gas_energies", &gas_energies),
            ("gas_molec_weights", &gas_weights),
            ("gas_molar_fracs", &gas_fractions),
        ] {
            if values.len() != n_gas {
                return Err(ModelError::parse(
                    SIMULATION_FILE,
                    0,
                    format!("{name} has {} values for {n_gas} gas species", values.len()),
                ));
            }
        }
        if surf_dent.len() != surf_names.len() {
            return Err(ModelError::parse(
                SIMULATION_FILE,
                0,
                format!(
                    "surf_specs_dent has {} values for {} surface species",
                    surf_dent.len(),
                    surf_names.len()
                ),
            ));
        }

        let gas = gas_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| GasSpecies {
                name,
                energy: gas_energies[i],
                molecular_weight: gas_weights[i],
                molar_fraction: gas_fractions[i],
            })
            .collect();
        let surface = surf_names
            .into_iter()
            .zip(surf_dent)
            .map(|(name, dentate)| SurfaceSpecies { name, dentate })
            .collect();

        Ok(SimulationSettings {
            seed,
            temperature: temperature
                .ok_or_else(|| ModelError::parse(SIMULATION_FILE, 0, "missing temperature"))?,
            pressure: pressure.ok_or_else(|| ModelError::parse(SIMULATION_FILE, 0, "missing pressure"))?,
            gas,
            surface,
            snapshots,
            process_statistics,
            species_numbers,
            event_report,
            max_steps,
            max_time,
            wall_time,
            restart,
            extra,
        })
    }
}

fn parse_limit<T>(
    lineno: usize,
    rest: &[&str],
    parse: impl Fn(Option<&str>) -> Result<T, ModelError>,
) -> Result<Option<T>, ModelError> {
    match rest.first() {
        Some(&"infinity") => Ok(None),
        Some(&token) => parse(Some(token)).map(Some),
        None => Err(ModelError::parse(SIMULATION_FILE, lineno, "missing limit value")),
    }
}

fn write_row<T: fmt::Display>(f: &mut fmt::Formatter<'_>, key: &str, values: impl Iterator<Item = T>) -> fmt::Result {
    write!(f, "{key:20}")?;
    for v in values {
        write!(f, " {:14}", v.to_string())?;
    }
    writeln!(f)
}

impl fmt::Display for SimulationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#KMC simulation specification\n")?;
        if let Some(seed) = self.seed {
            writeln!(f, "{:20}{}\n", "random_seed", seed)?;
        }

        match self.temperature {
            Temperature::Constant(t) => writeln!(f, "{:20}{:?}", "temperature", t)?,
            Temperature::Ramp { start, rate } => writeln!(f, "{:20}ramp {:?} {:?}", "temperature", start, rate)?,
        }
        writeln!(f, "{:20}{:?}\n", "pressure", self.pressure)?;

        writeln!(f, "{:20}{}", "n_gas_species", self.gas.len())?;
        write_row(f, "gas_specs_names", self.gas.iter().map(|g| g.name.clone()))?;
        write_row(f, "gas_energies", self.gas.iter().map(|g| format!("{:?}", g.energy)))?;
        write_row(f, "gas_molec_weights", self.gas.iter().map(|g| format!("{:?}", g.molecular_weight)))?;
        write_row(f, "gas_molar_fracs", self.gas.iter().map(|g| format!("{:?}", g.molar_fraction)))?;
        writeln!(f)?;

        writeln!(f, "{:20}{}", "n_surf_species", self.surface.len())?;
        write_row(f, "surf_specs_names", self.surface.iter().map(|s| s.name.clone()))?;
        write_row(f, "surf_specs_dent", self.surface.iter().map(|s| s.dentate))?;
        writeln!(f)?;

        writeln!(f, "{:20}{}", "snapshots", self.snapshots)?;
        writeln!(f, "{:20}{}", "process_statistics", self.process_statistics)?;
        writeln!(f, "{:20}{}", "species_numbers", self.species_numbers)?;
        writeln!(f, "{:20}{}\n", "event_report", self.event_report)?;

        match self.max_steps {
            Some(n) => writeln!(f, "{:20}{}", "max_steps", n)?,
            None => writeln!(f, "{:20}infinity", "max_steps")?,
        }
        match self.max_time {
            Some(t) => writeln!(f, "{:20}{:?}", "max_time", t)?,
            None => writeln!(f, "{:20}infinity", "max_time")?,
        }
        if let Some(wall) = self.wall_time {
            writeln!(f, "\n{:20}{}", "wall_time", wall)?;
        }
        writeln!(f)?;

        for line in &self.extra {
            writeln!(f, "{line}")?;
        }
        if !self.restart {
            writeln!(f, "no_restart")?;
        }
        writeln!(f, "finish")
    }
}
