//! `mechanism_input.dat`: elementary steps and their variants.
//!
//! Each variant of each step is one reaction channel, named
//! `<step>_<variant>`. When any channel carries a scale-down factor the file
//! gets a header listing all factors in channel order:
//!
//! ```text
//! # Automated stiffness reconditioning employed
//! #
//! # SDF: 1.00000e+00 	2.00000e-02 	...
//! ```
//!
//! and the `pre_expon` line of every rescaled variant ends with a comment
//! naming its factor. Both are read back on load; the header wins when both
//! are present.

use super::{parse_f64, parse_u64, split_comment};
use crate::ModelError;
use kmc_common::{sci, ReactionChannel, ReactionNetwork};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// File name inside a run directory.
pub const MECHANISM_FILE: &str = "mechanism_input.dat";

const SDF_BANNER: &str = "# Automated stiffness reconditioning employed";
const RESCALE_NOTE: &str = "Pre-exponential has been rescaled by a factor of";

/// One variant of an elementary step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepVariant {
    pub name: String,
    pub site_types: Vec<String>,
    /// Pre-exponential as written to the file (already scaled).
    pub pre_expon: f64,
    pub pe_ratio: Option<f64>,
    pub prox_factor: Option<f64>,
    pub activ_eng: f64,
    /// Cumulative scale-down applied to `pre_expon`.
    pub scaledown: f64,
}

impl StepVariant {
    fn new(name: String) -> Self {
        StepVariant {
            name,
            site_types: Vec::new(),
            pre_expon: f64::NAN,
            pe_ratio: None,
            prox_factor: None,
            activ_eng: 0.0,
            scaledown: 1.0,
        }
    }
}

/// An elementary step with its lattice pattern and variants.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismStep {
    pub name: String,
    pub reversible: bool,
    pub sites: usize,
    pub neighboring: Option<Vec<String>>,
    pub gas_reacs_prods: Option<Vec<String>>,
    pub initial: Vec<String>,
    pub final_state: Vec<String>,
    pub variants: Vec<StepVariant>,
}

impl MechanismStep {
    /// Gas species and coefficients of the forward direction.
    pub fn gas_stoichiometry(&self) -> Vec<(String, f64)> {
        let Some(tokens) = &self.gas_reacs_prods else {
            return Vec::new();
        };
        tokens
            .chunks_exact(2)
            .filter_map(|pair| Some((pair[0].clone(), pair[1].parse().ok()?)))
            .collect()
    }
}

/// Parsed mechanism file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mechanism {
    pub steps: Vec<MechanismStep>,
}

impl Mechanism {
    /// Read and parse a mechanism file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.is_file() {
            return Err(ModelError::MissingFile(path.to_path_buf()));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Write the mechanism file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Number of reaction channels (variants over all steps).
    pub fn channel_count(&self) -> usize {
        self.steps.iter().map(|s| s.variants.len()).sum()
    }

    fn variants(&self) -> impl Iterator<Item = &StepVariant> {
        self.steps.iter().flat_map(|s| s.variants.iter())
    }

    fn variants_mut(&mut self) -> impl Iterator<Item = &mut StepVariant> {
        self.steps.iter_mut().flat_map(|s| s.variants.iter_mut())
    }

    /// Cumulative scale-down factors in channel order.
    pub fn scaledown_factors(&self) -> Vec<f64> {
        self.variants().map(|v| v.scaledown).collect()
    }

    /// Whether any channel has been rescaled.
    pub fn is_rescaled(&self) -> bool {
        self.variants().any(|v| v.scaledown != 1.0)
    }

    /// Flattened reaction channels.
    pub fn network(&self) -> ReactionNetwork {
        let channels = self
            .steps
            .iter()
            .flat_map(|step| {
                step.variants.iter().map(move |v| ReactionChannel {
                    name: format!("{}_{}", step.name, v.name),
                    reversible: step.reversible,
                    site_count: step.sites,
                    pre_expon: v.pre_expon,
                    pe_ratio: v.pe_ratio,
                    activation_energy: v.activ_eng,
                    scaledown: v.scaledown,
                    gas_stoichiometry: step.gas_stoichiometry(),
                })
            })
            .collect();
        ReactionNetwork { channels }
    }

    /// Multiply each channel's pre-exponential and cumulative factor by
    /// `delta[i]`.
    pub fn apply_scaledown(&mut self, delta: &[f64]) -> Result<(), ModelError> {
        let expected = self.channel_count();
        if delta.len() != expected {
            return Err(ModelError::ScaledownLength {
                expected,
                found: delta.len(),
            });
        }
        for (variant, d) in self.variants_mut().zip(delta) {
            variant.pre_expon *= d;
            variant.scaledown *= d;
        }
        Ok(())
    }

    /// Parse mechanism text.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut steps = Vec::new();
        let mut header_sdf: Option<Vec<f64>> = None;
        let mut current: Option<MechanismStep> = None;
        let mut variant: Option<StepVariant> = None;

        let mut i = 0;
        while i < lines.len() {
            let lineno = i + 1;
            let trimmed = lines[i].trim();
            i += 1;
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix('#') {
                if let Some(values) = rest.trim_start().strip_prefix("SDF:") {
                    let parsed = values
                        .split_whitespace()
                        .map(|t| parse_f64(MECHANISM_FILE, lineno, Some(t)))
                        .collect::<Result<Vec<_>, _>>()?;
                    header_sdf = Some(parsed);
                }
                continue;
            }

            let (code, comment) = split_comment(trimmed);
            let mut tokens = code.split_whitespace();
            let Some(keyword) = tokens.next() else {
                continue;
            };

            if keyword == "end_variant" {
                let done = variant
                    .take()
                    .ok_or_else(|| ModelError::parse(MECHANISM_FILE, lineno, "end_variant outside a variant"))?;
                if done.pre_expon.is_nan() {
                    return Err(ModelError::parse(
                        MECHANISM_FILE,
                        lineno,
                        format!("variant '{}' has no pre_expon", done.name),
                    ));
                }
                if let Some(step) = current.as_mut() {
                    step.variants.push(done);
                }
                continue;
            }

            if let Some(var) = variant.as_mut() {
                match keyword {
                    "site_types" => var.site_types = tokens.map(String::from).collect(),
                    "pre_expon" => {
                        var.pre_expon = parse_f64(MECHANISM_FILE, lineno, tokens.next())?;
                        if let Some(factor) = comment.and_then(parse_rescale_note) {
                            var.scaledown = factor;
                        }
                    }
                    "pe_ratio" => var.pe_ratio = Some(parse_f64(MECHANISM_FILE, lineno, tokens.next())?),
                    "prox_factor" => {
                        var.prox_factor = Some(parse_f64(MECHANISM_FILE, lineno, tokens.next())?)
                    }
                    "activ_eng" => var.activ_eng = parse_f64(MECHANISM_FILE, lineno, tokens.next())?,
                    other => warn!(line = lineno, keyword = other, "Unparsed line in mechanism variant"),
                }
                continue;
            }

            match keyword {
                "mechanism" | "end_mechanism" => {}
                "reversible_step" | "step" => {
                    if current.is_some() {
                        return Err(ModelError::parse(MECHANISM_FILE, lineno, "step opened inside another step"));
                    }
                    let name = tokens
                        .next()
                        .ok_or_else(|| ModelError::parse(MECHANISM_FILE, lineno, "step without a name"))?;
                    current = Some(MechanismStep {
                        name: name.to_string(),
                        reversible: keyword == "reversible_step",
                        sites: 0,
                        neighboring: None,
                        gas_reacs_prods: None,
                        initial: Vec::new(),
                        final_state: Vec::new(),
                        variants: Vec::new(),
                    });
                }
                "end_reversible_step" | "end_step" => {
                    let step = current
                        .take()
                        .ok_or_else(|| ModelError::parse(MECHANISM_FILE, lineno, "step end without a step"))?;
                    if step.variants.is_empty() {
                        return Err(ModelError::parse(
                            MECHANISM_FILE,
                            lineno,
                            format!("step '{}' has no variants", step.name),
                        ));
                    }
                    steps.push(step);
                }
                _ => {
                    let Some(step) = current.as_mut() else {
                        warn!(line = lineno, keyword, "Unparsed line in mechanism input");
                        continue;
                    };
                    match keyword {
                        "sites" => step.sites = parse_u64(MECHANISM_FILE, lineno, tokens.next())? as usize,
                        "neighboring" => step.neighboring = Some(tokens.map(String::from).collect()),
                        "gas_reacs_prods" => {
                            let pairs: Vec<String> = tokens.map(String::from).collect();
                            if pairs.len() % 2 != 0 {
                                return Err(ModelError::parse(
                                    MECHANISM_FILE,
                                    lineno,
                                    "gas_reacs_prods needs species/coefficient pairs",
                                ));
                            }
                            for coefficient in pairs.iter().skip(1).step_by(2) {
                                parse_f64(MECHANISM_FILE, lineno, Some(coefficient))?;
                            }
                            step.gas_reacs_prods = Some(pairs);
                        }
                        "initial" | "final" => {
                            if step.sites == 0 || i + step.sites > lines.len() {
                                return Err(ModelError::parse(
                                    MECHANISM_FILE,
                                    lineno,
                                    format!("'{keyword}' needs {} pattern lines", step.sites),
                                ));
                            }
                            let pattern: Vec<String> =
                                lines[i..i + step.sites].iter().map(|l| l.trim().to_string()).collect();
                            i += step.sites;
                            if keyword == "initial" {
                                step.initial = pattern;
                            } else {
                                step.final_state = pattern;
                            }
                        }
                        "variant" => {
                            let name = tokens
                                .next()
                                .ok_or_else(|| ModelError::parse(MECHANISM_FILE, lineno, "variant without a name"))?;
                            variant = Some(StepVariant::new(name.to_string()));
                        }
                        other => warn!(line = lineno, keyword = other, "Unparsed line in mechanism step"),
                    }
                }
            }
        }

        if let Some(step) = current {
            return Err(ModelError::parse(
                MECHANISM_FILE,
                lines.len(),
                format!("step '{}' is not closed", step.name),
            ));
        }

        let mut mechanism = Mechanism { steps };
        if let Some(sdf) = header_sdf {
            let expected = mechanism.channel_count();
            if sdf.len() != expected {
                return Err(ModelError::ScaledownLength {
                    expected,
                    found: sdf.len(),
                });
            }
            for (variant, factor) in mechanism.variants_mut().zip(sdf) {
                variant.scaledown = factor;
            }
        }
        Ok(mechanism)
    }
}

fn parse_rescale_note(comment: &str) -> Option<f64> {
    let (_, value) = comment.split_once(RESCALE_NOTE)?;
    value.split_whitespace().next()?.parse().ok()
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "#".repeat(80);
        writeln!(f, "mechanism\n")?;

        if self.is_rescaled() {
            writeln!(f, "{SDF_BANNER}")?;
            writeln!(f, "# ")?;
            write!(f, "# SDF: ")?;
            for factor in self.scaledown_factors() {
                write!(f, "{} \t", sci(factor, 5, false))?;
            }
            writeln!(f, "\n")?;
        }

        for step in &self.steps {
            writeln!(f, "{rule}\n")?;
            let (open, close) = if step.reversible {
                ("reversible_step", "end_reversible_step")
            } else {
                ("step", "end_step")
            };
            writeln!(f, "{open} {}", step.name)?;
            writeln!(f, "  sites {}", step.sites)?;
            if let Some(neighboring) = &step.neighboring {
                writeln!(f, "  neighboring {}", neighboring.join(" "))?;
            }
            if let Some(gas) = &step.gas_reacs_prods {
                writeln!(f, "  gas_reacs_prods {}", gas.join(" "))?;
            }
            writeln!(f, "  initial")?;
            for line in &step.initial {
                writeln!(f, "    {line}")?;
            }
            writeln!(f, "  final")?;
            for line in &step.final_state {
                writeln!(f, "    {line}")?;
            }
            writeln!(f)?;

            for v in &step.variants {
                writeln!(f, "  variant {}", v.name)?;
                writeln!(f, "    {:25}{}", "site_types", v.site_types.join(" "))?;
                write!(f, "    {:25}{}", "pre_expon", sci(v.pre_expon, 5, false))?;
                if v.scaledown != 1.0 {
                    write!(f, "    # {RESCALE_NOTE} {}", sci(v.scaledown, 5, false))?;
                }
                writeln!(f)?;
                if let Some(pe_ratio) = v.pe_ratio {
                    writeln!(f, "    {:25}{}", "pe_ratio", sci(pe_ratio, 5, false))?;
                }
                if let Some(prox) = v.prox_factor {
                    writeln!(f, "    {:25}{}", "prox_factor", prox)?;
                }
                writeln!(f, "    {:25}{}", "activ_eng", v.activ_eng)?;
                writeln!(f, "  end_variant\n")?;
            }
            writeln!(f, "{close}\n")?;
        }

        writeln!(f, "{rule}\n")?;
        writeln!(f, "end_mechanism")
    }
}
