use crate::{parse_field, read_file, OutputError};
use kmc_common::Performance;
use std::path::Path;

pub const GENERAL_FILE: &str = "general_output.txt";

const COMPLETION_MARKER: &str = "Normal termination";

/// Performance figures and step names from `general_output.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralOutput {
    pub performance: Performance,
    /// One name per step direction, in procstat column order.
    pub step_names: Vec<String>,
}

/// Whether the run in `dir` finished normally.
pub fn check_complete(dir: &Path) -> bool {
    std::fs::read_to_string(dir.join(GENERAL_FILE))
        .map(|text| text.contains(COMPLETION_MARKER))
        .unwrap_or(false)
}

/// Parse `general_output.txt`.
///
/// The simulator reports time and event count repeatedly; the last
/// occurrence wins.
pub fn read_general(dir: &Path) -> Result<GeneralOutput, OutputError> {
    let text = read_file(dir, GENERAL_FILE)?;
    let lines: Vec<&str> = text.lines().collect();

    let mut performance = Performance::default();
    let mut n_steps = 0usize;
    let mut network_start = None;

    for (idx, line) in lines.iter().enumerate() {
        let lineno = idx + 1;
        let value = || line.split_once(':').map(|(_, v)| v.trim());
        if line.contains("Number of elementary steps:") {
            n_steps = parse_field(GENERAL_FILE, lineno, value())? as usize;
        } else if line.contains("Current KMC time:") {
            performance.t_final = parse_field(GENERAL_FILE, lineno, value())?;
        } else if line.contains("Events occurred:") {
            performance.events_occurred = parse_field(GENERAL_FILE, lineno, value())?;
        } else if line.contains("Elapsed CPU time:") {
            let first = value().and_then(|v| v.split_whitespace().next());
            performance.cpu_time = parse_field(GENERAL_FILE, lineno, first)?;
        } else if line.contains("Reaction network:") {
            network_start = Some(idx + 2);
        }
    }

    let mut step_names = Vec::with_capacity(n_steps);
    if n_steps > 0 {
        let start = network_start
            .ok_or_else(|| OutputError::parse(GENERAL_FILE, lines.len(), "missing reaction network"))?;
        for idx in start..start + n_steps {
            let line = lines
                .get(idx)
                .ok_or_else(|| OutputError::parse(GENERAL_FILE, idx + 1, "reaction network ends early"))?;
            step_names.push(step_name(line).ok_or_else(|| {
                OutputError::parse(GENERAL_FILE, idx + 1, "cannot read step name")
            })?);
        }
    }

    Ok(GeneralOutput {
        performance,
        step_names,
    })
}

/// `"  1. CO_ads_fwd_top:  A(Tini) = ..."` gives `CO_ads_fwd_top`.
fn step_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    let mut token = tokens.next()?;
    if token.ends_with('.') && token[..token.len() - 1].chars().all(|c| c.is_ascii_digit()) {
        token = tokens.next()?;
    }
    Some(token.trim_end_matches(':').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::GENERAL;
    use tempfile::TempDir;

    #[test]
    fn test_read_general() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(GENERAL_FILE), GENERAL).unwrap();
        let out = read_general(dir.path()).unwrap();
        assert_eq!(out.performance.t_final, 2.0);
        assert_eq!(out.performance.events_occurred, 120.0);
        assert_eq!(out.performance.cpu_time, 0.8125);
        assert_eq!(
            out.step_names,
            vec![
                "CO_adsorption_fwd_top",
                "CO_adsorption_rev_top",
                "O2_adsorption_fwd_bridge",
                "O2_adsorption_rev_bridge"
            ]
        );
    }

    #[test]
    fn test_check_complete() {
        let dir = TempDir::new().unwrap();
        assert!(!check_complete(dir.path()));
        std::fs::write(dir.path().join(GENERAL_FILE), "Simulation stopped\n").unwrap();
        assert!(!check_complete(dir.path()));
        std::fs::write(dir.path().join(GENERAL_FILE), GENERAL).unwrap();
        assert!(check_complete(dir.path()));
    }

    #[test]
    fn test_step_name_without_index() {
        assert_eq!(step_name("A_fwd: Reaction: x -> y").as_deref(), Some("A_fwd"));
        assert_eq!(step_name("   12. B_rev:  stuff").as_deref(), Some("B_rev"));
    }
}
