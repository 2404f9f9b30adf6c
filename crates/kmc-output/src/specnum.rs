use crate::{parse_field, read_file, thinning_spacing, OutputError, MAX_ROWS};
use std::path::Path;

pub const SPECNUM_FILE: &str = "specnum_output.txt";

/// Species populations from `specnum_output.txt`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecnumOutput {
    /// Stride between kept rows.
    pub spacing: usize,
    pub events: Vec<f64>,
    pub time: Vec<f64>,
    pub temperature: Vec<f64>,
    pub energy: Vec<f64>,
    /// Surface species columns first, then gas species.
    pub species: Vec<Vec<f64>>,
}

impl SpecnumOutput {
    pub(crate) fn truncate(&mut self, n: usize) {
        self.events.truncate(n);
        self.time.truncate(n);
        self.temperature.truncate(n);
        self.energy.truncate(n);
        self.species.truncate(n);
    }
}

/// Parse `specnum_output.txt`: a header line, then rows of
/// `entry events time temperature energy species...`.
pub fn read_specnum(dir: &Path) -> Result<SpecnumOutput, OutputError> {
    let text = read_file(dir, SPECNUM_FILE)?;
    let rows: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l))
        .collect();

    let spacing = thinning_spacing(rows.len());
    let mut out = SpecnumOutput {
        spacing,
        ..Default::default()
    };

    for &(lineno, line) in rows.iter().step_by(spacing).take(MAX_ROWS) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let field = |i: usize| parse_field(SPECNUM_FILE, lineno, fields.get(i).copied());
        out.events.push(field(1)?);
        out.time.push(field(2)?);
        out.temperature.push(field(3)?);
        out.energy.push(field(4)?);
        out.species.push((5..fields.len()).map(field).collect::<Result<Vec<_>, _>>()?);
    }

    Ok(out)
}
