use crate::{parse_field, read_file, thinning_spacing, OutputError, MAX_ROWS};
use std::path::Path;

pub const PROCSTAT_FILE: &str = "procstat_output.txt";

/// Cumulative event counts from `procstat_output.txt`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcstatOutput {
    /// Stride between kept records.
    pub spacing: usize,
    pub time: Vec<f64>,
    /// One row per kept record, one column per step direction.
    pub events: Vec<Vec<f64>>,
}

impl ProcstatOutput {
    pub(crate) fn truncate(&mut self, n: usize) {
        self.time.truncate(n);
        self.events.truncate(n);
    }
}

/// Parse `procstat_output.txt`.
///
/// After a header line the file holds three-line records: a configuration
/// line whose fourth field is the time, a line of waiting times and a line
/// whose first field is the overall count followed by per-step counts.
pub fn read_procstat(dir: &Path) -> Result<ProcstatOutput, OutputError> {
    let text = read_file(dir, PROCSTAT_FILE)?;
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l))
        .collect();

    let n_records = lines.len() / 3;
    let spacing = thinning_spacing(n_records);

    let mut time = Vec::with_capacity(n_records.min(MAX_ROWS));
    let mut events = Vec::with_capacity(n_records.min(MAX_ROWS));
    for record in lines.chunks_exact(3).step_by(spacing).take(MAX_ROWS) {
        let (header_line, header) = record[0];
        time.push(parse_field(PROCSTAT_FILE, header_line, header.split_whitespace().nth(3))?);

        let (counts_line, counts) = record[2];
        let row = counts
            .split_whitespace()
            .skip(1)
            .map(|t| parse_field(PROCSTAT_FILE, counts_line, Some(t)))
            .collect::<Result<Vec<_>, _>>()?;
        events.push(row);
    }

    Ok(ProcstatOutput {
        spacing,
        time,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::PROCSTAT;
    use std::fmt::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_procstat() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROCSTAT_FILE), PROCSTAT).unwrap();
        let out = read_procstat(dir.path()).unwrap();
        assert_eq!(out.spacing, 1);
        assert_eq!(out.time, vec![0.0, 1.0, 2.0]);
        assert_eq!(out.events[1], vec![20.0, 18.0, 12.0, 10.0]);
    }

    #[test]
    fn test_long_procstat_thinned() {
        let n = MAX_ROWS * 2 + 1;
        let mut text = String::from("Overall A_fwd A_rev\n");
        for i in 0..n {
            let _ = writeln!(text, "configuration {} {} {}.0", i + 1, i, i);
            text.push_str("  0.0 0.0\n");
            let _ = writeln!(text, "  {} {} 0", i, i);
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROCSTAT_FILE), text).unwrap();

        let out = read_procstat(dir.path()).unwrap();
        assert_eq!(out.spacing, 2);
        assert_eq!(out.time.len(), MAX_ROWS);
        assert_eq!(out.time[1], 2.0);
        assert_eq!(out.events[3], vec![6.0, 0.0]);
    }
}
