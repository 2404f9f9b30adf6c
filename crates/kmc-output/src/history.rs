use crate::{parse_field, OutputError};
use kmc_common::{LatticeSnapshot, SiteOccupancy};
use std::path::Path;

pub const HISTORY_FILE: &str = "history_output.txt";

/// Read lattice snapshots from `history_output.txt`.
///
/// Each snapshot starts with a `configuration` line whose fourth field is the
/// time and continues with one `site entity species dentate` row per site. A
/// run without snapshots yields an empty list.
pub fn read_history(dir: &Path) -> Result<Vec<LatticeSnapshot>, OutputError> {
    let path = dir.join(HISTORY_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)?;

    let mut snapshots: Vec<LatticeSnapshot> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&"configuration") {
            snapshots.push(LatticeSnapshot {
                time: parse_field(HISTORY_FILE, lineno, fields.get(3).copied())?,
                sites: Vec::new(),
            });
            continue;
        }
        let Some(current) = snapshots.last_mut() else {
            continue;
        };
        if fields.len() != 4 {
            continue;
        }
        let mut values = [0usize; 4];
        for (slot, token) in values.iter_mut().zip(&fields) {
            *slot = token
                .parse()
                .map_err(|_| OutputError::parse(HISTORY_FILE, lineno, format!("invalid site field '{token}'")))?;
        }
        current.sites.push(SiteOccupancy {
            site: values[0],
            entity: values[1],
            species: values[2],
            dentate: values[3],
        });
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::HISTORY;
    use tempfile::TempDir;

    #[test]
    fn test_read_history() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(HISTORY_FILE), HISTORY).unwrap();
        let snaps = read_history(dir.path()).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].time, 0.0);
        assert_eq!(snaps[1].time, 2.0);
        assert_eq!(snaps[1].sites.len(), 2);
        assert_eq!(
            snaps[1].sites[1],
            SiteOccupancy { site: 2, entity: 2, species: 2, dentate: 1 }
        );
    }

    #[test]
    fn test_missing_history_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_history(dir.path()).unwrap().is_empty());
    }
}
