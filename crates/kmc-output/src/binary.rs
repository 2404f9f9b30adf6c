use crate::OutputError;
use std::path::Path;

/// Instantaneous propensities, one column per step direction.
pub const PROP_FILE: &str = "Prop_output.bin";
/// Integral propensities, one column per step direction.
pub const PROP_COUNTER_FILE: &str = "PropCounter_output.bin";
/// Likelihood-ratio sensitivity derivatives, one column per step direction.
pub const SENSITIVITY_FILE: &str = "SA_output.bin";

/// Read a little-endian `f64` matrix with `n_cols` columns.
///
/// Trailing values that do not fill a whole row are dropped.
pub fn read_f64_matrix(path: &Path, n_cols: usize) -> Result<Vec<Vec<f64>>, OutputError> {
    if !path.is_file() {
        return Err(OutputError::MissingFile(path.to_path_buf()));
    }
    if n_cols == 0 {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    let values: Vec<f64> = bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect();
    Ok(values.chunks_exact(n_cols).map(|row| row.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_row_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PROP_FILE);
        let bytes: Vec<u8> = [1.5f64, 2.5, 3.5, 4.5, 5.5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        std::fs::write(&path, bytes).unwrap();
        let rows = read_f64_matrix(&path, 2).unwrap();
        assert_eq!(rows, vec![vec![1.5, 2.5], vec![3.5, 4.5]]);
    }
}
