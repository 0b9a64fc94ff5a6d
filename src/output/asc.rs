//! ESRI ASCII grid writer
//!
//! ```text
//! NCOLS 3
//! NROWS 3
//! XLLCENTER 0
//! YLLCENTER 0
//! CELLSIZE 1
//! NODATA_VALUE -9999
//! 0.000000 1.500000 0.000000
//! ...
//! ```
//!
//! Rows run north→south, values west→east, six decimals per value.

use crate::grid::CoarseGrid;
use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write the grid header and values to any writer
pub fn write_asc_to<W: Write>(out: &mut W, grid: &CoarseGrid, values: &[f64], nodata: i64) -> Result<()> {
    if values.len() != grid.len() {
        anyhow::bail!(
            "Grid has {} cells but {} values were given",
            grid.len(),
            values.len()
        );
    }

    let bounds = grid.bounds();
    writeln!(out, "NCOLS {}", grid.cols())?;
    writeln!(out, "NROWS {}", grid.rows())?;
    writeln!(out, "XLLCENTER {}", bounds.min_x)?;
    writeln!(out, "YLLCENTER {}", bounds.min_y)?;
    writeln!(out, "CELLSIZE {}", grid.pixel_size())?;
    writeln!(out, "NODATA_VALUE {}", nodata)?;

    for row in values.chunks(grid.cols().max(1)) {
        let line: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }

    Ok(())
}

/// Write an ASCII grid file
pub fn write_asc(path: &Path, grid: &CoarseGrid, values: &[f64], nodata: i64) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create grid file: {}", path.display()))?;
    let mut out = BufWriter::new(file);

    write_asc_to(&mut out, grid, values, nodata)
        .with_context(|| format!("Failed to write grid file: {}", path.display()))?;
    out.flush()
        .with_context(|| format!("Failed to flush grid file: {}", path.display()))?;

    tracing::debug!(path = %path.display(), cells = values.len(), "Grid written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asc_layout() {
        let grid = CoarseGrid::from_extent(0.0, 0.0, 2.0, 1.0, 1.0).unwrap();
        assert_eq!((grid.rows(), grid.cols()), (2, 3));

        let mut out = Vec::new();
        write_asc_to(&mut out, &grid, &[1.0, 0.0, 2.5, 0.0, 0.125, 0.0], -9999).unwrap();
        let text = String::from_utf8(out).unwrap();

        let expected = "NCOLS 3\n\
                        NROWS 2\n\
                        XLLCENTER 0\n\
                        YLLCENTER 0\n\
                        CELLSIZE 1\n\
                        NODATA_VALUE -9999\n\
                        1.000000 0.000000 2.500000\n\
                        0.000000 0.125000 0.000000\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_asc_rejects_wrong_length() {
        let grid = CoarseGrid::from_extent(0.0, 0.0, 1.0, 1.0, 1.0).unwrap();
        let mut out = Vec::new();
        assert!(write_asc_to(&mut out, &grid, &[0.0; 3], -9999).is_err());
    }

    #[test]
    fn test_write_asc_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.asc");
        let grid = CoarseGrid::from_extent(-1.0, -1.0, 1.0, 1.0, 0.5).unwrap();

        write_asc(&path, &grid, &vec![0.0; grid.len()], -9999).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("NCOLS 5\nNROWS 5\nXLLCENTER -1\nYLLCENTER -1\nCELLSIZE 0.5\n"));
        assert_eq!(text.lines().count(), 6 + 5);
    }
}
