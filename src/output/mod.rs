//! Output writing
//!
//! Every run writes into its own timestamped directory:
//!
//! ```text
//! <output_dir>/<country>/<country>_<subset>_<pixel>_<iterations>_<unix ts>/
//!     <country>_output_<pixel>_<iterations>_mean_surf.asc
//!     <country>_output_<pixel>_<iterations>_mean_aid.asc
//!     <country>_output_<pixel>_<iterations>_std_aid.asc
//!     <country>_output_<pixel>_<iterations>_mean_count.asc
//!     <country>_output_<pixel>_<iterations>_std_count.asc
//!     <country>_output_<pixel>_<iterations>_error_surf.asc
//!     <country>_output_<pixel>_<iterations>_results.json
//!     <country>_output_<pixel>_<iterations>_results.txt
//! ```

pub mod asc;
pub mod json;
pub mod text;

use crate::config::RunConfig;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Grids written by a complete run, by file suffix
pub const GRID_SUFFIXES: [&str; 6] = [
    "mean_surf",
    "mean_aid",
    "std_aid",
    "mean_count",
    "std_count",
    "error_surf",
];

/// A run's output directory and file naming
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
    prefix: String,
}

impl RunDirectory {
    /// Directory path for a run started at `started`, without creating it
    pub fn for_run(config: &RunConfig, started: DateTime<Local>) -> Self {
        let path = config.output.dir.join(&config.country).join(format!(
            "{}_{}_{}_{}_{}",
            config.country,
            config.output.subset,
            config.grid.pixel_size,
            config.sampling.iterations,
            started.timestamp()
        ));
        let prefix = format!(
            "{}_output_{}_{}",
            config.country, config.grid.pixel_size, config.sampling.iterations
        );
        Self { path, prefix }
    }

    /// Create the directory (and parents)
    pub fn create(config: &RunConfig, started: DateTime<Local>) -> Result<Self> {
        let dir = Self::for_run(config, started);
        std::fs::create_dir_all(&dir.path)
            .with_context(|| format!("Failed to create output directory: {}", dir.path.display()))?;
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `<prefix>_<suffix>` inside the directory
    pub fn file(&self, suffix: &str) -> PathBuf {
        self.path.join(format!("{}_{}", self.prefix, suffix))
    }

    /// Path of a grid file (`suffix` without extension)
    pub fn grid_file(&self, suffix: &str) -> PathBuf {
        self.file(&format!("{}.asc", suffix))
    }
}
