//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! A [`RunConfig`] is the complete description of a run. The coordinator sends
//! it (seed resolved) to every node, so every process performs the same setup.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::distributed::coordinator::DispatchSettings;
use crate::geometry::lookup::PrecisionLookup;
use crate::input::InputFields;
use crate::raster::DEFAULT_FINE_SUBDIVISIONS;
use crate::sampling::DEFAULT_MAX_SAMPLE_ATTEMPTS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Country name (directory name under `countries/`)
    #[serde(default)]
    pub country: String,
    /// Country abbreviation used in boundary file names
    #[serde(default)]
    pub abbr: String,
    #[serde(default)]
    pub inputs: InputConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Precision code table
    #[serde(default)]
    pub lookup: PrecisionLookup,
}

/// Input locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Directory holding `projects` and `locations` tables
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// GeoJSON boundary files, index = administrative level
    #[serde(default)]
    pub boundary_paths: Vec<PathBuf>,
    /// Table column names
    #[serde(default)]
    pub fields: InputFields,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            boundary_paths: Vec::new(),
            fields: InputFields::default(),
        }
    }
}

impl InputConfig {
    /// Standard layout under a base directory
    ///
    /// ```text
    /// <base>/countries/<country>/data/{projects,locations}.{tsv,csv}
    /// <base>/countries/<country>/boundaries/<abbr>_adm<N>.geojson
    /// ```
    ///
    /// Boundary levels `0..=max_level` are listed.
    pub fn for_country(base: &Path, country: &str, abbr: &str, max_level: usize) -> Self {
        let root = base.join("countries").join(country);
        let boundary_paths = (0..=max_level)
            .map(|level| {
                root.join("boundaries")
                    .join(format!("{}_adm{}.geojson", abbr, level))
            })
            .collect();

        Self {
            data_dir: root.join("data"),
            boundary_paths,
            fields: InputFields::default(),
        }
    }
}

/// Coarse and fine grid resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Output cell size in coordinate units (`1 / pixel_size` must be integral)
    #[serde(default)]
    pub pixel_size: f64,
    /// Fine grid cells per coarse cell edge for the mean surface
    #[serde(default = "default_fine_subdivisions")]
    pub fine_subdivisions: u32,
}

fn default_fine_subdivisions() -> u32 {
    DEFAULT_FINE_SUBDIVISIONS
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            pixel_size: 0.0,
            fine_subdivisions: default_fine_subdivisions(),
        }
    }
}

/// Monte Carlo pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub iterations: u32,
    /// Run seed; drawn from entropy when absent
    pub seed: Option<u64>,
    /// Rejection sampling bound per location per iteration
    #[serde(default = "default_max_sample_attempts")]
    pub max_sample_attempts: u32,
}

fn default_max_sample_attempts() -> u32 {
    DEFAULT_MAX_SAMPLE_ATTEMPTS
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            iterations: 0,
            seed: None,
            max_sample_attempts: default_max_sample_attempts(),
        }
    }
}

/// Worker pool and dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Local worker threads (standalone mode)
    #[serde(default = "default_workers")]
    pub count: usize,
    /// Seconds before a dispatched task is handed to another worker
    pub task_timeout_secs: Option<u64>,
    /// Redispatches allowed per task after timeouts
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_max_task_retries() -> u32 {
    3
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_workers(),
            task_timeout_secs: None,
            max_task_retries: default_max_task_retries(),
        }
    }
}

/// Output directory and grid file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root output directory
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// NODATA_VALUE written to grid headers
    #[serde(default = "default_nodata")]
    pub nodata: i64,
    /// Subset label used in the run directory name
    #[serde(default = "default_subset")]
    pub subset: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_nodata() -> i64 {
    -9999
}

fn default_subset() -> String {
    "all".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            nodata: default_nodata(),
            subset: default_subset(),
        }
    }
}

impl RunConfig {
    /// Configuration with defaults for everything but the four run parameters
    pub fn new(country: impl Into<String>, abbr: impl Into<String>, pixel_size: f64, iterations: u32) -> Self {
        Self {
            country: country.into(),
            abbr: abbr.into(),
            inputs: InputConfig::default(),
            grid: GridConfig {
                pixel_size,
                ..Default::default()
            },
            sampling: SamplingConfig {
                iterations,
                ..Default::default()
            },
            workers: WorkerConfig::default(),
            output: OutputConfig::default(),
            lookup: PrecisionLookup::default(),
        }
    }

    /// Fix the run seed, drawing one from entropy if none is set
    pub fn with_resolved_seed(mut self) -> Self {
        if self.sampling.seed.is_none() {
            self.sampling.seed = Some(rand::random::<u64>());
        }
        self
    }

    /// Run seed (zero until resolved)
    pub fn seed(&self) -> u64 {
        self.sampling.seed.unwrap_or(0)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            task_timeout: self.workers.task_timeout_secs.map(Duration::from_secs),
            max_task_retries: self.workers.max_task_retries,
        }
    }
}
