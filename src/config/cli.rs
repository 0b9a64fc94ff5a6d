//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Standalone mode (default) - single machine, local worker threads
    Standalone,
    /// Coordinator mode - distribute tasks to node services
    Coordinator,
    /// Service mode - host worker slots for a coordinator
    Service,
}

/// AidGrid - distributed rasterization of geocoded aid
#[derive(Parser, Debug)]
#[command(name = "aidgrid")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: standalone, coordinator, or service
    #[arg(long, value_enum, default_value = "standalone")]
    pub mode: ExecutionMode,

    /// Port for service to listen on (service mode only)
    #[arg(long, default_value = "9999")]
    pub listen_port: u16,

    /// Comma-separated list of node addresses for coordinator mode (e.g., "10.0.1.10:9999,10.0.1.11")
    #[arg(long)]
    pub host_list: Option<String>,

    /// File containing list of node addresses (one per line, for coordinator mode)
    #[arg(long)]
    pub clients_file: Option<PathBuf>,

    /// Port to connect to on nodes listed without one (coordinator mode only)
    #[arg(long, default_value = "9999")]
    pub worker_port: u16,

    /// Worker slots hosted by this node (service mode only, default: CPU count)
    #[arg(long)]
    pub threads: Option<usize>,

    // === Run Parameters ===
    // Not required in service mode (coordinator sends configuration)
    /// Country name
    #[arg(value_name = "COUNTRY")]
    pub country: Option<String>,

    /// Country abbreviation (boundary file prefix)
    #[arg(value_name = "ABBR")]
    pub abbr: Option<String>,

    /// Output cell size in degrees (1 / PIXEL_SIZE must be an integer)
    #[arg(value_name = "PIXEL_SIZE")]
    pub pixel_size: Option<f64>,

    /// Monte Carlo iterations
    #[arg(value_name = "ITERATIONS")]
    pub iterations: Option<u32>,

    // === Input Options ===
    /// Base directory holding countries/<COUNTRY>/{data,boundaries}
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Directory with projects and locations tables (overrides --base-dir layout)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Boundary GeoJSON files, level 0 first (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub adm: Vec<PathBuf>,

    /// Aid amount column in the projects table
    #[arg(long)]
    pub aid_field: Option<String>,

    /// Precision code column in the locations table
    #[arg(long)]
    pub code_field: Option<String>,

    // === Algorithm Options ===
    /// Run seed (default: drawn at random and recorded in the results)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fine grid cells per coarse cell edge
    #[arg(long)]
    pub fine_subdivisions: Option<u32>,

    /// Rejection sampling attempts per location before falling back
    #[arg(long)]
    pub max_sample_attempts: Option<u32>,

    // === Worker Options ===
    /// Number of local worker threads (standalone mode)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Redispatch tasks not finished within this long (e.g., 30s, 5m)
    #[arg(long)]
    pub task_timeout: Option<String>,

    /// Redispatches allowed per task
    #[arg(long)]
    pub max_task_retries: Option<u32>,

    // === Output Options ===
    /// Root output directory
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Subset label used in the run directory name
    #[arg(long)]
    pub subset: Option<String>,

    // === Configuration File ===
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Dry run - prepare and validate the run without executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        // Service mode doesn't need validation (coordinator sends config)
        if self.mode == ExecutionMode::Service {
            if self.threads == Some(0) {
                anyhow::bail!("threads must be at least 1");
            }
            return Ok(());
        }

        if self.config.is_none() {
            let missing: Vec<&str> = [
                ("COUNTRY", self.country.is_none()),
                ("ABBR", self.abbr.is_none()),
                ("PIXEL_SIZE", self.pixel_size.is_none()),
                ("ITERATIONS", self.iterations.is_none()),
            ]
            .iter()
            .filter(|(_, missing)| *missing)
            .map(|(name, _)| *name)
            .collect();
            if !missing.is_empty() {
                anyhow::bail!("missing run parameters: {} (or pass --config)", missing.join(", "));
            }
        }

        if self.workers == Some(0) {
            anyhow::bail!("workers must be at least 1");
        }

        if self.mode == ExecutionMode::Coordinator && self.host_list.is_none() && self.clients_file.is_none() {
            anyhow::bail!("coordinator mode requires --host-list or --clients-file");
        }

        Ok(())
    }
}
