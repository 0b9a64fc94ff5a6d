//! Configuration validation
//!
//! All checks run before any input is read or any worker is started.

use super::*;
use crate::geometry::lookup::{AggregationKind, PrecisionLookup};
use crate::grid::pixel_scale;

/// Fatal configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    #[error("invalid pixel size {0}: must be positive with 1/pixel_size an integer")]
    InvalidPixelSize(f64),

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("precision code '{code}' needs admin level {level} but only {available} boundary file(s) are configured")]
    MissingAdminLevel {
        code: String,
        level: usize,
        available: usize,
    },

    #[error("precision code '{code}' has invalid buffer radius {radius}")]
    InvalidRadius { code: String, radius: f64 },

    #[error("precision lookup table is empty")]
    EmptyLookup,
}

/// Validate complete configuration
pub fn validate_config(config: &RunConfig) -> Result<(), ConfigError> {
    if config.country.trim().is_empty() {
        return Err(ConfigError::MissingField("country"));
    }
    if config.abbr.trim().is_empty() {
        return Err(ConfigError::MissingField("abbr"));
    }
    validate_grid(&config.grid)?;
    validate_sampling(&config.sampling)?;
    validate_workers(&config.workers)?;
    validate_inputs(&config.inputs, &config.lookup)?;

    Ok(())
}

/// Validate grid resolution
pub fn validate_grid(grid: &GridConfig) -> Result<(), ConfigError> {
    if pixel_scale(grid.pixel_size).is_err() {
        return Err(ConfigError::InvalidPixelSize(grid.pixel_size));
    }
    if grid.fine_subdivisions == 0 {
        return Err(ConfigError::Zero("fine_subdivisions"));
    }
    Ok(())
}

/// Validate Monte Carlo settings
pub fn validate_sampling(sampling: &SamplingConfig) -> Result<(), ConfigError> {
    if sampling.iterations == 0 {
        return Err(ConfigError::Zero("iterations"));
    }
    if sampling.max_sample_attempts == 0 {
        return Err(ConfigError::Zero("max_sample_attempts"));
    }
    Ok(())
}

/// Validate worker configuration
pub fn validate_workers(workers: &WorkerConfig) -> Result<(), ConfigError> {
    if workers.count == 0 {
        return Err(ConfigError::Zero("workers"));
    }
    if workers.task_timeout_secs == Some(0) {
        return Err(ConfigError::Zero("task_timeout_secs"));
    }
    Ok(())
}

/// Validate input paths against the lookup table
pub fn validate_inputs(inputs: &InputConfig, lookup: &PrecisionLookup) -> Result<(), ConfigError> {
    if inputs.boundary_paths.is_empty() {
        return Err(ConfigError::MissingField("boundary paths (--adm or --base-dir)"));
    }
    if lookup.is_empty() {
        return Err(ConfigError::EmptyLookup);
    }

    for (code, kind) in lookup.iter() {
        match *kind {
            AggregationKind::AdminArea { level } if level >= inputs.boundary_paths.len() => {
                return Err(ConfigError::MissingAdminLevel {
                    code: code.to_string(),
                    level,
                    available: inputs.boundary_paths.len(),
                });
            }
            AggregationKind::Buffer { radius } if !(radius.is_finite() && radius > 0.0) => {
                return Err(ConfigError::InvalidRadius {
                    code: code.to_string(),
                    radius,
                });
            }
            _ => {}
        }
    }
    Ok(())
}
