//! AidGrid - Distributed rasterization of geocoded aid
//!
//! AidGrid spreads geocoded aid records over a regular grid covering a
//! country. Each record carries a precision code saying how exactly it was
//! located; the code picks the area its aid is spread over (the point itself,
//! a buffer around it, or a containing administrative area).
//!
//! # Architecture
//!
//! - **Setup**: tables and boundaries are loaded, the grid is built and every
//!   record's aggregation geometry is resolved, identically on every process
//! - **Mean surface**: each location's aid is spread evenly over its area
//! - **Monte Carlo**: each iteration places every location's aid at one random
//!   point of its area; per-cell mean and standard deviation follow
//! - **Distribution**: both phases are task-pull jobs run by local threads or
//!   by worker slots on remote node services
//! - **Output**: ESRI ASCII grids plus JSON and text result records

pub mod config;
pub mod distributed;
pub mod geometry;
pub mod grid;
pub mod input;
pub mod output;
pub mod pipeline;
pub mod raster;
pub mod sampling;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use config::RunConfig;
pub use pipeline::{Pipeline, RunContext, WorkerSource};

/// Result type used throughout AidGrid
pub type Result<T> = anyhow::Result<T>;
