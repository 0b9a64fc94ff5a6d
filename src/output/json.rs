//! JSON results record
//!
//! [`RunSummary`] captures everything needed to interpret a run's grids:
//! parameters, seed, grid geometry, location counts, per-phase dispatch and
//! timing, skip counters and the error value.

use crate::distributed::coordinator::PhaseReport;
use crate::geometry::RejectionCounts;
use crate::grid::{GridBounds, GridShape};
use crate::sampling::SampleCounters;
use crate::stats::aggregator::RasterCounters;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

/// Duration with both seconds and the `Xm Ys` form used in results.txt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDuration {
    pub secs: f64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_duration(d: Duration) -> Self {
        Self {
            secs: d.as_secs_f64(),
            human: format_minutes(d),
        }
    }
}

/// Format as whole minutes and seconds (`"2m 5s"`)
pub fn format_minutes(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Location counts from setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSummary {
    /// Records after merging the tables
    pub loaded: usize,
    /// Records with an aggregation geometry
    pub resolved: usize,
    pub rejected: RejectionCounts,
}

/// Dispatch figures for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub tasks: usize,
    pub workers: usize,
    pub redispatched: u64,
    pub duplicates: u64,
    pub elapsed: JsonDuration,
}

impl From<&PhaseReport> for PhaseSummary {
    fn from(report: &PhaseReport) -> Self {
        Self {
            tasks: report.tasks,
            workers: report.workers,
            redispatched: report.redispatched,
            duplicates: report.duplicates,
            elapsed: JsonDuration::from_duration(report.elapsed),
        }
    }
}

/// Mean surface phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanSurfaceSummary {
    #[serde(flatten)]
    pub phase: PhaseSummary,
    pub counters: RasterCounters,
    /// Sum of the mean surface
    pub total_aid: f64,
}

/// Monte Carlo phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloSummary {
    #[serde(flatten)]
    pub phase: PhaseSummary,
    /// Summed over all iterations
    pub counters: SampleCounters,
    /// Mean of the error surface
    pub error: f64,
}

/// Complete results record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub start_time: String,
    pub country: String,
    pub abbr: String,
    pub pixel_size: f64,
    pub iterations: u32,
    pub seed: u64,
    pub nodata: i64,
    pub subset: String,
    pub aid_field: String,
    pub code_field: String,
    /// Rounded country bounds
    pub bounds: GridBounds,
    pub grid: GridShape,
    pub fine_subdivisions: u32,
    pub locations: LocationSummary,
    pub mean_surface: Option<MeanSurfaceSummary>,
    pub monte_carlo: Option<MonteCarloSummary>,
    pub total_runtime: Option<JsonDuration>,
}

/// Write the summary as pretty-printed JSON
pub fn write_json_output(output_path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create results file: {}", output_path.display()))?;

    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Failed to write results file: {}", output_path.display()))?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_summary() -> RunSummary {
        RunSummary {
            start_time: "2024-05-01 10:00:00".to_string(),
            country: "Uganda".to_string(),
            abbr: "UGA".to_string(),
            pixel_size: 0.5,
            iterations: 10,
            seed: 42,
            nodata: -9999,
            subset: "all".to_string(),
            aid_field: "total_commitments".to_string(),
            code_field: "precision_code".to_string(),
            bounds: GridBounds {
                min_x: 29.5,
                min_y: -1.5,
                max_x: 35.0,
                max_y: 4.5,
            },
            grid: GridShape { rows: 13, cols: 12 },
            fine_subdivisions: 10,
            locations: LocationSummary {
                loaded: 12,
                resolved: 10,
                rejected: RejectionCounts {
                    unrecognized_code: 1,
                    outside_country: 1,
                    ..Default::default()
                },
            },
            mean_surface: Some(MeanSurfaceSummary {
                phase: PhaseSummary {
                    tasks: 10,
                    workers: 2,
                    redispatched: 0,
                    duplicates: 0,
                    elapsed: JsonDuration::from_duration(Duration::from_secs(3)),
                },
                counters: RasterCounters {
                    areas: 10,
                    ..Default::default()
                },
                total_aid: 1000.0,
            }),
            monte_carlo: Some(MonteCarloSummary {
                phase: PhaseSummary {
                    tasks: 10,
                    workers: 2,
                    redispatched: 0,
                    duplicates: 0,
                    elapsed: JsonDuration::from_duration(Duration::from_secs(125)),
                },
                counters: SampleCounters {
                    placed: 100,
                    ..Default::default()
                },
                error: 1.25,
            }),
            total_runtime: Some(JsonDuration::from_duration(Duration::from_secs(130))),
        }
    }

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(Duration::from_secs(0)), "0m 0s");
        assert_eq!(format_minutes(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_minutes(Duration::from_millis(59_900)), "0m 59s");
    }

    #[test]
    fn test_write_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let summary = sample_summary();

        write_json_output(&path, &summary).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["seed"], 42);
        assert_eq!(value["grid"]["rows"], 13);
        assert_eq!(value["locations"]["rejected"]["unrecognized_code"], 1);
        // Phase fields are flattened next to the counters
        assert_eq!(value["monte_carlo"]["tasks"], 10);
        assert_eq!(value["monte_carlo"]["elapsed"]["human"], "2m 5s");

        let back: RunSummary = serde_json::from_value(value).unwrap();
        assert_eq!(back, summary);
    }
}
