//! Text output: results.txt and console summary

use crate::output::json::RunSummary;
use crate::Result;
use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

/// Render the tab-separated results record
pub fn format_results(summary: &RunSummary) -> String {
    let mut out = String::new();
    let b = &summary.bounds;

    // Writes into a String cannot fail
    let _ = writeln!(out, "Monte Carlo Rasterization Output File\t");
    let _ = writeln!(out, "start time\t{}", summary.start_time);
    let _ = writeln!(out, "country\t{}", summary.country);
    let _ = writeln!(out, "abbr\t{}", summary.abbr);
    let _ = writeln!(out, "pixel_size\t{}", summary.pixel_size);
    let _ = writeln!(out, "iterations\t{}", summary.iterations);
    let _ = writeln!(out, "seed\t{}", summary.seed);
    let _ = writeln!(out, "nodata\t{}", summary.nodata);
    let _ = writeln!(out, "subset\t{}", summary.subset);
    let _ = writeln!(out, "aid_field\t{}", summary.aid_field);
    let _ = writeln!(out, "code_field\t{}", summary.code_field);
    let _ = writeln!(out, "country bounds\t({}, {}, {}, {})", b.min_x, b.min_y, b.max_x, b.max_y);
    let _ = writeln!(out, "grid\t{} rows x {} cols", summary.grid.rows, summary.grid.cols);
    let _ = writeln!(
        out,
        "locations\t{} loaded, {} resolved, {} rejected",
        summary.locations.loaded,
        summary.locations.resolved,
        summary.locations.rejected.total()
    );

    if let Some(ref mean) = summary.mean_surface {
        let _ = writeln!(out, "Mean Surf Runtime\t{}", mean.phase.elapsed.human);
    }
    if let Some(ref mc) = summary.monte_carlo {
        let _ = writeln!(out, "error value\t{}", mc.error);
        let _ = writeln!(out, "Iterations Runtime\t{}", mc.phase.elapsed.human);
    }
    if let Some(ref total) = summary.total_runtime {
        let _ = writeln!(out, "Total Runtime\t{}", total.human);
    }

    out
}

/// Write results.txt
pub fn write_text_output(output_path: &Path, summary: &RunSummary) -> Result<()> {
    std::fs::write(output_path, format_results(summary))
        .with_context(|| format!("Failed to write results file: {}", output_path.display()))
}

/// Print the end-of-run summary to stdout
pub fn print_summary(summary: &RunSummary, output_dir: &Path) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    RUN RESULTS");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Country:     {} ({})", summary.country, summary.abbr);
    println!("Grid:        {} x {} cells at {}", summary.grid.rows, summary.grid.cols, summary.pixel_size);
    println!("Seed:        {}", summary.seed);
    println!();

    let rejected = &summary.locations.rejected;
    println!("Locations:");
    println!("  Loaded:    {}", summary.locations.loaded);
    println!("  Resolved:  {}", summary.locations.resolved);
    if rejected.total() > 0 {
        println!(
            "  Rejected:  {} (unrecognized code {}, outside country {}, no admin area {}, empty buffer {})",
            rejected.total(),
            rejected.unrecognized_code,
            rejected.outside_country,
            rejected.no_containing_admin_area,
            rejected.empty_buffer
        );
    }
    println!();

    if let Some(ref mean) = summary.mean_surface {
        println!("Mean surface:");
        println!("  Tasks:     {} on {} workers", mean.phase.tasks, mean.phase.workers);
        println!("  Total aid: {:.2}", mean.total_aid);
        if mean.counters.zero_coverage + mean.counters.out_of_grid > 0 {
            println!(
                "  Skipped:   {} zero coverage, {} outside grid",
                mean.counters.zero_coverage, mean.counters.out_of_grid
            );
        }
        println!("  Runtime:   {}", mean.phase.elapsed.human);
        println!();
    }

    if let Some(ref mc) = summary.monte_carlo {
        println!("Monte Carlo:");
        println!("  Iterations: {} on {} workers", mc.phase.tasks, mc.phase.workers);
        if mc.phase.redispatched > 0 {
            println!("  Redispatched: {} ({} duplicate results)", mc.phase.redispatched, mc.phase.duplicates);
        }
        if mc.counters.fallbacks + mc.counters.out_of_grid > 0 {
            println!(
                "  Skipped:    {} outside grid, {} sampling fallbacks",
                mc.counters.out_of_grid, mc.counters.fallbacks
            );
        }
        println!("  Error:      {:.6}", mc.error);
        println!("  Runtime:    {}", mc.phase.elapsed.human);
        println!();
    }

    if let Some(ref total) = summary.total_runtime {
        println!("Total runtime: {}", total.human);
    }
    println!("Output: {}", output_dir.display());
}
