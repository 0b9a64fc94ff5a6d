//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<RunConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<RunConfig> {
    let config: RunConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the run configuration from the CLI, reading `--config` if given
pub fn load_config(cli: &Cli) -> Result<RunConfig> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => RunConfig::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: RunConfig) -> Result<RunConfig> {
    // Run parameters
    if let Some(ref country) = cli.country {
        config.country = country.clone();
    }
    if let Some(ref abbr) = cli.abbr {
        config.abbr = abbr.clone();
    }
    if let Some(pixel_size) = cli.pixel_size {
        config.grid.pixel_size = pixel_size;
    }
    if let Some(iterations) = cli.iterations {
        config.sampling.iterations = iterations;
    }

    // Input layout: base dir first, explicit paths override it
    if let Some(ref base) = cli.base_dir {
        let max_level = config.lookup.max_admin_level().unwrap_or(0);
        let layout = InputConfig::for_country(base, &config.country, &config.abbr, max_level);
        config.inputs.data_dir = layout.data_dir;
        config.inputs.boundary_paths = layout.boundary_paths;
    }
    if let Some(ref data_dir) = cli.data_dir {
        config.inputs.data_dir = data_dir.clone();
    }
    if !cli.adm.is_empty() {
        config.inputs.boundary_paths = cli.adm.clone();
    }
    if let Some(ref field) = cli.aid_field {
        config.inputs.fields.aid = field.clone();
    }
    if let Some(ref field) = cli.code_field {
        config.inputs.fields.precision_code = field.clone();
    }

    // Algorithm settings
    if cli.seed.is_some() {
        config.sampling.seed = cli.seed;
    }
    if let Some(subdivisions) = cli.fine_subdivisions {
        config.grid.fine_subdivisions = subdivisions;
    }
    if let Some(attempts) = cli.max_sample_attempts {
        config.sampling.max_sample_attempts = attempts;
    }

    // Worker settings
    if let Some(workers) = cli.workers {
        config.workers.count = workers;
    }
    if let Some(ref timeout) = cli.task_timeout {
        config.workers.task_timeout_secs = Some(parse_duration(timeout)?);
    }
    if let Some(retries) = cli.max_task_retries {
        config.workers.max_task_retries = retries;
    }

    // Output settings
    if let Some(ref dir) = cli.output_dir {
        config.output.dir = dir.clone();
    }
    if let Some(ref subset) = cli.subset {
        config.output.subset = subset.clone();
    }

    Ok(config)
}

/// Parse duration string (e.g., "60s", "5m", "1h") to seconds
fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // A bare number is seconds
    if let Ok(seconds) = s.parse::<u64>() {
        return Ok(seconds);
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let unit_start = s.len() - 1;
        (&s[..unit_start], &s[unit_start..])
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid number in duration: {}", num_str))?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "ms" => {
            if num < 1000 {
                1 // Round up to 1 second
            } else {
                num / 1000
            }
        }
        _ => anyhow::bail!("Invalid duration unit: {}. Use s, m, h, or ms", unit),
    };

    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::lookup::AggregationKind;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), 60);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("45").unwrap(), 45);
        assert_eq!(parse_duration("500ms").unwrap(), 1); // Rounds up
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_toml_basic() {
        let toml = r#"
country = "Uganda"
abbr = "UGA"

[grid]
pixel_size = 0.05

[sampling]
iterations = 200
seed = 12345

[workers]
count = 4
task_timeout_secs = 60
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.country, "Uganda");
        assert_eq!(config.grid.pixel_size, 0.05);
        assert_eq!(config.grid.fine_subdivisions, 10);
        assert_eq!(config.sampling.iterations, 200);
        assert_eq!(config.sampling.seed, Some(12345));
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.workers.task_timeout_secs, Some(60));
        assert_eq!(config.output.subset, "all");
        assert_eq!(config.lookup.len(), 8);
    }

    #[test]
    fn test_parse_toml_with_lookup_and_fields() {
        let toml = r#"
country = "Nepal"
abbr = "NPL"

[grid]
pixel_size = 0.1
fine_subdivisions = 4

[sampling]
iterations = 10

[inputs]
data_dir = "/srv/nepal/data"
boundary_paths = ["/srv/nepal/adm0.geojson", "/srv/nepal/adm1.geojson"]

[inputs.fields]
aid = "total_disbursements"

[lookup]
"1" = { type = "point" }
"2" = { type = "buffer", radius = 0.25 }
"4" = { type = "adm", level = 1 }
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.grid.fine_subdivisions, 4);
        assert_eq!(config.inputs.boundary_paths.len(), 2);
        assert_eq!(config.inputs.fields.aid, "total_disbursements");
        assert_eq!(config.inputs.fields.project_id, "project_id");
        assert_eq!(config.lookup.len(), 3);
        assert_eq!(config.lookup.kind("2"), Some(AggregationKind::Buffer { radius: 0.25 }));
        assert_eq!(config.lookup.max_admin_level(), Some(1));
    }

    #[test]
    fn test_parse_toml_invalid() {
        assert!(parse_toml_string("[grid]\npixel_size = \"fine\"").is_err());
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "country = \"Malawi\"\nabbr = \"MWI\"").unwrap();

        let config = parse_toml_file(file.path()).unwrap();
        assert_eq!(config.abbr, "MWI");
        assert!(parse_toml_file(Path::new("/nonexistent/aidgrid.toml")).is_err());
    }

    #[test]
    fn test_merge_cli_overrides_config() {
        let config = parse_toml_string(
            r#"
country = "Uganda"
abbr = "UGA"
[grid]
pixel_size = 0.5
[sampling]
iterations = 10
seed = 1
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "aidgrid",
            "--seed",
            "99",
            "--task-timeout",
            "2m",
            "--base-dir",
            "/base",
            "--data-dir",
            "/elsewhere",
            "--aid-field",
            "amount",
        ])
        .unwrap();

        let merged = merge_cli_with_config(&cli, config).unwrap();
        assert_eq!(merged.country, "Uganda");
        assert_eq!(merged.grid.pixel_size, 0.5);
        assert_eq!(merged.sampling.seed, Some(99));
        assert_eq!(merged.workers.task_timeout_secs, Some(120));
        assert_eq!(merged.inputs.data_dir, PathBuf::from("/elsewhere"));
        assert_eq!(merged.inputs.boundary_paths.len(), 3);
        assert_eq!(
            merged.inputs.boundary_paths[0],
            PathBuf::from("/base/countries/Uganda/boundaries/UGA_adm0.geojson")
        );
        assert_eq!(merged.inputs.fields.aid, "amount");
    }

    #[test]
    fn test_load_config_from_positionals() {
        let cli = Cli::try_parse_from(["aidgrid", "Malawi", "MWI", "0.25", "40", "--adm", "mwi0.geojson"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.country, "Malawi");
        assert_eq!(config.grid.pixel_size, 0.25);
        assert_eq!(config.sampling.iterations, 40);
        assert_eq!(config.inputs.boundary_paths, vec![PathBuf::from("mwi0.geojson")]);
    }
}
