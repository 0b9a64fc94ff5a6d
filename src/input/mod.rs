//! Input loading
//!
//! Project and location tables are merged on the project id and each project's
//! aid is split evenly across its locations, producing one [`LocationRecord`]
//! per project location. Administrative boundaries are read from GeoJSON.
//!
//! Every process reads the same inputs and produces the same records in the
//! same order; task indices sent over the wire refer to that order.

pub mod boundaries;
pub mod table;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use table::Table;

pub use boundaries::{load_boundaries, read_geojson_polygons};

/// Input errors (all fatal, raised before any distributed work)
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("table extension not recognized (expected .tsv or .csv): {0}")]
    UnsupportedTable(PathBuf),

    #[error("no projects/locations table found in {0}")]
    MissingTable(PathBuf),

    #[error("malformed table {path}: {reason}")]
    MalformedTable { path: PathBuf, reason: String },

    #[error("required field '{field}' not found in {table}")]
    MissingField { table: String, field: String },

    #[error("invalid {field} value '{value}' on {table} row {row}")]
    InvalidValue {
        table: String,
        field: String,
        row: usize,
        value: String,
    },

    #[error("invalid GeoJSON in {path}: {reason}")]
    InvalidGeoJson { path: PathBuf, reason: String },

    #[error("administrative level 0 (country outline) is required")]
    MissingCountry,
}

/// One project location with its share of the project's aid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub location_id: String,
    pub project_id: String,
    pub precision_code: String,
    pub longitude: f64,
    pub latitude: f64,
    /// Project total divided evenly across the project's locations
    pub aid_share: f64,
}

/// Column names used when merging the input tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFields {
    pub project_id: String,
    pub location_id: String,
    pub precision_code: String,
    pub aid: String,
}

impl Default for InputFields {
    fn default() -> Self {
        Self {
            project_id: "project_id".to_string(),
            location_id: "project_location_id".to_string(),
            precision_code: "precision_code".to_string(),
            aid: "total_commitments".to_string(),
        }
    }
}

/// Find `<dir>/<stem>.tsv` or `<dir>/<stem>.csv`
fn find_table(dir: &Path, stem: &str) -> Result<PathBuf, InputError> {
    ["tsv", "csv"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.exists())
        .ok_or_else(|| InputError::MissingTable(dir.join(stem)))
}

/// Load and merge `projects` and `locations` from a data directory
pub fn load_records(data_dir: &Path, fields: &InputFields) -> Result<Vec<LocationRecord>, InputError> {
    let projects = Table::read(&find_table(data_dir, "projects")?)?;
    let locations = Table::read(&find_table(data_dir, "locations")?)?;
    merge_tables(&projects, &locations, fields)
}

fn require(table: &Table, name: &str, field: &str) -> Result<usize, InputError> {
    table.column(field).ok_or_else(|| InputError::MissingField {
        table: name.to_string(),
        field: field.to_string(),
    })
}

fn parse_number(value: &str, table: &str, field: &str, row: usize) -> Result<f64, InputError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| InputError::InvalidValue {
            table: table.to_string(),
            field: field.to_string(),
            row,
            value: value.to_string(),
        })
}

/// Inner-join locations to projects and split each project's aid
///
/// Locations whose project is missing from the projects table are dropped by
/// the join. Output order follows the locations table. A blank aid value counts
/// as zero.
pub fn merge_tables(projects: &Table, locations: &Table, fields: &InputFields) -> Result<Vec<LocationRecord>, InputError> {
    let p_id = require(projects, "projects", &fields.project_id)?;
    let p_aid = require(projects, "projects", &fields.aid)?;
    let l_project = require(locations, "locations", &fields.project_id)?;
    let l_id = require(locations, "locations", &fields.location_id)?;
    let l_code = require(locations, "locations", &fields.precision_code)?;
    let l_lon = require(locations, "locations", "longitude")?;
    let l_lat = require(locations, "locations", "latitude")?;

    let mut project_aid: HashMap<&str, f64> = HashMap::new();
    for (i, row) in projects.rows().iter().enumerate() {
        let raw = row[p_aid].trim();
        let aid = if raw.is_empty() {
            0.0
        } else {
            parse_number(raw, "projects", &fields.aid, i + 2)?
        };
        project_aid.insert(row[p_id].trim(), aid);
    }

    let mut location_count: HashMap<&str, usize> = HashMap::new();
    for row in locations.rows() {
        let project = row[l_project].trim();
        if project_aid.contains_key(project) {
            *location_count.entry(project).or_default() += 1;
        }
    }

    let mut records = Vec::with_capacity(locations.len());
    for (i, row) in locations.rows().iter().enumerate() {
        let project = row[l_project].trim();
        let Some(&aid) = project_aid.get(project) else {
            continue;
        };
        let count = location_count[project] as f64;

        records.push(LocationRecord {
            location_id: row[l_id].trim().to_string(),
            project_id: project.to_string(),
            precision_code: row[l_code].trim().to_string(),
            longitude: parse_number(&row[l_lon], "locations", "longitude", i + 2)?,
            latitude: parse_number(&row[l_lat], "locations", "latitude", i + 2)?,
            aid_share: aid / count,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECTS: &str = "project_id\ttotal_commitments\nP1\t300\nP2\t50\nP3\t\n";
    const LOCATIONS: &str = "project_id\tproject_location_id\tprecision_code\tlongitude\tlatitude\n\
        P1\tL1\t1\t85.3\t27.7\n\
        P1\tL2\t2\t84.0\t28.0\n\
        P1\tL3\t3\t83.5\t28.2\n\
        P2\tL4\t1\t85.0\t27.5\n\
        P9\tL5\t1\t85.0\t27.5\n\
        P3\tL6\t6\t85.0\t27.5\n";

    fn tables() -> (Table, Table) {
        (Table::parse(PROJECTS, '\t').unwrap(), Table::parse(LOCATIONS, '\t').unwrap())
    }

    #[test]
    fn test_merge_splits_aid_evenly() {
        let (projects, locations) = tables();
        let records = merge_tables(&projects, &locations, &InputFields::default()).unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(records[0].location_id, "L1");
        assert_eq!(records[0].aid_share, 100.0);
        assert_eq!(records[2].aid_share, 100.0);
        assert_eq!(records[3].aid_share, 50.0);
        assert_eq!(records[1].precision_code, "2");
        assert_eq!(records[1].longitude, 84.0);
        assert_eq!(records[1].latitude, 28.0);
    }

    #[test]
    fn test_merge_drops_unknown_project() {
        let (projects, locations) = tables();
        let records = merge_tables(&projects, &locations, &InputFields::default()).unwrap();
        assert!(records.iter().all(|r| r.project_id != "P9"));
    }

    #[test]
    fn test_blank_aid_is_zero() {
        let (projects, locations) = tables();
        let records = merge_tables(&projects, &locations, &InputFields::default()).unwrap();
        let l6 = records.iter().find(|r| r.location_id == "L6").unwrap();
        assert_eq!(l6.aid_share, 0.0);
    }

    #[test]
    fn test_missing_field() {
        let projects = Table::parse("project_id\tamount\nP1\t1\n", '\t').unwrap();
        let (_, locations) = tables();
        let err = merge_tables(&projects, &locations, &InputFields::default()).unwrap_err();
        assert!(matches!(err, InputError::MissingField { ref field, .. } if field == "total_commitments"));
    }

    #[test]
    fn test_invalid_coordinate() {
        let (projects, _) = tables();
        let locations = Table::parse(
            "project_id\tproject_location_id\tprecision_code\tlongitude\tlatitude\nP1\tL1\t1\tabc\t27.7\n",
            '\t',
        )
        .unwrap();
        let err = merge_tables(&projects, &locations, &InputFields::default()).unwrap_err();
        assert!(matches!(err, InputError::InvalidValue { row: 2, .. }));
    }

    #[test]
    fn test_load_records_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("projects.tsv"), PROJECTS).unwrap();
        std::fs::write(dir.path().join("locations.tsv"), LOCATIONS).unwrap();

        let records = load_records(dir.path(), &InputFields::default()).unwrap();
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_load_records_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_records(dir.path(), &InputFields::default()).unwrap_err();
        assert!(matches!(err, InputError::MissingTable(_)));
    }
}
