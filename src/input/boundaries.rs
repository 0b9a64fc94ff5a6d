//! Administrative boundary loading (GeoJSON)
//!
//! Accepts a FeatureCollection, a single Feature, or a bare Polygon /
//! MultiPolygon geometry. Features keep their file order, which is the order
//! admin-area lookups search in.

use super::InputError;
use crate::geometry::Boundaries;
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde::Deserialize;
use std::fs;
use std::path::Path;

type Position = Vec<f64>;
type PolygonCoords = Vec<Vec<Position>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Document {
    FeatureCollection { features: Vec<Feature> },
    Feature(Feature),
    Polygon { coordinates: PolygonCoords },
    MultiPolygon { coordinates: Vec<PolygonCoords> },
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon { coordinates: PolygonCoords },
    MultiPolygon { coordinates: Vec<PolygonCoords> },
    #[serde(other)]
    Unsupported,
}

fn ring(positions: &[Position]) -> Result<LineString<f64>, String> {
    positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(format!("position with {} values", p.len())),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn polygon(rings: &PolygonCoords) -> Result<Polygon<f64>, String> {
    let mut rings = rings.iter();
    let exterior = rings.next().ok_or_else(|| "polygon without rings".to_string())?;
    let interiors = rings.map(|r| ring(r)).collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(ring(exterior)?, interiors))
}

fn multi_polygon(polygons: &[PolygonCoords]) -> Result<MultiPolygon<f64>, String> {
    polygons
        .iter()
        .map(polygon)
        .collect::<Result<Vec<_>, _>>()
        .map(MultiPolygon::new)
}

fn feature_shape(feature: &Feature) -> Result<Option<MultiPolygon<f64>>, String> {
    match &feature.geometry {
        Some(Geometry::Polygon { coordinates }) => Ok(Some(MultiPolygon::new(vec![polygon(coordinates)?]))),
        Some(Geometry::MultiPolygon { coordinates }) => multi_polygon(coordinates).map(Some),
        Some(Geometry::Unsupported) => Err("only Polygon and MultiPolygon geometries are supported".to_string()),
        None => Ok(None),
    }
}

/// Parse GeoJSON text into one multipolygon per feature
pub fn parse_geojson(contents: &str) -> Result<Vec<MultiPolygon<f64>>, String> {
    let document: Document = serde_json::from_str(contents).map_err(|e| e.to_string())?;

    match document {
        Document::FeatureCollection { features } => {
            let mut shapes = Vec::with_capacity(features.len());
            for feature in &features {
                if let Some(shape) = feature_shape(feature)? {
                    shapes.push(shape);
                }
            }
            Ok(shapes)
        }
        Document::Feature(feature) => Ok(feature_shape(&feature)?.into_iter().collect()),
        Document::Polygon { coordinates } => Ok(vec![MultiPolygon::new(vec![polygon(&coordinates)?])]),
        Document::MultiPolygon { coordinates } => Ok(vec![multi_polygon(&coordinates)?]),
    }
}

/// Read one boundary file
pub fn read_geojson_polygons(path: &Path) -> Result<Vec<MultiPolygon<f64>>, InputError> {
    let contents = fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_geojson(&contents).map_err(|reason| InputError::InvalidGeoJson {
        path: path.to_path_buf(),
        reason,
    })
}

/// Read boundary files for admin levels `0..paths.len()`
///
/// `paths[0]` must be the country outline.
pub fn load_boundaries<P: AsRef<Path>>(paths: &[P]) -> Result<Boundaries, InputError> {
    let mut levels = Vec::with_capacity(paths.len());
    for path in paths {
        let shapes = read_geojson_polygons(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), features = shapes.len(), "Loaded boundary level");
        levels.push(shapes);
    }

    Boundaries::from_levels(levels).ok_or(InputError::MissingCountry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Area;

    const SQUARE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "properties": {"name": "A"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[2,0],[2,2],[0,2],[0,0]]]}},
            {"type": "Feature", "properties": {"name": "B"},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[3,3],[4,3],[4,4],[3,4],[3,3]]]]}},
            {"type": "Feature", "properties": {}, "geometry": null}
        ]
    }"#;

    #[test]
    fn test_parse_feature_collection() {
        let shapes = parse_geojson(SQUARE).unwrap();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].unsigned_area(), 4.0);
        assert_eq!(shapes[1].unsigned_area(), 1.0);
    }

    #[test]
    fn test_parse_bare_polygon_with_hole() {
        let shapes = parse_geojson(
            r#"{"type": "Polygon", "coordinates": [
                [[0,0],[4,0],[4,4],[0,4],[0,0]],
                [[1,1],[2,1],[2,2],[1,2],[1,1]]
            ]}"#,
        )
        .unwrap();
        assert_eq!(shapes.len(), 1);
        assert_eq!(shapes[0].unsigned_area(), 15.0);
    }

    #[test]
    fn test_parse_rejects_points() {
        let err = parse_geojson(
            r#"{"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]}}"#,
        )
        .unwrap_err();
        assert!(err.contains("Polygon"));
    }

    #[test]
    fn test_parse_rejects_short_position() {
        assert!(parse_geojson(r#"{"type": "Polygon", "coordinates": [[[0],[1,1],[0,0]]]}"#).is_err());
    }

    #[test]
    fn test_load_boundaries_requires_country() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("adm0.geojson");
        std::fs::write(&empty, r#"{"type": "FeatureCollection", "features": []}"#).unwrap();
        assert!(matches!(load_boundaries(&[&empty]), Err(InputError::MissingCountry)));
    }

    #[test]
    fn test_load_boundaries_levels() {
        let dir = tempfile::tempdir().unwrap();
        let adm0 = dir.path().join("adm0.geojson");
        let adm1 = dir.path().join("adm1.geojson");
        std::fs::write(&adm0, SQUARE).unwrap();
        std::fs::write(&adm1, SQUARE).unwrap();

        let boundaries = load_boundaries(&[adm0, adm1]).unwrap();
        assert_eq!(boundaries.level(1).len(), 2);
        assert!(boundaries.level(2).is_empty());
    }
}
