//! Aggregation geometries
//!
//! A location's precision code selects how its aid is spread spatially:
//!
//! - **Point**: exact coordinates
//! - **Buffer**: a circle around the point, clipped to the country
//! - **AdminArea**: the first administrative polygon of a level containing
//!   the point
//!
//! Resolution happens once per location during setup. Locations that cannot
//! be resolved are rejected and never reach either aggregation pass.

pub mod lookup;

use crate::input::LocationRecord;
use geo::{BooleanOps, BoundingRect, Contains, Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub use lookup::{AggregationKind, PrecisionLookup};

/// Vertices used to approximate a buffer circle
pub const BUFFER_SEGMENTS: usize = 64;

/// Administrative boundary polygons by level
///
/// Level 0 is the country outline. Polygons within a level keep their input
/// order.
#[derive(Debug, Clone)]
pub struct Boundaries {
    country: MultiPolygon<f64>,
    levels: Vec<Vec<MultiPolygon<f64>>>,
}

impl Boundaries {
    /// Build from per-level polygon lists; `None` without a level-0 polygon
    pub fn from_levels(levels: Vec<Vec<MultiPolygon<f64>>>) -> Option<Self> {
        let country: Vec<Polygon<f64>> = levels
            .first()?
            .iter()
            .flat_map(|shape| shape.0.iter().cloned())
            .collect();
        if country.is_empty() {
            return None;
        }

        Some(Self {
            country: MultiPolygon::new(country),
            levels,
        })
    }

    /// Country outline (all level-0 polygons)
    pub fn country(&self) -> &MultiPolygon<f64> {
        &self.country
    }

    /// Polygons at `level`; empty when the level was not loaded
    pub fn level(&self, level: usize) -> &[MultiPolygon<f64>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A polygonal footprint with its cached bounding box
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    shape: MultiPolygon<f64>,
    bounds: Rect<f64>,
}

impl Footprint {
    /// `None` for an empty shape
    pub fn new(shape: MultiPolygon<f64>) -> Option<Self> {
        let bounds = shape.bounding_rect()?;
        Some(Self { shape, bounds })
    }

    pub fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }

    pub fn bounds(&self) -> &Rect<f64> {
        &self.bounds
    }

    /// Strict interior containment
    pub fn contains(&self, coord: Coord<f64>) -> bool {
        self.shape.contains(&coord)
    }
}

/// Resolved aggregation geometry of one location
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationGeometry {
    Point(Point<f64>),
    Buffer { radius: f64, footprint: Footprint },
    AdminArea { level: usize, footprint: Footprint },
}

impl AggregationGeometry {
    /// Polygonal footprint, `None` for points
    pub fn footprint(&self) -> Option<&Footprint> {
        match self {
            AggregationGeometry::Point(_) => None,
            AggregationGeometry::Buffer { footprint, .. } | AggregationGeometry::AdminArea { footprint, .. } => {
                Some(footprint)
            }
        }
    }

    pub fn kind(&self) -> AggregationKind {
        match self {
            AggregationGeometry::Point(_) => AggregationKind::Point,
            AggregationGeometry::Buffer { radius, .. } => AggregationKind::Buffer { radius: *radius },
            AggregationGeometry::AdminArea { level, .. } => AggregationKind::AdminArea { level: *level },
        }
    }
}

/// Why a location was excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unrecognized code")]
    UnrecognizedCode,

    #[error("outside country")]
    OutsideCountry,

    #[error("no containing admin polygon")]
    NoContainingAdminArea,

    #[error("buffer does not intersect country")]
    EmptyBuffer,
}

/// Rejection tallies, reported in the run summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub unrecognized_code: u64,
    pub outside_country: u64,
    pub no_containing_admin_area: u64,
    pub empty_buffer: u64,
}

impl RejectionCounts {
    pub fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::UnrecognizedCode => self.unrecognized_code += 1,
            Rejection::OutsideCountry => self.outside_country += 1,
            Rejection::NoContainingAdminArea => self.no_containing_admin_area += 1,
            Rejection::EmptyBuffer => self.empty_buffer += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.unrecognized_code + self.outside_country + self.no_containing_admin_area + self.empty_buffer
    }
}

/// A location that passed resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub record: LocationRecord,
    pub geometry: AggregationGeometry,
}

/// Output of resolving every record
#[derive(Debug, Clone)]
pub struct Resolution {
    pub locations: Vec<ResolvedLocation>,
    pub rejections: RejectionCounts,
}

/// Closed polygon approximating a circle
pub fn circle(center: Point<f64>, radius: f64, segments: usize) -> Polygon<f64> {
    let segments = segments.max(3);
    let mut coords: Vec<Coord<f64>> = (0..segments)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / segments as f64;
            Coord {
                x: center.x() + radius * angle.cos(),
                y: center.y() + radius * angle.sin(),
            }
        })
        .collect();
    coords.push(coords[0]);
    Polygon::new(LineString::new(coords), vec![])
}

/// Maps `(code, lon, lat)` to an aggregation geometry
pub struct GeometryResolver<'a> {
    lookup: &'a PrecisionLookup,
    boundaries: &'a Boundaries,
}

impl<'a> GeometryResolver<'a> {
    pub fn new(lookup: &'a PrecisionLookup, boundaries: &'a Boundaries) -> Self {
        Self { lookup, boundaries }
    }

    /// Resolve one location's geometry
    pub fn resolve(&self, code: &str, lon: f64, lat: f64) -> Result<AggregationGeometry, Rejection> {
        let kind = self.lookup.kind(code).ok_or(Rejection::UnrecognizedCode)?;

        let point = Point::new(lon, lat);
        let country = self.boundaries.country();
        if !lon.is_finite() || !lat.is_finite() || !country.contains(&point) {
            return Err(Rejection::OutsideCountry);
        }

        match kind {
            AggregationKind::Point => Ok(AggregationGeometry::Point(point)),
            AggregationKind::Buffer { radius } => {
                let buffer = MultiPolygon::new(vec![circle(point, radius, BUFFER_SEGMENTS)]);
                let shape = if country.contains(&buffer) {
                    buffer
                } else {
                    country.intersection(&buffer)
                };
                let footprint = Footprint::new(shape).ok_or(Rejection::EmptyBuffer)?;
                Ok(AggregationGeometry::Buffer { radius, footprint })
            }
            AggregationKind::AdminArea { level } => self
                .boundaries
                .level(level)
                .iter()
                .find(|shape| shape.contains(&point))
                .and_then(|shape| Footprint::new(shape.clone()))
                .map(|footprint| AggregationGeometry::AdminArea { level, footprint })
                .ok_or(Rejection::NoContainingAdminArea),
        }
    }

    /// Resolve every record in parallel, keeping input order
    pub fn resolve_all(&self, records: Vec<LocationRecord>) -> Resolution {
        let outcomes: Vec<_> = records
            .into_par_iter()
            .map(|record| {
                let outcome = self.resolve(&record.precision_code, record.longitude, record.latitude);
                (record, outcome)
            })
            .collect();

        let mut locations = Vec::with_capacity(outcomes.len());
        let mut rejections = RejectionCounts::default();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(geometry) => locations.push(ResolvedLocation { record, geometry }),
                Err(rejection) => {
                    tracing::debug!(
                        location = %record.location_id,
                        code = %record.precision_code,
                        reason = %rejection,
                        "Location rejected"
                    );
                    rejections.record(rejection);
                }
            }
        }

        Resolution { locations, rejections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
            (x: x0, y: y0),
        ]])
    }

    /// Country [0,10]², level 1 halves, level 2 quarters of the west half
    fn test_boundaries() -> Boundaries {
        Boundaries::from_levels(vec![
            vec![square(0.0, 0.0, 10.0, 10.0)],
            vec![square(0.0, 0.0, 5.0, 10.0), square(5.0, 0.0, 10.0, 10.0)],
            vec![square(0.0, 0.0, 5.0, 5.0), square(0.0, 5.0, 5.0, 10.0)],
        ])
        .unwrap()
    }

    fn record(code: &str, lon: f64, lat: f64) -> LocationRecord {
        LocationRecord {
            location_id: format!("{}-{}-{}", code, lon, lat),
            project_id: "P1".to_string(),
            precision_code: code.to_string(),
            longitude: lon,
            latitude: lat,
            aid_share: 10.0,
        }
    }

    #[test]
    fn test_from_levels_requires_country() {
        assert!(Boundaries::from_levels(vec![]).is_none());
        assert!(Boundaries::from_levels(vec![vec![]]).is_none());
    }

    #[test]
    fn test_circle_closed() {
        let c = circle(Point::new(1.0, 1.0), 2.0, BUFFER_SEGMENTS);
        let ring = &c.exterior().0;
        assert_eq!(ring.len(), BUFFER_SEGMENTS + 1);
        assert_eq!(ring.first(), ring.last());
        let expected = PI * 4.0;
        assert!((c.unsigned_area() - expected).abs() / expected < 0.01);
    }

    #[test]
    fn test_resolve_point() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        let geometry = resolver.resolve("1", 2.5, 3.5).unwrap();
        assert_eq!(geometry, AggregationGeometry::Point(Point::new(2.5, 3.5)));
        assert!(geometry.footprint().is_none());
    }

    #[test]
    fn test_resolve_unrecognized_code() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);
        assert_eq!(resolver.resolve("9", 2.5, 3.5), Err(Rejection::UnrecognizedCode));
    }

    #[test]
    fn test_resolve_outside_country() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);
        assert_eq!(resolver.resolve("1", 12.0, 3.0), Err(Rejection::OutsideCountry));
        // On the boundary is not strictly inside
        assert_eq!(resolver.resolve("1", 0.0, 3.0), Err(Rejection::OutsideCountry));
    }

    #[test]
    fn test_resolve_buffer_inside_unchanged() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::from_entries([("b", AggregationKind::Buffer { radius: 1.0 })]);
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        let geometry = resolver.resolve("b", 5.0, 5.0).unwrap();
        let footprint = geometry.footprint().unwrap();
        assert_eq!(footprint.shape().0.len(), 1);
        assert_eq!(footprint.shape().0[0], circle(Point::new(5.0, 5.0), 1.0, BUFFER_SEGMENTS));
    }

    #[test]
    fn test_resolve_buffer_clipped_to_country() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        // Code 2 is a 25000-unit buffer: covers the whole country after clipping
        let geometry = resolver.resolve("2", 5.0, 5.0).unwrap();
        let footprint = geometry.footprint().unwrap();
        assert!((footprint.shape().unsigned_area() - 100.0).abs() < 1e-6);
        assert_eq!(geometry.kind(), AggregationKind::Buffer { radius: 25000.0 });
    }

    #[test]
    fn test_resolve_admin_area_first_match() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        // Code 3 → level 2
        let geometry = resolver.resolve("3", 2.0, 7.0).unwrap();
        assert_eq!(geometry.kind(), AggregationKind::AdminArea { level: 2 });
        assert_eq!(geometry.footprint().unwrap().shape(), &square(0.0, 5.0, 5.0, 10.0));

        // Code 6 → level 0
        let geometry = resolver.resolve("6", 7.0, 7.0).unwrap();
        assert_eq!(geometry.footprint().unwrap().shape(), &square(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_resolve_admin_area_missing() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        // Level 2 only covers the west half
        assert_eq!(resolver.resolve("3", 7.0, 7.0), Err(Rejection::NoContainingAdminArea));
    }

    #[test]
    fn test_resolve_all_keeps_order_and_counts() {
        let boundaries = test_boundaries();
        let lookup = PrecisionLookup::default();
        let resolver = GeometryResolver::new(&lookup, &boundaries);

        let records = vec![
            record("1", 1.0, 1.0),
            record("x", 1.0, 1.0),
            record("1", 20.0, 1.0),
            record("3", 8.0, 8.0),
            record("6", 9.0, 9.0),
        ];
        let resolution = resolver.resolve_all(records);

        assert_eq!(resolution.locations.len(), 2);
        assert_eq!(resolution.locations[0].record.longitude, 1.0);
        assert_eq!(resolution.locations[1].record.precision_code, "6");
        assert_eq!(resolution.rejections.unrecognized_code, 1);
        assert_eq!(resolution.rejections.outside_country, 1);
        assert_eq!(resolution.rejections.no_containing_admin_area, 1);
        assert_eq!(resolution.rejections.total(), 3);
    }
}
