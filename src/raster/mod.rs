//! Mean surface rasterization
//!
//! Spreads one location's aid share over the coarse cells its aggregation
//! geometry covers. The result is a sparse list of per-cell deltas; the
//! coordinator sums the deltas of every location into the mean surface.
//!
//! # Algorithm
//!
//! - **Point**: the whole share goes to the cell nearest the point.
//! - **Polygon**: a fine grid (`pixel_size / subdivisions` spacing) is laid over
//!   the footprint's bounding box. Each of the `n` fine nodes strictly inside
//!   the footprint carries `aid_share / n` to its nearest coarse cell.
//!
//! Rasterization is deterministic and never consults a random source, so a
//! task can be rerun on any worker with identical output.
//!
//! # Example
//!
//! ```
//! use aidgrid::geometry::{AggregationGeometry, ResolvedLocation};
//! use aidgrid::grid::CoarseGrid;
//! use aidgrid::input::LocationRecord;
//! use aidgrid::raster::AreaRasterizer;
//! use geo::Point;
//!
//! let grid = CoarseGrid::from_extent(0.0, 0.0, 2.0, 2.0, 1.0).unwrap();
//! let location = ResolvedLocation {
//!     record: LocationRecord {
//!         location_id: "L1".to_string(),
//!         project_id: "P1".to_string(),
//!         precision_code: "1".to_string(),
//!         longitude: 0.4,
//!         latitude: 1.6,
//!         aid_share: 100.0,
//!     },
//!     geometry: AggregationGeometry::Point(Point::new(0.4, 1.6)),
//! };
//!
//! let raster = AreaRasterizer::new(&grid, 10).rasterize(&location);
//! assert_eq!(raster.deltas, vec![(0, 100.0)]);
//! ```

use crate::geometry::{AggregationGeometry, Footprint, ResolvedLocation};
use crate::grid::{CoarseGrid, FineGrid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default fine nodes per coarse pixel along each axis
pub const DEFAULT_FINE_SUBDIVISIONS: u32 = 10;

/// How a location's share was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RasterOutcome {
    /// Whole share to a single cell
    Point,
    /// Share split across `fine_cells` contained fine nodes
    Area { fine_cells: u64 },
    /// No fine node fell inside the footprint; nothing contributed
    ZeroCoverage,
    /// The point's cell lies outside the grid
    OutOfGrid,
}

/// Sparse contribution of one location to the mean surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRaster {
    /// `(cell index, aid)` pairs, ascending by cell, one entry per cell
    pub deltas: Vec<(u32, f64)>,
    pub outcome: RasterOutcome,
    /// Fine nodes whose nearest coarse cell lies outside the grid
    pub dropped_out_of_grid: u64,
}

impl LocationRaster {
    fn empty(outcome: RasterOutcome) -> Self {
        Self {
            deltas: Vec::new(),
            outcome,
            dropped_out_of_grid: 0,
        }
    }

    /// Sum of all deltas
    pub fn total(&self) -> f64 {
        self.deltas.iter().map(|(_, aid)| aid).sum()
    }
}

/// Area-weighted rasterizer bound to one coarse grid
#[derive(Debug, Clone, Copy)]
pub struct AreaRasterizer<'a> {
    grid: &'a CoarseGrid,
    fine_subdivisions: u32,
}

impl<'a> AreaRasterizer<'a> {
    pub fn new(grid: &'a CoarseGrid, fine_subdivisions: u32) -> Self {
        Self {
            grid,
            fine_subdivisions: fine_subdivisions.max(1),
        }
    }

    pub fn rasterize(&self, location: &ResolvedLocation) -> LocationRaster {
        let aid = location.record.aid_share;
        match &location.geometry {
            AggregationGeometry::Point(point) => match self.grid.index_of(point.x(), point.y()) {
                Some(index) => LocationRaster {
                    deltas: vec![(index as u32, aid)],
                    outcome: RasterOutcome::Point,
                    dropped_out_of_grid: 0,
                },
                None => LocationRaster::empty(RasterOutcome::OutOfGrid),
            },
            AggregationGeometry::Buffer { footprint, .. } | AggregationGeometry::AdminArea { footprint, .. } => {
                self.rasterize_area(footprint, aid)
            }
        }
    }

    fn rasterize_area(&self, footprint: &Footprint, aid: f64) -> LocationRaster {
        let fine = FineGrid::covering(footprint.bounds(), self.grid.scale(), self.fine_subdivisions);
        let inside: Vec<_> = fine.nodes().filter(|node| footprint.contains(node.coord)).collect();
        if inside.is_empty() {
            return LocationRaster::empty(RasterOutcome::ZeroCoverage);
        }

        let share = aid / inside.len() as f64;
        let mut cells: BTreeMap<usize, f64> = BTreeMap::new();
        let mut dropped = 0;
        for node in &inside {
            match self.grid.index_of_fine(node.x_units, node.y_units, self.fine_subdivisions) {
                Some(index) => *cells.entry(index).or_insert(0.0) += share,
                None => dropped += 1,
            }
        }

        LocationRaster {
            deltas: cells.into_iter().map(|(index, aid)| (index as u32, aid)).collect(),
            outcome: RasterOutcome::Area {
                fine_cells: inside.len() as u64,
            },
            dropped_out_of_grid: dropped,
        }
    }
}
