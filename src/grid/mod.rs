//! Coarse output grid and transient fine sub-grids
//!
//! The coarse grid covers the country's bounding box, rounded outward to the
//! pixel size. Every process builds it from the same boundary and pixel size,
//! so the cell index of a coordinate is identical on the coordinator and on
//! every worker without exchanging any state.
//!
//! # Grid units
//!
//! Coordinates are held as integer multiples of the pixel size ("grid units").
//! With `scale = 1 / pixel_size`, a longitude `x` lies nearest to column unit
//! `round(x * scale)`. Bounds and cell centers are therefore exact integers
//! and rounding never depends on accumulated floating point steps.
//!
//! # Layout
//!
//! ```text
//!            west                     east
//!   north  [ 0 ][ 1 ][ 2 ] ... [cols-1]
//!          [cols] ...
//!   south  ...                 [rows*cols-1]
//! ```
//!
//! Rows run north→south, columns west→east, index = `row * cols + col`.

use geo::{Area, BoundingRect, Coord, MultiPolygon, Rect};
use serde::{Deserialize, Serialize};

/// Tolerance used when snapping scaled coordinates onto integer grid units.
const SNAP_EPSILON: f64 = 1e-9;

/// Grid construction errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("invalid pixel size {0}: 1/pixel_size must be a whole number")]
    InvalidPixelSize(f64),

    #[error("country boundary has zero area")]
    EmptyBoundary,
}

/// Number of cells per coordinate unit for a pixel size
///
/// Fails unless `1 / pixel_size` is a positive whole number
/// (1.0, 0.5, 0.25, 0.2, 0.1, 0.05, 0.025, ...).
pub fn pixel_scale(pixel_size: f64) -> Result<u32, GridError> {
    if !pixel_size.is_finite() || pixel_size <= 0.0 {
        return Err(GridError::InvalidPixelSize(pixel_size));
    }

    let inverse = 1.0 / pixel_size;
    let rounded = inverse.round();
    if rounded < 1.0 || rounded > u32::MAX as f64 || (inverse - rounded).abs() > SNAP_EPSILON * rounded {
        return Err(GridError::InvalidPixelSize(pixel_size));
    }

    Ok(rounded as u32)
}

/// Round half away from zero on integers (`n / d`, `d > 0`)
///
/// Matches `f64::round` so fine-grid units map to the same coarse cell as
/// their floating point coordinates would.
pub(crate) fn div_round(n: i64, d: i64) -> i64 {
    if n >= 0 {
        (2 * n + d) / (2 * d)
    } else {
        -((-2 * n + d) / (2 * d))
    }
}

fn snap_floor(value: f64, scale: f64) -> i64 {
    let scaled = value * scale;
    let nearest = scaled.round();
    if (scaled - nearest).abs() < SNAP_EPSILON {
        nearest as i64
    } else {
        scaled.floor() as i64
    }
}

fn snap_ceil(value: f64, scale: f64) -> i64 {
    let scaled = value * scale;
    let nearest = scaled.round();
    if (scaled - nearest).abs() < SNAP_EPSILON {
        nearest as i64
    } else {
        scaled.ceil() as i64
    }
}

/// Rounded country bounds in coordinate units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Grid dimensions, exchanged between processes to confirm identical setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

/// Coarse output grid
#[derive(Debug, Clone, PartialEq)]
pub struct CoarseGrid {
    scale: u32,
    west: i64,
    north: i64,
    rows: usize,
    cols: usize,
}

impl CoarseGrid {
    /// Build the grid covering a country boundary
    pub fn new(country: &MultiPolygon<f64>, pixel_size: f64) -> Result<Self, GridError> {
        let scale = pixel_scale(pixel_size)?;
        if country.unsigned_area() <= 0.0 {
            return Err(GridError::EmptyBoundary);
        }
        let rect = country.bounding_rect().ok_or(GridError::EmptyBoundary)?;
        Ok(Self::from_rect(&rect, scale))
    }

    /// Build the grid covering an explicit extent
    pub fn from_extent(min_x: f64, min_y: f64, max_x: f64, max_y: f64, pixel_size: f64) -> Result<Self, GridError> {
        let scale = pixel_scale(pixel_size)?;
        if !(max_x > min_x && max_y > min_y) {
            return Err(GridError::EmptyBoundary);
        }
        let rect = Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y });
        Ok(Self::from_rect(&rect, scale))
    }

    fn from_rect(rect: &Rect<f64>, scale: u32) -> Self {
        let s = scale as f64;
        let west = snap_floor(rect.min().x, s);
        let south = snap_floor(rect.min().y, s);
        let east = snap_ceil(rect.max().x, s);
        let north = snap_ceil(rect.max().y, s);

        // Both ends inclusive
        Self {
            scale,
            west,
            north,
            rows: (north - south + 1) as usize,
            cols: (east - west + 1) as usize,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of cells (`rows * cols`)
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> GridShape {
        GridShape { rows: self.rows, cols: self.cols }
    }

    /// Cells per coordinate unit (`1 / pixel_size`)
    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn pixel_size(&self) -> f64 {
        1.0 / self.scale as f64
    }

    fn south(&self) -> i64 {
        self.north - self.rows as i64 + 1
    }

    fn east(&self) -> i64 {
        self.west + self.cols as i64 - 1
    }

    /// Rounded bounds; the corner cells' centers sit exactly on them
    pub fn bounds(&self) -> GridBounds {
        let s = self.scale as f64;
        GridBounds {
            min_x: self.west as f64 / s,
            min_y: self.south() as f64 / s,
            max_x: self.east() as f64 / s,
            max_y: self.north as f64 / s,
        }
    }

    /// Index of the cell whose center is nearest to `(lon, lat)`
    ///
    /// Returns `None` when the rounded coordinate falls outside the grid.
    pub fn index_of(&self, lon: f64, lat: f64) -> Option<usize> {
        if !lon.is_finite() || !lat.is_finite() {
            return None;
        }
        let s = self.scale as f64;
        self.index_of_units((lon * s).round() as i64, (lat * s).round() as i64)
    }

    /// Index of the cell at integer grid units `(x, y)`
    pub fn index_of_units(&self, x: i64, y: i64) -> Option<usize> {
        let col = x - self.west;
        let row = self.north - y;
        self.cell_index(row, col)
    }

    /// Index of the coarse cell nearest to a fine-grid node
    ///
    /// `fine_x`/`fine_y` are in units of `pixel_size / subdivisions`.
    pub fn index_of_fine(&self, fine_x: i64, fine_y: i64, subdivisions: u32) -> Option<usize> {
        let d = subdivisions as i64;
        self.index_of_units(div_round(fine_x, d), div_round(fine_y, d))
    }

    /// Index for `(row, col)`, `None` outside the grid
    pub fn cell_index(&self, row: i64, col: i64) -> Option<usize> {
        if row < 0 || col < 0 || row >= self.rows as i64 || col >= self.cols as i64 {
            return None;
        }
        Some(row as usize * self.cols + col as usize)
    }

    /// `(row, col)` of an index
    pub fn cell_of(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.len() {
            return None;
        }
        Some((index / self.cols, index % self.cols))
    }

    /// Center coordinate `(lon, lat)` of a cell
    pub fn cell_center(&self, index: usize) -> Option<(f64, f64)> {
        let (row, col) = self.cell_of(index)?;
        let s = self.scale as f64;
        Some((
            (self.west + col as i64) as f64 / s,
            (self.north - row as i64) as f64 / s,
        ))
    }

    /// Column center longitudes, west→east
    pub fn column_coords(&self) -> impl Iterator<Item = f64> + '_ {
        let s = self.scale as f64;
        (self.west..=self.east()).map(move |x| x as f64 / s)
    }

    /// Row center latitudes, north→south
    pub fn row_coords(&self) -> impl Iterator<Item = f64> + '_ {
        let s = self.scale as f64;
        (self.south()..=self.north).rev().map(move |y| y as f64 / s)
    }
}

/// Transient sub-pixel grid over one geometry's bounding box
///
/// Node spacing is `pixel_size / subdivisions`; the box is rounded outward to
/// that spacing and both ends are inclusive, like the coarse grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FineGrid {
    scale: u64,
    west: i64,
    east: i64,
    south: i64,
    north: i64,
}

/// One fine-grid node: integer fine units plus its coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FineNode {
    pub x_units: i64,
    pub y_units: i64,
    pub coord: Coord<f64>,
}

impl FineGrid {
    /// Cover `rect` at `coarse_scale * subdivisions` nodes per coordinate unit
    pub fn covering(rect: &Rect<f64>, coarse_scale: u32, subdivisions: u32) -> Self {
        let scale = coarse_scale as u64 * subdivisions.max(1) as u64;
        let s = scale as f64;
        Self {
            scale,
            west: snap_floor(rect.min().x, s),
            east: snap_ceil(rect.max().x, s),
            south: snap_floor(rect.min().y, s),
            north: snap_ceil(rect.max().y, s),
        }
    }

    pub fn rows(&self) -> usize {
        (self.north - self.south + 1) as usize
    }

    pub fn cols(&self) -> usize {
        (self.east - self.west + 1) as usize
    }

    pub fn len(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes in scan order (north→south, west→east)
    pub fn nodes(&self) -> impl Iterator<Item = FineNode> + '_ {
        let s = self.scale as f64;
        (self.south..=self.north).rev().flat_map(move |y| {
            (self.west..=self.east).map(move |x| FineNode {
                x_units: x,
                y_units: y,
                coord: Coord { x: x as f64 / s, y: y as f64 / s },
            })
        })
    }
}
