//! Phase result aggregation
//!
//! Both aggregators are commutative: results may arrive from any worker in any
//! order and the final grids are the same.
//!
//! - [`MeanSurfaceAggregator`] sums sparse per-location deltas (phase 3)
//! - [`IterationStack`] stores each iteration's vectors in the slot of its
//!   index (phase 4), so the stack is ordered by iteration, not arrival
//!
//! # Example
//!
//! ```
//! use aidgrid::raster::{LocationRaster, RasterOutcome};
//! use aidgrid::stats::aggregator::MeanSurfaceAggregator;
//!
//! let mut surface = MeanSurfaceAggregator::new(4);
//! surface.add(&LocationRaster {
//!     deltas: vec![(0, 1.5), (3, 2.0)],
//!     outcome: RasterOutcome::Area { fine_cells: 2 },
//!     dropped_out_of_grid: 0,
//! });
//! surface.add(&LocationRaster {
//!     deltas: vec![(3, 1.0)],
//!     outcome: RasterOutcome::Point,
//!     dropped_out_of_grid: 0,
//! });
//!
//! assert_eq!(surface.values(), &[1.5, 0.0, 0.0, 3.0]);
//! ```

use crate::raster::{LocationRaster, RasterOutcome};
use crate::sampling::{IterationGrids, SampleCounters};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Placement tallies for the mean surface pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterCounters {
    pub points: u64,
    pub areas: u64,
    pub zero_coverage: u64,
    pub out_of_grid: u64,
    /// Fine nodes dropped because their cell is outside the grid
    pub dropped_fine_cells: u64,
}

/// Running sum of location rasters
#[derive(Debug, Clone)]
pub struct MeanSurfaceAggregator {
    surface: Vec<f64>,
    counters: RasterCounters,
}

impl MeanSurfaceAggregator {
    pub fn new(cells: usize) -> Self {
        Self {
            surface: vec![0.0; cells],
            counters: RasterCounters::default(),
        }
    }

    /// Add one location's deltas; indices past the grid are ignored
    pub fn add(&mut self, raster: &LocationRaster) {
        for &(index, aid) in &raster.deltas {
            if let Some(cell) = self.surface.get_mut(index as usize) {
                *cell += aid;
            }
        }

        match raster.outcome {
            RasterOutcome::Point => self.counters.points += 1,
            RasterOutcome::Area { .. } => self.counters.areas += 1,
            RasterOutcome::ZeroCoverage => self.counters.zero_coverage += 1,
            RasterOutcome::OutOfGrid => self.counters.out_of_grid += 1,
        }
        self.counters.dropped_fine_cells += raster.dropped_out_of_grid;
    }

    pub fn values(&self) -> &[f64] {
        &self.surface
    }

    pub fn counters(&self) -> RasterCounters {
        self.counters
    }

    /// Total aid on the surface
    pub fn total(&self) -> f64 {
        self.surface.iter().sum()
    }

    pub fn into_values(self) -> Vec<f64> {
        self.surface
    }
}

/// One iteration's vectors
#[derive(Debug, Clone, PartialEq)]
struct StackSlot {
    aid_sum: Vec<u64>,
    location_count: Vec<u64>,
}

/// `iterations × cells` stacks of aid and count vectors
#[derive(Debug, Clone)]
pub struct IterationStack {
    cells: usize,
    slots: Vec<Option<StackSlot>>,
    counters: SampleCounters,
}

impl IterationStack {
    pub fn new(iterations: usize, cells: usize) -> Self {
        Self {
            cells,
            slots: vec![None; iterations],
            counters: SampleCounters::default(),
        }
    }

    /// Store an iteration in its slot
    ///
    /// Fails when the index is out of range, the slot is already filled or
    /// the vector length does not match the grid.
    pub fn insert(&mut self, grids: IterationGrids) -> Result<()> {
        let index = grids.iteration as usize;
        let cells = self.cells;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("Iteration {} out of range", index))?;

        if slot.is_some() {
            anyhow::bail!("Iteration {} already stored", index);
        }
        if grids.aid_sum.len() != cells || grids.location_count.len() != cells {
            anyhow::bail!(
                "Iteration {} has {} cells, grid has {}",
                index,
                grids.aid_sum.len(),
                cells
            );
        }

        self.counters.merge(&grids.counters);
        *slot = Some(StackSlot {
            aid_sum: grids.aid_sum,
            location_count: grids.location_count,
        });
        Ok(())
    }

    pub fn iterations(&self) -> usize {
        self.slots.len()
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    /// Number of iterations stored so far
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Counters summed over every stored iteration
    pub fn counters(&self) -> SampleCounters {
        self.counters
    }

    /// Aid row of each stored iteration, by iteration index
    pub(crate) fn aid_rows(&self) -> impl Iterator<Item = &[u64]> + Clone {
        self.slots.iter().flatten().map(|s| s.aid_sum.as_slice())
    }

    /// Count row of each stored iteration, by iteration index
    pub(crate) fn count_rows(&self) -> impl Iterator<Item = &[u64]> + Clone {
        self.slots.iter().flatten().map(|s| s.location_count.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grids(iteration: u32, aid: Vec<u64>, count: Vec<u64>) -> IterationGrids {
        IterationGrids {
            iteration,
            aid_sum: aid,
            location_count: count,
            counters: SampleCounters {
                placed: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_mean_surface_counters() {
        let mut surface = MeanSurfaceAggregator::new(2);
        surface.add(&LocationRaster {
            deltas: vec![(1, 4.0)],
            outcome: RasterOutcome::Area { fine_cells: 3 },
            dropped_out_of_grid: 2,
        });
        surface.add(&LocationRaster {
            deltas: vec![],
            outcome: RasterOutcome::ZeroCoverage,
            dropped_out_of_grid: 0,
        });

        let counters = surface.counters();
        assert_eq!(counters.areas, 1);
        assert_eq!(counters.zero_coverage, 1);
        assert_eq!(counters.dropped_fine_cells, 2);
        assert_eq!(surface.total(), 4.0);
    }

    #[test]
    fn test_mean_surface_order_independent() {
        let rasters = vec![
            LocationRaster {
                deltas: vec![(0, 0.25), (2, 0.5)],
                outcome: RasterOutcome::Area { fine_cells: 2 },
                dropped_out_of_grid: 0,
            },
            LocationRaster {
                deltas: vec![(2, 1.0)],
                outcome: RasterOutcome::Point,
                dropped_out_of_grid: 0,
            },
        ];

        let mut forward = MeanSurfaceAggregator::new(3);
        rasters.iter().for_each(|r| forward.add(r));
        let mut backward = MeanSurfaceAggregator::new(3);
        rasters.iter().rev().for_each(|r| backward.add(r));

        assert_eq!(forward.values(), backward.values());
    }

    #[test]
    fn test_stack_orders_by_iteration() {
        let mut stack = IterationStack::new(3, 2);
        stack.insert(grids(2, vec![3, 0], vec![1, 0])).unwrap();
        stack.insert(grids(0, vec![1, 0], vec![1, 0])).unwrap();
        assert!(!stack.is_complete());
        assert_eq!(stack.filled(), 2);

        stack.insert(grids(1, vec![0, 2], vec![0, 1])).unwrap();
        assert!(stack.is_complete());

        let rows: Vec<&[u64]> = stack.aid_rows().collect();
        assert_eq!(rows, vec![&[1u64, 0][..], &[0, 2][..], &[3, 0][..]]);
        assert_eq!(stack.counters().placed, 3);
    }

    #[test]
    fn test_stack_rows_can_be_walked_twice() {
        let mut stack = IterationStack::new(2, 2);
        stack.insert(grids(0, vec![4, 0], vec![1, 0])).unwrap();
        stack.insert(grids(1, vec![0, 6], vec![0, 1])).unwrap();

        // Mean and std passes each walk the rows
        let counts = stack.count_rows();
        let first: Vec<&[u64]> = counts.clone().collect();
        let second: Vec<&[u64]> = counts.collect();
        assert_eq!(first, second);
        assert_eq!(stack.aid_rows().clone().count(), 2);
    }

    #[test]
    fn test_stack_rejects_duplicate_and_out_of_range() {
        let mut stack = IterationStack::new(2, 1);
        stack.insert(grids(0, vec![1], vec![1])).unwrap();
        assert!(stack.insert(grids(0, vec![1], vec![1])).is_err());
        assert!(stack.insert(grids(5, vec![1], vec![1])).is_err());
        assert!(stack.insert(grids(1, vec![1, 2], vec![1, 2])).is_err());
        assert_eq!(stack.counters().placed, 1);
    }
}
