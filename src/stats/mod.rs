//! Statistics reduction
//!
//! Reduces the Monte Carlo stacks to per-cell statistics once every iteration
//! has been stored:
//!
//! - **mean / std of aid**: over `aid_sum` rows
//! - **mean / std of count**: over `location_count` rows
//! - **error surface**: `|mean_surface - mean_aid|` per cell
//! - **error**: mean of the error surface
//!
//! Standard deviations are population standard deviations (divide by the
//! iteration count).

pub mod aggregator;

use crate::Result;
use aggregator::IterationStack;

/// Per-cell statistics over all iterations
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStatistics {
    pub iterations: usize,
    pub mean_aid: Vec<f64>,
    pub std_aid: Vec<f64>,
    pub mean_count: Vec<f64>,
    pub std_count: Vec<f64>,
    pub error_surface: Vec<f64>,
    /// Mean of `error_surface`
    pub error: f64,
}

/// Elementwise mean and population std of equal-length rows
fn mean_and_std<'a, I>(rows: I, cells: usize) -> (Vec<f64>, Vec<f64>)
where
    I: Iterator<Item = &'a [u64]> + Clone,
{
    let mut mean = vec![0.0; cells];
    let mut n = 0usize;
    for row in rows.clone() {
        for (m, &v) in mean.iter_mut().zip(row) {
            *m += v as f64;
        }
        n += 1;
    }
    if n == 0 {
        return (mean, vec![0.0; cells]);
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);

    let mut var = vec![0.0; cells];
    for row in rows {
        for ((s, &v), m) in var.iter_mut().zip(row).zip(&mean) {
            let d = v as f64 - m;
            *s += d * d;
        }
    }
    let std = var.into_iter().map(|s| (s / n as f64).sqrt()).collect();

    (mean, std)
}

impl AggregateStatistics {
    /// Reduce a complete stack against the mean surface
    pub fn reduce(mean_surface: &[f64], stack: &IterationStack) -> Result<Self> {
        if !stack.is_complete() {
            anyhow::bail!(
                "Iteration stack incomplete: {} of {} iterations stored",
                stack.filled(),
                stack.iterations()
            );
        }
        if mean_surface.len() != stack.cells() {
            anyhow::bail!(
                "Mean surface has {} cells, iteration stack has {}",
                mean_surface.len(),
                stack.cells()
            );
        }

        let cells = stack.cells();
        let (mean_aid, std_aid) = mean_and_std(stack.aid_rows(), cells);
        let (mean_count, std_count) = mean_and_std(stack.count_rows(), cells);

        let error_surface: Vec<f64> = mean_surface
            .iter()
            .zip(&mean_aid)
            .map(|(surface, aid)| (surface - aid).abs())
            .collect();
        let error = if cells == 0 {
            0.0
        } else {
            error_surface.iter().sum::<f64>() / cells as f64
        };

        Ok(Self {
            iterations: stack.iterations(),
            mean_aid,
            std_aid,
            mean_count,
            std_count,
            error_surface,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::aggregator::MeanSurfaceAggregator;
    use super::*;
    use crate::geometry::{AggregationGeometry, Footprint, ResolvedLocation};
    use crate::grid::CoarseGrid;
    use crate::input::LocationRecord;
    use crate::raster::AreaRasterizer;
    use crate::sampling::{IterationGrids, MonteCarloSampler, SampleCounters, DEFAULT_MAX_SAMPLE_ATTEMPTS};
    use geo::{polygon, MultiPolygon};

    fn push(stack: &mut IterationStack, iteration: u32, aid: Vec<u64>, count: Vec<u64>) {
        stack
            .insert(IterationGrids {
                iteration,
                aid_sum: aid,
                location_count: count,
                counters: SampleCounters::default(),
            })
            .unwrap();
    }

    #[test]
    fn test_reduce_mean_std() {
        let mut stack = IterationStack::new(2, 3);
        push(&mut stack, 0, vec![10, 0, 4], vec![1, 0, 2]);
        push(&mut stack, 1, vec![0, 0, 4], vec![0, 0, 2]);

        let stats = AggregateStatistics::reduce(&[5.0, 1.0, 4.0], &stack).unwrap();
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.mean_aid, vec![5.0, 0.0, 4.0]);
        assert_eq!(stats.std_aid, vec![5.0, 0.0, 0.0]);
        assert_eq!(stats.mean_count, vec![0.5, 0.0, 2.0]);
        assert_eq!(stats.std_count, vec![0.5, 0.0, 0.0]);
        assert_eq!(stats.error_surface, vec![0.0, 1.0, 0.0]);
        assert!((stats.error - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_reduce_single_iteration_has_zero_std() {
        let mut stack = IterationStack::new(1, 2);
        push(&mut stack, 0, vec![3, 7], vec![1, 1]);

        let stats = AggregateStatistics::reduce(&[3.0, 7.0], &stack).unwrap();
        assert_eq!(stats.std_aid, vec![0.0, 0.0]);
        assert_eq!(stats.error, 0.0);
    }

    #[test]
    fn test_reduce_requires_complete_stack() {
        let mut stack = IterationStack::new(2, 1);
        push(&mut stack, 1, vec![1], vec![1]);
        assert!(AggregateStatistics::reduce(&[0.0], &stack).is_err());
    }

    #[test]
    fn test_reduce_rejects_shape_mismatch() {
        let mut stack = IterationStack::new(1, 2);
        push(&mut stack, 0, vec![1, 1], vec![1, 1]);
        assert!(AggregateStatistics::reduce(&[0.0], &stack).is_err());
    }

    fn error_after(iterations: u32, grid: &CoarseGrid, locations: &[ResolvedLocation], surface: &[f64]) -> f64 {
        let sampler = MonteCarloSampler::new(grid, locations, 2024, DEFAULT_MAX_SAMPLE_ATTEMPTS);
        let mut stack = IterationStack::new(iterations as usize, grid.len());
        for i in 0..iterations {
            stack.insert(sampler.run_iteration(i)).unwrap();
        }
        AggregateStatistics::reduce(surface, &stack).unwrap().error
    }

    #[test]
    fn test_error_shrinks_with_iterations() {
        let grid = CoarseGrid::from_extent(0.0, 0.0, 4.0, 4.0, 0.5).unwrap();
        let footprint = Footprint::new(MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 0.0),
            (x: 2.0, y: 4.0),
            (x: 0.0, y: 4.0),
            (x: 0.0, y: 0.0),
        ]]))
        .unwrap();
        let locations: Vec<ResolvedLocation> = (0..10)
            .map(|i| ResolvedLocation {
                record: LocationRecord {
                    location_id: format!("L{}", i),
                    project_id: "P".to_string(),
                    precision_code: "3".to_string(),
                    longitude: 1.0,
                    latitude: 2.0,
                    aid_share: 100.0,
                },
                geometry: AggregationGeometry::AdminArea {
                    level: 2,
                    footprint: footprint.clone(),
                },
            })
            .collect();

        let rasterizer = AreaRasterizer::new(&grid, 10);
        let mut surface = MeanSurfaceAggregator::new(grid.len());
        for location in &locations {
            surface.add(&rasterizer.rasterize(location));
        }
        assert!((surface.total() - 1000.0).abs() < 1e-6);

        let coarse = error_after(10, &grid, &locations, surface.values());
        let fine = error_after(1000, &grid, &locations, surface.values());
        assert!(fine < coarse, "error with 1000 iterations {} not below 10 iterations {}", fine, coarse);
    }
}
