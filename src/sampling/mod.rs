//! Monte Carlo sampling
//!
//! One iteration draws a single representative point per resolved location
//! and accumulates two coarse-grid vectors:
//!
//! - `aid_sum`: rounded aid share of every placed location, per cell
//! - `location_count`: number of locations placed in each cell
//!
//! Points keep their coordinates. Polygons are rejection-sampled uniformly
//! inside their bounding box; after `max_attempts` misses the footprint's
//! interior point is used instead and the fallback is counted.
//!
//! # Seeding
//!
//! Each iteration seeds its own xoshiro256++ generator from the run seed and
//! the iteration index (mixed through SplitMix64), and visits locations in
//! resolved order. An iteration's output therefore depends only on the seed,
//! the iteration index and the inputs, whichever worker runs it.

use crate::geometry::{AggregationGeometry, Footprint, ResolvedLocation};
use crate::grid::CoarseGrid;
use geo::{Coord, InteriorPoint};
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// Default rejection-sampling attempts per location
pub const DEFAULT_MAX_SAMPLE_ATTEMPTS: u32 = 10_000;

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Generator seed for one iteration of a run
pub fn iteration_seed(run_seed: u64, iteration: u32) -> u64 {
    splitmix64(run_seed ^ splitmix64(iteration as u64))
}

/// Per-iteration placement tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounters {
    /// Locations added to both vectors
    pub placed: u64,
    /// Rounded aid share was not positive
    pub zero_aid: u64,
    /// Sample rounded to a cell outside the grid
    pub out_of_grid: u64,
    /// Rejection sampling gave up; interior point used
    pub fallbacks: u64,
}

impl SampleCounters {
    pub fn merge(&mut self, other: &SampleCounters) {
        self.placed += other.placed;
        self.zero_aid += other.zero_aid;
        self.out_of_grid += other.out_of_grid;
        self.fallbacks += other.fallbacks;
    }
}

/// Output of one Monte Carlo iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationGrids {
    pub iteration: u32,
    pub aid_sum: Vec<u64>,
    pub location_count: Vec<u64>,
    pub counters: SampleCounters,
}

/// Randomized pass over the resolved locations
#[derive(Debug, Clone, Copy)]
pub struct MonteCarloSampler<'a> {
    grid: &'a CoarseGrid,
    locations: &'a [ResolvedLocation],
    run_seed: u64,
    max_attempts: u32,
}

impl<'a> MonteCarloSampler<'a> {
    pub fn new(grid: &'a CoarseGrid, locations: &'a [ResolvedLocation], run_seed: u64, max_attempts: u32) -> Self {
        Self {
            grid,
            locations,
            run_seed,
            max_attempts,
        }
    }

    /// Run iteration `iteration`
    pub fn run_iteration(&self, iteration: u32) -> IterationGrids {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(iteration_seed(self.run_seed, iteration));
        let mut aid_sum = vec![0u64; self.grid.len()];
        let mut location_count = vec![0u64; self.grid.len()];
        let mut counters = SampleCounters::default();

        for location in self.locations {
            let coord = match &location.geometry {
                AggregationGeometry::Point(point) => point.0,
                AggregationGeometry::Buffer { footprint, .. } | AggregationGeometry::AdminArea { footprint, .. } => {
                    let (coord, fell_back) = self.sample_point(&mut rng, footprint);
                    if fell_back {
                        counters.fallbacks += 1;
                    }
                    coord
                }
            };

            let aid = location.record.aid_share.round();
            if aid <= 0.0 {
                counters.zero_aid += 1;
                continue;
            }

            match self.grid.index_of(coord.x, coord.y) {
                Some(index) => {
                    aid_sum[index] += aid as u64;
                    location_count[index] += 1;
                    counters.placed += 1;
                }
                None => {
                    tracing::debug!(
                        iteration,
                        location = %location.record.location_id,
                        x = coord.x,
                        y = coord.y,
                        "Sample outside grid, skipped"
                    );
                    counters.out_of_grid += 1;
                }
            }
        }

        IterationGrids {
            iteration,
            aid_sum,
            location_count,
            counters,
        }
    }

    /// Uniform point inside the footprint; `true` when the fallback was used
    fn sample_point(&self, rng: &mut Xoshiro256PlusPlus, footprint: &Footprint) -> (Coord<f64>, bool) {
        let bounds = footprint.bounds();
        let (min, max) = (bounds.min(), bounds.max());

        for _ in 0..self.max_attempts {
            let candidate = Coord {
                x: rng.gen_range(min.x..=max.x),
                y: rng.gen_range(min.y..=max.y),
            };
            if footprint.contains(candidate) {
                return (candidate, false);
            }
        }

        let fallback = footprint
            .shape()
            .interior_point()
            .map(|p| p.0)
            .unwrap_or_else(|| bounds.center());
        (fallback, true)
    }
}
