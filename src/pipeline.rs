//! Run setup and phase sequencing
//!
//! # Setup
//!
//! Every process (standalone, coordinator and each node service) builds the
//! same [`RunContext`] from the same [`RunConfig`]:
//!
//! 1. validate the configuration
//! 2. load and merge the tables, load the boundaries
//! 3. build the coarse grid over the country
//! 4. resolve every location's aggregation geometry
//!
//! Task indices refer to positions in the resolved location list, so the
//! setup must be deterministic. Nodes confirm it by reporting the grid shape
//! and resolved count in their `Hello`.
//!
//! # Phases
//!
//! [`Pipeline::run`] drives the coordinator side:
//!
//! - **Mean surface**: one `RasterizeLocation` task per resolved location,
//!   summed into the mean surface, written before the next phase starts
//! - **Monte Carlo**: one `RunIteration` task per iteration, stacked by
//!   iteration index and reduced to the statistics grids
//!
//! Each phase gets a fresh worker pool, joined whether the phase succeeds or
//! not.

use crate::config::validator::validate_config;
use crate::config::RunConfig;
use crate::distributed::coordinator::{PhaseReport, ResultSink, TaskCoordinator, WorkerPool};
use crate::distributed::local::spawn_local_workers;
use crate::distributed::protocol::{Phase, Task, TaskResult};
use crate::distributed::remote::connect_pool;
use crate::geometry::{Boundaries, GeometryResolver, RejectionCounts, ResolvedLocation};
use crate::grid::CoarseGrid;
use crate::input::{load_boundaries, load_records, LocationRecord};
use crate::output::asc::write_asc;
use crate::output::json::{
    write_json_output, JsonDuration, LocationSummary, MeanSurfaceSummary, MonteCarloSummary, PhaseSummary,
    RunSummary,
};
use crate::output::text::write_text_output;
use crate::output::RunDirectory;
use crate::raster::AreaRasterizer;
use crate::sampling::MonteCarloSampler;
use crate::stats::aggregator::{IterationStack, MeanSurfaceAggregator};
use crate::stats::AggregateStatistics;
use crate::worker::TaskExecutor;
use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Read-only state shared by every worker of a process
#[derive(Debug)]
pub struct RunContext {
    config: RunConfig,
    grid: CoarseGrid,
    locations: Vec<ResolvedLocation>,
    rejections: RejectionCounts,
    loaded: usize,
}

impl RunContext {
    /// Validate the configuration, read the inputs and resolve geometries
    ///
    /// Resolves the seed if the configuration has none.
    pub fn prepare(config: &RunConfig) -> Result<Self> {
        validate_config(config).context("Invalid configuration")?;

        let records = load_records(&config.inputs.data_dir, &config.inputs.fields)
            .with_context(|| format!("Failed to load records from {}", config.inputs.data_dir.display()))?;
        let boundaries = load_boundaries(&config.inputs.boundary_paths).context("Failed to load boundaries")?;

        Self::from_parts(config.clone(), &boundaries, records)
    }

    /// Build from already loaded inputs
    pub fn from_parts(config: RunConfig, boundaries: &Boundaries, records: Vec<LocationRecord>) -> Result<Self> {
        let config = config.with_resolved_seed();
        let grid = CoarseGrid::new(boundaries.country(), config.grid.pixel_size)
            .context("Failed to build coarse grid")?;

        let loaded = records.len();
        let resolution = GeometryResolver::new(&config.lookup, boundaries).resolve_all(records);

        tracing::info!(
            rows = grid.rows(),
            cols = grid.cols(),
            loaded,
            resolved = resolution.locations.len(),
            rejected = resolution.rejections.total(),
            "Run prepared"
        );

        Ok(Self {
            config,
            grid,
            locations: resolution.locations,
            rejections: resolution.rejections,
            loaded,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn grid(&self) -> &CoarseGrid {
        &self.grid
    }

    pub fn locations(&self) -> &[ResolvedLocation] {
        &self.locations
    }

    pub fn rejections(&self) -> &RejectionCounts {
        &self.rejections
    }

    /// Records read before resolution
    pub fn loaded(&self) -> usize {
        self.loaded
    }

    /// Every task of a phase, in dispatch order
    pub fn tasks(&self, phase: Phase) -> Vec<Task> {
        match phase {
            Phase::MeanSurface => (0..self.locations.len() as u32).map(Task::RasterizeLocation).collect(),
            Phase::MonteCarlo => (0..self.config.sampling.iterations).map(Task::RunIteration).collect(),
        }
    }
}

impl TaskExecutor for RunContext {
    fn execute(&self, task: Task) -> Result<TaskResult> {
        match task {
            Task::RasterizeLocation(index) => {
                let location = self
                    .locations
                    .get(index as usize)
                    .ok_or_else(|| anyhow::anyhow!("Location {} out of range ({} resolved)", index, self.locations.len()))?;
                let rasterizer = AreaRasterizer::new(&self.grid, self.config.grid.fine_subdivisions);
                Ok(TaskResult::Raster(rasterizer.rasterize(location)))
            }
            Task::RunIteration(iteration) => {
                if iteration >= self.config.sampling.iterations {
                    anyhow::bail!(
                        "Iteration {} out of range ({} configured)",
                        iteration,
                        self.config.sampling.iterations
                    );
                }
                let sampler = MonteCarloSampler::new(
                    &self.grid,
                    &self.locations,
                    self.config.seed(),
                    self.config.sampling.max_sample_attempts,
                );
                Ok(TaskResult::Iteration(sampler.run_iteration(iteration)))
            }
        }
    }
}

impl ResultSink for MeanSurfaceAggregator {
    fn accept(&mut self, task: Task, result: TaskResult) -> Result<()> {
        match result {
            TaskResult::Raster(raster) => {
                self.add(&raster);
                Ok(())
            }
            TaskResult::Iteration(_) => anyhow::bail!("{} returned an iteration result", task),
        }
    }
}

impl ResultSink for IterationStack {
    fn accept(&mut self, task: Task, result: TaskResult) -> Result<()> {
        match result {
            TaskResult::Iteration(grids) if grids.iteration == task.index() => self.insert(grids),
            TaskResult::Iteration(grids) => {
                anyhow::bail!("{} returned iteration {}", task, grids.iteration)
            }
            TaskResult::Raster(_) => anyhow::bail!("{} returned a raster result", task),
        }
    }
}

/// Where a phase's workers come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSource {
    /// Threads in this process
    Local { workers: usize },
    /// Slots of node services at these addresses
    Remote { nodes: Vec<String> },
}

/// Files and summary of a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output_dir: PathBuf,
    pub summary: RunSummary,
    pub statistics: AggregateStatistics,
}

/// Coordinator-side run driver
pub struct Pipeline {
    context: Arc<RunContext>,
    source: WorkerSource,
}

impl Pipeline {
    pub fn new(context: Arc<RunContext>, source: WorkerSource) -> Self {
        Self { context, source }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    async fn open_pool(&self, phase: Phase) -> Result<WorkerPool> {
        match &self.source {
            WorkerSource::Local { workers } => spawn_local_workers(*workers, self.context.clone()),
            WorkerSource::Remote { nodes } => connect_pool(nodes, phase, &self.context).await,
        }
    }

    /// Run one phase on a fresh pool
    pub async fn run_phase<S: ResultSink>(&self, phase: Phase, sink: &mut S) -> Result<PhaseReport> {
        let tasks = self.context.tasks(phase);
        tracing::info!(%phase, tasks = tasks.len(), "Phase started");

        let mut pool = self.open_pool(phase).await?;
        let coordinator = TaskCoordinator::new(tasks, self.context.config().dispatch_settings());
        let outcome = coordinator.run(&mut pool, sink).await;
        let joined = pool.join().await;

        let report = outcome.with_context(|| format!("{} phase failed", phase))?;
        if let Err(e) = joined {
            tracing::warn!(%phase, error = %format!("{:#}", e), "Worker shutdown reported an error");
        }

        tracing::info!(
            %phase,
            tasks = report.tasks,
            workers = report.workers,
            redispatched = report.redispatched,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Phase complete"
        );
        Ok(report)
    }

    fn base_summary(&self, start_time: &chrono::DateTime<chrono::Local>) -> RunSummary {
        let config = self.context.config();
        RunSummary {
            start_time: start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            country: config.country.clone(),
            abbr: config.abbr.clone(),
            pixel_size: config.grid.pixel_size,
            iterations: config.sampling.iterations,
            seed: config.seed(),
            nodata: config.output.nodata,
            subset: config.output.subset.clone(),
            aid_field: config.inputs.fields.aid.clone(),
            code_field: config.inputs.fields.precision_code.clone(),
            bounds: self.context.grid().bounds(),
            grid: self.context.grid().shape(),
            fine_subdivisions: config.grid.fine_subdivisions,
            locations: LocationSummary {
                loaded: self.context.loaded(),
                resolved: self.context.locations().len(),
                rejected: self.context.rejections().clone(),
            },
            mean_surface: None,
            monte_carlo: None,
            total_runtime: None,
        }
    }

    fn write_summary(dir: &RunDirectory, summary: &RunSummary) -> Result<()> {
        write_json_output(&dir.file("results.json"), summary)?;
        write_text_output(&dir.file("results.txt"), summary)
    }

    /// Run both phases and write every output file
    pub async fn run(&self) -> Result<RunOutcome> {
        let started_at = chrono::Local::now();
        let started = Instant::now();
        let config = self.context.config();
        let grid = self.context.grid();
        let nodata = config.output.nodata;

        let dir = RunDirectory::create(config, started_at)?;
        let mut summary = self.base_summary(&started_at);

        // Mean surface
        let mut surface = MeanSurfaceAggregator::new(grid.len());
        let report = self.run_phase(Phase::MeanSurface, &mut surface).await?;
        write_asc(&dir.grid_file("mean_surf"), grid, surface.values(), nodata)?;
        summary.mean_surface = Some(MeanSurfaceSummary {
            phase: PhaseSummary::from(&report),
            counters: surface.counters(),
            total_aid: surface.total(),
        });
        Self::write_summary(&dir, &summary)?;

        // Monte Carlo
        let mut stack = IterationStack::new(config.sampling.iterations as usize, grid.len());
        let report = self.run_phase(Phase::MonteCarlo, &mut stack).await?;
        let statistics = AggregateStatistics::reduce(surface.values(), &stack)?;

        write_asc(&dir.grid_file("mean_aid"), grid, &statistics.mean_aid, nodata)?;
        write_asc(&dir.grid_file("std_aid"), grid, &statistics.std_aid, nodata)?;
        write_asc(&dir.grid_file("mean_count"), grid, &statistics.mean_count, nodata)?;
        write_asc(&dir.grid_file("std_count"), grid, &statistics.std_count, nodata)?;
        write_asc(&dir.grid_file("error_surf"), grid, &statistics.error_surface, nodata)?;

        summary.monte_carlo = Some(MonteCarloSummary {
            phase: PhaseSummary::from(&report),
            counters: stack.counters(),
            error: statistics.error,
        });
        summary.total_runtime = Some(JsonDuration::from_duration(started.elapsed()));
        Self::write_summary(&dir, &summary)?;

        tracing::info!(error = statistics.error, dir = %dir.path().display(), "Run complete");

        Ok(RunOutcome {
            output_dir: dir.path().to_path_buf(),
            summary,
            statistics,
        })
    }
}
