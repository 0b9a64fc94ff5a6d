//! AidGrid CLI entry point

use aidgrid::config::cli::{Cli, ExecutionMode};
use aidgrid::config::toml::load_config;
use aidgrid::distributed::remote::parse_node_list;
use aidgrid::distributed::NodeService;
use aidgrid::output::text::print_summary;
use aidgrid::{Pipeline, RunContext, WorkerSource};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    println!("AidGrid v{}", env!("CARGO_PKG_VERSION"));
    println!("Distributed aid rasterization");
    println!();

    cli.validate()?;

    // Handle different execution modes
    match cli.mode {
        ExecutionMode::Standalone => run_standalone(cli),
        ExecutionMode::Service => run_service(cli),
        ExecutionMode::Coordinator => run_coordinator(cli),
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`, `debug` with --debug)
fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Run in standalone mode (worker threads in this process)
fn run_standalone(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let workers = config.workers.count;

    run_pipeline(&cli, config, WorkerSource::Local { workers })
}

/// Run in coordinator mode (worker slots on node services)
fn run_coordinator(cli: Cli) -> Result<()> {
    let nodes = parse_node_list(cli.host_list.as_deref(), cli.clients_file.as_deref(), cli.worker_port)?;
    let config = load_config(&cli)?;

    run_pipeline(&cli, config, WorkerSource::Remote { nodes })
}

/// Run in service mode (distributed node)
fn run_service(cli: Cli) -> Result<()> {
    let slots = cli.threads.unwrap_or_else(num_cpus::get);

    // Service mode uses tokio runtime
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let service = NodeService::new(cli.listen_port, slots).context("Failed to create node service")?;

        service.run().await
    })
}

fn run_pipeline(cli: &Cli, config: aidgrid::RunConfig, source: WorkerSource) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let context = tokio::task::spawn_blocking(move || RunContext::prepare(&config))
            .await
            .context("Setup task failed")??;

        print_configuration(&context, &source);

        if cli.dry_run {
            println!();
            println!("Dry run mode - configuration validated successfully");
            return Ok(());
        }

        println!();
        println!("Starting run...");
        println!();

        let pipeline = Pipeline::new(Arc::new(context), source);
        let outcome = pipeline.run().await?;

        println!();
        print_summary(&outcome.summary, &outcome.output_dir);
        Ok(())
    })
}

fn print_configuration(context: &RunContext, source: &WorkerSource) {
    let config = context.config();
    let grid = context.grid();
    let bounds = grid.bounds();

    println!("Configuration:");
    println!("  Run:");
    println!("    Country: {} ({})", config.country, config.abbr);
    println!("    Pixel size: {}", config.grid.pixel_size);
    println!("    Iterations: {}", config.sampling.iterations);
    println!("    Seed: {}", config.seed());
    println!("  Inputs:");
    println!("    Data: {}", config.inputs.data_dir.display());
    for (level, path) in config.inputs.boundary_paths.iter().enumerate() {
        println!("    ADM{}: {}", level, path.display());
    }
    println!("  Grid:");
    println!(
        "    Bounds: ({}, {}, {}, {})",
        bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y
    );
    println!("    Cells: {} rows x {} cols", grid.rows(), grid.cols());
    println!("  Locations:");
    println!("    Loaded: {}", context.loaded());
    println!("    Resolved: {}", context.locations().len());
    if context.rejections().total() > 0 {
        println!("    Rejected: {}", context.rejections().total());
    }

    println!("  Workers:");
    match source {
        WorkerSource::Local { workers } => println!("    Threads: {}", workers),
        WorkerSource::Remote { nodes } => {
            for node in nodes {
                println!("    Node: {}", node);
            }
        }
    }
    if let Some(timeout) = config.workers.task_timeout_secs {
        println!("    Task timeout: {}s (max {} retries)", timeout, config.workers.max_task_retries);
    }
}
