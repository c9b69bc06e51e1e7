use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gridrun::core::errors::format_coordinates;
use gridrun::{
    run_sweep, ArtifactPolicy, GridError, MandelbrotKernel, RunConfig, RunConfigBuilder, RunReport,
    SweepRange, SweepRequest, TaskParameters,
};

/// Compute Mandelbrot stability scores over a grid of the complex plane
#[derive(Parser, Debug)]
#[command(name = "gridrun")]
#[command(version, about, long_about = None, allow_negative_numbers = true)]
struct Cli {
    /// Lower bound of the real axis
    re_min: f64,
    /// Upper bound of the real axis
    re_max: f64,
    /// Lower bound of the imaginary axis
    im_min: f64,
    /// Upper bound of the imaginary axis
    im_max: f64,
    /// Samples per axis; the grid has num_points^2 cells
    num_points: usize,

    /// Result artifact path
    #[arg(long, short, default_value = "mandelbrot.db")]
    output: PathBuf,

    /// Replace an existing artifact
    #[arg(long, conflicts_with = "resume")]
    overwrite: bool,

    /// Continue an existing artifact, computing only unwritten cells
    #[arg(long)]
    resume: bool,

    /// Worker slots (default: physical cores)
    #[arg(long, env = "GRIDRUN_WORKERS")]
    workers: Option<usize>,

    /// Pool restarts allowed over the whole run
    #[arg(long, env = "GRIDRUN_MAX_POOL_RESTARTS")]
    max_pool_restarts: Option<u32>,

    /// Log task errors and keep going instead of aborting
    #[arg(long, env = "GRIDRUN_SUPPRESS_TASK_ERRORS")]
    suppress_task_errors: bool,

    /// Iterations of the quadratic map per point
    #[arg(long, default_value_t = TaskParameters::default().max_iterations)]
    max_iterations: u32,

    /// Escape radius
    #[arg(long, default_value_t = TaskParameters::default().threshold)]
    threshold: f64,

    /// YAML run configuration; flags and environment override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn range(&self) -> SweepRange {
        SweepRange {
            re_min: self.re_min,
            re_max: self.re_max,
            im_min: self.im_min,
            im_max: self.im_max,
            num_points: self.num_points,
        }
    }

    /// Defaults, then the YAML file, then environment and flags
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let mut builder = match &self.config {
            Some(path) => RunConfigBuilder::from_config(
                RunConfig::from_yaml_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
            ),
            None => RunConfig::builder(),
        };
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(max) = self.max_pool_restarts {
            builder = builder.max_pool_restarts(max);
        }
        if self.suppress_task_errors {
            builder = builder.re_raise_exceptions(false);
        }
        if self.overwrite {
            builder = builder.artifact_policy(ArtifactPolicy::Overwrite);
        } else if self.resume {
            builder = builder.artifact_policy(ArtifactPolicy::Resume);
        }
        Ok(builder.build()?)
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: &Cli) -> anyhow::Result<RunReport> {
    let config = cli.run_config()?;
    let request = SweepRequest::new(cli.range(), &cli.output).with_parameters(TaskParameters {
        max_iterations: cli.max_iterations,
        threshold: cli.threshold,
    });
    info!(
        workers = config.workers,
        max_pool_restarts = config.max_pool_restarts,
        policy = ?config.artifact_policy,
        "Resolved run configuration"
    );
    Ok(run_sweep(request, config, Arc::new(MandelbrotKernel)).await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(&cli).await {
        Ok(report) if report.is_complete() => {
            println!(
                "Wrote {} cells to {} in {:.2}s ({} pool restarts)",
                report.completed,
                cli.output.display(),
                report.elapsed.as_secs_f64(),
                report.restarts
            );
            ExitCode::SUCCESS
        }
        Ok(report) => {
            eprintln!(
                "Completed with {} failed task(s); unwritten: {}",
                report.failed.len(),
                format_coordinates(&report.failed_coordinates())
            );
            ExitCode::from(6)
        }
        Err(err) => {
            let code = match err.downcast_ref::<GridError>() {
                Some(grid_err) => {
                    error!(category = grid_err.category(), "{grid_err}");
                    let unwritten = grid_err.unwritten();
                    if !unwritten.is_empty() {
                        eprintln!("Unwritten coordinates: {}", format_coordinates(unwritten));
                    }
                    grid_err.exit_code()
                }
                None => {
                    error!("{err:#}");
                    1
                }
            };
            ExitCode::from(code as u8)
        }
    }
}
