//! jobgraph - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use jobgraph::driver::{self, load, stress};
use jobgraph::util::config::{self, RuntimeConfig};
use jobgraph::util::logger::{self, LogLevel};
use jobgraph::{NAME, VERSION};

/// Dependency-graph job scheduler and load-once resource cache
#[derive(Parser, Debug)]
#[command(name = "jobgraph")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $JOBGRAPH_CONFIG, then ~/.config/jobgraph/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load files through the resource cache on the runner pool
    Load {
        /// Files or directories to load
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Only load files with this extension when walking directories
        #[arg(short, long)]
        extension: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a random layered job graph and verify its ordering
    Stress {
        /// Number of stages
        #[arg(long, default_value_t = 10_000)]
        stages: usize,

        /// Number of layers
        #[arg(long, default_value_t = 16)]
        layers: usize,

        /// Maximum prerequisites per stage
        #[arg(long, default_value_t = 3)]
        fan_in: usize,

        /// Busy work per stage in microseconds
        #[arg(long, default_value_t = 0)]
        work_us: u64,

        /// RNG seed, random if omitted
        #[arg(long)]
        seed: Option<u64>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Print version information
    Version,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = config::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let level = match (args.log_level, args.verbose) {
        (Some(level), _) => level,
        (None, true) => LogLevel::Debug,
        (None, false) => config.log.level,
    };
    logger::init_with_filter(level, config.log.filter.as_deref());

    if args.verbose {
        eprintln!("jobgraph version: {}", VERSION);
        eprintln!("Host: {}", std::env::consts::OS);
    }

    match args.command {
        Commands::Load {
            paths,
            extension,
            json,
        } => run_load(&config, &paths, extension.as_deref(), json),
        Commands::Stress {
            stages,
            layers,
            fan_in,
            work_us,
            seed,
            timeout_secs,
            json,
        } => {
            let options = stress::StressOptions {
                stages,
                layers,
                fan_in,
                work: Duration::from_micros(work_us),
                seed,
                timeout: Duration::from_secs(timeout_secs),
            };
            run_stress(&config, &options, json)
        }
        Commands::Config => {
            print!("{}", config::to_toml(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_load(
    config: &RuntimeConfig,
    paths: &[PathBuf],
    extension: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let files = load::collect_files(paths, extension)?;
    let pool = driver::start_pool(config).context("Failed to start runner pool")?;
    let cache = load::FileCache::new(config.cache.capacity).context("Failed to start I/O thread")?;

    let report = load::load_files(&pool, &cache, &files)?;
    pool.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "loaded {}/{} files ({} bytes) in {} ms, {} failed",
            report.loaded, report.requested, report.bytes, report.elapsed_ms, report.failed
        );
    }
    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_stress(
    config: &RuntimeConfig,
    options: &stress::StressOptions,
    json: bool,
) -> Result<ExitCode> {
    let pool = driver::start_pool(config).context("Failed to start runner pool")?;
    let report = stress::run(&pool, options)?;
    pool.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = &report.scheduler;
        println!(
            "{} stages, {} edges, {} layers in {} ms (seed {})",
            report.stages, report.edges, report.layers, report.elapsed_ms, report.seed
        );
        println!(
            "completed {} | cooperative {} | stolen {}/{} | peak parallelism {} | panics {}",
            stats.stages_completed,
            stats.stages_run_cooperatively,
            stats.steal_success,
            stats.steal_attempts,
            stats.peak_parallelism,
            stats.stages_panicked
        );
        println!(
            "miscounted {} | ordering violations {}",
            report.miscounted, report.violations
        );
    }
    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
