// stansim CLI
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stansim::config::PipelineConfig;
use stansim::datagen::{
    replicate_rng, write_stan_json, write_truth_json, DataGenerator, LinearRegression,
};
use stansim::diagnostics::{compute_coverage, IntervalSpec};
use stansim::pipeline::run_pipeline;
use stansim::registry::{
    log_coverage_run, log_generate_run, log_pipeline_run, Registry, RunId, RunLogger,
};
use stansim::report::{
    print_coverage, print_sbc, write_coverage_csv, write_coverage_json, write_outputs,
};
use stansim::stanrun::CmdStanSampler;
use stansim::table::SummaryTable;

#[derive(Parser)]
#[command(name = "stansim")]
#[command(version)]
#[command(about = "Simulation-based coverage checks for Stan models", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Registry directory (default: ~/.stansim/registry)
    #[arg(long, global = true, value_name = "DIR")]
    registry: Option<PathBuf>,

    /// Do not record this run in the registry
    #[arg(long, global = true, conflicts_with = "registry")]
    no_registry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate one dataset and write it as Stan JSON
    Generate {
        /// Number of observations
        #[arg(short = 'n', long, default_value = "10")]
        n: usize,

        /// Random seed (the dataset equals replicate 0 of a pipeline with this seed)
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output Stan data JSON
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Also write the ground-truth parameters here
        #[arg(long, value_name = "TRUTH")]
        truth: Option<PathBuf>,
    },

    /// Run a replicated simulation pipeline and report coverage
    Run {
        /// Pipeline config (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Output directory (overrides the config)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Worker threads (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Recompute coverage from a summaries.csv table
    Coverage {
        /// Summary table written by `stansim run`
        #[arg(value_name = "SUMMARIES")]
        input: PathBuf,

        /// Lower bound column
        #[arg(long, requires = "upper", conflicts_with = "level")]
        lower: Option<String>,

        /// Upper bound column
        #[arg(long, requires = "lower", conflicts_with = "level")]
        upper: Option<String>,

        /// Central interval level, e.g. 0.9 for q5/q95
        #[arg(long)]
        level: Option<f64>,

        /// Write coverage here (.csv or .json)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// List recent registry runs
    Runs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Where (and whether) to record runs
struct RegistryChoice {
    root: Option<PathBuf>,
    disabled: bool,
}

impl RegistryChoice {
    fn open(&self) -> Result<Registry> {
        match &self.root {
            Some(root) => Registry::new(root.clone()),
            None => Registry::new_default(),
        }
    }

    /// Record a finished run; registry problems never fail the command
    fn record(&self, pipeline: Option<&str>, log: impl FnOnce(&RunLogger) -> Result<RunId>) {
        if self.disabled {
            return;
        }
        let project_root = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());

        let result = self
            .open()
            .map(|registry| RunLogger::with_registry(registry, &project_root, pipeline))
            .and_then(|logger| log(&logger));
        match result {
            Ok(id) => info!(run = %id, "run recorded in registry"),
            Err(e) => warn!(error = %format!("{:#}", e), "could not record run in registry"),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = RegistryChoice {
        root: cli.registry,
        disabled: cli.no_registry,
    };

    match cli.command {
        Commands::Generate {
            n,
            seed,
            output,
            truth,
        } => generate_command(n, seed, &output, truth.as_deref(), &registry),
        Commands::Run {
            config,
            output,
            workers,
        } => run_command(&config, output, workers, &registry),
        Commands::Coverage {
            input,
            lower,
            upper,
            level,
            output,
        } => coverage_command(&input, lower, upper, level, output.as_deref(), &registry),
        Commands::Runs { limit } => runs_command(limit, &registry),
    }
}

fn generate_command(
    n: usize,
    seed: u64,
    output: &Path,
    truth: Option<&Path>,
    registry: &RegistryChoice,
) -> Result<()> {
    let started: DateTime<Utc> = Utc::now();
    let generator = LinearRegression { n };

    let dataset = generator
        .generate(&mut replicate_rng(seed, 0))
        .context("Failed to simulate dataset")?;

    write_stan_json(output, &dataset)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(path = %output.display(), n, seed, "wrote Stan data");

    if let Some(path) = truth {
        write_truth_json(path, &dataset)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "wrote ground truth");
    }

    registry.record(None, |logger| {
        log_generate_run(logger, started, &generator, seed, output, truth)
    });
    Ok(())
}

fn run_command(
    config_path: &Path,
    output: Option<PathBuf>,
    workers: Option<usize>,
    registry: &RegistryChoice,
) -> Result<()> {
    let started: DateTime<Utc> = Utc::now();

    let mut config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(dir) = output {
        config.output_dir = dir;
    }
    if workers.is_some() {
        config.max_workers = workers;
    }

    let sampler = CmdStanSampler::detect(config.sampler.clone())?;
    let result = run_pipeline(&config, &config.data, &sampler)?;

    let paths = write_outputs(&config.output_dir, &result)
        .with_context(|| format!("Failed to write outputs to {}", config.output_dir.display()))?;
    info!(dir = %config.output_dir.display(), "wrote pipeline outputs");

    print_coverage(&result.coverage);
    if !result.sbc.is_empty() {
        print_sbc(&result.sbc);
    }
    if !result.failures.is_empty() {
        warn!(
            failed = result.failures.len(),
            total = config.n_replicates(),
            "some replicates were dropped; see failures.json"
        );
    }

    registry.record(Some(&config.name), |logger| {
        log_pipeline_run(logger, started, &config, &result, &paths)
    });
    Ok(())
}

fn coverage_command(
    input: &Path,
    lower: Option<String>,
    upper: Option<String>,
    level: Option<f64>,
    output: Option<&Path>,
    registry: &RegistryChoice,
) -> Result<()> {
    let started: DateTime<Utc> = Utc::now();

    let interval = match (lower, upper, level) {
        (Some(lower), Some(upper), None) => IntervalSpec::new(lower, upper)?,
        (None, None, Some(level)) => IntervalSpec::central(level)?,
        (None, None, None) => IntervalSpec::default(),
        _ => bail!("use either --lower/--upper or --level"),
    };

    let table = SummaryTable::read_csv(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let stats = compute_coverage(&table.rows, &interval)?;

    print_coverage(&stats);

    if let Some(path) = output {
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv {
            write_coverage_csv(path, &stats)?;
        } else {
            write_coverage_json(path, &stats)?;
        }
        info!(path = %path.display(), "wrote coverage");
    }

    registry.record(None, |logger| {
        log_coverage_run(logger, started, input, &interval, &stats, output)
    });
    Ok(())
}

fn runs_command(limit: usize, registry: &RegistryChoice) -> Result<()> {
    if registry.disabled {
        bail!("--no-registry cannot be combined with `runs`");
    }
    let registry = registry.open()?;
    let runs = registry.recent_runs(limit)?;

    if runs.is_empty() {
        println!("No runs recorded in {}", registry.root().display());
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<20}  {:<16}  {:>9}",
        "id", "kind", "started", "pipeline", "artifacts"
    );
    for run in runs {
        println!(
            "{:<36}  {:<10}  {:<20}  {:<16}  {:>9}",
            run.id,
            run.kind.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.pipeline.as_deref().unwrap_or("-"),
            run.artifacts.len()
        );
    }
    Ok(())
}
