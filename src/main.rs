//! `walk-bench`: time the random-walk kernel under each execution mode.
//!
//! ```sh
//! walk-bench run -r 2000 -t 1000 --mode compiled --mode cluster --workers 8
//! walk-bench run --config walk.toml
//! walk-bench validate walk.toml
//! walk-bench info
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use walk_sim_core::{ClusterConfig, ExecutionMode, ExperimentRunner, WalkConfig};

#[derive(Parser)]
#[command(name = "walk-bench")]
#[command(about = "Random walk under interpreted, compiled, chunked and cluster execution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate steps once and run the selected modes.
    Run(RunArgs),
    /// Check a configuration file without running anything.
    Validate {
        /// Path to the TOML configuration file.
        config: PathBuf,
    },
    /// Show thread counts and default cluster settings.
    Info,
}

#[derive(Args)]
struct RunArgs {
    /// TOML configuration file; flags below override it.
    #[arg(short, long, env = "WALK_CONFIG")]
    config: Option<PathBuf>,
    /// Number of realisations (rows).
    #[arg(short = 'r', long)]
    realisations: Option<usize>,
    /// Number of steps per realisation (columns).
    #[arg(short = 't', long)]
    steps: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Rows per chunk for chunked and cluster modes.
    #[arg(long)]
    chunk_rows: Option<usize>,
    /// Repeatable; defaults to every mode.
    #[arg(short, long = "mode")]
    modes: Vec<ExecutionMode>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    threads_per_worker: Option<usize>,
    /// Per-worker memory limit in bytes.
    #[arg(long)]
    memory_limit: Option<usize>,
    /// Keep the step array in a memory-mapped file.
    #[arg(long)]
    backing_store: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<WalkConfig> {
        let mut config = match &self.config {
            Some(path) => WalkConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => WalkConfig::default(),
        };

        if let Some(realisations) = self.realisations {
            config.realisations = realisations;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(chunk_rows) = self.chunk_rows {
            config.chunk_rows = chunk_rows;
        }
        if !self.modes.is_empty() {
            config.modes = self.modes;
        }
        if let Some(workers) = self.workers {
            config.cluster.n_workers = workers;
        }
        if let Some(threads) = self.threads_per_worker {
            config.cluster.threads_per_worker = threads;
        }
        if self.memory_limit.is_some() {
            config.cluster.memory_limit = self.memory_limit;
        }
        if self.backing_store.is_some() {
            config.backing_store = self.backing_store;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = args.into_config()?;
            println!("Random Walk Benchmark");
            println!("=====================");

            let mut runner = ExperimentRunner::new(config)?;
            let report = runner.run()?;
            println!("{report}");
            Ok(())
        }
        Commands::Validate { config } => {
            WalkConfig::load(&config).with_context(|| format!("loading {}", config.display()))?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
        Commands::Info => {
            let cluster = ClusterConfig::default();
            println!("rayon threads:       {}", rayon::current_num_threads());
            println!("default workers:     {}", cluster.n_workers);
            println!("threads per worker:  {}", cluster.threads_per_worker);
            println!(
                "modes:               {}",
                ExecutionMode::ALL.map(|m| m.as_str()).join(", ")
            );
            Ok(())
        }
    }
}
