//! Condense CLI - validator for the Condense context-compression benchmark

use anyhow::Result;
use clap::{Parser, Subcommand};
use condense_core::MinerInfo;
use condense_runtime::metrics::{MetricsServer, ValidatorMetrics};
use condense_runtime::registry::TierRegistry;
use condense_runtime::validator::{RoundReport, Validator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use condense_cli::config::Config;
use condense_cli::{apply_reload, benchmark, build_validator, init_logging, ConfigWatcher};

#[derive(Parser)]
#[command(name = "condense")]
#[command(author = "Condense Contributors")]
#[command(version)]
#[command(about = "Condense - validator for the context-compression benchmark", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "CONDENSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run validator rounds until interrupted
    Run {
        /// Stop after this many rounds
        #[arg(long)]
        rounds: Option<u64>,
    },

    /// Run a single round and exit
    Round,

    /// Benchmark task generation for every configured tier
    Benchmark {
        /// Tasks generated per tier
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// Include generated tasks in the report
        #[arg(long)]
        samples: bool,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    Check {
        /// File to check (defaults to --config)
        file: Option<PathBuf>,
    },

    /// Print an example configuration
    ConfigGen {
        /// Output format (yaml or toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { rounds } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging)?;
            run_loop(config, cli.config, rounds).await?;
        }

        Commands::Round => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging)?;
            let (mut validator, _metrics) = start(&config)?;
            let mut roster = config.miners.clone();
            let report = run_one(&mut validator, &config, &mut roster).await?;
            print_report(&report);
        }

        Commands::Benchmark {
            count,
            samples,
            output,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging)?;
            let report = benchmark(&config, count, samples)?;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Benchmark report written to {}", path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Check { file } => {
            let Some(path) = file.or(cli.config) else {
                anyhow::bail!("No configuration file given (use --config or CONDENSE_CONFIG)");
            };
            let config = Config::load(&path)?;
            let table = config.validate()?;
            println!("Configuration OK: {}", path.display());
            println!("   Tiers: {}", table.len());
            for tier in table.iter() {
                println!(
                    "     {} [{}, {}] tokens -> {} soft tokens, {} ms, importance {}",
                    tier.id,
                    tier.min_context_tokens,
                    tier.max_context_tokens,
                    tier.max_compressed_tokens,
                    tier.latency_budget_ms,
                    tier.importance
                );
            }
            println!("   Miners: {}", config.miners.len());
        }

        Commands::ConfigGen { format, output } => {
            let content = match format.as_str() {
                "yaml" | "yml" => Config::example_yaml(),
                "toml" => Config::example_toml(),
                other => anyhow::bail!("Unknown format {:?} (expected yaml or toml)", other),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    println!("Example configuration written to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::default()),
    }
}

/// Validate config, start the metrics endpoint if enabled and build the validator.
fn start(config: &Config) -> Result<(Validator, ValidatorMetrics)> {
    let table = config.validate()?;
    if config.miners.is_empty() {
        warn!("Miner roster is empty; rounds will publish nothing");
    }

    let metrics = ValidatorMetrics::new();
    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.addr());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let registry = Arc::new(TierRegistry::new(table));
    let validator = build_validator(config, registry, metrics.clone())?;
    Ok((validator, metrics))
}

async fn run_one(
    validator: &mut Validator,
    config: &Config,
    roster: &mut [MinerInfo],
) -> Result<RoundReport> {
    if config.validator.refresh_metadata {
        validator.refresh_metadata(roster).await;
    }
    Ok(validator.run_round(roster).await?)
}

async fn run_loop(config: Config, path: Option<PathBuf>, rounds: Option<u64>) -> Result<()> {
    let (mut validator, _metrics) = start(&config)?;
    let mut watcher = path.map(ConfigWatcher::new);
    let mut roster = config.miners.clone();
    let interval = config.round_interval();
    let mut completed = 0u64;

    info!(
        tiers = validator.registry().snapshot()?.len(),
        miners = roster.len(),
        interval_secs = interval.as_secs(),
        "Validator started"
    );

    loop {
        let started = tokio::time::Instant::now();

        if let Some(watcher) = watcher.as_mut() {
            match watcher.poll() {
                Ok(Some(fresh)) => match apply_reload(validator.registry(), fresh) {
                    Ok(miners) => roster = miners,
                    Err(e) => warn!(path = %watcher.path().display(), "Reloaded config refused: {}", e),
                },
                Ok(None) => {}
                Err(e) => warn!(path = %watcher.path().display(), "Config reload failed: {}", e),
            }
        }

        match run_one(&mut validator, &config, &mut roster).await {
            Ok(report) => print_report(&report),
            Err(e) => error!("Round failed: {}", e),
        }

        completed += 1;
        if rounds.is_some_and(|n| completed >= n) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + interval) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
        }
    }

    info!(round = validator.round(), "Validator stopped");
    Ok(())
}

fn print_report(report: &RoundReport) {
    println!(
        "Round {}: {} tasks, {} dispatched ({} fulfilled, {} timed out, {} rejected), {} evaluation failures, {:.1}s",
        report.round,
        report.tasks,
        report.dispatched,
        report.fulfilled,
        report.timed_out,
        report.rejected,
        report.evaluation_failures,
        report.duration.as_secs_f64()
    );
    if !report.skipped_tiers.is_empty() {
        println!("   Skipped tiers: {:?}", report.skipped_tiers);
    }
    match &report.weights {
        Some(weights) => {
            for (miner, weight) in weights.iter() {
                println!("   {:<24} {:.4}", miner.as_str(), weight);
            }
            if !report.published {
                println!("   (weights committed but not published)");
            }
        }
        None => println!("   No weights this round"),
    }
}
