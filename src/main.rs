//! Strategy Optimizer - Main Entry Point
//!
//! Runs parameter optimization and pair analysis over CSV price history.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use strategy_optimizer::config::Config;
use strategy_optimizer::data::{CsvPriceHistory, PriceHistory};
use strategy_optimizer::evaluate::{
    PARAM_RSI_OVERBOUGHT, PARAM_RSI_OVERSOLD, PARAM_RSI_PERIOD, PARAM_STOP_LOSS, PARAM_TAKE_PROFIT,
};
use strategy_optimizer::optimizer::{OptimizationRequest, RunManager};
use strategy_optimizer::pairs::{PairsAnalyzer, PairsRequest};
use strategy_optimizer::persistence::SqliteStore;
use strategy_optimizer::search::Algorithm;
use strategy_optimizer::space::{ParamBound, ParameterSpace};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Strategy Optimizer CLI
#[derive(Parser)]
#[command(name = "strategy-optimizer")]
#[command(version, about = "Strategy parameter optimization and pair analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a parameter optimization over historical data
    Optimize {
        /// Path to CSV data file (timestamp,instrument,price)
        #[arg(short, long)]
        data: String,

        /// Instrument to optimize against
        #[arg(short, long)]
        instrument: String,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Search algorithm: bayesian, pso, or genetic
        #[arg(short, long, default_value = "bayesian")]
        algorithm: String,

        /// Maximum candidate evaluations
        #[arg(long)]
        budget: Option<u64>,

        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Path to a JSON parameter-space file (defaults to the built-in
        /// RSI mean-reversion space)
        #[arg(long)]
        space: Option<String>,
    },

    /// Analyze every instrument pair for arbitrage signals
    Pairs {
        /// Path to CSV data file (timestamp,instrument,price)
        #[arg(short, long)]
        data: String,

        /// Instruments to pair up (comma separated); defaults to every
        /// instrument in the file
        #[arg(short, long)]
        instruments: Option<String>,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Trailing observations per pair
        #[arg(long)]
        lookback: Option<usize>,

        /// Z-score threshold for signal classification
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Show stored pair correlations, most stretched first
    Correlations {
        /// Minimum signed correlation
        #[arg(long)]
        min_correlation: Option<f64>,

        /// Minimum |z-score|
        #[arg(long)]
        min_zscore: Option<f64>,

        /// Maximum rows
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List stored optimization runs, newest first
    Runs {
        /// Maximum rows
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

/// One entry of a JSON parameter-space file.
#[derive(Deserialize)]
struct SpaceEntry {
    name: String,
    #[serde(flatten)]
    bound: ParamBound,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Optimize {
            data,
            instrument,
            start,
            end,
            algorithm,
            budget,
            seed,
            space,
        } => {
            run_optimize(
                config, &data, &instrument, &start, &end, &algorithm, budget, seed,
                space.as_deref(),
            )
            .await
        }
        Commands::Pairs {
            data,
            instruments,
            start,
            end,
            lookback,
            threshold,
        } => {
            run_pairs(
                config,
                &data,
                instruments.as_deref(),
                &start,
                &end,
                lookback,
                threshold,
            )
            .await
        }
        Commands::Correlations {
            min_correlation,
            min_zscore,
            limit,
        } => show_correlations(&config, min_correlation, min_zscore, limit),
        Commands::Runs { limit } => show_runs(&config, limit),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_optimize(
    config: Config,
    data_path: &str,
    instrument: &str,
    start_str: &str,
    end_str: &str,
    algorithm_str: &str,
    budget: Option<u64>,
    seed: Option<u64>,
    space_path: Option<&str>,
) -> Result<()> {
    let (start, end) = parse_dates(start_str, end_str)?;
    let algorithm: Algorithm = algorithm_str.parse()?;
    let space = match space_path {
        Some(path) => load_space(path)?,
        None => default_space()?,
    };

    info!("Loading data from: {}", data_path);
    let history = Arc::new(CsvPriceHistory::new(data_path)?);
    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    let manager = RunManager::new(config, history, store);

    let run_id = manager
        .submit(OptimizationRequest {
            instrument: instrument.to_string(),
            start,
            end,
            algorithm,
            space,
            iteration_budget: budget,
            seed,
        })
        .await?;
    info!("Run {} started ({} on {})", run_id, algorithm, instrument);

    // Poll until the run reaches a terminal state.
    let snapshot = loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Some(snapshot) = manager.status(&run_id).await else {
            anyhow::bail!("run {} vanished from the registry", run_id);
        };
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        info!(
            "   progress: {}/{} iterations, best score {}",
            snapshot.iterations_completed,
            snapshot.iteration_budget,
            snapshot
                .best
                .as_ref()
                .map(|b| format!("{:.4}", b.score))
                .unwrap_or_else(|| "-".to_string()),
        );
    };

    println!("\nRun {} finished: {}", snapshot.run_id, snapshot.status);
    println!(
        "  iterations: {}/{}",
        snapshot.iterations_completed, snapshot.iteration_budget
    );
    match &snapshot.best {
        Some(best) => {
            println!("  best score: {:.4}", best.score);
            println!("  best params: {}", best.candidate);
            println!(
                "  trades: {} | mean return: {:.4} | max drawdown: {:.4}",
                best.meta.trade_count, best.meta.mean_return, best.meta.max_drawdown
            );
        }
        None => println!("  no candidate could be scored"),
    }
    if let Some(err) = &snapshot.error {
        println!("  error: {err}");
    }
    Ok(())
}

async fn run_pairs(
    config: Config,
    data_path: &str,
    instruments: Option<&str>,
    start_str: &str,
    end_str: &str,
    lookback: Option<usize>,
    threshold: Option<f64>,
) -> Result<()> {
    let (start, end) = parse_dates(start_str, end_str)?;

    info!("Loading data from: {}", data_path);
    let history = Arc::new(CsvPriceHistory::new(data_path)?);
    let instruments: Vec<String> = match instruments {
        Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        None => history.available_instruments(),
    };

    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    let analyzer = PairsAnalyzer::new(config.pairs.clone(), history, store);
    let report = analyzer
        .analyze(PairsRequest {
            instruments,
            start,
            end,
            lookback,
            zscore_threshold: threshold,
        })
        .await?;

    println!("\nPairs analysis");
    println!("  pairs analyzed:          {}", report.summary.total_pairs);
    println!("  strong signals:          {}", report.summary.strong_signals);
    println!("  medium signals:          {}", report.summary.medium_signals);
    println!(
        "  arbitrage opportunities: {}",
        report.summary.arbitrage_opportunities
    );
    println!(
        "  avg correlation:         {:.4}",
        report.summary.avg_correlation
    );
    println!(
        "  max |z-score|:           {:.4}",
        report.summary.max_abs_zscore
    );
    println!();
    for stat in &report.statistics {
        println!(
            "  {:<24} corr {:>7.4}  z {:>7.3}  {:<11} {}",
            stat.key.as_str(),
            stat.correlation,
            stat.zscore,
            stat.signal.to_string(),
            stat.strength
        );
    }
    if !report.skipped.is_empty() {
        println!("\n  skipped:");
        for skip in &report.skipped {
            println!("    {:<24} {}", skip.key.as_str(), skip.reason);
        }
    }
    Ok(())
}

fn show_correlations(
    config: &Config,
    min_correlation: Option<f64>,
    min_zscore: Option<f64>,
    limit: usize,
) -> Result<()> {
    let store = SqliteStore::open(&config.database.path)?;
    let stats = store.get_correlations(min_correlation, min_zscore, limit)?;
    if stats.is_empty() {
        println!("No stored pair correlations match the filters.");
        return Ok(());
    }
    println!(
        "{:<24} {:>10} {:>10} {:<12} {:<8} {}",
        "pair", "corr", "zscore", "signal", "strength", "computed"
    );
    for stat in stats {
        println!(
            "{:<24} {:>10.4} {:>10.3} {:<12} {:<8} {}",
            stat.key.as_str(),
            stat.correlation,
            stat.zscore,
            stat.signal.to_string(),
            stat.strength.to_string(),
            stat.computed_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn show_runs(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.database.path)?;
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("No stored optimization runs.");
        return Ok(());
    }
    for run in runs {
        let best = run
            .best
            .as_ref()
            .map(|b| format!("{:.4} ({})", b.score, b.candidate))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {:<9} {:>5}/{:<5} best: {}",
            run.run_id, run.algorithm, run.status, run.iterations_completed, run.iteration_budget,
            best
        );
        if let Some(err) = &run.error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

/// The built-in search space for the RSI mean-reversion rule set.
fn default_space() -> Result<ParameterSpace> {
    Ok(ParameterSpace::new(vec![
        (
            PARAM_RSI_PERIOD.to_string(),
            ParamBound::Integer { min: 5, max: 30 },
        ),
        (
            PARAM_RSI_OVERSOLD.to_string(),
            ParamBound::Continuous {
                min: 20.0,
                max: 40.0,
            },
        ),
        (
            PARAM_RSI_OVERBOUGHT.to_string(),
            ParamBound::Continuous {
                min: 60.0,
                max: 80.0,
            },
        ),
        (
            PARAM_STOP_LOSS.to_string(),
            ParamBound::Continuous {
                min: 0.005,
                max: 0.05,
            },
        ),
        (
            PARAM_TAKE_PROFIT.to_string(),
            ParamBound::Continuous {
                min: 0.01,
                max: 0.10,
            },
        ),
    ])?)
}

fn load_space(path: &str) -> Result<ParameterSpace> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read space file {path}"))?;
    let entries: Vec<SpaceEntry> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse space file {path}"))?;
    Ok(ParameterSpace::new(
        entries.into_iter().map(|e| (e.name, e.bound)).collect(),
    )?)
}

fn parse_dates(
    start_str: &str,
    end_str: &str,
) -> Result<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> {
    let start_date = NaiveDate::parse_from_str(start_str, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid start date '{}': {}", start_str, e))?;
    let end_date = NaiveDate::parse_from_str(end_str, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid end date '{}': {}", end_str, e))?;
    let start = start_date
        .and_hms_opt(0, 0, 0)
        .context("invalid start time")?
        .and_utc();
    let end = end_date
        .and_hms_opt(23, 59, 59)
        .context("invalid end time")?
        .and_utc();
    Ok((start, end))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strategy_optimizer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}
