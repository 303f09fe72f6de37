//! Configuration management for the optimization and pairs engines.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Optimization run settings
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Search algorithm tuning
    #[serde(default)]
    pub search: SearchConfig,
    /// Pairs analysis settings
    #[serde(default)]
    pub pairs: PairsConfig,
    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Default iteration budget when a request does not specify one
    #[serde(default = "default_iteration_budget")]
    pub default_iteration_budget: u64,
    /// Parallel candidate evaluations within one batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Default RNG seed for reproducible runs
    #[serde(default = "default_seed")]
    pub default_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub bayesian: BayesianConfig,
    #[serde(default)]
    pub pso: PsoConfig,
    #[serde(default)]
    pub genetic: GeneticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianConfig {
    /// Candidates proposed per iteration
    #[serde(default = "default_bayes_batch")]
    pub batch_size: usize,
    /// Random acquisition pool evaluated per proposal
    #[serde(default = "default_bayes_pool")]
    pub pool_size: usize,
    /// RBF kernel length scale in normalized coordinates
    #[serde(default = "default_length_scale")]
    pub length_scale: f64,
    /// Expected-improvement floor below which an iteration counts toward
    /// convergence
    #[serde(default = "default_ei_threshold")]
    pub ei_threshold: f64,
    /// Consecutive low-EI iterations required to declare convergence
    #[serde(default = "default_patience")]
    pub patience: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsoConfig {
    /// Number of particles (also the batch size)
    #[serde(default = "default_swarm_size")]
    pub swarm_size: usize,
    /// Velocity inertia weight
    #[serde(default = "default_inertia")]
    pub inertia: f64,
    /// Pull toward each particle's personal best
    #[serde(default = "default_cognitive")]
    pub cognitive: f64,
    /// Pull toward the global best
    #[serde(default = "default_social")]
    pub social: f64,
    /// Positional spread (relative to bound width) below which the swarm is
    /// considered converged
    #[serde(default = "default_spread_tolerance")]
    pub spread_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneticConfig {
    /// Population size (also the batch size)
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Per-gene mutation probability
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Magnitude of a mutation step in normalized coordinates
    #[serde(default = "default_mutation_scale")]
    pub mutation_scale: f64,
    /// Tournament size for parent selection
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    /// Population score variance below which evolution is considered
    /// converged
    #[serde(default = "default_variance_tolerance")]
    pub variance_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsConfig {
    /// Minimum aligned observations required per pair (hard floor 2)
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Default trailing window when a request does not specify one
    #[serde(default = "default_lookback")]
    pub default_lookback: usize,
    /// Default z-score threshold for signal classification
    #[serde(default = "default_zscore_threshold")]
    pub default_zscore_threshold: f64,
    /// Parallel pair computations
    #[serde(default = "default_pair_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions
fn default_iteration_budget() -> u64 {
    100
}

fn default_parallelism() -> usize {
    4
}

fn default_seed() -> u64 {
    42
}

fn default_bayes_batch() -> usize {
    4
}

fn default_bayes_pool() -> usize {
    256
}

fn default_length_scale() -> f64 {
    0.2
}

fn default_ei_threshold() -> f64 {
    1e-4
}

fn default_patience() -> usize {
    5
}

fn default_swarm_size() -> usize {
    12
}

fn default_inertia() -> f64 {
    0.72
}

fn default_cognitive() -> f64 {
    1.49
}

fn default_social() -> f64 {
    1.49
}

fn default_spread_tolerance() -> f64 {
    0.01
}

fn default_population_size() -> usize {
    24
}

fn default_mutation_rate() -> f64 {
    0.1
}

fn default_mutation_scale() -> f64 {
    0.2
}

fn default_tournament_size() -> usize {
    3
}

fn default_variance_tolerance() -> f64 {
    1e-6
}

fn default_min_observations() -> usize {
    20
}

fn default_lookback() -> usize {
    30
}

fn default_zscore_threshold() -> f64 {
    2.0
}

fn default_pair_workers() -> usize {
    4
}

fn default_db_path() -> String {
    "strategy_optimizer.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("OPT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.optimizer.parallelism >= 1,
            "optimizer.parallelism must be >= 1"
        );

        anyhow::ensure!(
            self.pairs.min_observations >= 2,
            "pairs.min_observations must be >= 2 for correlation to be defined"
        );

        anyhow::ensure!(
            self.pairs.default_zscore_threshold > 0.0,
            "pairs.default_zscore_threshold must be positive"
        );

        anyhow::ensure!(
            self.search.pso.swarm_size >= 2,
            "search.pso.swarm_size must be >= 2"
        );

        anyhow::ensure!(
            self.search.genetic.population_size >= 2,
            "search.genetic.population_size must be >= 2"
        );

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.search.genetic.mutation_rate),
            "search.genetic.mutation_rate must be between 0 and 1"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            search: SearchConfig::default(),
            pairs: PairsConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            default_iteration_budget: default_iteration_budget(),
            parallelism: default_parallelism(),
            default_seed: default_seed(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            bayesian: BayesianConfig::default(),
            pso: PsoConfig::default(),
            genetic: GeneticConfig::default(),
        }
    }
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            batch_size: default_bayes_batch(),
            pool_size: default_bayes_pool(),
            length_scale: default_length_scale(),
            ei_threshold: default_ei_threshold(),
            patience: default_patience(),
        }
    }
}

impl Default for PsoConfig {
    fn default() -> Self {
        Self {
            swarm_size: default_swarm_size(),
            inertia: default_inertia(),
            cognitive: default_cognitive(),
            social: default_social(),
            spread_tolerance: default_spread_tolerance(),
        }
    }
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            mutation_rate: default_mutation_rate(),
            mutation_scale: default_mutation_scale(),
            tournament_size: default_tournament_size(),
            variance_tolerance: default_variance_tolerance(),
        }
    }
}

impl Default for PairsConfig {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            default_lookback: default_lookback(),
            default_zscore_threshold: default_zscore_threshold(),
            workers: default_pair_workers(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}
