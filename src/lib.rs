//! # Strategy Optimizer
//!
//! A Rust engine for trading-strategy parameter optimization and
//! statistical-arbitrage pair analysis.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `data`: Price series model and history loaders (CSV, in-memory)
//! - `space`: Parameter space definition, encoding, and validation
//! - `evaluate`: Trade simulation and risk-adjusted scoring
//! - `search`: Bayesian, particle swarm, and genetic search strategies
//! - `optimizer`: Run lifecycle, registry, and cooperative cancellation
//! - `pairs`: Pair correlation, z-score signals, and fan-out analysis
//! - `persistence`: SQLite storage for runs and pair verdicts

pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod optimizer;
pub mod pairs;
pub mod persistence;
pub mod search;
pub mod space;

pub use config::Config;
pub use error::EngineError;
