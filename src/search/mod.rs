//! Candidate search strategies.
//!
//! Each strategy implements the same propose/observe/converged capability
//! over a `ParameterSpace` and is selected once at run creation; shared
//! logic never branches on the algorithm name. All strategies work in
//! normalized [0,1] coordinates and decode through the space, which is what
//! guarantees bounds and types are respected, and all randomness flows from
//! one seeded `StdRng` so runs are reproducible.

mod bayesian;
mod genetic;
mod pso;

pub use bayesian::BayesianSearch;
pub use genetic::GeneticSearch;
pub use pso::ParticleSwarm;

use crate::config::SearchConfig;
use crate::error::{EngineError, Result};
use crate::evaluate::ScoredCandidate;
use crate::space::{Candidate, ParameterSpace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Search algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Bayesian,
    Pso,
    Genetic,
}

impl FromStr for Algorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bayesian" => Ok(Algorithm::Bayesian),
            "pso" => Ok(Algorithm::Pso),
            "genetic" => Ok(Algorithm::Genetic),
            other => Err(EngineError::Configuration(format!(
                "unknown algorithm '{other}' (expected bayesian, pso, or genetic)"
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Bayesian => write!(f, "bayesian"),
            Algorithm::Pso => write!(f, "pso"),
            Algorithm::Genetic => write!(f, "genetic"),
        }
    }
}

/// Propose/observe capability implemented by every search algorithm.
///
/// Contract: every `propose` must be answered by exactly one `observe`
/// carrying one score per proposed candidate, in proposal order. Proposing
/// again before observing discards the pending batch without corrupting
/// model state; observing with a mismatched batch size is a
/// `ContractViolation`.
pub trait SearchStrategy: Send {
    /// Generate the next batch of candidates to evaluate.
    fn propose(&mut self, batch_size: usize) -> Result<Vec<Candidate>>;

    /// Feed back scores for the last proposed batch.
    fn observe(&mut self, scored: &[ScoredCandidate]) -> Result<()>;

    /// Whether further search is unlikely to improve materially.
    fn is_converged(&self) -> bool;

    /// The batch size this strategy naturally works in (swarm size for PSO,
    /// population for GA, configured batch for Bayesian).
    fn preferred_batch(&self) -> usize;
}

/// Build the strategy bound to a run for its lifetime.
pub fn build_strategy(
    algorithm: Algorithm,
    space: &ParameterSpace,
    config: &SearchConfig,
    seed: u64,
) -> Box<dyn SearchStrategy> {
    match algorithm {
        Algorithm::Bayesian => {
            Box::new(BayesianSearch::new(space.clone(), config.bayesian.clone(), seed))
        }
        Algorithm::Pso => {
            Box::new(ParticleSwarm::new(space.clone(), config.pso.clone(), seed))
        }
        Algorithm::Genetic => {
            Box::new(GeneticSearch::new(space.clone(), config.genetic.clone(), seed))
        }
    }
}

/// Shared propose/observe bookkeeping: the normalized points of the batch
/// awaiting observation.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    points: Option<Vec<Vec<f64>>>,
}

impl PendingBatch {
    pub(crate) fn set(&mut self, points: Vec<Vec<f64>>) {
        self.points = Some(points);
    }

    /// Take the pending batch, verifying the observed count matches.
    pub(crate) fn take(&mut self, observed: usize) -> Result<Vec<Vec<f64>>> {
        match self.points.take() {
            None => Err(EngineError::ContractViolation(
                "observe called with no pending proposal".into(),
            )),
            Some(points) if points.len() != observed => {
                let proposed = points.len();
                // Restore so a corrected observe can still succeed.
                self.points = Some(points);
                Err(EngineError::ContractViolation(format!(
                    "observed {observed} scores for a batch of {proposed} candidates"
                )))
            }
            Some(points) => Ok(points),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::data::testutil::hourly_series;
    use crate::evaluate;
    use crate::space::ParamBound;

    /// The scenario space used across strategy tests: an integer RSI period
    /// and a continuous stop loss.
    pub fn scenario_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            (
                "rsi_period".into(),
                ParamBound::Integer { min: 5, max: 30 },
            ),
            (
                "stop_loss".into(),
                ParamBound::Continuous {
                    min: 0.005,
                    max: 0.05,
                },
            ),
        ])
        .unwrap()
    }

    /// Score a batch with the real evaluator over a synthetic choppy series.
    pub fn score_batch(candidates: &[Candidate]) -> Vec<ScoredCandidate> {
        let prices: Vec<f64> = (0..200)
            .map(|i| {
                let cycle = (i % 16) as f64;
                if cycle < 8.0 {
                    100.0 - cycle * 1.5
                } else {
                    88.0 + (cycle - 8.0) * 1.5
                }
            })
            .collect();
        let series = hourly_series("BTCUSDT", &prices);
        candidates
            .iter()
            .map(|c| evaluate::evaluate(c, &series).unwrap())
            .collect()
    }

    /// Drive a strategy through `rounds` propose/observe cycles and assert
    /// every proposed candidate is inside the space.
    pub fn drive(strategy: &mut dyn SearchStrategy, space: &ParameterSpace, rounds: usize) {
        for _ in 0..rounds {
            let batch = strategy.propose(strategy.preferred_batch()).unwrap();
            assert!(!batch.is_empty());
            for candidate in &batch {
                space.check(candidate).unwrap();
            }
            let scored = score_batch(&batch);
            strategy.observe(&scored).unwrap();
        }
    }
}
