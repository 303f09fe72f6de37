//! Bayesian-style search over the normalized space.
//!
//! Uses a lightweight RBF-kernel surrogate rather than a full Gaussian
//! process: the predicted mean at a point is the kernel-weighted average of
//! observed scores, and the uncertainty shrinks with proximity to observed
//! points. Candidates are chosen by expected improvement over a seeded
//! random pool. This keeps proposals exploitative near good regions while
//! still covering unexplored space, without a linear-algebra dependency.

use super::{PendingBatch, SearchStrategy};
use crate::config::BayesianConfig;
use crate::error::Result;
use crate::evaluate::ScoredCandidate;
use crate::space::{Candidate, ParameterSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

pub struct BayesianSearch {
    space: ParameterSpace,
    config: BayesianConfig,
    rng: StdRng,
    /// Observed (normalized point, score) pairs.
    observations: Vec<(Vec<f64>, f64)>,
    pending: PendingBatch,
    best_score: f64,
    /// Best expected improvement of the pending batch, folded into the
    /// streak only when that batch is observed.
    pending_batch_ei: Option<f64>,
    /// Consecutive observed batches whose best expected improvement fell
    /// below the configured threshold.
    low_ei_streak: usize,
}

impl BayesianSearch {
    pub fn new(space: ParameterSpace, config: BayesianConfig, seed: u64) -> Self {
        Self {
            space,
            config,
            rng: StdRng::seed_from_u64(seed),
            observations: Vec::new(),
            pending: PendingBatch::default(),
            best_score: f64::NEG_INFINITY,
            pending_batch_ei: None,
            low_ei_streak: 0,
        }
    }

    fn random_point(&mut self) -> Vec<f64> {
        (0..self.space.dimensions())
            .map(|_| self.rng.random::<f64>())
            .collect()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let dist_sq: f64 = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        let ls = self.config.length_scale;
        (-dist_sq / (2.0 * ls * ls)).exp()
    }

    /// Surrogate prediction: kernel-weighted mean plus a residual-scaled
    /// uncertainty that is large far from any observation.
    fn predict(&self, point: &[f64]) -> (f64, f64) {
        let mut weight_sum = 0.0;
        let mut weighted_score = 0.0;
        let mut max_kernel: f64 = 0.0;
        for (obs, score) in &self.observations {
            let k = self.kernel(point, obs);
            weight_sum += k;
            weighted_score += k * score;
            max_kernel = max_kernel.max(k);
        }
        if weight_sum <= f64::EPSILON {
            // Nothing nearby: fall back to the observed mean with full
            // uncertainty.
            let mean = self.observations.iter().map(|(_, s)| s).sum::<f64>()
                / self.observations.len().max(1) as f64;
            return (mean, self.score_spread());
        }
        let mean = weighted_score / weight_sum;
        let sigma = self.score_spread() * (1.0 - max_kernel).max(0.0).sqrt();
        (mean, sigma)
    }

    /// Rough scale of observed scores used to size the surrogate's
    /// uncertainty band.
    fn score_spread(&self) -> f64 {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for (_, s) in &self.observations {
            lo = lo.min(*s);
            hi = hi.max(*s);
        }
        if lo.is_finite() && hi.is_finite() && hi > lo {
            hi - lo
        } else {
            1.0
        }
    }

    fn expected_improvement(&self, point: &[f64]) -> f64 {
        let (mean, sigma) = self.predict(point);
        if sigma <= f64::EPSILON {
            return (mean - self.best_score).max(0.0);
        }
        let z = (mean - self.best_score) / sigma;
        (mean - self.best_score) * normal_cdf(z) + sigma * normal_pdf(z)
    }
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

impl SearchStrategy for BayesianSearch {
    fn propose(&mut self, batch_size: usize) -> Result<Vec<Candidate>> {
        let batch_size = batch_size.max(1);
        let mut points = Vec::with_capacity(batch_size);

        if self.observations.is_empty() {
            // Cold start: pure random exploration.
            self.pending_batch_ei = None;
            for _ in 0..batch_size {
                points.push(self.random_point());
            }
        } else {
            // Score a random pool by expected improvement and take the top
            // of it, one point at a time so picked points repel the rest of
            // the batch through a temporary observation.
            let mut batch_ei_best = f64::NEG_INFINITY;
            for _ in 0..batch_size {
                let pool: Vec<Vec<f64>> = (0..self.config.pool_size)
                    .map(|_| self.random_point())
                    .collect();
                let mut best_point = pool[0].clone();
                let mut best_ei = f64::NEG_INFINITY;
                for point in pool {
                    let ei = self.expected_improvement(&point);
                    if ei > best_ei {
                        best_ei = ei;
                        best_point = point;
                    }
                }
                batch_ei_best = batch_ei_best.max(best_ei);
                // Pin the pick to its surrogate mean so the next pick in this
                // batch spreads out instead of clustering.
                let (mean, _) = self.predict(&best_point);
                self.observations.push((best_point.clone(), mean));
                points.push(best_point);
            }
            // Drop the temporary pins; real scores arrive via observe.
            self.observations
                .truncate(self.observations.len() - batch_size);

            // Convergence bookkeeping waits for observe: an abandoned
            // proposal must not move the patience counter.
            self.pending_batch_ei = Some(batch_ei_best);
            debug!(best_ei = batch_ei_best, "bayesian batch proposed");
        }

        let candidates = points.iter().map(|p| self.space.decode(p)).collect();
        self.pending.set(points);
        Ok(candidates)
    }

    fn observe(&mut self, scored: &[ScoredCandidate]) -> Result<()> {
        let points = self.pending.take(scored.len())?;
        for (point, s) in points.into_iter().zip(scored) {
            // Non-finite scores (candidates that could not be evaluated)
            // would poison the surrogate.
            if !s.score.is_finite() {
                continue;
            }
            if s.score > self.best_score {
                self.best_score = s.score;
            }
            self.observations.push((point, s.score));
        }
        if let Some(best_ei) = self.pending_batch_ei.take() {
            if best_ei < self.config.ei_threshold {
                self.low_ei_streak += 1;
            } else {
                self.low_ei_streak = 0;
            }
            debug!(best_ei, streak = self.low_ei_streak, "bayesian batch observed");
        }
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.low_ei_streak >= self.config.patience
    }

    fn preferred_batch(&self) -> usize {
        self.config.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BayesianConfig;
    use crate::search::testutil::{drive, scenario_space, score_batch};

    #[test]
    fn test_proposals_stay_in_bounds() {
        let space = scenario_space();
        let mut search = BayesianSearch::new(space.clone(), BayesianConfig::default(), 42);
        drive(&mut search, &space, 8);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let space = scenario_space();
        let mut a = BayesianSearch::new(space.clone(), BayesianConfig::default(), 7);
        let mut b = BayesianSearch::new(space.clone(), BayesianConfig::default(), 7);
        for _ in 0..4 {
            let batch_a = a.propose(4).unwrap();
            let batch_b = b.propose(4).unwrap();
            assert_eq!(batch_a, batch_b);
            a.observe(&score_batch(&batch_a)).unwrap();
            b.observe(&score_batch(&batch_b)).unwrap();
        }
    }

    #[test]
    fn test_repropose_replaces_pending() {
        let space = scenario_space();
        let mut search = BayesianSearch::new(space, BayesianConfig::default(), 1);
        search.propose(4).unwrap();
        let second = search.propose(2).unwrap();
        // Only the second proposal is pending now.
        search.observe(&score_batch(&second)).unwrap();
    }

    #[test]
    fn test_abandoned_proposals_leave_patience_untouched() {
        let space = scenario_space();
        let mut search = BayesianSearch::new(space, BayesianConfig::default(), 42);
        let batch = search.propose(4).unwrap();
        search.observe(&score_batch(&batch)).unwrap();

        // Proposals that never get observed carry no convergence weight.
        let streak = search.low_ei_streak;
        for _ in 0..10 {
            search.propose(4).unwrap();
            assert_eq!(search.low_ei_streak, streak);
            assert!(!search.is_converged());
        }
    }

    #[test]
    fn test_mismatched_observe_rejected() {
        let space = scenario_space();
        let mut search = BayesianSearch::new(space, BayesianConfig::default(), 1);
        let batch = search.propose(4).unwrap();
        let mut scored = score_batch(&batch);
        scored.pop();
        assert!(search.observe(&scored).is_err());
    }

    #[test]
    fn test_converges_on_flat_landscape() {
        // Identical scores everywhere: expected improvement collapses and
        // the patience counter should eventually trip.
        let space = scenario_space();
        let config = BayesianConfig {
            patience: 3,
            ..BayesianConfig::default()
        };
        let mut search = BayesianSearch::new(space.clone(), config, 42);
        for _ in 0..20 {
            let batch = search.propose(4).unwrap();
            let scored: Vec<_> = batch
                .iter()
                .map(|c| ScoredCandidate {
                    candidate: c.clone(),
                    score: 0.0,
                    meta: Default::default(),
                })
                .collect();
            search.observe(&scored).unwrap();
            if search.is_converged() {
                return;
            }
        }
        panic!("never converged on a flat landscape");
    }
}
