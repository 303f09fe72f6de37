//! Particle swarm optimization in the normalized space.
//!
//! Standard inertia-weight PSO: each particle carries a position and
//! velocity in [0,1]^d, is pulled toward its personal best and the swarm's
//! global best, and is clamped back into the unit cube after every move.
//! Convergence is declared when the swarm's positional spread collapses
//! below a tolerance.

use super::{PendingBatch, SearchStrategy};
use crate::config::PsoConfig;
use crate::error::Result;
use crate::evaluate::ScoredCandidate;
use crate::space::{Candidate, ParameterSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

struct Particle {
    position: Vec<f64>,
    velocity: Vec<f64>,
    best_position: Vec<f64>,
    best_score: f64,
}

pub struct ParticleSwarm {
    space: ParameterSpace,
    config: PsoConfig,
    rng: StdRng,
    particles: Vec<Particle>,
    global_best: Option<(Vec<f64>, f64)>,
    pending: PendingBatch,
    /// Set once the swarm has been stepped at least once and its spread has
    /// collapsed.
    converged: bool,
}

impl ParticleSwarm {
    pub fn new(space: ParameterSpace, config: PsoConfig, seed: u64) -> Self {
        Self {
            space,
            config,
            rng: StdRng::seed_from_u64(seed),
            particles: Vec::new(),
            global_best: None,
            pending: PendingBatch::default(),
            converged: false,
        }
    }

    fn make_particles(&mut self, count: usize) -> Vec<Particle> {
        let dims = self.space.dimensions();
        (0..count)
            .map(|_| {
                let position: Vec<f64> = (0..dims).map(|_| self.rng.random::<f64>()).collect();
                // Initial velocities span a fraction of the cube in either
                // direction.
                let velocity: Vec<f64> = (0..dims)
                    .map(|_| self.rng.random_range(-0.1..0.1))
                    .collect();
                Particle {
                    best_position: position.clone(),
                    best_score: f64::NEG_INFINITY,
                    position,
                    velocity,
                }
            })
            .collect()
    }

    fn step_swarm(&mut self) {
        let (global_pos, _) = match &self.global_best {
            Some(best) => (best.0.clone(), best.1),
            None => return,
        };
        let dims = self.space.dimensions();
        for particle in &mut self.particles {
            for d in 0..dims {
                let r1 = self.rng.random::<f64>();
                let r2 = self.rng.random::<f64>();
                let cognitive = self.config.cognitive
                    * r1
                    * (particle.best_position[d] - particle.position[d]);
                let social = self.config.social * r2 * (global_pos[d] - particle.position[d]);
                particle.velocity[d] =
                    self.config.inertia * particle.velocity[d] + cognitive + social;
                particle.position[d] = (particle.position[d] + particle.velocity[d]).clamp(0.0, 1.0);
            }
        }
    }

    /// Mean distance of particles from the swarm centroid.
    fn spread(&self) -> f64 {
        if self.particles.is_empty() {
            return f64::INFINITY;
        }
        let dims = self.space.dimensions();
        let mut centroid = vec![0.0; dims];
        for particle in &self.particles {
            for d in 0..dims {
                centroid[d] += particle.position[d];
            }
        }
        for c in &mut centroid {
            *c /= self.particles.len() as f64;
        }
        let total: f64 = self
            .particles
            .iter()
            .map(|p| {
                p.position
                    .iter()
                    .zip(&centroid)
                    .map(|(x, c)| (x - c) * (x - c))
                    .sum::<f64>()
                    .sqrt()
            })
            .sum();
        total / self.particles.len() as f64
    }
}

impl SearchStrategy for ParticleSwarm {
    fn propose(&mut self, batch_size: usize) -> Result<Vec<Candidate>> {
        let size = if batch_size > 0 {
            batch_size
        } else {
            self.config.swarm_size
        };
        if self.particles.is_empty() {
            self.particles = self.make_particles(size);
        } else if size > self.particles.len() {
            // Grow with fresh particles; existing memory stays intact.
            let mut extra = self.make_particles(size - self.particles.len());
            self.particles.append(&mut extra);
        }
        // No stepping here: the move happens in observe, so re-proposing
        // before an observe hands back the same positions.
        let points: Vec<Vec<f64>> = self.particles[..size]
            .iter()
            .map(|p| p.position.clone())
            .collect();
        let candidates = points.iter().map(|p| self.space.decode(p)).collect();
        self.pending.set(points);
        Ok(candidates)
    }

    fn observe(&mut self, scored: &[ScoredCandidate]) -> Result<()> {
        let points = self.pending.take(scored.len())?;
        // A truncated batch only updates the particles it covered.
        for ((particle, point), s) in self.particles.iter_mut().zip(points).zip(scored) {
            if s.score > particle.best_score {
                particle.best_score = s.score;
                particle.best_position = point.clone();
            }
            let improved = match &self.global_best {
                Some((_, best)) => s.score > *best,
                None => true,
            };
            if improved {
                self.global_best = Some((point, s.score));
            }
        }
        self.step_swarm();
        let spread = self.spread();
        self.converged = spread < self.config.spread_tolerance;
        debug!(spread, converged = self.converged, "swarm step observed");
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn preferred_batch(&self) -> usize {
        self.config.swarm_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PsoConfig;
    use crate::search::testutil::{drive, scenario_space, score_batch};

    #[test]
    fn test_proposals_stay_in_bounds() {
        let space = scenario_space();
        let mut swarm = ParticleSwarm::new(space.clone(), PsoConfig::default(), 42);
        drive(&mut swarm, &space, 6);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let space = scenario_space();
        let mut a = ParticleSwarm::new(space.clone(), PsoConfig::default(), 42);
        let mut b = ParticleSwarm::new(space.clone(), PsoConfig::default(), 42);
        for _ in 0..4 {
            let batch_a = a.propose(a.preferred_batch()).unwrap();
            let batch_b = b.propose(b.preferred_batch()).unwrap();
            assert_eq!(batch_a, batch_b);
            a.observe(&score_batch(&batch_a)).unwrap();
            b.observe(&score_batch(&batch_b)).unwrap();
        }
    }

    #[test]
    fn test_converges_toward_global_best() {
        // Score by closeness to a fixed target: the swarm should contract
        // onto it and trip the spread tolerance well inside the budget.
        let space = scenario_space();
        let config = PsoConfig {
            spread_tolerance: 0.05,
            ..PsoConfig::default()
        };
        let mut swarm = ParticleSwarm::new(space.clone(), config, 42);
        for _ in 0..60 {
            let batch = swarm.propose(swarm.preferred_batch()).unwrap();
            let scored: Vec<_> = batch
                .iter()
                .map(|c| {
                    let period = c.f64_or("rsi_period", 0.0);
                    let stop = c.f64_or("stop_loss", 0.0);
                    ScoredCandidate {
                        candidate: c.clone(),
                        score: -((period - 14.0).powi(2) + (stop - 0.02).powi(2) * 1e4),
                        meta: Default::default(),
                    }
                })
                .collect();
            swarm.observe(&scored).unwrap();
            if swarm.is_converged() {
                let (best, _) = swarm.global_best.as_ref().unwrap();
                let best_candidate = space.decode(best);
                let period = best_candidate.i64_or("rsi_period", 0);
                assert!((5..=30).contains(&period));
                return;
            }
        }
        panic!("swarm never contracted");
    }

    #[test]
    fn test_repropose_returns_same_positions() {
        let space = scenario_space();
        let mut swarm = ParticleSwarm::new(space, PsoConfig::default(), 9);
        let first = swarm.propose(6).unwrap();
        let second = swarm.propose(6).unwrap();
        assert_eq!(first, second);
        swarm.observe(&score_batch(&second)).unwrap();
    }

    #[test]
    fn test_truncated_batch_keeps_swarm_memory() {
        let space = scenario_space();
        let mut swarm = ParticleSwarm::new(space, PsoConfig::default(), 9);
        let batch = swarm.propose(6).unwrap();
        swarm.observe(&score_batch(&batch)).unwrap();
        let kept_best = swarm.particles[5].best_score;

        // A final short batch must not re-seed the swarm.
        let short = swarm.propose(2).unwrap();
        assert_eq!(short.len(), 2);
        swarm.observe(&score_batch(&short)).unwrap();
        assert_eq!(swarm.particles.len(), 6);
        assert_eq!(swarm.particles[5].best_score, kept_best);
    }

    #[test]
    fn test_mismatched_observe_rejected() {
        let space = scenario_space();
        let mut swarm = ParticleSwarm::new(space, PsoConfig::default(), 1);
        let batch = swarm.propose(4).unwrap();
        let mut scored = score_batch(&batch);
        scored.pop();
        assert!(swarm.observe(&scored).is_err());
    }
}
