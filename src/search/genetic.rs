//! Genetic search: tournament selection, uniform crossover, gaussian-ish
//! mutation, and single-elite carryover, all in the normalized space.

use super::{PendingBatch, SearchStrategy};
use crate::config::GeneticConfig;
use crate::error::Result;
use crate::evaluate::ScoredCandidate;
use crate::space::{Candidate, ParameterSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

pub struct GeneticSearch {
    space: ParameterSpace,
    config: GeneticConfig,
    rng: StdRng,
    /// Last scored generation, genome plus fitness.
    population: Vec<(Vec<f64>, f64)>,
    pending: PendingBatch,
    converged: bool,
}

impl GeneticSearch {
    pub fn new(space: ParameterSpace, config: GeneticConfig, seed: u64) -> Self {
        Self {
            space,
            config,
            rng: StdRng::seed_from_u64(seed),
            population: Vec::new(),
            pending: PendingBatch::default(),
            converged: false,
        }
    }

    fn random_genome(&mut self) -> Vec<f64> {
        (0..self.space.dimensions())
            .map(|_| self.rng.random::<f64>())
            .collect()
    }

    fn tournament_select(&mut self) -> Vec<f64> {
        let k = self.config.tournament_size.max(1);
        let mut best_idx = self.rng.random_range(0..self.population.len());
        for _ in 1..k {
            let idx = self.rng.random_range(0..self.population.len());
            if self.population[idx].1 > self.population[best_idx].1 {
                best_idx = idx;
            }
        }
        self.population[best_idx].0.clone()
    }

    fn crossover(&mut self, a: &[f64], b: &[f64]) -> Vec<f64> {
        a.iter()
            .zip(b)
            .map(|(x, y)| if self.rng.random_bool(0.5) { *x } else { *y })
            .collect()
    }

    fn mutate(&mut self, genome: &mut [f64]) {
        let rate = self.config.mutation_rate;
        let scale = self.config.mutation_scale;
        for gene in genome.iter_mut() {
            if self.rng.random::<f64>() < rate {
                let delta = self.rng.random_range(-scale..scale);
                *gene = (*gene + delta).clamp(0.0, 1.0);
            }
        }
    }

    /// Fitness variance of the current population.
    fn fitness_variance(&self) -> f64 {
        if self.population.len() < 2 {
            return f64::INFINITY;
        }
        let n = self.population.len() as f64;
        let mean = self.population.iter().map(|(_, f)| f).sum::<f64>() / n;
        self.population
            .iter()
            .map(|(_, f)| (f - mean) * (f - mean))
            .sum::<f64>()
            / n
    }
}

impl SearchStrategy for GeneticSearch {
    fn propose(&mut self, batch_size: usize) -> Result<Vec<Candidate>> {
        let size = if batch_size > 0 {
            batch_size
        } else {
            self.config.population_size
        };
        let mut genomes = Vec::with_capacity(size);
        if self.population.is_empty() {
            for _ in 0..size {
                genomes.push(self.random_genome());
            }
        } else {
            // Elitism: the current best genome survives unchanged.
            let elite = self
                .population
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(g, _)| g.clone())
                .unwrap_or_default();
            genomes.push(elite);
            while genomes.len() < size {
                let parent_a = self.tournament_select();
                let parent_b = self.tournament_select();
                let mut child = self.crossover(&parent_a, &parent_b);
                self.mutate(&mut child);
                genomes.push(child);
            }
        }
        let candidates = genomes.iter().map(|g| self.space.decode(g)).collect();
        self.pending.set(genomes);
        Ok(candidates)
    }

    fn observe(&mut self, scored: &[ScoredCandidate]) -> Result<()> {
        let genomes = self.pending.take(scored.len())?;
        self.population = genomes
            .into_iter()
            .zip(scored)
            .map(|(g, s)| (g, s.score))
            .collect();
        let variance = self.fitness_variance();
        self.converged = variance < self.config.variance_tolerance;
        debug!(variance, converged = self.converged, "generation observed");
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn preferred_batch(&self) -> usize {
        self.config.population_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneticConfig;
    use crate::search::testutil::{drive, scenario_space, score_batch};

    #[test]
    fn test_proposals_stay_in_bounds() {
        let space = scenario_space();
        let mut search = GeneticSearch::new(space.clone(), GeneticConfig::default(), 42);
        drive(&mut search, &space, 6);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let space = scenario_space();
        let mut a = GeneticSearch::new(space.clone(), GeneticConfig::default(), 99);
        let mut b = GeneticSearch::new(space.clone(), GeneticConfig::default(), 99);
        for _ in 0..3 {
            let batch_a = a.propose(a.preferred_batch()).unwrap();
            let batch_b = b.propose(b.preferred_batch()).unwrap();
            assert_eq!(batch_a, batch_b);
            a.observe(&score_batch(&batch_a)).unwrap();
            b.observe(&score_batch(&batch_b)).unwrap();
        }
    }

    #[test]
    fn test_elite_survives_generation() {
        let space = scenario_space();
        let mut search = GeneticSearch::new(space.clone(), GeneticConfig::default(), 5);
        let batch = search.propose(search.preferred_batch()).unwrap();
        // Hand-craft scores so candidate 3 is the clear winner.
        let scored: Vec<_> = batch
            .iter()
            .enumerate()
            .map(|(i, c)| ScoredCandidate {
                candidate: c.clone(),
                score: if i == 3 { 10.0 } else { 0.0 },
                meta: Default::default(),
            })
            .collect();
        search.observe(&scored).unwrap();
        let next = search.propose(search.preferred_batch()).unwrap();
        assert_eq!(next[0], batch[3]);
    }

    #[test]
    fn test_converges_on_uniform_fitness() {
        let space = scenario_space();
        let mut search = GeneticSearch::new(space, GeneticConfig::default(), 3);
        let batch = search.propose(8).unwrap();
        let scored: Vec<_> = batch
            .iter()
            .map(|c| ScoredCandidate {
                candidate: c.clone(),
                score: 1.0,
                meta: Default::default(),
            })
            .collect();
        search.observe(&scored).unwrap();
        assert!(search.is_converged());
    }

    #[test]
    fn test_mismatched_observe_rejected() {
        let space = scenario_space();
        let mut search = GeneticSearch::new(space, GeneticConfig::default(), 1);
        let batch = search.propose(6).unwrap();
        let mut scored = score_batch(&batch);
        scored.pop();
        assert!(search.observe(&scored).is_err());
    }
}
