//! Optimization run lifecycle.
//!
//! `RunManager` owns every run: submission allocates an id and spawns a
//! background task, status reads return a snapshot copy without touching
//! the task, and cancellation raises a flag the run loop polls between
//! iterations. A run moves pending -> running -> one terminal state
//! (converged, exhausted, failed, or cancelled) and never leaves a
//! terminal state.

use crate::config::Config;
use crate::data::PriceHistory;
use crate::error::{EngineError, Result};
use crate::evaluate::{self, ScoredCandidate};
use crate::persistence::SqliteStore;
use crate::search::{self, Algorithm, SearchStrategy};
use crate::space::ParameterSpace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

/// Lifecycle state of an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Converged,
    Exhausted,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "converged" => Ok(RunStatus::Converged),
            "exhausted" => Ok(RunStatus::Exhausted),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(EngineError::Configuration(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Converged => "converged",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What a caller submits to start a run. Budget and seed fall back to the
/// configured defaults when absent.
#[derive(Debug, Clone)]
pub struct OptimizationRequest {
    pub instrument: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub algorithm: Algorithm,
    pub space: ParameterSpace,
    pub iteration_budget: Option<u64>,
    pub seed: Option<u64>,
}

/// Point-in-time copy of a run's state. Detached from the live run: safe
/// to hold, serialize, or return across an API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub instrument: String,
    pub algorithm: Algorithm,
    pub status: RunStatus,
    pub iterations_completed: u64,
    pub iteration_budget: u64,
    pub best: Option<ScoredCandidate>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct RunEntry {
    snapshot: RunSnapshot,
    cancel: Arc<AtomicBool>,
}

/// Owns the run registry and the data/persistence handles runs need.
pub struct RunManager {
    config: Config,
    history: Arc<dyn PriceHistory>,
    store: Arc<SqliteStore>,
    registry: Arc<RwLock<HashMap<String, RunEntry>>>,
}

impl RunManager {
    pub fn new(config: Config, history: Arc<dyn PriceHistory>, store: Arc<SqliteStore>) -> Self {
        Self {
            config,
            history,
            store,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a run and spawn its worker. Returns the run id immediately;
    /// progress is observed through `status`.
    pub async fn submit(&self, request: OptimizationRequest) -> Result<String> {
        if request.end <= request.start {
            return Err(EngineError::Configuration(format!(
                "empty evaluation window: {} .. {}",
                request.start, request.end
            )));
        }
        let budget = request
            .iteration_budget
            .unwrap_or(self.config.optimizer.default_iteration_budget);
        if budget == 0 {
            return Err(EngineError::Configuration(
                "iteration budget must be at least 1".into(),
            ));
        }
        let seed = request.seed.unwrap_or(self.config.optimizer.default_seed);

        let now = Utc::now();
        let run_id = format!("run-{}-{}", now.timestamp(), now.timestamp_subsec_nanos());
        let cancel = Arc::new(AtomicBool::new(false));
        let snapshot = RunSnapshot {
            run_id: run_id.clone(),
            instrument: request.instrument.clone(),
            algorithm: request.algorithm,
            status: RunStatus::Pending,
            iterations_completed: 0,
            iteration_budget: budget,
            best: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_run(&snapshot)?;
        {
            let mut registry = self.registry.write().await;
            registry.insert(
                run_id.clone(),
                RunEntry {
                    snapshot: snapshot.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            run_id = %run_id,
            algorithm = %request.algorithm,
            instrument = %request.instrument,
            budget,
            seed,
            "optimization run submitted"
        );

        let worker = RunWorker {
            run_id: run_id.clone(),
            request,
            budget,
            seed,
            cancel,
            parallelism: self.config.optimizer.parallelism,
            strategy_config: self.config.search.clone(),
            history: self.history.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
        };
        tokio::spawn(worker.run());

        Ok(run_id)
    }

    /// Copy of the run's current state, or None for an unknown id. Readers
    /// never block a running worker beyond the registry read lock.
    pub async fn status(&self, run_id: &str) -> Option<RunSnapshot> {
        let registry = self.registry.read().await;
        registry.get(run_id).map(|entry| entry.snapshot.clone())
    }

    /// Request cancellation. Idempotent; a run that already reached a
    /// terminal state is left untouched.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let registry = self.registry.read().await;
        let entry = registry.get(run_id).ok_or_else(|| {
            EngineError::Configuration(format!("unknown run id '{run_id}'"))
        })?;
        if entry.snapshot.status.is_terminal() {
            return Ok(());
        }
        entry.cancel.store(true, Ordering::Relaxed);
        info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    /// Snapshots of all registered runs, newest first.
    pub async fn list(&self) -> Vec<RunSnapshot> {
        let registry = self.registry.read().await;
        let mut runs: Vec<RunSnapshot> =
            registry.values().map(|e| e.snapshot.clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }
}

/// Everything one background run needs, moved into its task.
struct RunWorker {
    run_id: String,
    request: OptimizationRequest,
    budget: u64,
    seed: u64,
    cancel: Arc<AtomicBool>,
    parallelism: usize,
    strategy_config: crate::config::SearchConfig,
    history: Arc<dyn PriceHistory>,
    store: Arc<SqliteStore>,
    registry: Arc<RwLock<HashMap<String, RunEntry>>>,
}

impl RunWorker {
    async fn run(self) {
        let outcome = self.drive().await;
        if let Err(err) = outcome {
            error!(run_id = %self.run_id, error = %err, "optimization run failed");
            self.finish(RunStatus::Failed, Some(err.to_string())).await;
        }
    }

    async fn drive(&self) -> Result<()> {
        self.update(|s| s.status = RunStatus::Running).await;

        let series = self
            .history
            .get_series(&self.request.instrument, self.request.start, self.request.end)
            .await
            .map_err(|e| EngineError::Configuration(format!("price history: {e}")))?;
        let series = Arc::new(series);

        let mut strategy = search::build_strategy(
            self.request.algorithm,
            &self.request.space,
            &self.strategy_config,
            self.seed,
        );
        let semaphore = Arc::new(Semaphore::new(self.parallelism.max(1)));

        let mut iterations: u64 = 0;
        let terminal = loop {
            if self.cancel.load(Ordering::Relaxed) {
                break RunStatus::Cancelled;
            }
            if iterations >= self.budget {
                break RunStatus::Exhausted;
            }
            let remaining = (self.budget - iterations) as usize;
            let batch_size = strategy.preferred_batch().clamp(1, remaining);
            let candidates = strategy.propose(batch_size)?;
            let scored =
                evaluate_batch(&candidates, series.clone(), semaphore.clone()).await?;
            strategy.observe(&scored)?;
            iterations += scored.len() as u64;

            let batch_best = best_of_batch(&scored).cloned();
            self.update(|snap| {
                snap.iterations_completed = iterations;
                if let Some(contender) = &batch_best {
                    let improved = match &snap.best {
                        Some(best) => contender.score > best.score,
                        None => true,
                    };
                    if improved {
                        snap.best = Some(contender.clone());
                    }
                }
            })
            .await;
            self.persist().await;

            if strategy.is_converged() {
                break RunStatus::Converged;
            }
        };

        info!(
            run_id = %self.run_id,
            status = %terminal,
            iterations,
            "optimization run finished"
        );
        self.finish(terminal, None).await;
        Ok(())
    }

    /// Apply a mutation to this run's registry snapshot.
    async fn update(&self, f: impl FnOnce(&mut RunSnapshot)) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(&self.run_id) {
            f(&mut entry.snapshot);
            entry.snapshot.updated_at = Utc::now();
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let registry = self.registry.read().await;
            registry.get(&self.run_id).map(|e| e.snapshot.clone())
        };
        if let Some(snapshot) = &snapshot {
            if let Err(err) = self.store.save_run(snapshot) {
                warn!(run_id = %self.run_id, error = %err, "failed to persist run progress");
            }
        }
    }

    async fn finish(&self, status: RunStatus, error: Option<String>) {
        self.update(|s| {
            // Terminal states are final; never overwrite one.
            if !s.status.is_terminal() {
                s.status = status;
                s.error = error;
            }
        })
        .await;
        self.persist().await;
    }
}

/// The batch's best finite-scored candidate. Ties keep the earlier one, so
/// a later duplicate score never displaces the candidate already selected.
fn best_of_batch(scored: &[ScoredCandidate]) -> Option<&ScoredCandidate> {
    let mut best: Option<&ScoredCandidate> = None;
    for s in scored {
        if !s.score.is_finite() {
            continue;
        }
        match best {
            Some(b) if s.score > b.score => best = Some(s),
            None => best = Some(s),
            _ => {}
        }
    }
    best
}

/// Evaluate a batch concurrently, capped by the semaphore. Order of the
/// results matches the order of the candidates. An `InsufficientData`
/// verdict for an individual candidate scores it at the floor instead of
/// failing the batch; anything else aborts.
async fn evaluate_batch(
    candidates: &[crate::space::Candidate],
    series: Arc<crate::data::PriceSeries>,
    semaphore: Arc<Semaphore>,
) -> Result<Vec<ScoredCandidate>> {
    let mut handles = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let candidate = candidate.clone();
        let series = series.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            evaluate::evaluate(&candidate, &series).map_err(|e| (candidate, e))
        }));
    }

    let mut scored = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| EngineError::ContractViolation(format!("evaluation task: {e}")))?;
        match result {
            Ok(s) => scored.push(s),
            Err((candidate, EngineError::InsufficientData { required, actual })) => {
                warn!(%candidate, required, actual, "candidate skipped for insufficient data");
                scored.push(ScoredCandidate {
                    candidate,
                    score: f64::NEG_INFINITY,
                    meta: Default::default(),
                });
            }
            Err((_, e)) => return Err(e),
        }
    }
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::data::testutil::hourly_series;
    use crate::data::MemoryPriceHistory;
    use crate::space::ParamBound;
    use chrono::TimeZone;

    fn scenario_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            ("rsi_period".into(), ParamBound::Integer { min: 5, max: 30 }),
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

    fn choppy_prices(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let cycle = (i % 16) as f64;
                if cycle < 8.0 {
                    100.0 - cycle * 1.5
                } else {
                    88.0 + (cycle - 8.0) * 1.5
                }
            })
            .collect()
    }

    fn manager_with_data(points: usize) -> RunManager {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("BTCUSDT", &choppy_prices(points)));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        RunManager::new(Config::default(), Arc::new(history), store)
    }

    fn request(algorithm: Algorithm, budget: u64) -> OptimizationRequest {
        OptimizationRequest {
            instrument: "BTCUSDT".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            algorithm,
            space: scenario_space(),
            iteration_budget: Some(budget),
            seed: Some(42),
        }
    }

    async fn wait_terminal(manager: &RunManager, run_id: &str) -> RunSnapshot {
        for _ in 0..600 {
            let snapshot = manager.status(run_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run never reached a terminal state");
    }

    #[tokio::test]
    async fn test_pso_run_completes_within_budget() {
        let manager = manager_with_data(300);
        let run_id = manager.submit(request(Algorithm::Pso, 50)).await.unwrap();
        let snapshot = wait_terminal(&manager, &run_id).await;
        assert!(matches!(
            snapshot.status,
            RunStatus::Converged | RunStatus::Exhausted
        ));
        assert!(snapshot.iterations_completed <= 50);
        let best = snapshot.best.expect("run should have found a best");
        let period = best.candidate.i64_or("rsi_period", 0);
        assert!((5..=30).contains(&period));
        let stop = best.candidate.f64_or("stop_loss", 0.0);
        assert!((0.005..=0.05).contains(&stop));
    }

    #[test]
    fn test_batch_tie_keeps_earlier_candidate() {
        let space = scenario_space();
        let make = |point: &[f64], score: f64| ScoredCandidate {
            candidate: space.decode(point),
            score,
            meta: Default::default(),
        };
        let batch = vec![
            make(&[0.5, 0.5], f64::NEG_INFINITY),
            make(&[0.1, 0.1], 1.0),
            make(&[0.9, 0.9], 1.0),
        ];
        let best = best_of_batch(&batch).unwrap();
        assert_eq!(best.candidate, batch[1].candidate);
        assert!(best_of_batch(&[make(&[0.2, 0.2], f64::NEG_INFINITY)]).is_none());
    }

    #[tokio::test]
    async fn test_best_score_never_decreases_across_snapshots() {
        let manager = manager_with_data(300);
        let run_id = manager.submit(request(Algorithm::Pso, 40)).await.unwrap();
        let mut last_best = f64::NEG_INFINITY;
        loop {
            let snapshot = manager.status(&run_id).await.unwrap();
            if let Some(best) = &snapshot.best {
                assert!(best.score >= last_best);
                last_best = best.score;
            }
            if snapshot.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_exhausted() {
        let manager = manager_with_data(300);
        // Patience high enough that the bayesian streak cannot trip first.
        let run_id = manager
            .submit(request(Algorithm::Genetic, 10))
            .await
            .unwrap();
        let snapshot = wait_terminal(&manager, &run_id).await;
        assert!(snapshot.iterations_completed <= 10);
    }

    #[tokio::test]
    async fn test_unknown_run_id() {
        let manager = manager_with_data(100);
        assert!(manager.status("run-0-0").await.is_none());
        assert!(matches!(
            manager.cancel("run-0-0").await,
            Err(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_budget_rejected() {
        let manager = manager_with_data(100);
        let err = manager.submit(request(Algorithm::Pso, 0)).await;
        assert!(matches!(err, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_cancel_preserves_best() {
        // The budget is far too large to exhaust and the flag is raised
        // before the worker can possibly burn through a patience streak, so
        // the only reachable terminal state is Cancelled.
        let manager = manager_with_data(300);
        let run_id = manager
            .submit(request(Algorithm::Bayesian, 1_000_000))
            .await
            .unwrap();
        manager.cancel(&run_id).await.unwrap();
        let snapshot = wait_terminal(&manager, &run_id).await;
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert!(snapshot.iterations_completed < 1_000_000);
        // Whatever progress landed before the flag was honored survives.
        if snapshot.iterations_completed > 0 {
            assert!(snapshot.best.is_some());
        }
        // Cancelling a finished run is a no-op.
        manager.cancel(&run_id).await.unwrap();
        assert_eq!(
            manager.status(&run_id).await.unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_short_history_floors_every_candidate() {
        // Too few points for any candidate: every evaluation floors, the
        // budget still drains, and the run exhausts rather than erroring.
        let manager = manager_with_data(3);
        let run_id = manager.submit(request(Algorithm::Pso, 24)).await.unwrap();
        let snapshot = wait_terminal(&manager, &run_id).await;
        assert!(matches!(
            snapshot.status,
            RunStatus::Exhausted | RunStatus::Converged
        ));
        assert!(snapshot.best.is_none());
    }

    #[tokio::test]
    async fn test_deterministic_best_across_runs() {
        let manager = manager_with_data(300);
        let a = manager.submit(request(Algorithm::Genetic, 48)).await.unwrap();
        let snap_a = wait_terminal(&manager, &a).await;
        let b = manager.submit(request(Algorithm::Genetic, 48)).await.unwrap();
        let snap_b = wait_terminal(&manager, &b).await;
        let best_a = snap_a.best.unwrap();
        let best_b = snap_b.best.unwrap();
        assert_eq!(best_a.score, best_b.score);
        assert_eq!(best_a.candidate, best_b.candidate);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let manager = manager_with_data(300);
        let first = manager.submit(request(Algorithm::Pso, 12)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager.submit(request(Algorithm::Pso, 12)).await.unwrap();
        let runs = manager.list().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[1].run_id, first);
    }
}
