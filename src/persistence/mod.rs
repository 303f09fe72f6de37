//! SQLite persistence for run progress and pair verdicts.
//!
//! Two tables, both upserted by their natural key so re-running an
//! analysis or re-saving run progress never duplicates rows:
//! - `optimization_runs`, keyed by run id, updated after every iteration
//! - `pair_correlations`, keyed by canonical pair key

use crate::error::{EngineError, Result};
use crate::optimizer::{RunSnapshot, RunStatus};
use crate::pairs::{PairKey, PairStatistic, Signal, Strength};
use crate::search::Algorithm;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Shared, thread-safe store. Cheap to clone behind an `Arc`; every call
/// takes the connection lock for its duration.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("store opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            -- Run progress, one row per run, rewritten as the run advances
            CREATE TABLE IF NOT EXISTS optimization_runs (
                run_id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                status TEXT NOT NULL,
                iterations_completed INTEGER NOT NULL,
                iteration_budget INTEGER NOT NULL,
                best TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_created ON optimization_runs(created_at);

            -- Latest verdict per pair
            CREATE TABLE IF NOT EXISTS pair_correlations (
                pair_key TEXT PRIMARY KEY,
                correlation REAL NOT NULL,
                zscore REAL NOT NULL,
                signal TEXT NOT NULL,
                strength TEXT NOT NULL,
                observations INTEGER NOT NULL,
                computed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pairs_zscore ON pair_correlations(zscore);
            "#,
        )?;
        debug!("database schema initialized");
        Ok(())
    }

    /// Upsert a run snapshot by run id.
    pub fn save_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        let best = snapshot
            .best
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn().execute(
            r#"
            INSERT INTO optimization_runs (run_id, instrument, algorithm, status,
                                           iterations_completed, iteration_budget,
                                           best, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(run_id) DO UPDATE SET
                status = ?4,
                iterations_completed = ?5,
                iteration_budget = ?6,
                best = ?7,
                error = ?8,
                updated_at = ?10
            "#,
            params![
                snapshot.run_id,
                snapshot.instrument,
                snapshot.algorithm.to_string(),
                snapshot.status.to_string(),
                snapshot.iterations_completed,
                snapshot.iteration_budget,
                best,
                snapshot.error,
                snapshot.created_at.to_rfc3339(),
                snapshot.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, instrument, algorithm, status, iterations_completed,
                   iteration_budget, best, error, created_at, updated_at
            FROM optimization_runs
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(RawRun {
                run_id: row.get(0)?,
                instrument: row.get(1)?,
                algorithm: row.get(2)?,
                status: row.get(3)?,
                iterations_completed: row.get(4)?,
                iteration_budget: row.get(5)?,
                best: row.get(6)?,
                error: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(raw?.into_snapshot()?);
        }
        Ok(runs)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn();
        let raw = conn
            .query_row(
                r#"
                SELECT run_id, instrument, algorithm, status, iterations_completed,
                       iteration_budget, best, error, created_at, updated_at
                FROM optimization_runs
                WHERE run_id = ?1
                "#,
                [run_id],
                |row| {
                    Ok(RawRun {
                        run_id: row.get(0)?,
                        instrument: row.get(1)?,
                        algorithm: row.get(2)?,
                        status: row.get(3)?,
                        iterations_completed: row.get(4)?,
                        iteration_budget: row.get(5)?,
                        best: row.get(6)?,
                        error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        raw.map(RawRun::into_snapshot).transpose()
    }

    /// Upsert a pair verdict by canonical key.
    pub fn save_pair(&self, stat: &PairStatistic) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO pair_correlations (pair_key, correlation, zscore, signal,
                                           strength, observations, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(pair_key) DO UPDATE SET
                correlation = ?2,
                zscore = ?3,
                signal = ?4,
                strength = ?5,
                observations = ?6,
                computed_at = ?7
            "#,
            params![
                stat.key.as_str(),
                stat.correlation,
                stat.zscore,
                stat.signal.to_string(),
                stat.strength.to_string(),
                stat.observations,
                stat.computed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Stored verdicts, most stretched ratio first, optionally filtered by
    /// minimum signed correlation and minimum |z-score|. The correlation
    /// floor is signed on purpose: anticorrelated pairs are not
    /// mean-reversion candidates and must not sneak past the filter.
    pub fn get_correlations(
        &self,
        min_correlation: Option<f64>,
        min_zscore: Option<f64>,
        limit: usize,
    ) -> Result<Vec<PairStatistic>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT pair_key, correlation, zscore, signal, strength, observations, computed_at
            FROM pair_correlations
            WHERE correlation >= ?1 AND ABS(zscore) >= ?2
            ORDER BY ABS(zscore) DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![
                min_correlation.unwrap_or(-1.0),
                min_zscore.unwrap_or(0.0),
                limit
            ],
            |row| {
                Ok(RawPair {
                    pair_key: row.get(0)?,
                    correlation: row.get(1)?,
                    zscore: row.get(2)?,
                    signal: row.get(3)?,
                    strength: row.get(4)?,
                    observations: row.get(5)?,
                    computed_at: row.get(6)?,
                })
            },
        )?;
        let mut stats = Vec::new();
        for raw in rows {
            stats.push(raw?.into_statistic()?);
        }
        Ok(stats)
    }
}

struct RawRun {
    run_id: String,
    instrument: String,
    algorithm: String,
    status: String,
    iterations_completed: u64,
    iteration_budget: u64,
    best: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRun {
    fn into_snapshot(self) -> Result<RunSnapshot> {
        Ok(RunSnapshot {
            run_id: self.run_id,
            instrument: self.instrument,
            algorithm: self.algorithm.parse::<Algorithm>()?,
            status: self.status.parse::<RunStatus>()?,
            iterations_completed: self.iterations_completed,
            iteration_budget: self.iteration_budget,
            best: self
                .best
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct RawPair {
    pair_key: String,
    correlation: f64,
    zscore: f64,
    signal: String,
    strength: String,
    observations: usize,
    computed_at: String,
}

impl RawPair {
    fn into_statistic(self) -> Result<PairStatistic> {
        let signal = match self.signal.as_str() {
            "neutral" => Signal::Neutral,
            "long_first" => Signal::LongFirst,
            "long_second" => Signal::LongSecond,
            other => {
                return Err(EngineError::Configuration(format!(
                    "unknown stored signal '{other}'"
                )))
            }
        };
        let strength = match self.strength.as_str() {
            "weak" => Strength::Weak,
            "medium" => Strength::Medium,
            "strong" => Strength::Strong,
            other => {
                return Err(EngineError::Configuration(format!(
                    "unknown stored strength '{other}'"
                )))
            }
        };
        Ok(PairStatistic {
            key: PairKey::parse(&self.pair_key)?,
            correlation: self.correlation,
            zscore: self.zscore,
            signal,
            strength,
            observations: self.observations,
            computed_at: parse_timestamp(&self.computed_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Configuration(format!("bad stored timestamp '{s}': {e}")))
}
