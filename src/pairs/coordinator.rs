//! Fan-out of the pair engine over every instrument combination.

use super::engine;
use super::{PairKey, PairStatistic, Signal, Strength};
use crate::config::PairsConfig;
use crate::data::{PriceHistory, PriceSeries};
use crate::error::{EngineError, Result};
use crate::persistence::SqliteStore;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One pairs-analysis request. Lookback and threshold fall back to the
/// configured defaults when absent.
#[derive(Debug, Clone)]
pub struct PairsRequest {
    pub instruments: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub lookback: Option<usize>,
    pub zscore_threshold: Option<f64>,
}

/// A pair left out of the results, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedPair {
    pub key: PairKey,
    pub reason: String,
}

/// Aggregate view over one analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsSummary {
    pub total_pairs: usize,
    pub strong_signals: usize,
    pub medium_signals: usize,
    pub avg_correlation: f64,
    pub max_abs_zscore: f64,
    pub arbitrage_opportunities: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsReport {
    pub summary: PairsSummary,
    /// Per-pair verdicts, most stretched ratio first.
    pub statistics: Vec<PairStatistic>,
    pub skipped: Vec<SkippedPair>,
}

/// Runs pair analysis across an instrument universe and persists every
/// verdict by canonical pair key.
pub struct PairsAnalyzer {
    config: PairsConfig,
    history: Arc<dyn PriceHistory>,
    store: Arc<SqliteStore>,
}

impl PairsAnalyzer {
    pub fn new(config: PairsConfig, history: Arc<dyn PriceHistory>, store: Arc<SqliteStore>) -> Self {
        Self {
            config,
            history,
            store,
        }
    }

    /// Analyze every unordered pair of the given instruments.
    ///
    /// Pairs that cannot be computed (missing history, too few overlapping
    /// observations) are reported in `skipped` instead of failing the pass.
    pub async fn analyze(&self, request: PairsRequest) -> Result<PairsReport> {
        let mut instruments = request.instruments.clone();
        instruments.sort();
        instruments.dedup();
        if instruments.len() < 2 {
            return Err(EngineError::Configuration(format!(
                "pair analysis needs at least 2 distinct instruments, got {}",
                instruments.len()
            )));
        }
        let lookback = request.lookback.unwrap_or(self.config.default_lookback);
        let threshold = request
            .zscore_threshold
            .unwrap_or(self.config.default_zscore_threshold);
        if threshold <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "z-score threshold must be positive, got {threshold}"
            )));
        }

        let mut skipped = Vec::new();

        // Fetch each leg once, up front. A missing leg skips its pairs, not
        // the whole pass.
        let mut series: HashMap<String, Arc<PriceSeries>> = HashMap::new();
        for instrument in &instruments {
            match self
                .history
                .get_series(instrument, request.start, request.end)
                .await
            {
                Ok(s) => {
                    series.insert(instrument.clone(), Arc::new(s));
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "price history unavailable");
                    for other in &instruments {
                        if other != instrument {
                            if let Ok(key) = PairKey::new(instrument.as_str(), other.as_str()) {
                                skipped.push(SkippedPair {
                                    key,
                                    reason: format!("no price history for {instrument}: {e}"),
                                });
                            }
                        }
                    }
                }
            }
        }
        // Both legs missing produces the same key twice; keep one.
        skipped.sort_by(|a, b| a.key.as_str().cmp(&b.key.as_str()));
        skipped.dedup_by(|a, b| a.key == b.key);

        let mut combos = Vec::new();
        for i in 0..instruments.len() {
            for j in (i + 1)..instruments.len() {
                let (a, b) = (&instruments[i], &instruments[j]);
                if let (Some(sa), Some(sb)) = (series.get(a), series.get(b)) {
                    let key = PairKey::new(a.as_str(), b.as_str())?;
                    combos.push((key, sa.clone(), sb.clone()));
                }
            }
        }

        let min_observations = self.config.min_observations;
        let outcomes: Vec<(PairKey, Result<PairStatistic>)> = stream::iter(combos)
            .map(|(key, a, b)| async move {
                let stat = engine::compute_pair(&a, &b, lookback, min_observations, threshold);
                (key, stat)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut statistics = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(stat) => {
                    self.store.save_pair(&stat)?;
                    statistics.push(stat);
                }
                Err(EngineError::InsufficientData { required, actual }) => {
                    skipped.push(SkippedPair {
                        key,
                        reason: format!(
                            "insufficient overlapping observations ({actual} < {required})"
                        ),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        statistics.sort_by(|a, b| b.zscore.abs().total_cmp(&a.zscore.abs()));

        let summary = summarize(&statistics);
        info!(
            total = summary.total_pairs,
            strong = summary.strong_signals,
            opportunities = summary.arbitrage_opportunities,
            skipped = skipped.len(),
            "pairs analysis complete"
        );
        Ok(PairsReport {
            summary,
            statistics,
            skipped,
        })
    }
}

fn summarize(statistics: &[PairStatistic]) -> PairsSummary {
    let total = statistics.len();
    let strong = statistics
        .iter()
        .filter(|s| s.strength == Strength::Strong)
        .count();
    let medium = statistics
        .iter()
        .filter(|s| s.strength == Strength::Medium)
        .count();
    let avg_correlation = if total > 0 {
        statistics.iter().map(|s| s.correlation).sum::<f64>() / total as f64
    } else {
        0.0
    };
    let max_abs_zscore = statistics
        .iter()
        .map(|s| s.zscore.abs())
        .fold(0.0, f64::max);
    let opportunities = statistics
        .iter()
        .filter(|s| s.signal != Signal::Neutral)
        .count();
    PairsSummary {
        total_pairs: total,
        strong_signals: strong,
        medium_signals: medium,
        avg_correlation,
        max_abs_zscore,
        arbitrage_opportunities: opportunities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testutil::hourly_series;
    use crate::data::MemoryPriceHistory;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn analyzer(history: MemoryPriceHistory) -> PairsAnalyzer {
        PairsAnalyzer::new(
            PairsConfig::default(),
            Arc::new(history),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        )
    }

    fn request(instruments: &[&str]) -> PairsRequest {
        let (start, end) = window();
        PairsRequest {
            instruments: instruments.iter().map(|s| s.to_string()).collect(),
            start,
            end,
            lookback: Some(50),
            zscore_threshold: None,
        }
    }

    fn wavy(n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + ((i as f64 * 0.3) + phase).sin() * 4.0)
            .collect()
    }

    #[tokio::test]
    async fn test_all_combinations_analyzed() {
        let mut history = MemoryPriceHistory::new();
        for (i, sym) in ["AUSDT", "BUSDT", "CUSDT", "DUSDT"].iter().enumerate() {
            history.insert(hourly_series(sym, &wavy(60, i as f64)));
        }
        let report = analyzer(history)
            .analyze(request(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]))
            .await
            .unwrap();
        // C(4,2)
        assert_eq!(report.summary.total_pairs, 6);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_short_leg_is_skipped_not_fatal() {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("AUSDT", &wavy(60, 0.0)));
        history.insert(hourly_series("BUSDT", &wavy(60, 1.0)));
        history.insert(hourly_series("CUSDT", &wavy(5, 2.0)));
        let report = analyzer(history)
            .analyze(request(&["AUSDT", "BUSDT", "CUSDT"]))
            .await
            .unwrap();
        assert_eq!(report.summary.total_pairs, 1);
        assert_eq!(report.skipped.len(), 2);
        for skip in &report.skipped {
            assert!(skip.reason.contains("insufficient"));
        }
    }

    #[tokio::test]
    async fn test_duplicate_instruments_deduped() {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("AUSDT", &wavy(60, 0.0)));
        history.insert(hourly_series("BUSDT", &wavy(60, 1.0)));
        let report = analyzer(history)
            .analyze(request(&["AUSDT", "BUSDT", "AUSDT"]))
            .await
            .unwrap();
        assert_eq!(report.summary.total_pairs, 1);
    }

    #[tokio::test]
    async fn test_single_instrument_rejected() {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("AUSDT", &wavy(60, 0.0)));
        let err = analyzer(history)
            .analyze(request(&["AUSDT", "AUSDT"]))
            .await;
        assert!(matches!(err, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_statistics_ordered_by_abs_zscore() {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("AUSDT", &wavy(60, 0.0)));
        history.insert(hourly_series("BUSDT", &wavy(60, 0.5)));
        let mut diverging = wavy(60, 0.0);
        for p in diverging.iter_mut().skip(55) {
            *p += 20.0;
        }
        history.insert(hourly_series("CUSDT", &diverging));
        let report = analyzer(history)
            .analyze(request(&["AUSDT", "BUSDT", "CUSDT"]))
            .await
            .unwrap();
        let zs: Vec<f64> = report.statistics.iter().map(|s| s.zscore.abs()).collect();
        for pair in zs.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_eq!(report.summary.total_pairs, 3);
    }

    #[tokio::test]
    async fn test_results_persisted_by_canonical_key() {
        let mut history = MemoryPriceHistory::new();
        history.insert(hourly_series("ZUSDT", &wavy(60, 0.0)));
        history.insert(hourly_series("AUSDT", &wavy(60, 1.0)));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let analyzer = PairsAnalyzer::new(PairsConfig::default(), Arc::new(history), store.clone());
        analyzer.analyze(request(&["ZUSDT", "AUSDT"])).await.unwrap();
        // Run again; the upsert keeps one row per pair.
        analyzer.analyze(request(&["AUSDT", "ZUSDT"])).await.unwrap();
        let rows = store.get_correlations(None, None, 50).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.as_str(), "AUSDT/ZUSDT");
    }
}
