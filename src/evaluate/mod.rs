//! Objective evaluator: scores one candidate against historical prices.
//!
//! Simulates an RSI mean-reversion rule set parameterized by the candidate,
//! produces a synthetic trade log at 1-unit notional, and scores it with an
//! annualized Sharpe-like ratio (mean trade return / return std).
//!
//! The evaluator is a pure function of its inputs: no shared mutable state,
//! safe to call concurrently against the same immutable series.

use crate::data::PriceSeries;
use crate::error::{EngineError, Result};
use crate::space::Candidate;
use serde::{Deserialize, Serialize};

const SECONDS_PER_YEAR: f64 = 365.0 * 86_400.0;

/// Parameter names the rule set reads from a candidate, with defaults used
/// when a space does not declare them.
pub const PARAM_RSI_PERIOD: &str = "rsi_period";
pub const PARAM_RSI_OVERSOLD: &str = "rsi_oversold";
pub const PARAM_RSI_OVERBOUGHT: &str = "rsi_overbought";
pub const PARAM_STOP_LOSS: &str = "stop_loss";
pub const PARAM_TAKE_PROFIT: &str = "take_profit";

/// One closed trade from the simulation.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedTrade {
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_price: f64,
    pub exit_price: f64,
}

impl SimulatedTrade {
    /// Simple return at 1-unit notional.
    pub fn ret(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.exit_price - self.entry_price) / self.entry_price
    }
}

/// Evaluation metadata recorded alongside the score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvaluationMeta {
    pub trade_count: usize,
    pub mean_return: f64,
    pub return_std: f64,
    pub max_drawdown: f64,
}

/// A candidate plus its score. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Higher is better. Always finite: degenerate simulations score 0.
    pub score: f64,
    pub meta: EvaluationMeta,
}

/// The strategy rule set resolved from one candidate.
#[derive(Debug, Clone, Copy)]
struct ResolvedRules {
    rsi_period: usize,
    rsi_oversold: f64,
    rsi_overbought: f64,
    stop_loss: f64,
    take_profit: f64,
}

impl ResolvedRules {
    fn from_candidate(candidate: &Candidate) -> Result<Self> {
        let rsi_period = candidate.i64_or(PARAM_RSI_PERIOD, 14);
        if rsi_period < 2 {
            return Err(EngineError::Configuration(format!(
                "rsi_period must be >= 2, got {rsi_period}"
            )));
        }
        Ok(Self {
            rsi_period: rsi_period as usize,
            rsi_oversold: candidate.f64_or(PARAM_RSI_OVERSOLD, 30.0),
            rsi_overbought: candidate.f64_or(PARAM_RSI_OVERBOUGHT, 70.0),
            stop_loss: candidate.f64_or(PARAM_STOP_LOSS, 0.02),
            take_profit: candidate.f64_or(PARAM_TAKE_PROFIT, 0.04),
        })
    }

    /// Minimum number of price points the simulation needs.
    fn min_points(&self) -> usize {
        self.rsi_period + 2
    }
}

/// Evaluate one candidate against a price series.
///
/// Fails with `InsufficientData` when the series is shorter than the rule
/// set's minimum lookback; that is a configuration problem for the caller
/// to handle, not a bad candidate scored as 0.
pub fn evaluate(candidate: &Candidate, series: &PriceSeries) -> Result<ScoredCandidate> {
    let rules = ResolvedRules::from_candidate(candidate)?;

    if series.len() < rules.min_points() {
        return Err(EngineError::InsufficientData {
            required: rules.min_points(),
            actual: series.len(),
        });
    }

    let prices = series.prices_f64();
    let trades = simulate(&prices, &rules);
    let returns: Vec<f64> = trades.iter().map(SimulatedTrade::ret).collect();

    let (mean, std) = mean_and_std(&returns);
    let max_drawdown = max_drawdown(&returns);

    // Annualize by sampling frequency. Degenerate cases (no trades, zero
    // variance, unknown interval) score 0 so the search stays well-defined
    // everywhere in the space.
    let interval = series.median_interval_secs();
    let score = if returns.is_empty() || std <= f64::EPSILON || interval <= 0 {
        0.0
    } else {
        let periods_per_year = SECONDS_PER_YEAR / interval as f64;
        mean / std * periods_per_year.sqrt()
    };

    Ok(ScoredCandidate {
        candidate: candidate.clone(),
        score,
        meta: EvaluationMeta {
            trade_count: returns.len(),
            mean_return: mean,
            return_std: std,
            max_drawdown,
        },
    })
}

/// Run the entry/exit rules over the price path.
fn simulate(prices: &[f64], rules: &ResolvedRules) -> Vec<SimulatedTrade> {
    let rsi = wilder_rsi(prices, rules.rsi_period);
    let mut trades = Vec::new();
    let mut open: Option<(usize, f64)> = None;

    for i in 0..prices.len() {
        let price = prices[i];
        match open {
            None => {
                if let Some(r) = rsi[i] {
                    if r < rules.rsi_oversold {
                        open = Some((i, price));
                    }
                }
            }
            Some((entry_index, entry_price)) => {
                let stop_hit = price <= entry_price * (1.0 - rules.stop_loss);
                let target_hit = price >= entry_price * (1.0 + rules.take_profit);
                let signal_exit = rsi[i].is_some_and(|r| r > rules.rsi_overbought);
                let last_bar = i == prices.len() - 1;

                if stop_hit || target_hit || signal_exit || last_bar {
                    trades.push(SimulatedTrade {
                        entry_index,
                        exit_index: i,
                        entry_price,
                        exit_price: price,
                    });
                    open = None;
                }
            }
        }
    }

    trades
}

/// RSI with Wilder smoothing. `None` until the warmup period has passed.
fn wilder_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; prices.len()];
    if prices.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let (gain, loss) = if delta >= 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= f64::EPSILON {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// Population mean and standard deviation.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Maximum peak-to-trough drawdown of the cumulative return path.
fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 0.0;
    let mut peak = 0.0;
    let mut max_dd = 0.0;
    for r in returns {
        equity += r;
        if equity > peak {
            peak = equity;
        } else if peak - equity > max_dd {
            max_dd = peak - equity;
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testutil::hourly_series;
    use crate::space::{ParamBound, ParameterSpace};

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            (
                PARAM_RSI_PERIOD.into(),
                ParamBound::Integer { min: 3, max: 30 },
            ),
            (
                PARAM_STOP_LOSS.into(),
                ParamBound::Continuous {
                    min: 0.005,
                    max: 0.05,
                },
            ),
        ])
        .unwrap()
    }

    /// Sawtooth prices: repeated drops then recoveries, enough to trigger
    /// both oversold entries and overbought exits at short RSI periods.
    fn sawtooth(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let phase = (i % 10) as f64;
                if phase < 5.0 {
                    100.0 - phase * 2.0
                } else {
                    90.0 + (phase - 5.0) * 2.5
                }
            })
            .collect()
    }

    #[test]
    fn test_insufficient_data_propagates() {
        let candidate = space().decode(&[0.5, 0.5]);
        let series = hourly_series("BTCUSDT", &[100.0, 101.0, 102.0]);
        let result = evaluate(&candidate, &series);
        assert!(matches!(
            result,
            Err(EngineError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_flat_series_scores_zero() {
        let candidate = space().decode(&[0.0, 0.5]);
        let series = hourly_series("BTCUSDT", &vec![100.0; 64]);
        let scored = evaluate(&candidate, &series).unwrap();
        assert_eq!(scored.score, 0.0);
    }

    #[test]
    fn test_sawtooth_produces_trades() {
        let candidate = space().decode(&[0.0, 1.0]);
        let series = hourly_series("BTCUSDT", &sawtooth(120));
        let scored = evaluate(&candidate, &series).unwrap();
        assert!(scored.meta.trade_count > 0);
        assert!(scored.score.is_finite());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let candidate = space().decode(&[0.25, 0.75]);
        let series = hourly_series("BTCUSDT", &sawtooth(96));
        let a = evaluate(&candidate, &series).unwrap();
        let b = evaluate(&candidate, &series).unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(a.meta.trade_count, b.meta.trade_count);
    }

    #[test]
    fn test_wilder_rsi_bounds() {
        let rsi = wilder_rsi(&sawtooth(50), 5);
        for value in rsi.iter().flatten() {
            assert!(*value >= 0.0 && *value <= 100.0);
        }
        // Warmup period has no value
        assert!(rsi[4].is_none());
        assert!(rsi[5].is_some());
    }

    #[test]
    fn test_max_drawdown() {
        // Cumulative path: 0.1, 0.3, 0.05, 0.2 — worst drop 0.25
        let dd = max_drawdown(&[0.1, 0.2, -0.25, 0.15]);
        assert!((dd - 0.25).abs() < 1e-12);
    }
}
