//! Pure pair statistics: two aligned price series in, one verdict out.

use super::{PairKey, PairStatistic, Signal, Strength};
use crate::data::PriceSeries;
use crate::error::{EngineError, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;

/// Compute correlation, z-score, and signal for one pair.
///
/// Series are aligned on exact timestamps first; only observations present
/// in both legs count. The trailing `lookback` aligned observations form
/// the window. Fewer than `min_observations` aligned points is an
/// `InsufficientData` verdict, which the coordinator reports as a skip
/// rather than a failure.
pub fn compute_pair(
    a: &PriceSeries,
    b: &PriceSeries,
    lookback: usize,
    min_observations: usize,
    zscore_threshold: f64,
) -> Result<PairStatistic> {
    let key = PairKey::new(a.instrument.as_str(), b.instrument.as_str())?;
    if zscore_threshold <= 0.0 {
        return Err(EngineError::Configuration(format!(
            "z-score threshold must be positive, got {zscore_threshold}"
        )));
    }

    // Canonical leg order: "first" is always key.first(), whatever order
    // the caller passed the series in.
    let (a, b) = if a.instrument == key.first() {
        (a, b)
    } else {
        (b, a)
    };

    // Correlation is undefined below two points, whatever the caller asked.
    let min_observations = min_observations.max(2);

    let aligned = align(a, b);
    let window_start = aligned.len().saturating_sub(lookback);
    let window = &aligned[window_start..];
    if window.len() < min_observations {
        return Err(EngineError::InsufficientData {
            required: min_observations,
            actual: window.len(),
        });
    }

    let (prices_a, prices_b): (Vec<f64>, Vec<f64>) = window.iter().copied().unzip();
    let correlation = pearson(&prices_a, &prices_b);

    // Z-score of the latest log price ratio against the window.
    let ratios: Vec<f64> = window.iter().map(|(pa, pb)| (pa / pb).ln()).collect();
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    let variance =
        ratios.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / ratios.len() as f64;
    let std = variance.sqrt();
    let last = *ratios.last().unwrap_or(&mean);
    // A perfectly rigid ratio is a valid neutral state, not an error.
    let zscore = if std > f64::EPSILON {
        (last - mean) / std
    } else {
        0.0
    };

    let signal = if zscore > zscore_threshold {
        // First leg rich relative to second: short it, buy the second.
        Signal::LongSecond
    } else if zscore < -zscore_threshold {
        Signal::LongFirst
    } else {
        Signal::Neutral
    };
    let strength = if zscore.abs() > 1.5 * zscore_threshold {
        Strength::Strong
    } else if zscore.abs() > zscore_threshold {
        Strength::Medium
    } else {
        Strength::Weak
    };

    Ok(PairStatistic {
        key,
        correlation,
        zscore,
        signal,
        strength,
        observations: window.len(),
        computed_at: Utc::now(),
    })
}

/// Intersect two ascending series on exact timestamps.
fn align(a: &PriceSeries, b: &PriceSeries) -> Vec<(f64, f64)> {
    let mut out = Vec::new();
    let (points_a, points_b) = (a.points(), b.points());
    let (mut i, mut j) = (0, 0);
    while i < points_a.len() && j < points_b.len() {
        match points_a[i].timestamp.cmp(&points_b[j].timestamp) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let pa = points_a[i].price.to_f64().unwrap_or(0.0);
                let pb = points_b[j].price.to_f64().unwrap_or(0.0);
                if pa > 0.0 && pb > 0.0 {
                    out.push((pa, pb));
                }
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Pearson correlation; 0.0 when either leg has zero variance.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}
