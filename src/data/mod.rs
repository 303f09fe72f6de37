//! Historical price data access.
//!
//! Provides the `PriceSeries` type consumed by the objective evaluator and
//! the pairs engine, plus loaders: CSV import for CLI use and an in-memory
//! provider for tests.

use crate::error::{EngineError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A single observation for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// Ordered price history for one instrument.
///
/// Timestamps are strictly increasing with no duplicates; this is enforced
/// at construction so downstream statistics never have to re-check it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSeries {
    pub instrument: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Create a series, validating timestamp ordering.
    pub fn new(instrument: impl Into<String>, points: Vec<PricePoint>) -> Result<Self> {
        for pair in points.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(EngineError::Configuration(format!(
                    "price series timestamps must be strictly increasing: {} followed by {}",
                    pair[0].timestamp, pair[1].timestamp
                )));
            }
        }
        Ok(Self {
            instrument: instrument.into(),
            points,
        })
    }

    /// Build a series from (timestamp, price) tuples, sorting and dropping
    /// duplicate timestamps (last write wins). Used by loaders where input
    /// ordering is not guaranteed.
    pub fn from_unsorted(
        instrument: impl Into<String>,
        mut rows: Vec<(DateTime<Utc>, Decimal)>,
    ) -> Self {
        rows.sort_by_key(|(ts, _)| *ts);
        rows.dedup_by_key(|(ts, _)| *ts);
        Self {
            instrument: instrument.into(),
            points: rows
                .into_iter()
                .map(|(timestamp, price)| PricePoint { timestamp, price })
                .collect(),
        }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Prices as f64 for statistical computation.
    pub fn prices_f64(&self) -> Vec<f64> {
        self.points
            .iter()
            .map(|p| p.price.to_f64().unwrap_or(0.0))
            .collect()
    }

    /// Restrict to the trailing `lookback` points.
    pub fn tail(&self, lookback: usize) -> &[PricePoint] {
        let start = self.points.len().saturating_sub(lookback);
        &self.points[start..]
    }

    /// Median sampling interval in seconds. Zero for series shorter than 2.
    pub fn median_interval_secs(&self) -> i64 {
        if self.points.len() < 2 {
            return 0;
        }
        let mut gaps: Vec<i64> = self
            .points
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds())
            .collect();
        gaps.sort_unstable();
        gaps[gaps.len() / 2]
    }
}

/// Read access to historical prices, keyed by instrument id.
///
/// This is the outbound seam to whatever store or feed the surrounding
/// service uses; the engine never fetches data any other way.
#[async_trait]
pub trait PriceHistory: Send + Sync {
    /// Fetch the series for one instrument within a time range.
    async fn get_series(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<PriceSeries>;

    /// All instruments this provider knows about.
    fn available_instruments(&self) -> Vec<String>;
}

/// CSV-backed price history.
///
/// Expected format:
/// ```csv
/// timestamp,instrument,price
/// 2024-01-01T00:00:00Z,BTCUSDT,42000.50
/// ```
#[derive(Clone)]
pub struct CsvPriceHistory {
    series: HashMap<String, PriceSeries>,
}

impl CsvPriceHistory {
    /// Load from a CSV file.
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;
        Self::from_csv_content(&content)
    }

    /// Load from CSV content string.
    pub fn from_csv_content(content: &str) -> anyhow::Result<Self> {
        let mut rows: HashMap<String, Vec<(DateTime<Utc>, Decimal)>> = HashMap::new();

        for (line_num, line) in content.lines().enumerate() {
            // Skip header
            if line_num == 0 && line.starts_with("timestamp") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() < 3 {
                anyhow::bail!(
                    "Line {}: expected 3 columns (timestamp,instrument,price), got {}",
                    line_num + 1,
                    parts.len()
                );
            }

            let timestamp: DateTime<Utc> = parts[0]
                .trim()
                .parse()
                .with_context(|| format!("Line {}: invalid timestamp: {}", line_num + 1, parts[0]))?;
            let instrument = parts[1].trim().to_string();
            let price: Decimal = parts[2]
                .trim()
                .parse()
                .with_context(|| format!("Line {}: invalid price: {}", line_num + 1, parts[2]))?;

            rows.entry(instrument).or_default().push((timestamp, price));
        }

        if rows.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        let series = rows
            .into_iter()
            .map(|(instrument, points)| {
                let s = PriceSeries::from_unsorted(instrument.clone(), points);
                (instrument, s)
            })
            .collect();

        Ok(Self { series })
    }
}

#[async_trait]
impl PriceHistory for CsvPriceHistory {
    async fn get_series(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<PriceSeries> {
        let series = self
            .series
            .get(instrument)
            .with_context(|| format!("No price data for instrument {instrument}"))?;
        let points: Vec<PricePoint> = series
            .points()
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect();
        Ok(PriceSeries {
            instrument: instrument.to_string(),
            points,
        })
    }

    fn available_instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.series.keys().cloned().collect();
        instruments.sort();
        instruments
    }
}

/// In-memory price history for tests and embedded use.
#[derive(Clone, Default)]
pub struct MemoryPriceHistory {
    series: HashMap<String, PriceSeries>,
}

impl MemoryPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: PriceSeries) {
        self.series.insert(series.instrument.clone(), series);
    }
}

#[async_trait]
impl PriceHistory for MemoryPriceHistory {
    async fn get_series(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<PriceSeries> {
        let series = self
            .series
            .get(instrument)
            .with_context(|| format!("No price data for instrument {instrument}"))?;
        let points: Vec<PricePoint> = series
            .points()
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect();
        Ok(PriceSeries {
            instrument: instrument.to_string(),
            points,
        })
    }

    fn available_instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.series.keys().cloned().collect();
        instruments.sort();
        instruments
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::prelude::FromPrimitive;

    /// Hourly series starting 2024-01-01 with the given prices.
    pub fn hourly_series(instrument: &str, prices: &[f64]) -> PriceSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| PricePoint {
                timestamp: start + Duration::hours(i as i64),
                price: Decimal::from_f64(p).unwrap(),
            })
            .collect();
        PriceSeries::new(instrument, points).unwrap()
    }
}
