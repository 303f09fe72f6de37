//! Statistical-arbitrage pair analysis.
//!
//! `engine` holds the pure statistics (correlation, log-ratio z-score,
//! signal classification); `coordinator` fans the engine out over every
//! instrument pair and persists the results.

pub mod coordinator;
pub mod engine;

pub use coordinator::{PairsAnalyzer, PairsReport, PairsRequest, PairsSummary, SkippedPair};

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier for an unordered instrument pair. Construction
/// sorts the legs so (A, B) and (B, A) name the same pair everywhere,
/// including in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    first: String,
    second: String,
}

impl PairKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Result<Self> {
        let a = a.into();
        let b = b.into();
        if a == b {
            return Err(EngineError::Configuration(format!(
                "a pair needs two distinct instruments, got '{a}' twice"
            )));
        }
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self { first, second })
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    /// Storage form, `FIRST/SECOND`.
    pub fn as_str(&self) -> String {
        format!("{}/{}", self.first, self.second)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() => Self::new(a, b),
            _ => Err(EngineError::Configuration(format!(
                "malformed pair key '{s}'"
            ))),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first, self.second)
    }
}

/// Trade direction implied by the ratio deviation. `LongFirst` means buy
/// the first leg and short the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Neutral,
    LongFirst,
    LongSecond,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::Neutral => "neutral",
            Signal::LongFirst => "long_first",
            Signal::LongSecond => "long_second",
        };
        write!(f, "{s}")
    }
}

/// Conviction band derived from how far the z-score sits past the
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strength::Weak => "weak",
            Strength::Medium => "medium",
            Strength::Strong => "strong",
        };
        write!(f, "{s}")
    }
}

/// Full statistical verdict for one pair at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairStatistic {
    pub key: PairKey,
    pub correlation: f64,
    pub zscore: f64,
    pub signal: Signal,
    pub strength: Strength,
    pub observations: usize,
    pub computed_at: DateTime<Utc>,
}
