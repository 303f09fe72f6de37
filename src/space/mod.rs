//! Parameter spaces and candidate assignments.
//!
//! A `ParameterSpace` is an ordered list of named bounds; a `Candidate` is
//! one concrete assignment of every parameter. Search strategies operate in
//! a normalized [0,1] coordinate per dimension and decode through the space,
//! which guarantees bounds and types are respected regardless of algorithm.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bound for a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamBound {
    /// Real-valued parameter in [min, max].
    Continuous { min: f64, max: f64 },
    /// Integer parameter in [min, max] inclusive.
    Integer { min: i64, max: i64 },
    /// One of a finite set of named values.
    Categorical { choices: Vec<String> },
}

impl ParamBound {
    fn validate(&self, name: &str) -> Result<()> {
        match self {
            ParamBound::Continuous { min, max } => {
                if !min.is_finite() || !max.is_finite() || min >= max {
                    return Err(EngineError::Configuration(format!(
                        "parameter '{name}': continuous bound [{min}, {max}] is empty or non-finite"
                    )));
                }
            }
            ParamBound::Integer { min, max } => {
                if min > max {
                    return Err(EngineError::Configuration(format!(
                        "parameter '{name}': integer bound [{min}, {max}] is empty"
                    )));
                }
            }
            ParamBound::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(EngineError::Configuration(format!(
                        "parameter '{name}': categorical bound enumerates no values"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decode a normalized coordinate in [0,1] to a concrete value.
    /// Integers round to the nearest valid integer, categoricals snap to an
    /// enumerated choice; out-of-range input is clamped first.
    pub fn decode(&self, unit: f64) -> ParamValue {
        let unit = unit.clamp(0.0, 1.0);
        match self {
            ParamBound::Continuous { min, max } => {
                ParamValue::Float(min + unit * (max - min))
            }
            ParamBound::Integer { min, max } => {
                let span = (*max - *min) as f64;
                ParamValue::Int(min + (unit * span).round() as i64)
            }
            ParamBound::Categorical { choices } => {
                let idx =
                    ((unit * choices.len() as f64) as usize).min(choices.len() - 1);
                ParamValue::Choice(choices[idx].clone())
            }
        }
    }

    /// Encode a concrete value back to a normalized coordinate. Returns
    /// None when the value does not belong to this bound.
    pub fn encode(&self, value: &ParamValue) -> Option<f64> {
        match (self, value) {
            (ParamBound::Continuous { min, max }, ParamValue::Float(v)) => {
                Some(((v - min) / (max - min)).clamp(0.0, 1.0))
            }
            (ParamBound::Integer { min, max }, ParamValue::Int(v)) => {
                if min == max {
                    Some(0.0)
                } else {
                    Some(((v - min) as f64 / (max - min) as f64).clamp(0.0, 1.0))
                }
            }
            (ParamBound::Categorical { choices }, ParamValue::Choice(c)) => {
                let idx = choices.iter().position(|x| x == c)?;
                // Midpoint of the choice's bucket so decode(encode(v)) == v
                Some((idx as f64 + 0.5) / choices.len() as f64)
            }
            _ => None,
        }
    }

    /// Whether a value lies within this bound and matches its type.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamBound::Continuous { min, max }, ParamValue::Float(v)) => {
                *v >= *min && *v <= *max
            }
            (ParamBound::Integer { min, max }, ParamValue::Int(v)) => {
                *v >= *min && *v <= *max
            }
            (ParamBound::Categorical { choices }, ParamValue::Choice(c)) => {
                choices.iter().any(|x| x == c)
            }
            _ => false,
        }
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Choice(String),
}

impl ParamValue {
    /// Numeric view: integers widen to f64, choices have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Choice(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:.6}"),
            ParamValue::Choice(c) => write!(f, "{c}"),
        }
    }
}

/// Ordered mapping from parameter name to bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpace {
    params: Vec<(String, ParamBound)>,
}

impl ParameterSpace {
    /// Build a space, validating every bound. Duplicate names and empty
    /// spaces are configuration errors.
    pub fn new(params: Vec<(String, ParamBound)>) -> Result<Self> {
        if params.is_empty() {
            return Err(EngineError::Configuration(
                "parameter space must declare at least one parameter".into(),
            ));
        }
        for (i, (name, bound)) in params.iter().enumerate() {
            bound.validate(name)?;
            if params[..i].iter().any(|(other, _)| other == name) {
                return Err(EngineError::Configuration(format!(
                    "duplicate parameter name '{name}'"
                )));
            }
        }
        Ok(Self { params })
    }

    pub fn dimensions(&self) -> usize {
        self.params.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ParamBound)> {
        self.params.iter()
    }

    pub fn bound(&self, name: &str) -> Option<&ParamBound> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    /// Decode a normalized point (one coordinate per dimension) into a
    /// candidate. Panics are avoided by clamping; the caller guarantees the
    /// length matches `dimensions()`.
    pub fn decode(&self, unit_point: &[f64]) -> Candidate {
        debug_assert_eq!(unit_point.len(), self.params.len());
        let values = self
            .params
            .iter()
            .zip(unit_point)
            .map(|((name, bound), &u)| (name.clone(), bound.decode(u)))
            .collect();
        Candidate { values }
    }

    /// Encode a candidate into normalized coordinates.
    pub fn encode(&self, candidate: &Candidate) -> Result<Vec<f64>> {
        self.params
            .iter()
            .map(|(name, bound)| {
                let value = candidate.get(name).ok_or_else(|| {
                    EngineError::ContractViolation(format!(
                        "candidate is missing parameter '{name}'"
                    ))
                })?;
                bound.encode(value).ok_or_else(|| {
                    EngineError::ContractViolation(format!(
                        "candidate value {value} does not fit bound of '{name}'"
                    ))
                })
            })
            .collect()
    }

    /// Verify a candidate assigns every parameter a value within bounds.
    pub fn check(&self, candidate: &Candidate) -> Result<()> {
        if candidate.values.len() != self.params.len() {
            return Err(EngineError::ContractViolation(format!(
                "candidate has {} values, space has {} parameters",
                candidate.values.len(),
                self.params.len()
            )));
        }
        for (name, bound) in &self.params {
            match candidate.get(name) {
                Some(value) if bound.contains(value) => {}
                Some(value) => {
                    return Err(EngineError::ContractViolation(format!(
                        "candidate value {value} out of bounds for '{name}'"
                    )))
                }
                None => {
                    return Err(EngineError::ContractViolation(format!(
                        "candidate is missing parameter '{name}'"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// One full parameter assignment. Immutable once scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    values: Vec<(String, ParamValue)>,
}

impl Candidate {
    pub fn new(values: Vec<(String, ParamValue)>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ParamValue)> {
        self.values.iter()
    }

    /// Numeric lookup with a default, used by the evaluator's rule set.
    pub fn f64_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).and_then(ParamValue::as_f64).unwrap_or(default)
    }

    /// Integer lookup with a default.
    pub fn i64_or(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|v| match v {
                ParamValue::Int(i) => Some(*i),
                ParamValue::Float(f) => Some(f.round() as i64),
                ParamValue::Choice(_) => None,
            })
            .unwrap_or(default)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsi_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            (
                "rsi_period".into(),
                ParamBound::Integer { min: 5, max: 30 },
            ),
            (
                "stop_loss".into(),
                ParamBound::Continuous {
                    min: 0.005,
                    max: 0.05,
                },
            ),
            (
                "exit_mode".into(),
                ParamBound::Categorical {
                    choices: vec!["signal".into(), "target".into()],
                },
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_bounds() {
        assert!(ParameterSpace::new(vec![(
            "x".into(),
            ParamBound::Continuous { min: 1.0, max: 1.0 }
        )])
        .is_err());
        assert!(ParameterSpace::new(vec![(
            "x".into(),
            ParamBound::Categorical { choices: vec![] }
        )])
        .is_err());
        assert!(ParameterSpace::new(vec![]).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = ParameterSpace::new(vec![
            ("x".into(), ParamBound::Integer { min: 0, max: 1 }),
            ("x".into(), ParamBound::Integer { min: 0, max: 1 }),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_respects_types_and_bounds() {
        let space = rsi_space();
        for &u in &[0.0, 0.17, 0.5, 0.99, 1.0, 1.7, -0.3] {
            let candidate = space.decode(&[u, u, u]);
            space.check(&candidate).unwrap();
            assert!(matches!(
                candidate.get("rsi_period"),
                Some(ParamValue::Int(_))
            ));
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let space = rsi_space();
        let candidate = space.decode(&[0.3, 0.6, 0.9]);
        let encoded = space.encode(&candidate).unwrap();
        let decoded = space.decode(&encoded);
        assert_eq!(candidate, decoded);
    }

    #[test]
    fn test_categorical_never_outside_enumeration() {
        let bound = ParamBound::Categorical {
            choices: vec!["a".into(), "b".into(), "c".into()],
        };
        for i in 0..=100 {
            let value = bound.decode(i as f64 / 100.0);
            assert!(bound.contains(&value));
        }
    }

    #[test]
    fn test_check_flags_out_of_bounds() {
        let space = rsi_space();
        let mut candidate = space.decode(&[0.5, 0.5, 0.5]);
        candidate.values[0].1 = ParamValue::Int(99);
        assert!(matches!(
            space.check(&candidate),
            Err(crate::error::EngineError::ContractViolation(_))
        ));
    }
}
