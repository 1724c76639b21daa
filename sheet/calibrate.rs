//! # Risk Calibration
//!
//! Converts total point scores into calibrated risks with the logistic link
//! `p(s) = sigmoid((intercept + s) / multiplier)`, reported as a percentage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("The model multiplier must be positive and finite, found {0}.")]
    NonPositiveMultiplier(f64),
    #[error("The model intercept must be finite, found {0}.")]
    NonFiniteIntercept(f64),
    #[error("Score {0} is not a finite number and cannot be calibrated.")]
    NonFiniteScore(f64),
    #[error("Score table rows are not sorted ascending by score at position {0}.")]
    UnsortedScores(usize),
    #[error("Risk {probability} for score {score} lies outside [0, 100].")]
    RiskOutOfRange { score: f64, probability: f64 },
}

/// Logistic function evaluated without overflow for large `|x|`.
pub fn stable_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// One row of the risk scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRisk {
    pub score: f64,
    /// Risk in percent, within `[0, 100]`.
    pub probability: f64,
}

/// Achievable scores with their calibrated risks, ascending by score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreProbabilityTable {
    rows: Vec<ScoreRisk>,
}

impl ScoreProbabilityTable {
    /// Builds a table from rows that are already sorted ascending by score.
    pub fn from_rows(rows: Vec<ScoreRisk>) -> Result<Self, CalibrationError> {
        for (i, row) in rows.iter().enumerate() {
            if !row.score.is_finite() {
                return Err(CalibrationError::NonFiniteScore(row.score));
            }
            if !(0.0..=100.0).contains(&row.probability) {
                return Err(CalibrationError::RiskOutOfRange {
                    score: row.score,
                    probability: row.probability,
                });
            }
            if i > 0 && rows[i - 1].score > row.score {
                return Err(CalibrationError::UnsortedScores(i));
            }
        }
        Ok(Self { rows })
    }

    /// Rows produced by a transformation that preserves every table invariant.
    pub(crate) fn from_sorted_rows(rows: Vec<ScoreRisk>) -> Self {
        debug_assert!(rows.windows(2).all(|w| w[0].score <= w[1].score));
        Self { rows }
    }

    pub fn rows(&self) -> &[ScoreRisk] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.score).collect()
    }

    pub fn probabilities(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.probability).collect()
    }

    /// The row whose score lies closest to `total`; the lower row wins ties.
    pub fn nearest(&self, total: f64) -> Option<&ScoreRisk> {
        self.rows.iter().min_by(|a, b| {
            (a.score - total)
                .abs()
                .total_cmp(&(b.score - total).abs())
        })
    }
}

/// Risk in percent for a single total score.
pub fn risk_percent(score: f64, intercept: f64, multiplier: f64) -> Result<f64, CalibrationError> {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err(CalibrationError::NonPositiveMultiplier(multiplier));
    }
    if !intercept.is_finite() {
        return Err(CalibrationError::NonFiniteIntercept(intercept));
    }
    if !score.is_finite() {
        return Err(CalibrationError::NonFiniteScore(score));
    }
    let risk = stable_sigmoid((intercept + score) / multiplier) * 100.0;
    Ok(risk.clamp(0.0, 100.0))
}

/// Calibrates an ascending score set into a [`ScoreProbabilityTable`].
pub fn calibrate(
    scores: &[f64],
    intercept: f64,
    multiplier: f64,
) -> Result<ScoreProbabilityTable, CalibrationError> {
    let rows = scores
        .iter()
        .map(|&score| {
            Ok(ScoreRisk {
                score,
                probability: risk_percent(score, intercept, multiplier)?,
            })
        })
        .collect::<Result<Vec<_>, CalibrationError>>()?;
    ScoreProbabilityTable::from_rows(rows)
}
