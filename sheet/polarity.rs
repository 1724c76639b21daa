//! Presents a fitted model as a scoring sheet for either target class.
//!
//! A model is always fitted for the positive class. The sheet for the complementary class is
//! derived from the positive one without refitting: points and scores change sign and each risk
//! `p` becomes `100 - p`.

use crate::calibrate::{CalibrationError, ScoreProbabilityTable, ScoreRisk, calibrate};
use crate::enumerate::{EnumerationError, enumerate_scores};
use crate::model::{DecisionParameter, FittedScoringModel};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The class whose risk a sheet reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetClass {
    #[default]
    Positive,
    Negative,
}

impl TargetClass {
    pub fn flipped(self) -> Self {
        match self {
            TargetClass::Positive => TargetClass::Negative,
            TargetClass::Negative => TargetClass::Positive,
        }
    }
}

impl fmt::Display for TargetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetClass::Positive => write!(f, "positive"),
            TargetClass::Negative => write!(f, "negative"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DerivationError {
    #[error("Failed to enumerate achievable scores: {0}")]
    Enumeration(#[from] EnumerationError),
    #[error("Failed to calibrate scores into risks: {0}")]
    Calibration(#[from] CalibrationError),
}

/// Decision parameters and the score/risk table for one target class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSheet {
    pub decision_parameters: Vec<DecisionParameter>,
    pub table: ScoreProbabilityTable,
    pub target: TargetClass,
}

impl ScoringSheet {
    /// Sum of the points of the decision parameters at the given positions.
    pub fn total_points(&self, checked: &[usize]) -> i64 {
        checked
            .iter()
            .filter_map(|&i| self.decision_parameters.get(i))
            .map(|p| p.points)
            .sum()
    }
}

/// Builds the positive-class sheet of a model.
pub fn derive_sheet(model: &FittedScoringModel) -> Result<ScoringSheet, DerivationError> {
    let scores = enumerate_scores(model)?;
    let table = calibrate(&scores, model.intercept(), model.multiplier())?;
    log::debug!(
        "Derived scoring sheet with {} decision parameters and {} score levels",
        model.support().len(),
        table.len()
    );
    Ok(ScoringSheet {
        decision_parameters: model.decision_parameters(),
        table,
        target: TargetClass::Positive,
    })
}

/// Builds the sheet of a model for the requested target class.
pub fn derive_sheet_for(
    model: &FittedScoringModel,
    target: TargetClass,
) -> Result<ScoringSheet, DerivationError> {
    let sheet = derive_sheet(model)?;
    Ok(match target {
        TargetClass::Positive => sheet,
        TargetClass::Negative => flip(&sheet),
    })
}

/// The same sheet seen from the complementary class. Applying it twice restores the
/// original up to floating-point rounding of the risks.
pub fn flip(sheet: &ScoringSheet) -> ScoringSheet {
    let decision_parameters = sheet
        .decision_parameters
        .iter()
        .map(|p| DecisionParameter {
            attribute: p.attribute.clone(),
            points: -p.points,
        })
        .collect();

    let mut rows: Vec<ScoreRisk> = sheet
        .table
        .rows()
        .iter()
        .map(|row| ScoreRisk {
            score: negate(row.score),
            probability: 100.0 - row.probability,
        })
        .collect();
    rows.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.probability.total_cmp(&b.probability))
    });

    ScoringSheet {
        decision_parameters,
        table: ScoreProbabilityTable::from_sorted_rows(rows),
        target: sheet.target.flipped(),
    }
}

/// Negation without producing `-0.0`.
fn negate(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { -value }
}
