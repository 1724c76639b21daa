use crate::calibrate::stable_sigmoid;
use crate::labels::from_internal;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Largest absolute point value a decision parameter may carry.
pub const MAX_ABS_POINTS: i64 = 100;

// --- Public Data Structures ---
// The fitted model is the unit handed from training to inspection, and the only
// state that is written to disk (as TOML).

/// One condition of the scoring sheet: the attribute and the points it contributes when true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionParameter {
    pub attribute: String,
    pub points: i64,
}

/// The immutable result of fitting a scoring sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScoringModel {
    intercept: f64,
    multiplier: f64,
    /// One integer per input column; zero for columns the sheet does not use.
    coefficients: Vec<i64>,
    feature_names: Vec<String>,
    /// Training matrix, kept for sampling achievable scores of large sheets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    training_projection: Option<Array2<f64>>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model has {coefficients} coefficients but {names} feature names.")]
    MismatchedFeatureNames { coefficients: usize, names: usize },
    #[error("The model multiplier must be positive and finite, found {0}.")]
    InvalidMultiplier(f64),
    #[error("The model intercept must be finite, found {0}.")]
    InvalidIntercept(f64),
    #[error("Coefficient {points} of '{feature}' exceeds the limit of {max} points.", max = MAX_ABS_POINTS)]
    PointsOutOfRange { feature: String, points: i64 },
    #[error("The training projection has {found} columns, but the model has {expected} coefficients.")]
    MismatchedProjection { found: usize, expected: usize },
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
}

impl FittedScoringModel {
    /// Creates a model, checking the invariants every downstream derivation relies on.
    pub fn new(
        coefficients: Vec<i64>,
        intercept: f64,
        multiplier: f64,
        feature_names: Vec<String>,
        training_projection: Option<Array2<f64>>,
    ) -> Result<Self, ModelError> {
        let model = Self {
            intercept,
            multiplier,
            coefficients,
            feature_names,
            training_projection,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.coefficients.len() != self.feature_names.len() {
            return Err(ModelError::MismatchedFeatureNames {
                coefficients: self.coefficients.len(),
                names: self.feature_names.len(),
            });
        }
        if !(self.multiplier.is_finite() && self.multiplier > 0.0) {
            return Err(ModelError::InvalidMultiplier(self.multiplier));
        }
        if !self.intercept.is_finite() {
            return Err(ModelError::InvalidIntercept(self.intercept));
        }
        let oversized = self
            .coefficients
            .iter()
            .zip(&self.feature_names)
            .find(|(c, _)| c.unsigned_abs() > MAX_ABS_POINTS as u64);
        if let Some((&points, feature)) = oversized {
            return Err(ModelError::PointsOutOfRange {
                feature: feature.clone(),
                points,
            });
        }
        if let Some(projection) = &self.training_projection {
            if projection.ncols() != self.coefficients.len() {
                return Err(ModelError::MismatchedProjection {
                    found: projection.ncols(),
                    expected: self.coefficients.len(),
                });
            }
        }
        Ok(())
    }

    pub fn coefficients(&self) -> &[i64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn training_projection(&self) -> Option<&Array2<f64>> {
        self.training_projection.as_ref()
    }

    /// Indices of the columns with a nonzero coefficient, in column order.
    pub fn support(&self) -> Vec<usize> {
        self.coefficients
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Nonzero coefficients in column order.
    pub fn nonzero_coefficients(&self) -> Vec<i64> {
        self.coefficients.iter().copied().filter(|c| *c != 0).collect()
    }

    /// The sheet's conditions: `(attribute, points)` for every nonzero coefficient.
    pub fn decision_parameters(&self) -> Vec<DecisionParameter> {
        self.support()
            .into_iter()
            .map(|i| DecisionParameter {
                attribute: self.feature_names[i].clone(),
                points: self.coefficients[i],
            })
            .collect()
    }

    /// Names of the attributes the sheet actually uses.
    pub fn selected_features(&self) -> Vec<&str> {
        self.support()
            .into_iter()
            .map(|i| self.feature_names[i].as_str())
            .collect()
    }

    fn check_width(&self, x: &ArrayView2<f64>) -> Result<(), ModelError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::MismatchedFeatureCount {
                found: x.ncols(),
                expected: self.coefficients.len(),
            });
        }
        Ok(())
    }

    /// Total points per row.
    pub fn total_scores(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        self.check_width(&x)?;
        let weights = Array1::from_iter(self.coefficients.iter().map(|&c| c as f64));
        Ok(x.dot(&weights))
    }

    /// Probability of the positive class for each row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let scores = self.total_scores(x)?;
        Ok(scores.mapv(|s| stable_sigmoid((self.intercept + s) / self.multiplier)))
    }

    /// Predicted labels in the `{0, 1}` encoding.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let scores = self.total_scores(x)?;
        let signed = scores.mapv(|s| {
            if (self.intercept + s) / self.multiplier > 0.0 {
                1.0
            } else {
                -1.0
            }
        });
        Ok(from_internal(signed.view()))
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and re-checks its invariants.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    #[test]
    fn decision_parameters_skip_zero_coefficients() {
        let model = FittedScoringModel::new(vec![0, 3, 0, -2], -1.0, 2.0, names(4), None).unwrap();
        assert_eq!(model.support(), vec![1, 3]);
        assert_eq!(model.nonzero_coefficients(), vec![3, -2]);
        assert_eq!(
            model.decision_parameters(),
            vec![
                DecisionParameter {
                    attribute: "f1".into(),
                    points: 3
                },
                DecisionParameter {
                    attribute: "f3".into(),
                    points: -2
                },
            ]
        );
        assert_eq!(model.selected_features(), vec!["f1", "f3"]);
    }

    #[test]
    fn construction_rejects_broken_models() {
        assert!(matches!(
            FittedScoringModel::new(vec![1, 2], 0.0, 1.0, names(3), None),
            Err(ModelError::MismatchedFeatureNames { .. })
        ));
        assert!(matches!(
            FittedScoringModel::new(vec![1], 0.0, 0.0, names(1), None),
            Err(ModelError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            FittedScoringModel::new(vec![1], f64::NAN, 1.0, names(1), None),
            Err(ModelError::InvalidIntercept(_))
        ));
        assert!(matches!(
            FittedScoringModel::new(vec![i64::MAX, 1], 0.0, 1.0, names(2), None),
            Err(ModelError::PointsOutOfRange { points: i64::MAX, .. })
        ));
        assert!(matches!(
            FittedScoringModel::new(vec![1, i64::MIN], 0.0, 1.0, names(2), None),
            Err(ModelError::PointsOutOfRange { points: i64::MIN, .. })
        ));
        let edge = vec![MAX_ABS_POINTS, -MAX_ABS_POINTS];
        assert!(FittedScoringModel::new(edge, 0.0, 1.0, names(2), None).is_ok());
        assert!(matches!(
            FittedScoringModel::new(vec![1], 0.0, 1.0, names(1), Some(Array2::zeros((3, 2)))),
            Err(ModelError::MismatchedProjection {
                found: 2,
                expected: 1
            })
        ));
    }

    #[test]
    fn predictions_follow_the_logistic_link() {
        let model = FittedScoringModel::new(vec![2, -1], -1.0, 2.0, names(2), None).unwrap();
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];

        let probs = model.predict_proba(x.view()).unwrap();
        assert_abs_diff_eq!(probs[0], stable_sigmoid(0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(probs[1], stable_sigmoid(-1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(probs[2], 0.5, epsilon = 1e-12);

        // A score of exactly zero on the logit scale predicts the negative class.
        let labels = model.predict(x.view()).unwrap();
        assert_eq!(labels, array![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn prediction_rejects_wrong_width() {
        let model = FittedScoringModel::new(vec![1, 1], 0.0, 1.0, names(2), None).unwrap();
        let x = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            model.predict_proba(x.view()),
            Err(ModelError::MismatchedFeatureCount {
                found: 3,
                expected: 2
            })
        ));
    }
}
