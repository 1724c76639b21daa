//! Fits a [`FittedScoringModel`] from a binarized feature matrix.
//!
//! The trainer owns everything around the search: validating the input, moving labels into the
//! `{-1, +1}` encoding, building the attribute group map, and checking that whatever candidate
//! the optimizer hands back actually honours the requested sparsity and point bound.

use crate::config::{ConfigError, TrainerConfig};
use crate::data::TrainingData;
use crate::grouping::{GroupMap, GroupingError, group_features};
use crate::labels::{is_internal_encoding, to_internal};
use crate::model::FittedScoringModel;
use crate::optimizer::{
    BeamSearchOptimizer, CancelFlag, CandidateModel, GroupBudget, OptimizerError,
    OptimizerRequest, RiskScoreOptimizer,
};
use itertools::Itertools;
use thiserror::Error;

/// The input was not in a shape the trainer can work with.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("The feature matrix has no rows.")]
    Empty,
    #[error("The feature matrix has {rows} rows, but {labels} labels were given.")]
    ShapeMismatch { rows: usize, labels: usize },
    #[error("{found} sample weights were given for {expected} rows.")]
    WeightsLengthMismatch { found: usize, expected: usize },
    #[error("Sample weights must be finite and non-negative; found {value} at row {row}.")]
    InvalidWeight { row: usize, value: f64 },
    #[error("{found} feature names were given for {expected} columns.")]
    FeatureNamesMismatch { found: usize, expected: usize },
    #[error("Non-finite value in the {what} at row {row}.")]
    NonFinite { what: &'static str, row: usize },
    #[error("Labels must be encoded as {{0, 1}} or {{-1, 1}}; found {0:?}.")]
    UnsupportedLabelEncoding(Vec<f64>),
    #[error("Invalid training parameters: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Grouping(#[from] GroupingError),
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("The target must have exactly two distinct values, but {found} were found.")]
    NotBinary { found: usize },
    #[error("No scoring sheet satisfies the requested constraints: {0}")]
    Infeasible(String),
    #[error("The optimizer returned a candidate that breaks its contract: {0}")]
    ContractViolation(String),
    #[error("Training was cancelled.")]
    Cancelled,
    #[error("The training worker stopped without reporting a result.")]
    WorkerLost,
}

impl From<OptimizerError> for TrainingError {
    fn from(err: OptimizerError) -> Self {
        match err {
            OptimizerError::Infeasible(reason) => TrainingError::Infeasible(reason),
            OptimizerError::Cancelled => TrainingError::Cancelled,
        }
    }
}

/// Fits scoring sheets with a pluggable risk-score optimizer.
#[derive(Debug, Clone)]
pub struct ScoringSheetTrainer<O = BeamSearchOptimizer> {
    config: TrainerConfig,
    optimizer: O,
}

impl ScoringSheetTrainer<BeamSearchOptimizer> {
    /// A trainer using the built-in beam search, tuned by `config.optimizer`.
    pub fn new(config: TrainerConfig) -> Result<Self, InputError> {
        let optimizer = BeamSearchOptimizer::new(config.optimizer);
        Self::with_optimizer(config, optimizer)
    }
}

impl<O: RiskScoreOptimizer> ScoringSheetTrainer<O> {
    pub fn with_optimizer(config: TrainerConfig, optimizer: O) -> Result<Self, InputError> {
        config.validate()?;
        Ok(Self { config, optimizer })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Fits one scoring sheet. Labels may be `{0, 1}` or `{-1, 1}`.
    pub fn fit(
        &self,
        data: &TrainingData,
        cancel: &CancelFlag,
    ) -> Result<FittedScoringModel, TrainingError> {
        validate_input(data)?;
        let (n, p) = data.x.dim();

        let y = to_internal(data.y.view());
        debug_assert!(is_internal_encoding(y.view()));

        let group_map = match self.config.num_input_features {
            Some(_) => Some(
                group_features(data.attribute_origins.as_deref(), p).map_err(InputError::from)?,
            ),
            None => None,
        };
        let group_budget = match (self.config.num_input_features, group_map.as_ref()) {
            (Some(max_groups), Some(groups)) => Some(GroupBudget { max_groups, groups }),
            _ => None,
        };

        log::info!(
            "Fitting scoring sheet on {} samples x {} features (k = {}, points in [-{}, {}]{})",
            n,
            p,
            self.config.num_decision_params,
            self.config.max_points_per_param,
            self.config.max_points_per_param,
            match &group_budget {
                Some(budget) => format!(
                    ", at most {} of {} attributes",
                    budget.max_groups,
                    budget.groups.num_groups()
                ),
                None => String::new(),
            }
        );

        if cancel.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }

        let request = OptimizerRequest {
            x: data.x.view(),
            y: y.view(),
            weights: data.weights.as_ref().map(|w| w.view()),
            max_nonzero: self.config.num_decision_params,
            bound: self.config.max_points_per_param,
            group_budget,
            select_top_m: self.config.select_top_m,
        };
        let candidates = self.optimizer.optimize(&request, cancel)?;

        let best = candidates.into_iter().next().ok_or_else(|| {
            TrainingError::Infeasible("the optimizer returned no candidate".to_string())
        })?;
        self.check_contract(&best, p, group_map.as_ref())?;

        log::info!(
            "Selected scoring sheet: loss {:.6}, {} decision parameters, intercept {:.4}, multiplier {:.4}",
            best.loss,
            best.coefficients.iter().filter(|c| **c != 0).count(),
            best.intercept,
            best.multiplier
        );

        let projection = self.config.retain_training_projection.then(|| data.x.to_owned());
        FittedScoringModel::new(
            best.coefficients,
            best.intercept,
            best.multiplier,
            data.feature_names.clone(),
            projection,
        )
        .map_err(|e| TrainingError::ContractViolation(e.to_string()))
    }

    fn check_contract(
        &self,
        candidate: &CandidateModel,
        num_features: usize,
        group_map: Option<&GroupMap>,
    ) -> Result<(), TrainingError> {
        let violation = |msg: String| Err(TrainingError::ContractViolation(msg));

        if candidate.coefficients.len() != num_features {
            return violation(format!(
                "{} coefficients for {} features",
                candidate.coefficients.len(),
                num_features
            ));
        }
        let support: Vec<usize> = candidate
            .coefficients
            .iter()
            .positions(|c| *c != 0)
            .collect();
        if support.len() > self.config.num_decision_params {
            return violation(format!(
                "{} nonzero coefficients, at most {} allowed",
                support.len(),
                self.config.num_decision_params
            ));
        }
        let bound = self.config.max_points_per_param;
        if let Some(c) = candidate.coefficients.iter().find(|c| c.abs() > bound) {
            return violation(format!("coefficient {c} outside [-{bound}, {bound}]"));
        }
        if let (Some(max_groups), Some(groups)) = (self.config.num_input_features, group_map) {
            let used = groups.groups_used(support.iter().copied());
            if used > max_groups {
                return violation(format!("{used} attributes used, at most {max_groups} allowed"));
            }
        }
        if !(candidate.multiplier.is_finite() && candidate.multiplier > 0.0) {
            return violation(format!("multiplier {}", candidate.multiplier));
        }
        if !candidate.intercept.is_finite() {
            return violation(format!("intercept {}", candidate.intercept));
        }
        Ok(())
    }
}

fn validate_input(data: &TrainingData) -> Result<(), TrainingError> {
    let (n, p) = data.x.dim();
    if n == 0 {
        return Err(InputError::Empty.into());
    }
    if data.y.len() != n {
        return Err(InputError::ShapeMismatch {
            rows: n,
            labels: data.y.len(),
        }
        .into());
    }
    if data.feature_names.len() != p {
        return Err(InputError::FeatureNamesMismatch {
            found: data.feature_names.len(),
            expected: p,
        }
        .into());
    }
    if let Some((row, _)) = data
        .x
        .outer_iter()
        .enumerate()
        .find(|(_, r)| r.iter().any(|v| !v.is_finite()))
    {
        return Err(InputError::NonFinite {
            what: "feature matrix",
            row,
        }
        .into());
    }
    if let Some(row) = data.y.iter().position(|v| !v.is_finite()) {
        return Err(InputError::NonFinite { what: "labels", row }.into());
    }
    if let Some(weights) = &data.weights {
        if weights.len() != n {
            return Err(InputError::WeightsLengthMismatch {
                found: weights.len(),
                expected: n,
            }
            .into());
        }
        if let Some((row, &value)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
        {
            return Err(InputError::InvalidWeight { row, value }.into());
        }
    }

    let distinct: Vec<f64> = data
        .y
        .iter()
        .copied()
        .sorted_unstable_by(|a, b| a.total_cmp(b))
        .dedup()
        .collect();
    if distinct.len() != 2 {
        return Err(TrainingError::NotBinary {
            found: distinct.len(),
        });
    }
    if distinct != [0.0, 1.0] && distinct != [-1.0, 1.0] {
        return Err(InputError::UnsupportedLabelEncoding(distinct).into());
    }
    Ok(())
}
