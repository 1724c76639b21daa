//! # Score Enumeration
//!
//! Computes the set of total scores a subject can reach on a fitted sheet. Small sheets
//! are enumerated exhaustively over every subset of satisfied conditions; large sheets
//! fall back to sampling the empirical score distribution of the training data.

use crate::model::FittedScoringModel;
use itertools::Itertools;
use ndarray::{Array1, ArrayView2};
use thiserror::Error;

/// Largest number of nonzero coefficients that is enumerated exactly (`2^n` subsets).
pub const EXACT_ENUMERATION_LIMIT: usize = 10;
/// Maximum number of quantile points sampled for large sheets.
pub const MAX_QUANTILE_POINTS: usize = 20;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnumerationError {
    #[error(
        "The sheet has {nonzero} decision parameters, more than can be enumerated exactly, and the model carries no training projection to sample scores from."
    )]
    MissingTrainingProjection { nonzero: usize },
    #[error("The training projection has {found} columns, but the model has {expected} coefficients.")]
    ProjectionShape { found: usize, expected: usize },
    #[error("The training projection produced a non-finite score for row {0}.")]
    NonFiniteScore(usize),
}

/// Achievable total scores of a fitted model, ascending and distinct.
pub fn enumerate_scores(model: &FittedScoringModel) -> Result<Vec<f64>, EnumerationError> {
    let nonzero = model.nonzero_coefficients();
    if nonzero.len() <= EXACT_ENUMERATION_LIMIT {
        return Ok(exact_scores(&nonzero));
    }

    let projection = model
        .training_projection()
        .ok_or(EnumerationError::MissingTrainingProjection {
            nonzero: nonzero.len(),
        })?;
    log::debug!(
        "Sampling achievable scores from {} training rows ({} decision parameters)",
        projection.nrows(),
        nonzero.len()
    );
    sampled_scores(projection.view(), model.coefficients())
}

/// Every distinct sum over subsets of `coefficients`, ascending. The empty subset gives `0`.
pub fn exact_scores(coefficients: &[i64]) -> Vec<f64> {
    let n = coefficients.len();
    (0u64..(1u64 << n))
        .map(|mask| {
            coefficients
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1u64 << bit) != 0)
                .map(|(_, &c)| c)
                .sum::<i64>()
        })
        .sorted_unstable()
        .dedup()
        .map(|s| s as f64)
        .collect()
}

/// Projects `x` through `coefficients` and samples at most [`MAX_QUANTILE_POINTS`]
/// observed scores from the distinct projected values.
pub fn sampled_scores(
    x: ArrayView2<f64>,
    coefficients: &[i64],
) -> Result<Vec<f64>, EnumerationError> {
    if x.ncols() != coefficients.len() {
        return Err(EnumerationError::ProjectionShape {
            found: x.ncols(),
            expected: coefficients.len(),
        });
    }
    let weights = Array1::from_iter(coefficients.iter().map(|&c| c as f64));
    let projected = x.dot(&weights);
    if let Some(row) = projected.iter().position(|s| !s.is_finite()) {
        return Err(EnumerationError::NonFiniteScore(row));
    }

    let distinct: Vec<f64> = projected
        .iter()
        .copied()
        .sorted_unstable_by(f64::total_cmp)
        .dedup()
        .collect();
    if distinct.is_empty() {
        return Ok(vec![0.0]);
    }

    let points = MAX_QUANTILE_POINTS.min(distinct.len());
    Ok((1..=points)
        .map(|i| distinct[closest_observation_index(distinct.len(), i as f64 / points as f64)])
        .dedup()
        .collect())
}

/// Index selected by the "closest observation" quantile rule for level `q` over `n`
/// sorted observations (Hyndman-Fan type 3): virtual index `n*q - 1.5`, rounding up
/// except on exact ties, which go to the even order statistic, clipped to the valid range.
fn closest_observation_index(n: usize, q: f64) -> usize {
    let virtual_index = n as f64 * q - 1.5;
    let previous = virtual_index.floor();
    let gamma = virtual_index - previous;
    // 0-based index `previous` is the 1-based order statistic `previous + 1`.
    let chosen = if gamma == 0.0 && previous.rem_euclid(2.0) == 1.0 {
        previous
    } else {
        previous + 1.0
    };
    chosen.clamp(0.0, (n - 1) as f64) as usize
}
