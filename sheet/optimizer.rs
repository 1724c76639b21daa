// sheet/optimizer.rs

//! # Sparse Integer Risk-Score Optimization
//!
//! The trainer treats the combinatorial search for a scoring sheet as a black box behind
//! [`RiskScoreOptimizer`]: it hands over the binarized matrix, `{-1, +1}` labels, the
//! sparsity target `k`, the symmetric point bound `B` and an optional group budget, and
//! receives candidate models ranked by fit quality.
//!
//! [`BeamSearchOptimizer`] is the bundled backend. Every integer coefficient vector `β` is
//! scored by the weighted logistic loss of the best positive rescaling of its total score,
//! `z = α + σ·(Xβ)` with `σ > 0`, which yields the sheet's intercept (`α/σ`) and multiplier
//! (`1/σ`). The search itself has three phases:
//!
//! 1.  Forward beam search: starting from the empty sheet, every step extends each beam
//!     member by one unused column at every nonzero value in `[-B, B]`, keeping the best
//!     `beam_width` children. Children are scored in parallel.
//! 2.  Coordinate refinement: each surviving sheet revisits the value of every selected
//!     column (zero included) until a sweep brings no improvement.
//! 3.  Scale polishing: the `(intercept, multiplier)` pair of each returned candidate is
//!     polished with BFGS over `(α, ln σ)`, which keeps the multiplier positive.

use crate::grouping::GroupMap;
use ahash::AHashSet;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Lower bound on the score slope; a sheet must never invert its risk curve.
const MIN_SLOPE: f64 = 1e-6;
/// Upper bound on the score slope, reached only on perfectly separable data.
const MAX_SLOPE: f64 = 1e3;
/// Bound on the logit-scale intercept for the same reason.
const MAX_ABS_ALPHA: f64 = 1e3;
/// Scores whose spread is below this are treated as constant.
const CONSTANT_SCORE_TOLERANCE: f64 = 1e-12;

/// Shared flag used to ask a running optimization to stop at its next checkpoint.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limit on the number of original attributes a sheet may draw its columns from.
#[derive(Debug, Clone, Copy)]
pub struct GroupBudget<'a> {
    pub max_groups: usize,
    pub groups: &'a GroupMap,
}

/// Everything the optimizer needs for one fit.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerRequest<'a> {
    pub x: ArrayView2<'a, f64>,
    /// Labels in the internal `{-1, +1}` encoding.
    pub y: ArrayView1<'a, f64>,
    pub weights: Option<ArrayView1<'a, f64>>,
    /// Target number of nonzero coefficients (`k`).
    pub max_nonzero: usize,
    /// Coefficients are constrained to `[-bound, bound]`.
    pub bound: i64,
    pub group_budget: Option<GroupBudget<'a>>,
    /// Number of ranked candidates to return.
    pub select_top_m: usize,
}

/// One fitted sheet proposed by the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateModel {
    pub coefficients: Vec<i64>,
    pub intercept: f64,
    pub multiplier: f64,
    /// Weighted logistic loss on the training data; lower is better.
    pub loss: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("The risk-score search is infeasible: {0}")]
    Infeasible(String),
    #[error("The risk-score search was cancelled.")]
    Cancelled,
}

/// The black-box contract of a combinatorial risk-score optimizer.
pub trait RiskScoreOptimizer: Send + Sync {
    /// Returns up to `request.select_top_m` candidates, best first. Every candidate has at
    /// most `max_nonzero` nonzero coefficients within `[-bound, bound]` and respects the
    /// group budget when one is given.
    fn optimize(
        &self,
        request: &OptimizerRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<Vec<CandidateModel>, OptimizerError>;
}

/// Tuning knobs of [`BeamSearchOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamSearchConfig {
    pub beam_width: usize,
    pub refinement_sweeps: usize,
    pub newton_max_iterations: usize,
    pub polish_tolerance: f64,
    pub polish_max_iterations: usize,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 10,
            refinement_sweeps: 3,
            newton_max_iterations: 30,
            polish_tolerance: 1e-8,
            polish_max_iterations: 100,
        }
    }
}

/// Beam search over sparse integer coefficient vectors with logistic-loss ranking.
#[derive(Debug, Clone, Default)]
pub struct BeamSearchOptimizer {
    config: BeamSearchConfig,
}

impl BeamSearchOptimizer {
    pub fn new(config: BeamSearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BeamSearchConfig {
        &self.config
    }
}

impl RiskScoreOptimizer for BeamSearchOptimizer {
    fn optimize(
        &self,
        request: &OptimizerRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<Vec<CandidateModel>, OptimizerError> {
        let problem = internal::Problem::new(request)?;
        let search = internal::Search {
            problem: &problem,
            request,
            config: &self.config,
            cancel,
        };

        let beam = search.forward()?;
        let refined = search.refine(beam)?;

        let mut candidates: Vec<CandidateModel> = refined
            .into_iter()
            .take(request.select_top_m.max(1))
            .map(|node| search.polish(node))
            .collect();
        candidates.sort_by(|a, b| a.loss.total_cmp(&b.loss));

        if let Some(best) = candidates.first() {
            log::debug!(
                "Beam search finished: best loss {:.6}, {} nonzero coefficients",
                best.loss,
                best.coefficients.iter().filter(|c| **c != 0).count()
            );
        }
        Ok(candidates)
    }
}

/// Internal module for the search implementation details.
mod internal {
    use super::*;

    /// Numerically stable `ln(1 + e^x)`.
    pub(super) fn softplus(x: f64) -> f64 {
        if x > 0.0 {
            x + (-x).exp().ln_1p()
        } else {
            x.exp().ln_1p()
        }
    }

    /// `d/dz softplus(-y z) = -y * sigmoid(-y z)`.
    fn loss_derivative(y: f64, z: f64) -> f64 {
        -y * crate::calibrate::stable_sigmoid(-y * z)
    }

    /// Validated training data with weights materialized.
    pub(super) struct Problem<'a> {
        pub x: ArrayView2<'a, f64>,
        pub y: ArrayView1<'a, f64>,
        pub w: Array1<f64>,
    }

    impl<'a> Problem<'a> {
        pub fn new(request: &OptimizerRequest<'a>) -> Result<Self, OptimizerError> {
            let (n, p) = request.x.dim();
            if n == 0 {
                return Err(OptimizerError::Infeasible(
                    "the feature matrix has no rows".to_string(),
                ));
            }
            if request.y.len() != n {
                return Err(OptimizerError::Infeasible(format!(
                    "{} labels for {} rows",
                    request.y.len(),
                    n
                )));
            }
            if request.bound < 1 {
                return Err(OptimizerError::Infeasible(format!(
                    "point bound {} leaves no nonzero value",
                    request.bound
                )));
            }
            if let Some(budget) = request.group_budget {
                if budget.groups.len() != p {
                    return Err(OptimizerError::Infeasible(format!(
                        "group map covers {} columns, the matrix has {}",
                        budget.groups.len(),
                        p
                    )));
                }
            }
            if request.y.iter().any(|&v| v != 1.0 && v != -1.0) {
                return Err(OptimizerError::Infeasible(
                    "labels must be encoded as -1 and +1".to_string(),
                ));
            }
            let w = match request.weights {
                Some(w) if w.len() == n => w.to_owned(),
                Some(w) => {
                    return Err(OptimizerError::Infeasible(format!(
                        "{} weights for {} rows",
                        w.len(),
                        n
                    )));
                }
                None => Array1::ones(n),
            };

            let positive: f64 = Self::class_weight(request.y, &w, 1.0);
            let negative: f64 = Self::class_weight(request.y, &w, -1.0);
            if positive <= 0.0 || negative <= 0.0 {
                return Err(OptimizerError::Infeasible(
                    "both classes need positive total weight".to_string(),
                ));
            }

            Ok(Self {
                x: request.x,
                y: request.y,
                w,
            })
        }

        fn class_weight(y: ArrayView1<f64>, w: &Array1<f64>, label: f64) -> f64 {
            y.iter()
                .zip(w.iter())
                .filter(|(yi, _)| **yi == label)
                .map(|(_, wi)| *wi)
                .sum()
        }

        pub fn loss(&self, score: &Array1<f64>, alpha: f64, slope: f64) -> f64 {
            self.y
                .iter()
                .zip(self.w.iter())
                .zip(score.iter())
                .map(|((&yi, &wi), &si)| wi * softplus(-yi * (alpha + slope * si)))
                .sum()
        }

        /// Weighted log-odds of the positive class.
        pub fn base_log_odds(&self) -> f64 {
            let positive = Self::class_weight(self.y, &self.w, 1.0);
            let negative = Self::class_weight(self.y, &self.w, -1.0);
            (positive / negative).ln()
        }

        /// Best `(α, σ ≥ MIN_SLOPE)` for a given total score, by damped Newton steps.
        pub fn fit_scale(&self, score: &Array1<f64>, max_iterations: usize) -> ScaleFit {
            let (lo, hi) = score
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
                    (lo.min(s), hi.max(s))
                });
            let alpha0 = self.base_log_odds();

            if hi - lo < CONSTANT_SCORE_TOLERANCE {
                // A constant total carries no information; only the base rate is fitted.
                let constant = lo;
                return ScaleFit {
                    alpha: alpha0,
                    slope: 0.0,
                    constant: Some(constant),
                    loss: self.loss(score, alpha0, 0.0),
                };
            }

            let mut alpha = alpha0;
            let mut slope = 1.0 / (hi - lo).max(1.0);
            let mut loss = self.loss(score, alpha, slope);

            for _ in 0..max_iterations {
                let (mut g0, mut g1) = (0.0, 0.0);
                let (mut h00, mut h01, mut h11) = (0.0, 0.0, 0.0);
                for ((&yi, &wi), &si) in self.y.iter().zip(self.w.iter()).zip(score.iter()) {
                    let z = alpha + slope * si;
                    let r = wi * loss_derivative(yi, z);
                    let p = crate::calibrate::stable_sigmoid(z);
                    let h = wi * p * (1.0 - p);
                    g0 += r;
                    g1 += r * si;
                    h00 += h;
                    h01 += h * si;
                    h11 += h * si * si;
                }
                h00 += 1e-9;
                h11 += 1e-9;
                let det = h00 * h11 - h01 * h01;
                if !det.is_finite() || det.abs() < 1e-18 {
                    break;
                }
                let d_alpha = -(h11 * g0 - h01 * g1) / det;
                let d_slope = -(h00 * g1 - h01 * g0) / det;

                let mut step = 1.0;
                let mut accepted = false;
                while step > 1e-6 {
                    let trial_alpha = (alpha + step * d_alpha).clamp(-MAX_ABS_ALPHA, MAX_ABS_ALPHA);
                    let trial_slope = (slope + step * d_slope).clamp(MIN_SLOPE, MAX_SLOPE);
                    let trial_loss = self.loss(score, trial_alpha, trial_slope);
                    if trial_loss.is_finite() && trial_loss <= loss {
                        let change = loss - trial_loss;
                        alpha = trial_alpha;
                        slope = trial_slope;
                        loss = trial_loss;
                        accepted = change > 1e-12 * (1.0 + loss);
                        break;
                    }
                    step *= 0.5;
                }
                if !accepted {
                    break;
                }
            }

            ScaleFit {
                alpha,
                slope,
                constant: None,
                loss,
            }
        }
    }

    /// Logit-scale rescaling of a total score.
    #[derive(Debug, Clone, Copy)]
    pub(super) struct ScaleFit {
        pub alpha: f64,
        pub slope: f64,
        /// Set when every row has the same total; the slope is then meaningless.
        pub constant: Option<f64>,
        pub loss: f64,
    }

    impl ScaleFit {
        /// `(intercept, multiplier)` in point units.
        pub fn to_sheet_scale(self) -> (f64, f64) {
            match self.constant {
                Some(constant) => (self.alpha - constant, 1.0),
                None => (self.alpha / self.slope, 1.0 / self.slope),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub(super) struct Node {
        pub coefficients: Vec<i64>,
        pub score: Array1<f64>,
        pub fit: ScaleFit,
    }

    pub(super) struct Search<'s, 'a> {
        pub problem: &'s Problem<'a>,
        pub request: &'s OptimizerRequest<'a>,
        pub config: &'s BeamSearchConfig,
        pub cancel: &'s CancelFlag,
    }

    impl Search<'_, '_> {
        fn check_cancelled(&self) -> Result<(), OptimizerError> {
            if self.cancel.is_cancelled() {
                return Err(OptimizerError::Cancelled);
            }
            Ok(())
        }

        fn shifted_score(&self, base: &Array1<f64>, column: usize, delta: i64) -> Array1<f64> {
            let mut score = base.clone();
            score.scaled_add(delta as f64, &self.problem.x.column(column));
            score
        }

        fn evaluate(&self, score: &Array1<f64>) -> ScaleFit {
            self.problem
                .fit_scale(score, self.config.newton_max_iterations)
        }

        fn allows(&self, coefficients: &[i64], column: usize) -> bool {
            match self.request.group_budget {
                None => true,
                Some(budget) => {
                    let support = coefficients
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| **c != 0)
                        .map(|(i, _)| i)
                        .chain(std::iter::once(column));
                    budget.groups.groups_used(support) <= budget.max_groups
                }
            }
        }

        fn nonzero_values(&self) -> Vec<i64> {
            (-self.request.bound..=self.request.bound)
                .filter(|v| *v != 0)
                .collect()
        }

        /// Phase 1: grows sheets one column at a time.
        pub fn forward(&self) -> Result<Vec<Node>, OptimizerError> {
            let p = self.problem.x.ncols();
            let zero = Array1::zeros(self.problem.x.nrows());
            let root = Node {
                coefficients: vec![0; p],
                fit: self.evaluate(&zero),
                score: zero,
            };
            let values = self.nonzero_values();
            let mut beam = vec![root];

            for step in 0..self.request.max_nonzero {
                self.check_cancelled()?;

                let moves: Vec<(usize, usize, i64)> = beam
                    .iter()
                    .enumerate()
                    .flat_map(|(parent, node)| {
                        (0..p)
                            .filter(move |&j| node.coefficients[j] == 0)
                            .filter(|&j| self.allows(&node.coefficients, j))
                            .flat_map(|j| values.iter().map(move |&v| (parent, j, v)))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                if moves.is_empty() {
                    log::debug!("No admissible column left after {step} steps");
                    break;
                }

                let mut scored: Vec<(f64, usize, usize, i64)> = moves
                    .par_iter()
                    .map(|&(parent, j, v)| {
                        let score = self.shifted_score(&beam[parent].score, j, v);
                        (self.evaluate(&score).loss, parent, j, v)
                    })
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));

                let mut seen: AHashSet<Vec<i64>> = AHashSet::new();
                let mut next = Vec::with_capacity(self.config.beam_width);
                for (_, parent, j, v) in scored {
                    if next.len() >= self.config.beam_width.max(1) {
                        break;
                    }
                    let mut coefficients = beam[parent].coefficients.clone();
                    coefficients[j] = v;
                    if !seen.insert(coefficients.clone()) {
                        continue;
                    }
                    let score = self.shifted_score(&beam[parent].score, j, v);
                    next.push(Node {
                        coefficients,
                        fit: self.evaluate(&score),
                        score,
                    });
                }
                log::debug!(
                    "Beam step {}: best loss {:.6}",
                    step + 1,
                    next.first().map_or(f64::NAN, |n| n.fit.loss)
                );
                beam = next;
            }
            Ok(beam)
        }

        /// Phase 2: coordinate sweeps over the values of the selected columns.
        pub fn refine(&self, beam: Vec<Node>) -> Result<Vec<Node>, OptimizerError> {
            let bound = self.request.bound;
            let mut refined = Vec::with_capacity(beam.len());
            for mut node in beam {
                for _ in 0..self.config.refinement_sweeps {
                    self.check_cancelled()?;
                    let support: Vec<usize> = node
                        .coefficients
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| **c != 0)
                        .map(|(i, _)| i)
                        .collect();
                    let mut improved = false;
                    for j in support {
                        let current = node.coefficients[j];
                        let best = (-bound..=bound)
                            .into_par_iter()
                            .filter(|&v| v != current)
                            .map(|v| {
                                let score = self.shifted_score(&node.score, j, v - current);
                                let fit = self.evaluate(&score);
                                (fit.loss, v)
                            })
                            .min_by(|a, b| a.0.total_cmp(&b.0));
                        if let Some((loss, v)) = best {
                            if loss < node.fit.loss - 1e-10 * (1.0 + node.fit.loss.abs()) {
                                node.score = self.shifted_score(&node.score, j, v - current);
                                node.coefficients[j] = v;
                                node.fit = self.evaluate(&node.score);
                                improved = true;
                            }
                        }
                    }
                    if !improved {
                        break;
                    }
                }
                refined.push(node);
            }

            refined.sort_by(|a, b| a.fit.loss.total_cmp(&b.fit.loss));
            let mut seen: AHashSet<Vec<i64>> = AHashSet::new();
            refined.retain(|node| seen.insert(node.coefficients.clone()));
            Ok(refined)
        }

        /// Phase 3: BFGS over `(α, ln σ)` for the final candidate.
        pub fn polish(&self, node: Node) -> CandidateModel {
            let mut fit = node.fit;
            if fit.constant.is_none() {
                let y = self.problem.y.to_owned();
                let w = self.problem.w.clone();
                let score = node.score.clone();
                let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
                    let alpha = theta[0].clamp(-MAX_ABS_ALPHA, MAX_ABS_ALPHA);
                    let slope = theta[1].clamp(MIN_SLOPE.ln(), MAX_SLOPE.ln()).exp();
                    let mut cost = 0.0;
                    let mut grad = Array1::zeros(2);
                    for ((&yi, &wi), &si) in y.iter().zip(w.iter()).zip(score.iter()) {
                        let z = alpha + slope * si;
                        cost += wi * softplus(-yi * z);
                        let r = wi * loss_derivative(yi, z);
                        grad[0] += r;
                        grad[1] += r * si * slope;
                    }
                    (cost, grad)
                };
                let start = Array1::from(vec![fit.alpha, fit.slope.ln()]);
                match Bfgs::new(start, cost_and_grad)
                    .with_tolerance(self.config.polish_tolerance)
                    .with_max_iterations(self.config.polish_max_iterations)
                    .run()
                {
                    Ok(BfgsSolution {
                        final_point,
                        final_value,
                        ..
                    }) => {
                        let alpha = final_point[0].clamp(-MAX_ABS_ALPHA, MAX_ABS_ALPHA);
                        let slope = final_point[1].clamp(MIN_SLOPE.ln(), MAX_SLOPE.ln()).exp();
                        if final_value.is_finite() && final_value < fit.loss {
                            fit.alpha = alpha;
                            fit.slope = slope;
                            fit.loss = self.problem.loss(&node.score, alpha, slope);
                        }
                    }
                    Err(e) => {
                        log::debug!("Scale polishing skipped, BFGS did not finish: {e:?}");
                    }
                }
            }

            let (intercept, multiplier) = fit.to_sheet_scale();
            CandidateModel {
                coefficients: node.coefficients,
                intercept,
                multiplier,
                loss: fit.loss,
            }
        }
    }
}
