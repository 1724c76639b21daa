//! Holds the "current model" and "current target class" of one inspection session.
//!
//! ```text
//! Idle --attach--> Loaded --derive--> Derived --toggle--> Derived(flipped) --toggle--> Derived
//! ```
//!
//! Every transition either completes or leaves the session untouched.

use crate::calibrate::ScoreRisk;
use crate::model::FittedScoringModel;
use crate::polarity::{DerivationError, ScoringSheet, TargetClass, derive_sheet_for, flip};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No fitted model is loaded in this session.")]
    NoModel,
    #[error("The scoring sheet has not been derived yet.")]
    NotDerived,
    #[error("There is no decision parameter at position {index}; the sheet has {count}.")]
    UnknownDecisionParameter { index: usize, count: usize },
    #[error("The score table is empty.")]
    EmptyTable,
    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

/// Observable phase of a [`SheetSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Loaded,
    Derived { target: TargetClass },
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    Loaded(Arc<FittedScoringModel>),
    Derived {
        model: Arc<FittedScoringModel>,
        sheet: ScoringSheet,
    },
}

/// Points collected by a subject and where they fall on the risk scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectedPoints {
    pub total: i64,
    /// The table row whose score is closest to `total`.
    pub risk: ScoreRisk,
}

#[derive(Debug, Clone)]
pub struct SheetSession {
    state: State,
    target: TargetClass,
}

impl Default for SheetSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SheetSession {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            target: TargetClass::Positive,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            State::Idle => SessionPhase::Idle,
            State::Loaded(_) => SessionPhase::Loaded,
            State::Derived { sheet, .. } => SessionPhase::Derived {
                target: sheet.target,
            },
        }
    }

    /// Requested target class. Applied on the next derivation when no sheet exists yet.
    pub fn target_class(&self) -> TargetClass {
        self.target
    }

    pub fn model(&self) -> Option<&FittedScoringModel> {
        match &self.state {
            State::Idle => None,
            State::Loaded(model) | State::Derived { model, .. } => Some(model),
        }
    }

    pub fn sheet(&self) -> Option<&ScoringSheet> {
        match &self.state {
            State::Derived { sheet, .. } => Some(sheet),
            _ => None,
        }
    }

    /// Replaces whatever the session held with a newly fitted model.
    pub fn attach(&mut self, model: impl Into<Arc<FittedScoringModel>>) {
        self.state = State::Loaded(model.into());
    }

    /// Back to `Idle`, as when the input data goes away.
    pub fn clear(&mut self) {
        self.state = State::Idle;
    }

    /// Derives the sheet for the current target class.
    pub fn derive(&mut self) -> Result<&ScoringSheet, SessionError> {
        let model = match &self.state {
            State::Idle => return Err(SessionError::NoModel),
            State::Loaded(model) | State::Derived { model, .. } => Arc::clone(model),
        };
        let sheet = derive_sheet_for(&model, self.target)?;
        self.state = State::Derived { model, sheet };
        self.sheet().ok_or(SessionError::NotDerived)
    }

    /// Flips the derived sheet to the complementary class.
    pub fn toggle_target_class(&mut self) -> Result<&ScoringSheet, SessionError> {
        match &mut self.state {
            State::Idle => Err(SessionError::NoModel),
            State::Loaded(_) => Err(SessionError::NotDerived),
            State::Derived { sheet, .. } => {
                *sheet = flip(sheet);
                self.target = sheet.target;
                Ok(sheet)
            }
        }
    }

    /// Selects a target class. Re-derives only when it differs from the current one.
    pub fn set_target_class(&mut self, target: TargetClass) -> Result<(), SessionError> {
        if target == self.target {
            return Ok(());
        }
        match self.state {
            State::Derived { .. } => {
                self.toggle_target_class()?;
            }
            State::Idle | State::Loaded(_) => self.target = target,
        }
        Ok(())
    }

    /// Sums the points of the checked decision parameters and locates the total on the
    /// risk scale.
    pub fn collect_points(&self, checked: &[usize]) -> Result<CollectedPoints, SessionError> {
        let sheet = match &self.state {
            State::Idle => return Err(SessionError::NoModel),
            State::Loaded(_) => return Err(SessionError::NotDerived),
            State::Derived { sheet, .. } => sheet,
        };
        let count = sheet.decision_parameters.len();
        if let Some(&index) = checked.iter().find(|&&i| i >= count) {
            return Err(SessionError::UnknownDecisionParameter { index, count });
        }
        let total = sheet.total_points(checked);
        let risk = *sheet
            .table
            .nearest(total as f64)
            .ok_or(SessionError::EmptyTable)?;
        Ok(CollectedPoints { total, risk })
    }

    /// Attribute names used by the loaded model, empty when nothing is loaded.
    pub fn selected_features(&self) -> Vec<&str> {
        self.model()
            .map(|m| m.selected_features())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model() -> FittedScoringModel {
        FittedScoringModel::new(
            vec![4, 0, -1],
            -1.0,
            2.0,
            ["age>60", "smoker", "exercise"].map(String::from).to_vec(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn session_walks_through_its_phases() {
        let mut session = SheetSession::new();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(session.derive().unwrap_err(), SessionError::NoModel);

        session.attach(model());
        assert_eq!(session.phase(), SessionPhase::Loaded);
        assert_eq!(
            session.toggle_target_class().unwrap_err(),
            SessionError::NotDerived
        );

        session.derive().unwrap();
        assert_eq!(
            session.phase(),
            SessionPhase::Derived {
                target: TargetClass::Positive
            }
        );

        session.toggle_target_class().unwrap();
        assert_eq!(
            session.phase(),
            SessionPhase::Derived {
                target: TargetClass::Negative
            }
        );
        session.toggle_target_class().unwrap();
        assert_eq!(session.target_class(), TargetClass::Positive);

        session.clear();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.selected_features().is_empty());
    }

    #[test]
    fn setting_the_same_target_is_a_no_op() {
        let mut session = SheetSession::new();
        session.attach(model());
        let positive = session.derive().unwrap().clone();

        session.set_target_class(TargetClass::Positive).unwrap();
        assert_eq!(session.sheet(), Some(&positive));

        session.set_target_class(TargetClass::Negative).unwrap();
        assert_eq!(session.sheet(), Some(&flip(&positive)));
    }

    #[test]
    fn target_chosen_before_derivation_is_applied() {
        let mut session = SheetSession::new();
        session.set_target_class(TargetClass::Negative).unwrap();
        session.attach(model());
        let sheet = session.derive().unwrap();
        assert_eq!(sheet.target, TargetClass::Negative);
        assert_eq!(sheet.table.scores(), vec![-4.0, -3.0, 0.0, 1.0]);
    }

    #[test]
    fn collected_points_land_on_the_table() {
        let mut session = SheetSession::new();
        session.attach(model());
        session.derive().unwrap();

        let collected = session.collect_points(&[0, 1]).unwrap();
        assert_eq!(collected.total, 3);
        assert_eq!(collected.risk.score, 3.0);
        let expected = crate::calibrate::stable_sigmoid(1.0) * 100.0;
        assert_abs_diff_eq!(collected.risk.probability, expected, epsilon = 1e-12);

        assert_eq!(
            session.collect_points(&[2]).unwrap_err(),
            SessionError::UnknownDecisionParameter { index: 2, count: 2 }
        );
    }

    #[test]
    fn selected_features_follow_the_model() {
        let mut session = SheetSession::new();
        session.attach(model());
        assert_eq!(session.selected_features(), vec!["age>60", "exercise"]);
    }
}
