use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scoresheet::calibrate::stable_sigmoid;
use scoresheet::config::TrainerConfig;
use scoresheet::data::{TrainingData, load_feature_table, load_training_data};
use scoresheet::enumerate::MAX_QUANTILE_POINTS;
use scoresheet::grouping::{attribute_of_column, group_features};
use scoresheet::model::FittedScoringModel;
use scoresheet::optimizer::CancelFlag;
use scoresheet::polarity::{TargetClass, derive_sheet, derive_sheet_for, flip};
use scoresheet::session::SheetSession;
use scoresheet::task::{TrainingOutcome, TrainingSession};
use scoresheet::trainer::{ScoringSheetTrainer, TrainingError};
use std::collections::HashSet;
use std::fs;
use tempfile::tempdir;

/// Eight binary columns over four attributes. The outcome depends on the first
/// three columns, with label noise.
fn clinical_data(n: usize, seed: u64) -> TrainingData {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array2::from_shape_fn((n, 8), |_| if rng.gen_bool(0.4) { 1.0 } else { 0.0 });
    let y = Array1::from_iter(x.outer_iter().map(|row| {
        let log_odds = 2.5 * row[0] + 1.5 * row[1] - 2.0 * row[2] - 0.5;
        let p = stable_sigmoid(log_odds);
        if rng.gen_bool(p) { 1.0 } else { 0.0 }
    }));
    let names = [
        "age=old", "age=young", "bmi=high", "bmi=low", "smoker=yes", "smoker=no", "sex=f", "sex=m",
    ];
    let origins = names
        .iter()
        .map(|n| attribute_of_column(n).to_string())
        .collect();
    TrainingData::new(x, y)
        .with_feature_names(names.iter().map(|s| s.to_string()).collect())
        .with_attribute_origins(origins)
}

fn trainer(k: usize, bound: i64) -> ScoringSheetTrainer {
    ScoringSheetTrainer::new(TrainerConfig {
        num_decision_params: k,
        max_points_per_param: bound,
        ..TrainerConfig::default()
    })
    .unwrap()
}

#[test]
fn trained_model_honours_its_budget_for_several_settings() {
    let data = clinical_data(400, 1);
    for (k, bound) in [(1, 1), (2, 3), (3, 5)] {
        let model = trainer(k, bound).fit(&data, &CancelFlag::new()).unwrap();
        let nonzero = model.nonzero_coefficients();
        assert!(nonzero.len() <= k, "k = {k}: {nonzero:?}");
        assert!(nonzero.iter().all(|c| c.abs() <= bound), "B = {bound}: {nonzero:?}");
        assert_eq!(model.feature_names(), data.feature_names.as_slice());
    }
}

#[test]
fn fitted_model_survives_a_toml_round_trip() {
    let data = clinical_data(200, 2);
    let model = trainer(3, 4).fit(&data, &CancelFlag::new()).unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let loaded = FittedScoringModel::load(&path).unwrap();

    assert_eq!(loaded, model);
    assert_eq!(derive_sheet(&loaded).unwrap(), derive_sheet(&model).unwrap());
}

#[test]
fn corrupted_model_file_is_rejected_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    fs::write(
        &path,
        "intercept = 0.5\nmultiplier = -1.0\ncoefficients = [1]\nfeature_names = [\"a\"]\n",
    )
    .unwrap();
    assert!(FittedScoringModel::load(&path).is_err());
}

#[test]
fn sheet_risks_are_monotone_and_flip_back() {
    let data = clinical_data(300, 3);
    let model = trainer(3, 5).fit(&data, &CancelFlag::new()).unwrap();

    let sheet = derive_sheet(&model).unwrap();
    let risks = sheet.table.probabilities();
    assert!(risks.iter().all(|p| (0.0..=100.0).contains(p)));
    assert!(risks.windows(2).all(|w| w[0] <= w[1]));

    let negative = derive_sheet_for(&model, TargetClass::Negative).unwrap();
    assert_eq!(negative.table.len(), sheet.table.len());
    let back = flip(&negative);
    assert_eq!(back.decision_parameters, sheet.decision_parameters);
    assert_eq!(back.table.scores(), sheet.table.scores());
    for (a, b) in back.table.rows().iter().zip(sheet.table.rows()) {
        assert_abs_diff_eq!(a.probability, b.probability, epsilon = 1e-9);
    }
}

#[test]
fn large_sheets_sample_observed_scores() {
    let mut rng = StdRng::seed_from_u64(4);
    let x = Array2::from_shape_fn((250, 14), |_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
    let coefficients: Vec<i64> = (0..14)
        .map(|j| if j < 12 { (j as i64 % 5) + 1 } else { 0 })
        .collect();
    let names = (0..14).map(|j| format!("f{j}")).collect();
    let model =
        FittedScoringModel::new(coefficients.clone(), -10.0, 2.0, names, Some(x.clone())).unwrap();

    let weights = Array1::from_iter(coefficients.iter().map(|&c| c as f64));
    let observed: HashSet<i64> = x.dot(&weights).iter().map(|s| *s as i64).collect();

    let sheet = derive_sheet(&model).unwrap();
    let scores = sheet.table.scores();
    assert!(!scores.is_empty());
    assert!(scores.len() <= MAX_QUANTILE_POINTS);
    assert!(scores.windows(2).all(|w| w[0] < w[1]));
    assert!(scores.iter().all(|s| observed.contains(&(*s as i64))));
}

#[test]
fn large_sheet_without_projection_cannot_be_enumerated() {
    let coefficients = vec![1; 11];
    let names = (0..11).map(|j| format!("f{j}")).collect();
    let model = FittedScoringModel::new(coefficients, 0.0, 1.0, names, None).unwrap();
    assert!(derive_sheet(&model).is_err());
}

#[test]
fn tsv_tables_drive_training_and_prediction() {
    let data = clinical_data(300, 5);
    let dir = tempdir().unwrap();

    let mut text = data.feature_names.join("\t");
    text.push_str("\tlabel\n");
    for (row, label) in data.x.outer_iter().zip(data.y.iter()) {
        let cells: Vec<String> = row.iter().map(|v| format!("{}", *v as i64)).collect();
        text.push_str(&format!("{}\t{}\n", cells.join("\t"), *label as i64));
    }
    let train_path = dir.path().join("train.tsv");
    fs::write(&train_path, &text).unwrap();

    let loaded = load_training_data(train_path.to_str().unwrap(), "label").unwrap();
    assert_eq!(loaded.x, data.x);
    assert_eq!(loaded.y, data.y);

    let trainer = ScoringSheetTrainer::new(TrainerConfig {
        num_decision_params: 3,
        max_points_per_param: 3,
        num_input_features: Some(2),
        ..TrainerConfig::default()
    })
    .unwrap();
    let model = trainer.fit(&loaded, &CancelFlag::new()).unwrap();
    let groups = group_features(loaded.attribute_origins.as_deref(), 8).unwrap();
    assert_eq!(groups.num_groups(), 4);
    assert!(groups.groups_used(model.support()) <= 2);

    let table = load_feature_table(train_path.to_str().unwrap(), "label").unwrap();
    assert!(table.labels.is_some());
    let x = table.select_features(model.feature_names()).unwrap();
    let predictions = model.predict(x.view()).unwrap();
    assert!(predictions.iter().all(|p| *p == 0.0 || *p == 1.0));
    let probabilities = model.predict_proba(x.view()).unwrap();
    for (p, label) in probabilities.iter().zip(predictions.iter()) {
        assert_eq!(*label == 1.0, *p > 0.5);
    }
}

#[test]
fn only_the_latest_training_request_is_observed() {
    let first = clinical_data(300, 6);
    let mut second = clinical_data(300, 7);
    second.feature_names = (0..8).map(|j| format!("second{j}")).collect();

    let mut session = TrainingSession::new(trainer(2, 3));
    let stale = session.start(first);
    let latest = session.start(second);
    assert!(latest > stale);

    let (generation, outcome) = session.wait().unwrap();
    assert_eq!(generation, latest);
    match outcome {
        TrainingOutcome::Completed(model) => {
            assert!(model.feature_names().iter().all(|n| n.starts_with("second")));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(session.wait().is_none());
}

#[test]
fn three_label_values_end_the_task_without_a_model() {
    let x = Array2::from_shape_vec((3, 1), vec![1.0, 0.0, 1.0]).unwrap();
    let data = TrainingData::new(x, Array1::from(vec![0.0, 1.0, 2.0]));

    let mut session = TrainingSession::new(trainer(1, 1));
    session.start(data);
    let (_, outcome) = session.wait().unwrap();
    assert!(matches!(
        outcome,
        TrainingOutcome::Failed(TrainingError::NotBinary { found: 3 })
    ));
}

#[test]
fn inspection_session_collects_points_on_a_trained_sheet() {
    let data = clinical_data(300, 8);
    let model = trainer(2, 3).fit(&data, &CancelFlag::new()).unwrap();

    let mut session = SheetSession::new();
    session.attach(model);
    let sheet = session.derive().unwrap().clone();
    let all: Vec<usize> = (0..sheet.decision_parameters.len()).collect();

    let collected = session.collect_points(&all).unwrap();
    let expected: i64 = sheet.decision_parameters.iter().map(|p| p.points).sum();
    assert_eq!(collected.total, expected);
    assert_eq!(collected.risk.score, expected as f64);

    session.toggle_target_class().unwrap();
    let flipped = session.collect_points(&all).unwrap();
    assert_eq!(flipped.total, -expected);
    assert_abs_diff_eq!(
        flipped.risk.probability,
        100.0 - collected.risk.probability,
        epsilon = 1e-9
    );
}
