mod common;

use common::{request_json, small_config, trained_bundle, write_dataset};
use creditrisk::artifact::{
    BASE_ESTIMATOR_FILES, BASE_PROVENANCE_FILE, BOUNDS_FILE, IMPUTER_FILE, MANIFEST_FILE,
    ModelBundle, PipelineError, STACKING_FILE, load_base_estimators, load_base_provenance,
};
use creditrisk::data::load_training_data;
use creditrisk::ensemble::progress::NoopFitProgress;
use creditrisk::impute::ImputerState;
use creditrisk::normalize::{NormalizationBounds, NormalizeError, quantile};
use creditrisk::report::{METRICS_FILE, TEST_PREDICTIONS_FILE, THRESHOLD_SWEEP_FILE};
use creditrisk::request::parse_request;
use creditrisk::schema::{Feature, FeatureMatrix, SchemaError, feature_names};
use creditrisk::service::ServiceHandle;
use ndarray::Array2;

fn same_values(a: &FeatureMatrix, b: &FeatureMatrix) -> bool {
    a.columns() == b.columns()
        && a.values().shape() == b.values().shape()
        && a
            .values()
            .iter()
            .zip(b.values().iter())
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
}

fn typical_row() -> [f64; 10] {
    let mut row = [0.0; 10];
    row[Feature::RevolvingUtilization.index()] = 0.3;
    row[Feature::Age.index()] = 45.0;
    row[Feature::DebtRatio.index()] = 0.4;
    row[Feature::MonthlyIncome.index()] = 5000.0;
    row[Feature::OpenCreditLines.index()] = 7.0;
    row[Feature::RealEstateLoans.index()] = 1.0;
    row[Feature::Dependents.index()] = 1.0;
    row
}

#[test]
fn zero_credit_limit_gives_zero_utilization_and_a_prediction() {
    let fixture = trained_bundle(300);
    let body = request_json(0.0, 0.0, 300.0, 4000.0, 0, 1);
    let row = parse_request(&body).unwrap().to_feature_row();
    assert_eq!(row[Feature::RevolvingUtilization.index()], 0.0);

    let handle = ServiceHandle::load(&fixture.bundle_dir);
    let response = handle.predict_json(&body).unwrap();
    assert!((0.0..=1.0).contains(&response.probability_of_default));
}

#[test]
fn zero_income_uses_payment_as_debt_ratio() {
    let fixture = trained_bundle(300);
    let body = request_json(100.0, 1000.0, 500.0, 0.0, 0, 1);
    let row = parse_request(&body).unwrap().to_feature_row();
    assert_eq!(row[Feature::DebtRatio.index()], 500.0);

    let handle = ServiceHandle::load(&fixture.bundle_dir);
    let (status, _) = handle.respond(&body);
    assert_eq!(status, 200);
}

#[test]
fn sentinel_is_replaced_by_the_stored_training_median() {
    let fixture = trained_bundle(300);
    let bundle = &fixture.outcome.bundle;

    let raw = load_training_data(&fixture.dir.path().join("train.csv")).unwrap();
    let expected = quantile(
        raw.features.values().column(Feature::PastDue90Plus.index()),
        0.5,
    )
    .unwrap();
    assert_eq!(bundle.bounds.past_due_90_plus_median, expected);

    let mut row = typical_row();
    row[Feature::PastDue90Plus.index()] = 98.0;
    row[Feature::PastDue30To59.index()] = 96.0;
    let normalized = bundle.bounds.apply(&FeatureMatrix::from_rows(&[row])).unwrap();
    assert_eq!(normalized.row(0)[Feature::PastDue90Plus.index()], expected);
    assert_eq!(
        normalized.row(0)[Feature::PastDue30To59.index()],
        bundle.bounds.past_due_30_59_median
    );

    // Training rows were treated the same way.
    let train_normalized = bundle.bounds.apply(&raw.features).unwrap();
    for feature in [Feature::PastDue30To59, Feature::PastDue60To89, Feature::PastDue90Plus] {
        let column = train_normalized.values().column(feature.index()).to_owned();
        assert!(column.iter().all(|&v| v != 96.0 && v != 98.0));
    }
}

#[test]
fn real_estate_count_is_capped_at_seventeen() {
    let fixture = trained_bundle(300);
    let mut row = typical_row();
    row[Feature::RealEstateLoans.index()] = 25.0;
    let normalized = fixture
        .outcome
        .bundle
        .bounds
        .apply(&FeatureMatrix::from_rows(&[row]))
        .unwrap();
    assert_eq!(normalized.row(0)[Feature::RealEstateLoans.index()], 17.0);
}

#[test]
fn predictions_repeat_across_calls_and_reloads() {
    let fixture = trained_bundle(300);
    let body = request_json(2500.0, 10000.0, 1200.0, 6000.0, 1, 2);

    let first = ServiceHandle::load(&fixture.bundle_dir);
    let a = first.predict_json(&body).unwrap();
    let b = first.predict_json(&body).unwrap();
    let reloaded = ServiceHandle::load(&fixture.bundle_dir);
    let c = reloaded.predict_json(&body).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);

    let rows = FeatureMatrix::from_rows(&[typical_row(), parse_request(&body).unwrap().to_feature_row()]);
    let in_memory = fixture.outcome.bundle.predict(&rows).unwrap();
    let from_disk = ModelBundle::load(&fixture.bundle_dir).unwrap().predict(&rows).unwrap();
    assert_eq!(in_memory, from_disk);
}

#[test]
fn normalizer_is_idempotent_on_training_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.csv");
    write_dataset(&path, 400, 5, true);
    let data = load_training_data(&path).unwrap();
    let bounds = NormalizationBounds::fit(&data.features).unwrap();
    let once = bounds.apply(&data.features).unwrap();
    let twice = bounds.apply(&once).unwrap();
    assert!(same_values(&once, &twice));
}

#[test]
fn imputer_is_deterministic_for_a_fixed_seed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.csv");
    write_dataset(&path, 250, 8, true);
    let data = load_training_data(&path).unwrap();
    let bounds = NormalizationBounds::fit(&data.features).unwrap();
    let normalized = bounds.apply(&data.features).unwrap();
    let config = small_config().imputer;

    let (state_a, imputed_a) = ImputerState::fit(&normalized, &config, &mut NoopFitProgress).unwrap();
    let (state_b, imputed_b) = ImputerState::fit(&normalized, &config, &mut NoopFitProgress).unwrap();
    assert_eq!(state_a, state_b);
    assert!(same_values(&imputed_a, &imputed_b));
    assert!(imputed_a.values().iter().all(|v| v.is_finite()));

    let replayed = state_a.transform(&normalized).unwrap();
    assert!(same_values(&replayed, &imputed_a));
}

#[test]
fn renamed_column_is_a_schema_mismatch_before_any_work() {
    let fixture = trained_bundle(300);
    let mut columns = feature_names();
    columns[Feature::MonthlyIncome.index()] = "Income".to_string();
    let values = Array2::from_shape_vec((1, 10), typical_row().to_vec()).unwrap();
    let drifted = FeatureMatrix::new(columns, values).unwrap();

    match fixture.outcome.bundle.predict(&drifted) {
        Err(PipelineError::Normalize(NormalizeError::Schema(SchemaError::Mismatch {
            missing,
            unexpected,
            ..
        }))) => {
            assert_eq!(missing, vec!["MonthlyIncome".to_string()]);
            assert_eq!(unexpected, vec!["Income".to_string()]);
        }
        other => panic!("Expected a schema mismatch, got {other:?}"),
    }
}

#[test]
fn training_writes_reports_and_test_predictions() {
    let fixture = trained_bundle(300);
    for file in [METRICS_FILE, THRESHOLD_SWEEP_FILE, TEST_PREDICTIONS_FILE]
        .into_iter()
        .chain(BASE_ESTIMATOR_FILES)
    {
        assert!(fixture.bundle_dir.join(file).exists(), "{file} missing");
    }
    assert_eq!(fixture.outcome.test_rows, Some(40));

    let predictions = std::fs::read_to_string(fixture.bundle_dir.join(TEST_PREDICTIONS_FILE)).unwrap();
    let mut lines = predictions.lines();
    assert_eq!(lines.next(), Some("id\tprobability"));
    assert_eq!(lines.count(), 40);

    let sweep = std::fs::read_to_string(fixture.bundle_dir.join(THRESHOLD_SWEEP_FILE)).unwrap();
    assert_eq!(sweep.lines().count(), 1 + 2 * 101);

    let auc = fixture.outcome.validation_metrics.roc_auc;
    assert!(auc > 0.6, "validation AUC {auc} is no better than chance");
}

#[test]
fn training_bundle_holds_every_artifact() {
    let fixture = trained_bundle(200);
    let mut present: Vec<String> = std::fs::read_dir(&fixture.bundle_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    present.sort();

    let mut expected: Vec<String> = [
        MANIFEST_FILE,
        BOUNDS_FILE,
        IMPUTER_FILE,
        STACKING_FILE,
        BASE_PROVENANCE_FILE,
        METRICS_FILE,
        THRESHOLD_SWEEP_FILE,
        TEST_PREDICTIONS_FILE,
    ]
    .into_iter()
    .chain(BASE_ESTIMATOR_FILES)
    .map(String::from)
    .collect();
    expected.sort();
    assert_eq!(present, expected);

    // The persisted bases are the ones the stack was built from, refitted per fold.
    let bases = load_base_estimators(&fixture.bundle_dir).unwrap();
    let names: Vec<&str> = bases.iter().map(|b| b.name.as_str()).collect();
    let stacked: Vec<&str> = fixture
        .outcome
        .bundle
        .model
        .estimators
        .iter()
        .map(|b| b.name.as_str())
        .collect();
    assert_eq!(names, stacked);

    let provenance = load_base_provenance(&fixture.bundle_dir).unwrap();
    assert_eq!(provenance.training_rows, 200);
    assert_eq!(provenance.fit_rows, fixture.outcome.bundle.manifest.training_rows);
}
