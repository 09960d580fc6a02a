// ========================================================================================
//
//                 CREDITRISK SINGLE-REQUEST PREDICTION LATENCY BENCHMARK
//
// ========================================================================================
//
// Measures the serving path for one borrower: JSON parsing and validation,
// ratio derivation, normalization, imputation replay and the stacked ensemble.
//
// ========================================================================================

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use creditrisk::artifact::{Manifest, ModelBundle};
use creditrisk::config::TrainingConfig;
use creditrisk::ensemble::progress::NoopFitProgress;
use creditrisk::ensemble::stacking::StackingModel;
use creditrisk::impute::ImputerState;
use creditrisk::normalize::NormalizationBounds;
use creditrisk::schema::{FEATURES, Feature, FeatureMatrix, feature_names};
use creditrisk::service::ServiceHandle;
use creditrisk::train::fit_base_models;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Rows in the synthetic training set.
const TRAINING_ROWS: usize = 2_000;

fn synthetic_training_set() -> (FeatureMatrix, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut values = Array2::<f64>::zeros((TRAINING_ROWS, FEATURES.len()));
    let mut labels = Array1::<f64>::zeros(TRAINING_ROWS);
    for i in 0..TRAINING_ROWS {
        let late: f64 = rng.gen_range(0..5) as f64;
        let utilization: f64 = rng.gen_range(0.0..1.3);
        values[[i, Feature::RevolvingUtilization.index()]] = utilization;
        values[[i, Feature::Age.index()]] = rng.gen_range(21..90) as f64;
        values[[i, Feature::PastDue30To59.index()]] = late;
        values[[i, Feature::DebtRatio.index()]] = rng.gen_range(0.0..2.0);
        values[[i, Feature::MonthlyIncome.index()]] = if i % 5 == 0 {
            f64::NAN
        } else {
            rng.gen_range(1_000.0..20_000.0)
        };
        values[[i, Feature::OpenCreditLines.index()]] = rng.gen_range(0..25) as f64;
        values[[i, Feature::PastDue90Plus.index()]] = rng.gen_range(0..3) as f64;
        values[[i, Feature::RealEstateLoans.index()]] = rng.gen_range(0..5) as f64;
        values[[i, Feature::PastDue60To89.index()]] = rng.gen_range(0..2) as f64;
        values[[i, Feature::Dependents.index()]] = rng.gen_range(0..5) as f64;
        labels[i] = if late + utilization + rng.gen_range(-1.0..1.0) > 3.5 {
            1.0
        } else {
            0.0
        };
    }
    let matrix = FeatureMatrix::new(feature_names(), values).expect("canonical columns");
    (matrix, labels)
}

fn build_service() -> ServiceHandle {
    let config = TrainingConfig::default();
    let (raw, labels) = synthetic_training_set();
    let bounds = NormalizationBounds::fit(&raw).expect("bounds");
    let normalized = bounds.apply(&raw).expect("normalize");
    let (imputer, imputed) =
        ImputerState::fit(&normalized, &config.imputer, &mut NoopFitProgress).expect("imputer");
    let base = fit_base_models(&imputed, &labels, &config, &mut NoopFitProgress).expect("base");
    let model = StackingModel::fit(
        &imputed,
        labels.view(),
        &base,
        &config.stacking,
        &mut NoopFitProgress,
    )
    .expect("stacking");
    ServiceHandle::from_bundle(ModelBundle {
        manifest: Manifest::new("bench".to_string(), TRAINING_ROWS),
        bounds,
        imputer,
        model,
    })
}

fn bench_predict(c: &mut Criterion) {
    let service = build_service();
    let body = r#"{"age": 47, "total_unsecured_balance": 3200.0,
        "total_unsecured_credit_limit": 9000.0, "total_monthly_debt_payment": 1100.0,
        "monthly_income": 5200.0, "open_credit_lines_and_loans": 9,
        "days_late_30_59": 1, "days_late_90_plus": 0, "real_estate_loans": 1,
        "days_late_60_89": 0, "dependents": 2}"#;

    c.bench_function("predict_single_request", |b| {
        b.iter(|| service.respond(black_box(body)))
    });
}

criterion_group!(benches, bench_predict);
criterion_main!(benches);
