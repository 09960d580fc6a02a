#![allow(dead_code)]

use creditrisk::config::TrainingConfig;
use creditrisk::ensemble::progress::NoopFitProgress;
use creditrisk::train::{TrainingOutcome, TrainingPaths, run_training};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

const HEADER: &str = "Id,SeriousDlqin2yrs,RevolvingUtilizationOfUnsecuredLines,age,\
NumberOfTime30-59DaysPastDueNotWorse,DebtRatio,MonthlyIncome,\
NumberOfOpenCreditLinesAndLoans,NumberOfTimes90DaysLate,NumberRealEstateLoansOrLines,\
NumberOfTime60-89DaysPastDueNotWorse,NumberOfDependents";

/// Writes a dataset shaped like the public credit dataset: hyphenated
/// past-due names, `NA` for missing income and dependents, the occasional
/// sentinel row and an out-of-range real-estate count. Labels are empty
/// when `labelled` is false.
pub fn write_dataset(path: &Path, rows: usize, seed: u64, labelled: bool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::from(HEADER);
    text.push('\n');
    for i in 0..rows {
        let utilization: f64 = rng.gen_range(0.0..1.2);
        let age: u32 = if i % 97 == 5 { 0 } else { rng.gen_range(21..90) };
        let sentinel = i % 53 == 7;
        let late_30: u32 = if sentinel { 98 } else { rng.gen_range(0..4) };
        let late_60: u32 = if sentinel { 98 } else { rng.gen_range(0..2) };
        let late_90: u32 = if sentinel { 98 } else { rng.gen_range(0..3) };
        let debt_ratio: f64 = rng.gen_range(0.0..1.5);
        let income = if i % 6 == 0 {
            "NA".to_string()
        } else {
            format!("{:.0}", rng.gen_range(1500.0..15000.0))
        };
        let lines: u32 = rng.gen_range(0..20);
        let real_estate: u32 = if i % 71 == 3 { 25 } else { rng.gen_range(0..4) };
        let dependents = if i % 8 == 1 {
            "NA".to_string()
        } else {
            rng.gen_range(0..4).to_string()
        };

        let risk = 1.6 * utilization + 0.9 * (late_30.min(5) + late_90.min(5)) as f64
            - 0.02 * age as f64
            + rng.gen_range(-0.6..0.6);
        let label = if labelled {
            if risk > 3.0 { "1" } else { "0" }
        } else {
            ""
        };

        let _ = writeln!(
            text,
            "{},{label},{utilization:.4},{age},{late_30},{debt_ratio:.4},{income},{lines},{late_90},{real_estate},{late_60},{dependents}",
            i + 1
        );
    }
    fs::write(path, text).unwrap();
}

/// A configuration small enough for tests to train in seconds.
pub fn small_config() -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.random_forest.n_estimators = 8;
    config.random_forest.max_depth = 6;
    config.boost_depthwise.n_estimators = 20;
    config.boost_leafwise.n_estimators = 20;
    config.boost_leafwise.min_samples_leaf = 5;
    config.imputer.n_estimators = 4;
    config.imputer.max_rounds = 3;
    config
        .with_overrides(None, Some(3), Some(1))
        .unwrap()
}

pub struct TrainedFixture {
    pub dir: tempfile::TempDir,
    pub bundle_dir: PathBuf,
    pub outcome: TrainingOutcome,
}

/// Trains a bundle on a fresh synthetic dataset, scoring a test file too.
pub fn trained_bundle(rows: usize) -> TrainedFixture {
    let dir = tempfile::tempdir().unwrap();
    let train = dir.path().join("train.csv");
    let test = dir.path().join("test.csv");
    write_dataset(&train, rows, 17, true);
    write_dataset(&test, 40, 99, false);
    let bundle_dir = dir.path().join("bundle");
    let outcome = run_training(
        &TrainingPaths {
            train: &train,
            test: Some(&test),
            base_dir: None,
            out_dir: &bundle_dir,
        },
        &small_config(),
        &mut NoopFitProgress,
    )
    .unwrap();
    TrainedFixture {
        dir,
        bundle_dir,
        outcome,
    }
}

pub fn request_json(
    balance: f64,
    limit: f64,
    payment: f64,
    income: f64,
    days_late_90_plus: u32,
    real_estate_loans: u32,
) -> String {
    serde_json::json!({
        "age": 41,
        "total_unsecured_balance": balance,
        "total_unsecured_credit_limit": limit,
        "total_monthly_debt_payment": payment,
        "monthly_income": income,
        "open_credit_lines_and_loans": 6,
        "days_late_30_59": 0,
        "days_late_90_plus": days_late_90_plus,
        "real_estate_loans": real_estate_loans,
        "days_late_60_89": 0,
        "dependents": 1
    })
    .to_string()
}
