//! # Training Entry Point
//!
//! Loads a labelled dataset, fits the preprocessing state, holds out a
//! stratified validation split, fits the stacking assembly on the rest and
//! writes the bundle together with its evaluation reports. Base estimators
//! come either from a directory written by [`fit_base_estimators`] or are
//! fitted in-process from the configured hyperparameters; either way they are
//! copied into the bundle with a record of the split they were fitted on.

use crate::artifact::{
    ArtifactError, BASE_ESTIMATOR_FILES, BaseProvenance, Manifest, ModelBundle, PipelineError,
    load_base_estimators, load_base_provenance, save_base_estimators,
};
use crate::config::TrainingConfig;
use crate::data::{DataError, TrainingData, load_prediction_data, load_training_data};
use crate::ensemble::EnsembleError;
use crate::ensemble::boosting::GradientBoostedClassifier;
use crate::ensemble::folds::stratified_holdout;
use crate::ensemble::forest::RandomForestClassifier;
use crate::ensemble::progress::{FitProgressObserver, FitProgressStage, StageProgress};
use crate::ensemble::stacking::{BaseEstimator, NamedEstimator, StackingModel};
use crate::impute::{ImputeError, ImputerState};
use crate::normalize::{NormalizationBounds, NormalizeError};
use crate::report::{
    ClassificationMetrics, METRICS_FILE, ReportError, TEST_PREDICTIONS_FILE, THRESHOLD_SWEEP_FILE,
    threshold_sweep, write_metrics, write_predictions, write_threshold_sweep,
};
use crate::schema::FeatureMatrix;
use ndarray::{Array1, Axis};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RANDOM_FOREST_NAME: &str = "random_forest";
pub const BOOST_DEPTHWISE_NAME: &str = "boost_depthwise";
pub const BOOST_LEAFWISE_NAME: &str = "boost_leafwise";

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("Imputation failed: {0}")]
    Impute(#[from] ImputeError),
    #[error("Model fitting failed: {0}")]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Scoring failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error(
        "Base estimators in '{dir}' were fitted on a different split ({found:?}); this run expects {expected:?}. Refit them with the same seed and data."
    )]
    BaseSplitMismatch {
        dir: PathBuf,
        expected: BaseProvenance,
        found: BaseProvenance,
    },
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Training data after preprocessing, with the state that produced it.
pub struct Prepared {
    pub bounds: NormalizationBounds,
    pub imputer: ImputerState,
    pub features: FeatureMatrix,
    pub labels: Array1<f64>,
    pub fit_rows: Vec<usize>,
    pub holdout_rows: Vec<usize>,
}

/// Fits normalization and imputation on every training row, then draws the
/// stratified validation holdout.
pub fn prepare(
    data: &TrainingData,
    config: &TrainingConfig,
    progress: &mut dyn FitProgressObserver,
) -> Result<Prepared, TrainingError> {
    let bounds = NormalizationBounds::fit(&data.features)?;
    log::info!(
        "Normalization bounds: utilization cap {:.4}, income cap {:.2}, debt ratio cap {:.4}, median age {}",
        bounds.utilization_cap,
        bounds.income_cap,
        bounds.debt_ratio_cap,
        bounds.median_age
    );
    let normalized = bounds.apply(&data.features)?;
    log::debug!("Missing values per column after normalization: {:?}", normalized.missing_counts());
    let (imputer, features) = ImputerState::fit(&normalized, &config.imputer, progress)?;
    let (fit_rows, holdout_rows) =
        stratified_holdout(data.labels.view(), config.holdout_fraction, config.seed)?;
    log::info!(
        "Holding out {} of {} rows for validation",
        holdout_rows.len(),
        data.labels.len()
    );
    Ok(Prepared {
        bounds,
        imputer,
        features,
        labels: data.labels.clone(),
        fit_rows,
        holdout_rows,
    })
}

impl Prepared {
    /// The split the base estimators of this run are fitted on.
    pub fn provenance(&self, config: &TrainingConfig) -> BaseProvenance {
        BaseProvenance {
            holdout_seed: config.seed,
            holdout_fraction: config.holdout_fraction,
            training_rows: self.labels.len(),
            fit_rows: self.fit_rows.len(),
        }
    }
}

/// Fits the three base estimators from their configured hyperparameters.
pub fn fit_base_models(
    x: &FeatureMatrix,
    y: &Array1<f64>,
    config: &TrainingConfig,
    progress: &mut dyn FitProgressObserver,
) -> Result<Vec<NamedEstimator>, TrainingError> {
    let values = x.values();
    let mut stage = StageProgress::begin(
        progress,
        FitProgressStage::BaseEstimators,
        BASE_ESTIMATOR_FILES.len(),
    );

    log::info!("Fitting base estimator '{RANDOM_FOREST_NAME}'");
    let forest = RandomForestClassifier::fit(values, y.view(), &config.random_forest)?;
    stage.step();

    log::info!("Fitting base estimator '{BOOST_DEPTHWISE_NAME}'");
    let depth_wise = GradientBoostedClassifier::fit(values, y.view(), &config.boost_depthwise)?;
    stage.step();

    log::info!("Fitting base estimator '{BOOST_LEAFWISE_NAME}'");
    let leaf_wise = GradientBoostedClassifier::fit(values, y.view(), &config.boost_leafwise)?;
    stage.step();
    stage.finish();

    Ok(vec![
        NamedEstimator {
            name: RANDOM_FOREST_NAME.to_string(),
            estimator: BaseEstimator::RandomForest(forest),
        },
        NamedEstimator {
            name: BOOST_DEPTHWISE_NAME.to_string(),
            estimator: BaseEstimator::GradientBoosting(depth_wise),
        },
        NamedEstimator {
            name: BOOST_LEAFWISE_NAME.to_string(),
            estimator: BaseEstimator::GradientBoosting(leaf_wise),
        },
    ])
}

fn create_dir(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|source| TrainingError::OutputDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Fits the base estimators on the non-holdout rows of `train_path` and
/// writes them to `out_dir`.
pub fn fit_base_estimators(
    train_path: &Path,
    out_dir: &Path,
    config: &TrainingConfig,
    progress: &mut dyn FitProgressObserver,
) -> Result<Vec<NamedEstimator>, TrainingError> {
    let data = load_training_data(train_path)?;
    let prepared = prepare(&data, config, progress)?;
    let x = prepared.features.select_rows(&prepared.fit_rows);
    let y = prepared.labels.select(Axis(0), &prepared.fit_rows);
    let estimators = fit_base_models(&x, &y, config, progress)?;

    create_dir(out_dir)?;
    save_base_estimators(out_dir, &estimators, &prepared.provenance(config))?;
    log::info!("Saved {} base estimators to {}", estimators.len(), out_dir.display());
    Ok(estimators)
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub bundle: ModelBundle,
    pub train_metrics: ClassificationMetrics,
    pub validation_metrics: ClassificationMetrics,
    pub test_rows: Option<usize>,
}

pub struct TrainingPaths<'a> {
    pub train: &'a Path,
    pub test: Option<&'a Path>,
    /// Directory of previously fitted base estimators; `None` fits them here.
    pub base_dir: Option<&'a Path>,
    pub out_dir: &'a Path,
}

pub fn run_training(
    paths: &TrainingPaths<'_>,
    config: &TrainingConfig,
    progress: &mut dyn FitProgressObserver,
) -> Result<TrainingOutcome, TrainingError> {
    let data = load_training_data(paths.train)?;
    let prepared = prepare(&data, config, progress)?;
    let x_fit = prepared.features.select_rows(&prepared.fit_rows);
    let y_fit = prepared.labels.select(Axis(0), &prepared.fit_rows);
    let x_holdout = prepared.features.select_rows(&prepared.holdout_rows);
    let y_holdout = prepared.labels.select(Axis(0), &prepared.holdout_rows);

    let provenance = prepared.provenance(config);
    let base = match paths.base_dir {
        Some(dir) => {
            log::info!("Loading base estimators from {}", dir.display());
            let found = load_base_provenance(dir)?;
            if found != provenance {
                return Err(TrainingError::BaseSplitMismatch {
                    dir: dir.to_path_buf(),
                    expected: provenance,
                    found,
                });
            }
            load_base_estimators(dir)?
        }
        None => fit_base_models(&x_fit, &y_fit, config, progress)?,
    };

    let model = StackingModel::fit(&x_fit, y_fit.view(), &base, &config.stacking, progress)?;

    let p_fit = model.predict_proba(&x_fit)?;
    let p_holdout = model.predict_proba(&x_holdout)?;
    let train_metrics = ClassificationMetrics::compute(y_fit.view(), p_fit.view(), config.threshold)?;
    let validation_metrics =
        ClassificationMetrics::compute(y_holdout.view(), p_holdout.view(), config.threshold)?;
    log::info!(
        "Train: AUC {:.4}, balanced accuracy {:.4}; validation: AUC {:.4}, balanced accuracy {:.4}",
        train_metrics.roc_auc,
        train_metrics.balanced_accuracy,
        validation_metrics.roc_auc,
        validation_metrics.balanced_accuracy
    );

    let model_version = format!(
        "{}-seed{}-n{}",
        env!("CARGO_PKG_VERSION"),
        config.seed,
        data.labels.len()
    );
    let bundle = ModelBundle {
        manifest: Manifest::new(model_version, x_fit.nrows()),
        bounds: prepared.bounds,
        imputer: prepared.imputer,
        model,
    };

    create_dir(paths.out_dir)?;
    save_base_estimators(paths.out_dir, &base, &provenance)?;
    bundle.save(paths.out_dir)?;
    write_metrics(
        &paths.out_dir.join(METRICS_FILE),
        &[("train", &train_metrics), ("validation", &validation_metrics)],
    )?;
    let train_sweep = threshold_sweep(y_fit.view(), p_fit.view())?;
    let validation_sweep = threshold_sweep(y_holdout.view(), p_holdout.view())?;
    write_threshold_sweep(
        &paths.out_dir.join(THRESHOLD_SWEEP_FILE),
        &[("train", train_sweep.as_slice()), ("validation", validation_sweep.as_slice())],
    )?;

    let test_rows = match paths.test {
        Some(test_path) => {
            let test = load_prediction_data(test_path)?;
            let probabilities = bundle.predict(&test.features)?;
            write_predictions(
                &paths.out_dir.join(TEST_PREDICTIONS_FILE),
                &test.ids,
                probabilities.view(),
            )?;
            log::info!("Scored {} test rows", test.ids.len());
            Some(test.ids.len())
        }
        None => None,
    };

    Ok(TrainingOutcome {
        bundle,
        train_metrics,
        validation_metrics,
        test_rows,
    })
}
