//! # Stacking Assembly
//!
//! Combines the class-1 probabilities of several base classifiers with a
//! logistic meta-estimator.
//!
//! Under `CvStrategy::StratifiedKFold` the meta-estimator never sees a base
//! prediction for a row that the producing estimator was trained on: every
//! fold gets fresh copies of the base estimators, fitted with their stored
//! hyperparameters and seeds on the other folds. The base estimators kept in
//! the final assembly are then refitted on all rows. Under `CvStrategy::Prefit`
//! the supplied base estimators are kept as they are and the meta-estimator is
//! trained on their in-sample predictions.
//!
//! Folds, base fits within a fold and the meta fit all run in sequence on the
//! calling thread; only tree building inside a forest may use worker threads.

use super::boosting::GradientBoostedClassifier;
use super::folds::StratifiedKFold;
use super::forest::RandomForestClassifier;
use super::logistic::{LogisticParams, LogisticRegression};
use super::progress::{FitProgressObserver, FitProgressStage, StageProgress};
use super::{EnsembleError, check_binary_problem};
use crate::schema::FeatureMatrix;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

/// A fitted base classifier. Refitting a clone reuses its stored
/// hyperparameters, seed included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseEstimator {
    RandomForest(RandomForestClassifier),
    GradientBoosting(GradientBoostedClassifier),
}

impl BaseEstimator {
    pub fn n_features(&self) -> usize {
        match self {
            Self::RandomForest(m) => m.0.n_features,
            Self::GradientBoosting(m) => m.n_features,
        }
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        match self {
            Self::RandomForest(m) => m.predict_proba(x),
            Self::GradientBoosting(m) => m.predict_proba(x),
        }
    }

    /// Fits a fresh estimator with the same hyperparameters on new rows.
    pub fn fit_clone(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self, EnsembleError> {
        Ok(match self {
            Self::RandomForest(m) => Self::RandomForest(RandomForestClassifier::fit(x, y, m.params())?),
            Self::GradientBoosting(m) => {
                Self::GradientBoosting(GradientBoostedClassifier::fit(x, y, &m.params)?)
            }
        })
    }

    pub fn validate(&self) -> Result<(), EnsembleError> {
        match self {
            Self::RandomForest(m) => m.0.validate(),
            Self::GradientBoosting(m) => m.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEstimator {
    pub name: String,
    pub estimator: BaseEstimator,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CvStrategy {
    StratifiedKFold { n_splits: usize, seed: u64 },
    Prefit,
}

impl Default for CvStrategy {
    fn default() -> Self {
        Self::StratifiedKFold {
            n_splits: 5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingConfig {
    pub cv: CvStrategy,
    /// Appends the original features to the meta-estimator input.
    pub passthrough: bool,
    pub meta: LogisticParams,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            cv: CvStrategy::default(),
            passthrough: false,
            meta: LogisticParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingModel {
    /// Columns the assembly was fitted on, in order.
    pub feature_columns: Vec<String>,
    pub estimators: Vec<NamedEstimator>,
    pub meta: LogisticRegression,
    pub passthrough: bool,
    pub cv: CvStrategy,
}

impl StackingModel {
    pub fn fit(
        x: &FeatureMatrix,
        y: ArrayView1<'_, f64>,
        base: &[NamedEstimator],
        config: &StackingConfig,
        progress: &mut dyn FitProgressObserver,
    ) -> Result<Self, EnsembleError> {
        let values = x.values();
        check_binary_problem(values, y)?;
        if base.is_empty() {
            return Err(EnsembleError::InvalidParameter {
                name: "estimators",
                reason: "stacking needs at least one base estimator".into(),
            });
        }
        for named in base {
            if named.estimator.n_features() != x.ncols() {
                return Err(EnsembleError::FeatureCountMismatch {
                    expected: named.estimator.n_features(),
                    found: x.ncols(),
                });
            }
        }

        let (base_predictions, estimators) = match config.cv {
            CvStrategy::StratifiedKFold { n_splits, seed } => {
                let oof = out_of_fold_predictions(values, y, base, n_splits, seed, &mut *progress)?;
                let mut stage =
                    StageProgress::begin(&mut *progress, FitProgressStage::FinalRefit, base.len());
                let mut refitted = Vec::with_capacity(base.len());
                for named in base {
                    log::info!("Refitting base estimator '{}' on all {} rows", named.name, y.len());
                    refitted.push(NamedEstimator {
                        name: named.name.clone(),
                        estimator: named.estimator.fit_clone(values, y)?,
                    });
                    stage.step();
                }
                stage.finish();
                (oof, refitted)
            }
            CvStrategy::Prefit => {
                log::info!("Using prefit base estimators; meta-estimator sees in-sample predictions");
                (stack_predictions(values, base)?, base.to_vec())
            }
        };

        let meta_input = meta_design(base_predictions, values, config.passthrough);
        let mut stage = StageProgress::begin(progress, FitProgressStage::MetaEstimator, 1);
        let meta = LogisticRegression::fit(meta_input.view(), y, &config.meta)?;
        stage.step();
        stage.finish();

        log::info!(
            "Meta-estimator weights: {:?}, intercept {:.6}",
            estimators
                .iter()
                .zip(&meta.coefficients)
                .map(|(e, w)| format!("{}={w:.4}", e.name))
                .collect::<Vec<_>>(),
            meta.intercept
        );

        Ok(Self {
            feature_columns: x.columns().to_vec(),
            estimators,
            meta,
            passthrough: config.passthrough,
            cv: config.cv,
        })
    }

    /// Class-1 probability per row. Fails before any computation if the
    /// columns differ from the fit-time columns.
    pub fn predict_proba(&self, x: &FeatureMatrix) -> Result<Array1<f64>, EnsembleError> {
        x.ensure_schema(&self.feature_columns)?;
        let values = x.values();
        let stacked = stack_predictions(values, &self.estimators)?;
        let meta_input = meta_design(stacked, values, self.passthrough);
        let probabilities = self.meta.predict_proba(meta_input.view())?;
        if let Some(row) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(EnsembleError::NonFiniteOutput(row));
        }
        Ok(probabilities)
    }

    /// Structural checks for an assembly read back from disk.
    pub fn validate(&self) -> Result<(), EnsembleError> {
        let expected_meta = self.estimators.len()
            + if self.passthrough {
                self.feature_columns.len()
            } else {
                0
            };
        if self.meta.coefficients.len() != expected_meta {
            return Err(EnsembleError::FeatureCountMismatch {
                expected: expected_meta,
                found: self.meta.coefficients.len(),
            });
        }
        for named in &self.estimators {
            if named.estimator.n_features() != self.feature_columns.len() {
                return Err(EnsembleError::FeatureCountMismatch {
                    expected: self.feature_columns.len(),
                    found: named.estimator.n_features(),
                });
            }
            named.estimator.validate()?;
        }
        Ok(())
    }
}

fn out_of_fold_predictions(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    base: &[NamedEstimator],
    n_splits: usize,
    seed: u64,
    progress: &mut dyn FitProgressObserver,
) -> Result<Array2<f64>, EnsembleError> {
    let folds = StratifiedKFold {
        n_splits,
        shuffle: true,
        seed,
    }
    .split(y)?;

    let mut oof = Array2::<f64>::from_elem((x.nrows(), base.len()), f64::NAN);
    let mut stage = StageProgress::begin(
        progress,
        FitProgressStage::CrossValidation,
        folds.len() * base.len(),
    );
    for (k, fold) in folds.iter().enumerate() {
        let x_train = x.select(Axis(0), &fold.train);
        let y_train = y.select(Axis(0), &fold.train);
        let x_test = x.select(Axis(0), &fold.test);
        for (j, named) in base.iter().enumerate() {
            let clone = named.estimator.fit_clone(x_train.view(), y_train.view())?;
            let predicted = clone.predict_proba(x_test.view())?;
            for (&row, &p) in fold.test.iter().zip(predicted.iter()) {
                oof[[row, j]] = p;
            }
            stage.step();
            log::debug!("Fold {}/{}: '{}' done", k + 1, folds.len(), named.name);
        }
    }
    stage.finish();
    Ok(oof)
}

fn stack_predictions(
    x: ArrayView2<'_, f64>,
    estimators: &[NamedEstimator],
) -> Result<Array2<f64>, EnsembleError> {
    let mut stacked = Array2::zeros((x.nrows(), estimators.len()));
    for (j, named) in estimators.iter().enumerate() {
        stacked
            .column_mut(j)
            .assign(&named.estimator.predict_proba(x)?);
    }
    Ok(stacked)
}

fn meta_design(stacked: Array2<f64>, x: ArrayView2<'_, f64>, passthrough: bool) -> Array2<f64> {
    if !passthrough {
        return stacked;
    }
    let m = stacked.ncols();
    let mut design = Array2::zeros((x.nrows(), m + x.ncols()));
    design.slice_mut(s![.., ..m]).assign(&stacked);
    design.slice_mut(s![.., m..]).assign(&x);
    design
}
