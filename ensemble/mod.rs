//! # Ensemble Engine
//!
//! Tree learners, the logistic meta-learner, fold assignment and the stacking
//! assembly that ties them together. Everything in here works on plain
//! `ndarray` matrices; column identity is checked by the callers and by
//! `StackingModel`, which carries the fit-time feature names.

pub mod boosting;
pub mod folds;
pub mod forest;
pub mod logistic;
pub mod progress;
pub mod stacking;
pub mod tree;

use crate::schema::SchemaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Cannot fit on an empty matrix.")]
    EmptyInput,
    #[error("Matrix has {rows} rows but {labels} labels were supplied.")]
    LabelLengthMismatch { rows: usize, labels: usize },
    #[error("Labels must be 0 or 1; found {value} at row {row}.")]
    NonBinaryLabel { row: usize, value: f64 },
    #[error("Both classes must be present to fit a classifier (positives: {positives}, negatives: {negatives}).")]
    SingleClass { positives: usize, negatives: usize },
    #[error("Non-finite value in the training matrix at row {row}, column {column}.")]
    NonFiniteInput { row: usize, column: usize },
    #[error("Expected {expected} feature columns, found {found}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error(
        "Cannot build {n_splits} stratified folds: class {class} has only {count} members."
    )]
    TooFewMembers {
        n_splits: usize,
        class: u8,
        count: usize,
    },
    #[error("Invalid hyperparameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Meta-estimator optimization failed: {0}")]
    MetaOptimization(String),
    #[error("Corrupt tree structure: {0}")]
    CorruptTree(String),
    #[error("Prediction produced a non-finite probability at row {0}.")]
    NonFiniteOutput(usize),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Checks a training matrix/label pair shared by every classifier fit.
pub(crate) fn check_binary_problem(
    x: ndarray::ArrayView2<'_, f64>,
    y: ndarray::ArrayView1<'_, f64>,
) -> Result<(), EnsembleError> {
    check_design(x)?;
    if x.nrows() != y.len() {
        return Err(EnsembleError::LabelLengthMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    let mut positives = 0;
    for (row, &value) in y.iter().enumerate() {
        if value == 1.0 {
            positives += 1;
        } else if value != 0.0 {
            return Err(EnsembleError::NonBinaryLabel { row, value });
        }
    }
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(EnsembleError::SingleClass {
            positives,
            negatives,
        });
    }
    Ok(())
}

/// Non-empty and finite.
pub(crate) fn check_design(x: ndarray::ArrayView2<'_, f64>) -> Result<(), EnsembleError> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(EnsembleError::EmptyInput);
    }
    for ((row, column), v) in x.indexed_iter() {
        if !v.is_finite() {
            return Err(EnsembleError::NonFiniteInput { row, column });
        }
    }
    Ok(())
}

#[inline]
pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
