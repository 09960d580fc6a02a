//! # Multivariate Imputer
//!
//! Iterative imputation with random-forest regressors. Fitting starts from a
//! column-mean fill and then, round after round, re-predicts the missing
//! entries of each incomplete column from every other column. Each regressor
//! fitted along the way is kept as an `ImputationStep`, so `transform` can
//! replay exactly the same sequence on new data without estimating anything.
//!
//! Column visiting order is ascending by missing count (ties keep schema
//! order). Fitting stops early once the largest change to any imputed entry
//! in a round falls below `tolerance * max|observed value|`.
//!
//! Only columns with missing training values get regressors. A column that
//! was complete at fit time has no step to replay, so a value missing from it
//! at transform time keeps the column's initial (mean) fill.

use crate::ensemble::EnsembleError;
use crate::ensemble::forest::{ForestParams, MaxFeatures, RandomForestRegressor};
use crate::ensemble::progress::{FitProgressObserver, FitProgressStage, StageProgress};
use crate::schema::{FeatureMatrix, SchemaError};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error(
        "Column '{0}' has no observed values in the training matrix and cannot be imputed."
    )]
    ColumnEntirelyMissing(String),
    #[error("Imputer state is inconsistent: {0}")]
    CorruptState(String),
    #[error("Regressor failure while imputing '{column}': {source}")]
    Regressor {
        column: String,
        #[source]
        source: EnsembleError,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputerConfig {
    pub max_rounds: usize,
    pub n_estimators: usize,
    /// Depth limit of each regressor tree; `0` is unbounded.
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
    pub tolerance: f64,
    pub n_jobs: usize,
}

impl Default for ImputerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            n_estimators: 10,
            max_depth: 12,
            min_samples_leaf: 1,
            seed: 42,
            tolerance: 1e-3,
            n_jobs: 1,
        }
    }
}

impl ImputerConfig {
    fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            max_features: MaxFeatures::All,
            bootstrap: true,
            seed: self.seed,
            n_jobs: self.n_jobs,
        }
    }
}

/// One fitted regression: `column` predicted from `predictors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationStep {
    pub round: usize,
    pub column: usize,
    pub predictors: Vec<usize>,
    pub regressor: RandomForestRegressor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputerState {
    pub columns: Vec<String>,
    /// Observed mean of each column at fit time.
    pub initial_fill: Vec<f64>,
    pub steps: Vec<ImputationStep>,
    pub rounds_run: usize,
    pub converged: bool,
    pub config: ImputerConfig,
}

impl ImputerState {
    /// Fits the imputer and returns it with the imputed training matrix.
    pub fn fit(
        train: &FeatureMatrix,
        config: &ImputerConfig,
        progress: &mut dyn FitProgressObserver,
    ) -> Result<(Self, FeatureMatrix), ImputeError> {
        let columns = train.columns().to_vec();
        let mut values = train.values().to_owned();
        let n_cols = values.ncols();

        let mut initial_fill = Vec::with_capacity(n_cols);
        let mut max_abs_observed = 0.0f64;
        for (j, column) in values.axis_iter(Axis(1)).enumerate() {
            let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
            if observed.is_empty() {
                return Err(ImputeError::ColumnEntirelyMissing(columns[j].clone()));
            }
            for v in &observed {
                max_abs_observed = max_abs_observed.max(v.abs());
            }
            initial_fill.push(observed.iter().sum::<f64>() / observed.len() as f64);
        }

        let missing_rows: Vec<Vec<usize>> = values
            .axis_iter(Axis(1))
            .map(|c| {
                c.iter()
                    .enumerate()
                    .filter(|(_, v)| v.is_nan())
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let mut order: Vec<usize> = (0..n_cols).filter(|&j| !missing_rows[j].is_empty()).collect();
        order.sort_by_key(|&j| missing_rows[j].len());

        fill_initial(&mut values, &initial_fill);

        let threshold = config.tolerance * max_abs_observed;
        let forest_params = config.forest_params();
        let mut steps = Vec::new();
        let mut rounds_run = 0;
        let mut converged = false;

        let mut stage = None;
        if !order.is_empty() {
            log::info!(
                "Imputing {} incomplete columns: {}",
                order.len(),
                order
                    .iter()
                    .map(|&j| format!("{} ({} missing)", columns[j], missing_rows[j].len()))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            stage = Some(StageProgress::begin(
                progress,
                FitProgressStage::Imputation,
                config.max_rounds,
            ));
        }

        for round in 0..config.max_rounds {
            if order.is_empty() {
                converged = true;
                break;
            }
            let mut largest_change = 0.0f64;
            for &target in &order {
                let predictors: Vec<usize> = (0..n_cols).filter(|&j| j != target).collect();
                let observed_rows: Vec<usize> = {
                    let missing = &missing_rows[target];
                    (0..values.nrows())
                        .filter(|r| missing.binary_search(r).is_err())
                        .collect()
                };
                let x_fit = values
                    .select(Axis(0), &observed_rows)
                    .select(Axis(1), &predictors);
                let y_fit = values.column(target).select(Axis(0), &observed_rows);
                let regressor = RandomForestRegressor::fit(x_fit.view(), y_fit.view(), &forest_params)
                    .map_err(|source| ImputeError::Regressor {
                        column: columns[target].clone(),
                        source,
                    })?;

                let x_missing = values
                    .select(Axis(0), &missing_rows[target])
                    .select(Axis(1), &predictors);
                let predicted = regressor.predict(x_missing.view()).map_err(|source| {
                    ImputeError::Regressor {
                        column: columns[target].clone(),
                        source,
                    }
                })?;
                for (&row, &value) in missing_rows[target].iter().zip(predicted.iter()) {
                    largest_change = largest_change.max((values[[row, target]] - value).abs());
                    values[[row, target]] = value;
                }

                steps.push(ImputationStep {
                    round,
                    column: target,
                    predictors,
                    regressor,
                });
            }
            rounds_run = round + 1;
            if let Some(stage) = stage.as_mut() {
                stage.step();
            }
            log::debug!("Imputation round {rounds_run}: largest change {largest_change:.6e}");
            if largest_change < threshold {
                converged = true;
                break;
            }
        }
        if let Some(stage) = stage {
            stage.finish();
            if converged {
                log::info!("Imputation converged after {rounds_run} rounds");
            } else {
                log::warn!(
                    "Imputation stopped at the round limit ({rounds_run}) before reaching the tolerance"
                );
            }
        }

        let state = Self {
            columns,
            initial_fill,
            steps,
            rounds_run,
            converged,
            config: config.clone(),
        };
        let imputed = train.with_values(values);
        Ok((state, imputed))
    }

    /// Fills every missing entry of `matrix` by replaying the fitted steps.
    /// Entries of columns that were complete at fit time stay at the initial
    /// fill.
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix, ImputeError> {
        matrix.ensure_schema(&self.columns)?;
        let mut values = matrix.values().to_owned();
        let missing_rows: Vec<Vec<usize>> = values
            .axis_iter(Axis(1))
            .map(|c| {
                c.iter()
                    .enumerate()
                    .filter(|(_, v)| v.is_nan())
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        fill_initial(&mut values, &self.initial_fill);

        for step in &self.steps {
            let rows = &missing_rows[step.column];
            if rows.is_empty() {
                continue;
            }
            let x = values
                .select(Axis(0), rows)
                .select(Axis(1), &step.predictors);
            let predicted = step
                .regressor
                .predict(x.view())
                .map_err(|source| ImputeError::Regressor {
                    column: self.columns[step.column].clone(),
                    source,
                })?;
            for (&row, &value) in rows.iter().zip(predicted.iter()) {
                values[[row, step.column]] = value;
            }
        }
        Ok(matrix.with_values(values))
    }

    /// Structural checks for a state read back from disk.
    pub fn validate(&self) -> Result<(), ImputeError> {
        let k = self.columns.len();
        if self.initial_fill.len() != k || self.initial_fill.iter().any(|v| !v.is_finite()) {
            return Err(ImputeError::CorruptState(format!(
                "expected {k} finite initial fill values, found {}",
                self.initial_fill.len()
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.column >= k || step.predictors.iter().any(|&p| p >= k || p == step.column) {
                return Err(ImputeError::CorruptState(format!(
                    "step {i} references columns outside the schema"
                )));
            }
            if step.regressor.0.n_features != step.predictors.len() {
                return Err(ImputeError::CorruptState(format!(
                    "step {i} regressor expects {} predictors, step lists {}",
                    step.regressor.0.n_features,
                    step.predictors.len()
                )));
            }
            step.regressor.0.validate().map_err(|source| ImputeError::Regressor {
                column: self.columns[step.column].clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn fill_initial(values: &mut Array2<f64>, fill: &[f64]) {
    for (mut column, &mean) in values.axis_iter_mut(Axis(1)).zip(fill) {
        column.mapv_inplace(|v| if v.is_nan() { mean } else { v });
    }
}
