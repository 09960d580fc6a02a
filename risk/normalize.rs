//! # Outlier & Sentinel Normalizer
//!
//! Caps heavy-tailed columns at training-time quantiles, replaces the
//! sentinel codes used by the bureau for "unknown" past-due counts, and
//! repairs implausible ages. Bounds are learned once from the training
//! features, frozen into `NormalizationBounds`, and then applied verbatim to
//! every later matrix. Nothing here ever looks at the data being transformed
//! to decide how to transform it.
//!
//! Missing entries (`NaN`) pass through untouched; the imputer owns them.

use crate::schema::{Feature, FeatureMatrix, PAST_DUE_FEATURES, SchemaError, feature_names};
use ndarray::{ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quantile used for the utilization, income and debt-ratio caps.
pub const UPPER_QUANTILE: f64 = 0.99;
/// Ages strictly below this are treated as data-entry errors.
pub const MINIMUM_AGE: f64 = 18.0;
/// Past-due codes that mean "unknown" rather than an actual count.
pub const PAST_DUE_SENTINELS: [f64; 2] = [96.0, 98.0];
/// Fixed upper bound on the number of real-estate loans.
pub const REAL_ESTATE_CAP: f64 = 17.0;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Column '{0}' has no observed values; a bound cannot be computed from it.")]
    EmptyColumn(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Frozen normalization bounds, learned from training features only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationBounds {
    /// Columns the bounds were fitted on, in order.
    pub columns: Vec<String>,
    pub utilization_cap: f64,
    pub median_age: f64,
    pub past_due_30_59_median: f64,
    pub past_due_60_89_median: f64,
    pub past_due_90_plus_median: f64,
    pub income_cap: f64,
    pub debt_ratio_cap: f64,
    pub real_estate_cap: f64,
}

impl NormalizationBounds {
    /// Learns the bounds from a training feature matrix in canonical order.
    pub fn fit(train: &FeatureMatrix) -> Result<Self, NormalizeError> {
        let columns = feature_names();
        train.ensure_schema(&columns)?;

        let values = train.values();
        let stat = |feature: Feature, q: f64| -> Result<f64, NormalizeError> {
            quantile(values.column(feature.index()), q)
                .ok_or_else(|| NormalizeError::EmptyColumn(feature.name().to_string()))
        };

        let bounds = Self {
            utilization_cap: stat(Feature::RevolvingUtilization, UPPER_QUANTILE)?,
            median_age: stat(Feature::Age, 0.5)?,
            past_due_30_59_median: stat(Feature::PastDue30To59, 0.5)?,
            past_due_60_89_median: stat(Feature::PastDue60To89, 0.5)?,
            past_due_90_plus_median: stat(Feature::PastDue90Plus, 0.5)?,
            income_cap: stat(Feature::MonthlyIncome, UPPER_QUANTILE)?,
            debt_ratio_cap: stat(Feature::DebtRatio, UPPER_QUANTILE)?,
            real_estate_cap: REAL_ESTATE_CAP,
            columns,
        };
        log::debug!("Fitted normalization bounds: {bounds:?}");
        Ok(bounds)
    }

    /// Stored replacement value for a past-due column's sentinel codes.
    pub fn past_due_median(&self, feature: Feature) -> Option<f64> {
        match feature {
            Feature::PastDue30To59 => Some(self.past_due_30_59_median),
            Feature::PastDue60To89 => Some(self.past_due_60_89_median),
            Feature::PastDue90Plus => Some(self.past_due_90_plus_median),
            _ => None,
        }
    }

    /// Applies the frozen bounds. Fails before touching any value if the
    /// matrix columns differ from the fit-time columns.
    pub fn apply(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix, NormalizeError> {
        matrix.ensure_schema(&self.columns)?;
        let mut values = matrix.values().to_owned();

        for mut row in values.axis_iter_mut(Axis(0)) {
            let utilization = &mut row[Feature::RevolvingUtilization.index()];
            *utilization = cap(*utilization, self.utilization_cap);

            let age = &mut row[Feature::Age.index()];
            if *age < MINIMUM_AGE {
                *age = self.median_age;
            }

            for feature in PAST_DUE_FEATURES {
                let cell = &mut row[feature.index()];
                if PAST_DUE_SENTINELS.contains(cell) {
                    *cell = self.past_due_median(feature).unwrap_or(*cell);
                }
            }

            // Floor then cap.
            let income = &mut row[Feature::MonthlyIncome.index()];
            if !income.is_nan() {
                *income = cap(income.max(0.0), self.income_cap);
            }

            let debt = &mut row[Feature::DebtRatio.index()];
            *debt = cap(*debt, self.debt_ratio_cap);

            let real_estate = &mut row[Feature::RealEstateLoans.index()];
            *real_estate = cap(*real_estate, self.real_estate_cap);
        }

        Ok(matrix.with_values(values))
    }
}

/// One-sided upper clip that leaves `NaN` alone.
#[inline]
fn cap(value: f64, upper: f64) -> f64 {
    if value > upper { upper } else { value }
}

/// Quantile with linear interpolation between order statistics, ignoring
/// `NaN`. Returns `None` when nothing is observed.
pub fn quantile(column: ArrayView1<'_, f64>, q: f64) -> Option<f64> {
    let mut observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    if observed.is_empty() {
        return None;
    }
    observed.sort_by(f64::total_cmp);
    let position = q.clamp(0.0, 1.0) * (observed.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(observed[lower] + (observed[upper] - observed[lower]) * fraction)
}
