//! # Feature Schema
//!
//! The single, ordered definition of the borrower feature set. Every path that
//! touches borrower data (the dataset loader, the request validator, the
//! normalizer, the imputer and the ensemble) consumes this definition, so the
//! column order used at training time is, by construction, the column order
//! used at serving time.
//!
//! A `FeatureMatrix` carries its column names next to the numeric values. Each
//! fitted component remembers the columns it was fitted on and rejects any
//! matrix whose columns differ, instead of silently reshaping it.

use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the binary outcome column in training data.
pub const LABEL_COLUMN: &str = "SeriousDlqin2yrs";

/// The borrower features, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    RevolvingUtilization,
    Age,
    PastDue30To59,
    DebtRatio,
    MonthlyIncome,
    OpenCreditLines,
    PastDue90Plus,
    RealEstateLoans,
    PastDue60To89,
    Dependents,
}

/// Canonical feature order shared by training and inference.
pub const FEATURES: [Feature; 10] = [
    Feature::RevolvingUtilization,
    Feature::Age,
    Feature::PastDue30To59,
    Feature::DebtRatio,
    Feature::MonthlyIncome,
    Feature::OpenCreditLines,
    Feature::PastDue90Plus,
    Feature::RealEstateLoans,
    Feature::PastDue60To89,
    Feature::Dependents,
];

/// The three days-past-due counters, which share the sentinel-code treatment.
pub const PAST_DUE_FEATURES: [Feature; 3] = [
    Feature::PastDue30To59,
    Feature::PastDue60To89,
    Feature::PastDue90Plus,
];

impl Feature {
    /// Canonical column name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RevolvingUtilization => "RevolvingUtilizationOfUnsecuredLines",
            Self::Age => "age",
            Self::PastDue30To59 => "NumberOfTime30_59DaysPastDueNotWorse",
            Self::DebtRatio => "DebtRatio",
            Self::MonthlyIncome => "MonthlyIncome",
            Self::OpenCreditLines => "NumberOfOpenCreditLinesAndLoans",
            Self::PastDue90Plus => "NumberOfTimes90DaysLate",
            Self::RealEstateLoans => "NumberRealEstateLoansOrLines",
            Self::PastDue60To89 => "NumberOfTime60_89DaysPastDueNotWorse",
            Self::Dependents => "NumberOfDependents",
        }
    }

    /// Alternative spellings accepted when reading tabular files. The public
    /// dataset uses hyphens in the past-due column names.
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::PastDue30To59 => &["NumberOfTime30-59DaysPastDueNotWorse"],
            Self::PastDue60To89 => &["NumberOfTime60-89DaysPastDueNotWorse"],
            _ => &[],
        }
    }

    /// Position of this feature in the canonical order.
    pub fn index(self) -> usize {
        FEATURES
            .iter()
            .position(|&f| f == self)
            .unwrap_or_default()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FEATURES
            .iter()
            .copied()
            .find(|f| f.name() == name || f.aliases().contains(&name))
    }
}

/// Canonical column names as owned strings.
pub fn feature_names() -> Vec<String> {
    FEATURES.iter().map(|f| f.name().to_string()).collect()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error(
        "Column schema mismatch. Missing: [{}]. Unexpected: [{}]. Out of order: [{}]. Expected order: [{}].",
        missing.join(", "),
        unexpected.join(", "),
        misordered.join(", "),
        expected.join(", ")
    )]
    Mismatch {
        expected: Vec<String>,
        found: Vec<String>,
        missing: Vec<String>,
        unexpected: Vec<String>,
        misordered: Vec<String>,
    },
    #[error("Matrix has {found} columns but {expected} column names were supplied.")]
    ShapeMismatch { expected: usize, found: usize },
}

impl SchemaError {
    /// Builds a mismatch report naming every column that differs.
    pub fn mismatch(expected: &[String], found: &[String]) -> Self {
        let missing = expected
            .iter()
            .filter(|c| !found.contains(c))
            .cloned()
            .collect();
        let unexpected = found
            .iter()
            .filter(|c| !expected.contains(c))
            .cloned()
            .collect();
        let misordered = found
            .iter()
            .enumerate()
            .filter(|(i, c)| expected.contains(c) && expected.get(*i) != Some(c))
            .map(|(i, c)| format!("{c}@{i}"))
            .collect();
        SchemaError::Mismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
            missing,
            unexpected,
            misordered,
        }
    }
}

/// Checks that `found` is exactly `expected`, in the same order.
pub fn ensure_columns(expected: &[String], found: &[String]) -> Result<(), SchemaError> {
    if expected == found {
        Ok(())
    } else {
        Err(SchemaError::mismatch(expected, found))
    }
}

/// A numeric matrix whose columns are named. Rows are records.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self, SchemaError> {
        if columns.len() != values.ncols() {
            return Err(SchemaError::ShapeMismatch {
                expected: columns.len(),
                found: values.ncols(),
            });
        }
        Ok(Self { columns, values })
    }

    /// Builds a matrix over the canonical feature set from row-major records.
    pub fn from_rows(rows: &[[f64; 10]]) -> Self {
        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let values = Array2::from_shape_vec((rows.len(), FEATURES.len()), flat)
            .unwrap_or_else(|_| Array2::zeros((0, FEATURES.len())));
        Self {
            columns: feature_names(),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn into_values(self) -> Array2<f64> {
        self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Fails with a `SchemaError` naming the differences unless the columns
    /// are exactly `expected`, in order.
    pub fn ensure_schema(&self, expected: &[String]) -> Result<(), SchemaError> {
        ensure_columns(expected, &self.columns)
    }

    /// Returns a copy holding only the given rows.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            values: self.values.select(ndarray::Axis(0), rows),
        }
    }

    /// Same columns, new values. Used by stages that transform in place.
    pub(crate) fn with_values(&self, values: Array2<f64>) -> Self {
        Self {
            columns: self.columns.clone(),
            values,
        }
    }

    /// Number of missing (`NaN`) entries per column.
    pub fn missing_counts(&self) -> Vec<usize> {
        self.values
            .columns()
            .into_iter()
            .map(|c| c.iter().filter(|v| v.is_nan()).count())
            .collect()
    }

    pub fn describe_columns(&self) -> String {
        self.columns.iter().join(", ")
    }
}
