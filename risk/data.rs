//! # Data Loading and Validation Module
//!
//! The single entry point for borrower datasets on disk. It reads delimited
//! text files (comma separated, or tab separated for `.tsv`), resolves the
//! canonical feature columns (accepting the hyphenated past-due spellings of
//! the public dataset), and produces `FeatureMatrix` values in schema order.
//!
//! - Missing cells (`NA` or empty) become `NaN`; the imputer deals with them.
//! - Infinite values and non-numeric text are rejected with the column name.
//! - A dataset may carry the raw monetary columns instead of the two ratios;
//!   the ratios are then derived with the same functions the service uses.
//! - Labels are required for training and must be exactly 0 or 1.

use crate::derive;
use crate::schema::{FEATURES, Feature, FeatureMatrix, LABEL_COLUMN, SchemaError, feature_names};
use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Raw monetary columns accepted in place of the derived ratios.
pub const BALANCE_COLUMN: &str = "total_unsecured_balance";
pub const CREDIT_LIMIT_COLUMN: &str = "total_unsecured_credit_limit";
pub const DEBT_PAYMENT_COLUMN: &str = "total_monthly_debt_payment";

/// Identifier columns, in order of preference. The empty name is the
/// unnamed leading index column written by dataframe libraries.
const ID_COLUMNS: [&str; 4] = ["Id", "id", "", "Unnamed: 0"];

/// Training datasets smaller than this are refused.
pub const MINIMUM_TRAINING_ROWS: usize = 20;

/// Validated data ready for fitting.
#[derive(Debug)]
pub struct TrainingData {
    /// Raw features in canonical order; missing entries are `NaN`.
    pub features: FeatureMatrix,
    /// Binary outcome from `SeriousDlqin2yrs`.
    pub labels: Array1<f64>,
    pub ids: Vec<String>,
}

/// Validated data ready for scoring.
#[derive(Debug)]
pub struct PredictionData {
    pub features: FeatureMatrix,
    /// Values of the identifier column if present, otherwise 1-based row numbers.
    pub ids: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing values were found in the label column '{0}'. Every training row needs an outcome."
    )]
    MissingLabels(String),
    #[error("Label column '{LABEL_COLUMN}' must contain only 0 or 1; found {value} at row {row}.")]
    NonBinaryLabel { row: usize, value: f64 },
    #[error(
        "Input file contains only {found} data rows, but at least {required} are required."
    )]
    InsufficientRows { found: usize, required: usize },
    #[error(
        "Non-finite values (Infinity) were found in column '{0}'. Use NA for unknown values."
    )]
    NonFiniteValuesFound(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Loads and validates a labelled dataset.
pub fn load_training_data(path: &Path) -> Result<TrainingData, DataError> {
    let df = internal::read_frame(path)?;
    if df.height() < MINIMUM_TRAINING_ROWS {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: MINIMUM_TRAINING_ROWS,
        });
    }
    let names = internal::column_names(&df);
    if !names.contains(LABEL_COLUMN) {
        return Err(DataError::ColumnNotFound(LABEL_COLUMN.to_string()));
    }

    let labels = internal::extract_numeric_column(&df, LABEL_COLUMN)?;
    if labels.iter().any(|v| v.is_nan()) {
        return Err(DataError::MissingLabels(LABEL_COLUMN.to_string()));
    }
    if let Some((row, &value)) = labels
        .iter()
        .enumerate()
        .find(|(_, v)| **v != 0.0 && **v != 1.0)
    {
        return Err(DataError::NonBinaryLabel {
            row: row + 1,
            value,
        });
    }

    let features = internal::feature_matrix(&df, &names)?;
    let ids = internal::row_ids(&df, &names)?;
    let positives = labels.iter().filter(|&&v| v == 1.0).count();
    log::info!(
        "Loaded {} training rows ({} positive, {:.2}%) from '{}'",
        labels.len(),
        positives,
        100.0 * positives as f64 / labels.len() as f64,
        path.display()
    );
    log::debug!("Feature columns: {}", features.describe_columns());
    Ok(TrainingData {
        features,
        labels: Array1::from_vec(labels),
        ids,
    })
}

/// Loads and validates a dataset for scoring. A label column, if present,
/// is ignored.
pub fn load_prediction_data(path: &Path) -> Result<PredictionData, DataError> {
    let df = internal::read_frame(path)?;
    if df.height() == 0 {
        return Err(DataError::InsufficientRows {
            found: 0,
            required: 1,
        });
    }
    let names = internal::column_names(&df);
    let features = internal::feature_matrix(&df, &names)?;
    let ids = internal::row_ids(&df, &names)?;
    log::info!("Loaded {} rows for scoring from '{}'", ids.len(), path.display());
    Ok(PredictionData { features, ids })
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) fn read_frame(path: &Path) -> Result<DataFrame, DataError> {
        let separator = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
            _ => b',',
        };
        let file = File::open(path).map_err(|source| DataError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        let df = CsvReader::new(file)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(None)
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator)
                            .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                    ),
            )
            .finish()?;
        Ok(df)
    }

    pub(super) fn column_names(df: &DataFrame) -> HashSet<String> {
        df.get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Numeric values of a column with nulls as `NaN`.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        // A failed text-to-number conversion shows up as an extra null.
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let chunked = casted.f64()?;
        let values: Vec<f64> = chunked
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        if values.iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Finds a feature under its canonical name or one of its aliases.
    fn locate(feature: Feature, names: &HashSet<String>) -> Option<&'static str> {
        std::iter::once(feature.name())
            .chain(feature.aliases().iter().copied())
            .find(|candidate| names.contains(*candidate))
    }

    fn derived_column(
        df: &DataFrame,
        names: &HashSet<String>,
        feature: Feature,
    ) -> Result<Vec<f64>, DataError> {
        let require = |name: &str| -> Result<Vec<f64>, DataError> {
            if names.contains(name) {
                extract_numeric_column(df, name)
            } else {
                Err(DataError::ColumnNotFound(format!(
                    "{} (or the raw column '{name}' to derive it from)",
                    feature.name()
                )))
            }
        };
        match feature {
            Feature::RevolvingUtilization => {
                log::info!("Deriving '{}' from raw monetary columns", feature.name());
                let balance = require(BALANCE_COLUMN)?;
                let limit = require(CREDIT_LIMIT_COLUMN)?;
                Ok(balance
                    .iter()
                    .zip(&limit)
                    .map(|(&b, &l)| {
                        if b.is_nan() || l.is_nan() {
                            f64::NAN
                        } else {
                            derive::revolving_utilization(b, l)
                        }
                    })
                    .collect())
            }
            Feature::DebtRatio => {
                log::info!("Deriving '{}' from raw monetary columns", feature.name());
                let payment = require(DEBT_PAYMENT_COLUMN)?;
                let income = match locate(Feature::MonthlyIncome, names) {
                    Some(name) => extract_numeric_column(df, name)?,
                    None => return Err(DataError::ColumnNotFound(Feature::MonthlyIncome.name().into())),
                };
                // Unknown income is handled like zero income: the payment
                // itself is the ratio.
                Ok(payment
                    .iter()
                    .zip(&income)
                    .map(|(&p, &i)| {
                        if p.is_nan() {
                            f64::NAN
                        } else {
                            derive::debt_ratio(p, i)
                        }
                    })
                    .collect())
            }
            other => Err(DataError::ColumnNotFound(other.name().to_string())),
        }
    }

    pub(super) fn feature_matrix(
        df: &DataFrame,
        names: &HashSet<String>,
    ) -> Result<FeatureMatrix, DataError> {
        let n = df.height();
        let mut buffer = Vec::with_capacity(n * FEATURES.len());
        for feature in FEATURES {
            let mut column = match locate(feature, names) {
                Some(name) => extract_numeric_column(df, name)?,
                None => derived_column(df, names, feature)?,
            };
            buffer.append(&mut column);
        }
        // Column-major buffer, one feature after another.
        let values = Array2::from_shape_vec((n, FEATURES.len()).f(), buffer).map_err(|e| {
            DataError::ColumnWrongType {
                column_name: "<feature matrix>".into(),
                expected_type: "rectangular numeric table",
                found_type: e.to_string(),
            }
        })?;
        let missing: usize = values.iter().filter(|v| v.is_nan()).count();
        if missing > 0 {
            log::info!("{missing} missing feature values will be imputed");
        }
        Ok(FeatureMatrix::new(feature_names(), values.as_standard_layout().to_owned())?)
    }

    pub(super) fn row_ids(df: &DataFrame, names: &HashSet<String>) -> Result<Vec<String>, DataError> {
        let n = df.height();
        let Some(id_column) = ID_COLUMNS.iter().find(|c| names.contains(**c)) else {
            return Ok((1..=n).map(|i| i.to_string()).collect());
        };
        let series = df.column(id_column)?.cast(&DataType::String)?;
        let text = series.str()?;
        Ok(text
            .into_iter()
            .enumerate()
            .map(|(i, v)| match v {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => (i + 1).to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    const HEADER: &str = ",SeriousDlqin2yrs,RevolvingUtilizationOfUnsecuredLines,age,NumberOfTime30-59DaysPastDueNotWorse,DebtRatio,MonthlyIncome,NumberOfOpenCreditLinesAndLoans,NumberOfTimes90DaysLate,NumberRealEstateLoansOrLines,NumberOfTime60-89DaysPastDueNotWorse,NumberOfDependents";

    fn write_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn kaggle_style(rows: usize) -> String {
        let mut text = String::from(HEADER);
        text.push('\n');
        for i in 1..=rows {
            let label = u8::from(i % 5 == 0);
            let income = if i % 4 == 0 { "NA".to_string() } else { (3000 + i * 10).to_string() };
            text.push_str(&format!(
                "{i},{label},0.{i:02},{},0,0.3,{income},5,0,1,0,{}\n",
                30 + i,
                if i % 6 == 0 { String::new() } else { "2".to_string() }
            ));
        }
        text
    }

    #[test]
    fn reads_kaggle_layout_with_aliases_and_missing_values() {
        let file = write_file(".csv", &kaggle_style(30));
        let data = load_training_data(file.path()).unwrap();
        assert_eq!(data.features.nrows(), 30);
        assert_eq!(data.features.columns(), feature_names().as_slice());
        assert_eq!(data.ids[0], "1");
        assert_eq!(data.ids[29], "30");
        assert_eq!(data.labels.iter().filter(|&&v| v == 1.0).count(), 6);

        let v = data.features.values();
        assert!(v[[3, Feature::MonthlyIncome.index()]].is_nan());
        assert_eq!(v[[0, Feature::MonthlyIncome.index()]], 3010.0);
        assert!(v[[5, Feature::Dependents.index()]].is_nan());
        assert_eq!(v[[0, Feature::Age.index()]], 31.0);
    }

    #[test]
    fn tsv_extension_switches_separator() {
        let text = kaggle_style(25).replace(',', "\t");
        let file = write_file(".tsv", &text);
        let data = load_training_data(file.path()).unwrap();
        assert_eq!(data.features.nrows(), 25);
    }

    #[test]
    fn raw_monetary_columns_are_derived() {
        let mut text = String::from(
            "id,age,NumberOfTime30_59DaysPastDueNotWorse,MonthlyIncome,NumberOfOpenCreditLinesAndLoans,NumberOfTimes90DaysLate,NumberRealEstateLoansOrLines,NumberOfTime60_89DaysPastDueNotWorse,NumberOfDependents,total_unsecured_balance,total_unsecured_credit_limit,total_monthly_debt_payment\n",
        );
        text.push_str("a,40,0,0,3,0,1,0,0,100,0,500\n");
        text.push_str("b,50,0,2000,3,0,1,0,0,250,1000,400\n");
        let file = write_file(".csv", &text);
        let data = load_prediction_data(file.path()).unwrap();
        let v = data.features.values();
        assert_eq!(v[[0, Feature::RevolvingUtilization.index()]], 0.0);
        assert_eq!(v[[0, Feature::DebtRatio.index()]], 500.0);
        assert_eq!(v[[1, Feature::RevolvingUtilization.index()]], 0.25);
        assert_eq!(v[[1, Feature::DebtRatio.index()]], 0.2);
        assert_eq!(data.ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn missing_feature_is_named() {
        let text = kaggle_style(25).replace("NumberOfDependents", "Dependents");
        let file = write_file(".csv", &text);
        match load_training_data(file.path()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "NumberOfDependents"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn labels_must_be_binary() {
        let text = kaggle_style(25).replacen("\n2,0,", "\n2,2,", 1);
        let file = write_file(".csv", &text);
        assert!(matches!(
            load_training_data(file.path()),
            Err(DataError::NonBinaryLabel { row: 2, .. })
        ));
    }

    #[test]
    fn too_few_training_rows() {
        let file = write_file(".csv", &kaggle_style(5));
        assert!(matches!(
            load_training_data(file.path()),
            Err(DataError::InsufficientRows { found: 5, .. })
        ));
    }

    #[test]
    fn text_in_numeric_column_is_rejected() {
        let text = kaggle_style(25).replacen(",5,0,1,0,", ",five,0,1,0,", 1);
        let file = write_file(".csv", &text);
        match load_training_data(file.path()) {
            Err(DataError::ColumnWrongType { column_name, .. }) => {
                assert_eq!(column_name, "NumberOfOpenCreditLinesAndLoans")
            }
            other => panic!("Expected ColumnWrongType, got {other:?}"),
        }
    }
}
