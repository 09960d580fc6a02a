//! # Model Bundle
//!
//! Every fitted component is persisted as a human-readable TOML file inside
//! one bundle directory. The manifest records the feature schema shared by
//! all of them; loading fails unless the bounds, imputer and stacking
//! assembly agree with it, so normalization bounds can only ever be used
//! with the model they were trained alongside.

use crate::ensemble::EnsembleError;
use crate::ensemble::stacking::{NamedEstimator, StackingModel};
use crate::impute::{ImputeError, ImputerState};
use crate::normalize::{NormalizationBounds, NormalizeError};
use crate::schema::{FeatureMatrix, SchemaError, ensure_columns, feature_names};
use ndarray::Array1;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BASE_RANDOM_FOREST_FILE: &str = "base_random_forest.toml";
pub const BASE_BOOST_DEPTHWISE_FILE: &str = "base_boost_depthwise.toml";
pub const BASE_BOOST_LEAFWISE_FILE: &str = "base_boost_leafwise.toml";
pub const BOUNDS_FILE: &str = "normalization_bounds.toml";
pub const IMPUTER_FILE: &str = "imputer.toml";
pub const STACKING_FILE: &str = "stacking_model.toml";
pub const MANIFEST_FILE: &str = "manifest.toml";
pub const BASE_PROVENANCE_FILE: &str = "base_provenance.toml";

/// The three base estimator files, in stacking order.
pub const BASE_ESTIMATOR_FILES: [&str; 3] = [
    BASE_RANDOM_FOREST_FILE,
    BASE_BOOST_DEPTHWISE_FILE,
    BASE_BOOST_LEAFWISE_FILE,
];

/// Layout version of the bundle directory.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML artifact '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize artifact to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Artifact '{path}' is structurally invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error(
        "Bundle format version {found} is not supported (this build reads version {expected})."
    )]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("Bundle components disagree on the feature schema: {0}")]
    Schema(#[from] SchemaError),
}

/// Writes any serializable artifact as pretty TOML.
pub fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let toml_string = toml::to_string_pretty(value)?;
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_err)?);
    file.write_all(toml_string.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(())
}

pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let toml_string = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&toml_string).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(path: &Path, reason: impl ToString) -> ArtifactError {
    ArtifactError::Invalid {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Records which training rows a set of base estimators was fitted on, so a
/// later stacking run can check that its validation holdout is disjoint from
/// them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BaseProvenance {
    /// Seed of the stratified validation holdout.
    pub holdout_seed: u64,
    pub holdout_fraction: f64,
    pub training_rows: usize,
    pub fit_rows: usize,
}

/// Writes the base estimators in stacking order, followed by their provenance.
pub fn save_base_estimators(
    dir: &Path,
    estimators: &[NamedEstimator],
    provenance: &BaseProvenance,
) -> Result<(), ArtifactError> {
    if estimators.len() != BASE_ESTIMATOR_FILES.len() {
        return Err(invalid(
            dir,
            format!(
                "expected {} base estimators, got {}",
                BASE_ESTIMATOR_FILES.len(),
                estimators.len()
            ),
        ));
    }
    for (named, file) in estimators.iter().zip(BASE_ESTIMATOR_FILES) {
        save_toml(named, &dir.join(file))?;
    }
    save_toml(provenance, &dir.join(BASE_PROVENANCE_FILE))
}

pub fn load_base_provenance(dir: &Path) -> Result<BaseProvenance, ArtifactError> {
    load_toml(&dir.join(BASE_PROVENANCE_FILE))
}

/// Loads and structurally validates the three base estimators of `dir`.
pub fn load_base_estimators(dir: &Path) -> Result<Vec<NamedEstimator>, ArtifactError> {
    BASE_ESTIMATOR_FILES
        .iter()
        .map(|file| {
            let path = dir.join(file);
            let named: NamedEstimator = load_toml(&path)?;
            named
                .estimator
                .validate()
                .map_err(|e| invalid(&path, e))?;
            Ok(named)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub crate_version: String,
    /// Identifies one training run; reported by the service health check.
    pub model_version: String,
    pub feature_columns: Vec<String>,
    pub training_rows: usize,
}

impl Manifest {
    pub fn new(model_version: String, training_rows: usize) -> Self {
        Self {
            format_version: BUNDLE_FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            model_version,
            feature_columns: feature_names(),
            training_rows,
        }
    }
}

/// Failures while running a matrix through the loaded pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}

/// Everything needed to turn a feature matrix into probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBundle {
    pub manifest: Manifest,
    pub bounds: NormalizationBounds,
    pub imputer: ImputerState,
    pub model: StackingModel,
}

impl ModelBundle {
    pub fn save(&self, dir: &Path) -> Result<(), ArtifactError> {
        fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        save_toml(&self.bounds, &dir.join(BOUNDS_FILE))?;
        save_toml(&self.imputer, &dir.join(IMPUTER_FILE))?;
        save_toml(&self.model, &dir.join(STACKING_FILE))?;
        // Written last: a directory without a manifest is not a bundle.
        save_toml(&self.manifest, &dir.join(MANIFEST_FILE))?;
        log::info!("Saved model bundle '{}' to {}", self.manifest.model_version, dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest: Manifest = load_toml(&manifest_path)?;
        if manifest.format_version != BUNDLE_FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: manifest.format_version,
                expected: BUNDLE_FORMAT_VERSION,
            });
        }
        ensure_columns(&feature_names(), &manifest.feature_columns)?;

        let bounds_path = dir.join(BOUNDS_FILE);
        let bounds: NormalizationBounds = load_toml(&bounds_path)?;
        ensure_columns(&manifest.feature_columns, &bounds.columns)?;

        let imputer_path = dir.join(IMPUTER_FILE);
        let imputer: ImputerState = load_toml(&imputer_path)?;
        ensure_columns(&manifest.feature_columns, &imputer.columns)?;
        imputer.validate().map_err(|e| invalid(&imputer_path, e))?;

        let model_path = dir.join(STACKING_FILE);
        let model: StackingModel = load_toml(&model_path)?;
        ensure_columns(&manifest.feature_columns, &model.feature_columns)?;
        model.validate().map_err(|e| invalid(&model_path, e))?;

        log::info!(
            "Loaded model bundle '{}' (format {}, built by {})",
            manifest.model_version,
            manifest.format_version,
            manifest.crate_version
        );
        Ok(Self {
            manifest,
            bounds,
            imputer,
            model,
        })
    }

    /// Normalizes, imputes and scores raw (derived) feature rows.
    pub fn predict(&self, raw: &FeatureMatrix) -> Result<Array1<f64>, PipelineError> {
        let normalized = self.bounds.apply(raw)?;
        let imputed = self.imputer.transform(&normalized)?;
        Ok(self.model.predict_proba(&imputed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_manifest_is_an_io_error() {
        let dir = tempdir().unwrap();
        match ModelBundle::load(dir.path()) {
            Err(ArtifactError::Io { path, .. }) => assert!(path.ends_with(MANIFEST_FILE)),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_toml_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(&path, "format_version = [unterminated").unwrap();
        match load_toml::<Manifest>(&path) {
            Err(ArtifactError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn future_format_version_is_refused() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new("test".into(), 10);
        manifest.format_version = BUNDLE_FORMAT_VERSION + 1;
        save_toml(&manifest, &dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(matches!(
            ModelBundle::load(dir.path()),
            Err(ArtifactError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn base_estimator_count_is_checked_before_writing() {
        let dir = tempdir().unwrap();
        let provenance = BaseProvenance {
            holdout_seed: 42,
            holdout_fraction: 0.1,
            training_rows: 100,
            fit_rows: 90,
        };
        assert!(matches!(
            save_base_estimators(dir.path(), &[], &provenance),
            Err(ArtifactError::Invalid { .. })
        ));
        assert!(!dir.path().join(BASE_PROVENANCE_FILE).exists());

        save_toml(&provenance, &dir.path().join(BASE_PROVENANCE_FILE)).unwrap();
        assert_eq!(load_base_provenance(dir.path()).unwrap(), provenance);
    }

    #[test]
    fn bounds_round_trip_exactly() {
        let dir = tempdir().unwrap();
        let bounds = NormalizationBounds {
            columns: feature_names(),
            utilization_cap: 1.092_836_417_000_1,
            median_age: 52.0,
            past_due_30_59_median: 0.0,
            past_due_60_89_median: 0.0,
            past_due_90_plus_median: 0.0,
            income_cap: 25_000.333_333_333_332,
            debt_ratio_cap: 4_979.040_000_000_001,
            real_estate_cap: 17.0,
        };
        let path = dir.path().join(BOUNDS_FILE);
        save_toml(&bounds, &path).unwrap();
        let loaded: NormalizationBounds = load_toml(&path).unwrap();
        assert_eq!(loaded, bounds);
    }
}
