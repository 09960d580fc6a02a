//! Training configuration, read from an optional TOML file.
//!
//! Every field defaults to the standard training policy, so an empty file
//! (or no file) reproduces it and a partial file overrides only what it
//! names. For example:
//!
//! ```toml
//! seed = 7
//!
//! [stacking.cv]
//! strategy = "stratified_k_fold"
//! n_splits = 10
//! seed = 7
//!
//! [random_forest]
//! n_estimators = 300
//! ```

use crate::ensemble::boosting::BoostParams;
use crate::ensemble::forest::ForestParams;
use crate::ensemble::stacking::{CvStrategy, StackingConfig};
use crate::impute::ImputerConfig;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Seed for the validation holdout.
    pub seed: u64,
    /// Share of training rows held out for validation metrics.
    pub holdout_fraction: f64,
    /// Worker threads for forest building; `0` uses every core.
    pub n_jobs: usize,
    /// Decision threshold used for the headline metrics.
    pub threshold: f64,
    pub stacking: StackingConfig,
    pub imputer: ImputerConfig,
    pub random_forest: ForestParams,
    #[serde(deserialize_with = "depth_wise_overrides")]
    pub boost_depthwise: BoostParams,
    #[serde(deserialize_with = "leaf_wise_overrides")]
    pub boost_leafwise: BoostParams,
}

/// Merges the keys present in a boosting section over that section's own
/// preset rather than over the generic boosting defaults.
fn merge_onto<'de, D: Deserializer<'de>>(
    deserializer: D,
    preset: BoostParams,
) -> Result<BoostParams, D::Error> {
    let overrides = toml::Value::deserialize(deserializer)?;
    let mut merged = toml::Value::try_from(preset).map_err(D::Error::custom)?;
    if let (Some(base), Some(named)) = (merged.as_table_mut(), overrides.as_table()) {
        for (key, value) in named {
            base.insert(key.clone(), value.clone());
        }
    }
    merged.try_into().map_err(D::Error::custom)
}

fn depth_wise_overrides<'de, D: Deserializer<'de>>(d: D) -> Result<BoostParams, D::Error> {
    merge_onto(d, BoostParams::depth_wise())
}

fn leaf_wise_overrides<'de, D: Deserializer<'de>>(d: D) -> Result<BoostParams, D::Error> {
    merge_onto(d, BoostParams::leaf_wise())
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            holdout_fraction: 0.1,
            n_jobs: 1,
            threshold: 0.5,
            stacking: StackingConfig::default(),
            imputer: ImputerConfig::default(),
            random_forest: ForestParams::default(),
            boost_depthwise: BoostParams::depth_wise(),
            boost_leafwise: BoostParams::leaf_wise(),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Applies command-line overrides.
    pub fn with_overrides(
        mut self,
        seed: Option<u64>,
        folds: Option<usize>,
        n_jobs: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if let Some(seed) = seed {
            self.seed = seed;
            if let CvStrategy::StratifiedKFold { seed: cv_seed, .. } = &mut self.stacking.cv {
                *cv_seed = seed;
            }
        }
        if let Some(folds) = folds {
            match &mut self.stacking.cv {
                CvStrategy::StratifiedKFold { n_splits, .. } => *n_splits = folds,
                CvStrategy::Prefit => {
                    return Err(ConfigError::Invalid(
                        "--folds cannot be combined with the prefit strategy".into(),
                    ));
                }
            }
        }
        if let Some(n_jobs) = n_jobs {
            self.n_jobs = n_jobs;
        }
        // Forests follow the run-wide worker count.
        self.random_forest.n_jobs = self.n_jobs;
        self.imputer.n_jobs = self.n_jobs;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "holdout_fraction must lie strictly between 0 and 1, got {}",
                self.holdout_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold must lie in [0, 1], got {}",
                self.threshold
            )));
        }
        if let CvStrategy::StratifiedKFold { n_splits, .. } = self.stacking.cv {
            if n_splits < 2 {
                return Err(ConfigError::Invalid(format!(
                    "stacking needs at least 2 folds, got {n_splits}"
                )));
            }
        }
        if self.imputer.n_estimators == 0 || self.imputer.max_rounds == 0 {
            return Err(ConfigError::Invalid(
                "imputer needs at least one round and one tree".into(),
            ));
        }
        Ok(())
    }
}
