//! Random forests for classification (class-1 probability) and regression.
//!
//! Each tree is grown on a bootstrap sample with a random subset of candidate
//! features at every split. The per-tree seeds are all drawn from the master
//! seed before any tree is built, so a forest fitted on a pool of eight
//! workers is identical to one fitted on a single thread.

use super::EnsembleError;
use super::tree::{self, GrowParams, RegressionTree};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How many features are considered at each split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    All,
    Sqrt,
    Fraction(f64),
}

impl MaxFeatures {
    pub fn resolve(self, n_features: usize) -> usize {
        let k = match self {
            Self::All => n_features,
            Self::Sqrt => (n_features as f64).sqrt().round() as usize,
            Self::Fraction(f) => (f * n_features as f64).round() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// Depth limit; `0` grows until leaves are pure or too small.
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub seed: u64,
    /// Worker threads for tree building; `0` uses every core.
    pub n_jobs: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 12,
            min_samples_leaf: 5,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            seed: 42,
            n_jobs: 1,
        }
    }
}

/// Converts the serialized depth convention to the tree builder's.
pub(crate) fn depth_limit(max_depth: usize) -> Option<usize> {
    (max_depth > 0).then_some(max_depth)
}

pub(crate) fn resolve_jobs(n_jobs: usize) -> usize {
    if n_jobs == 0 { num_cpus::get() } else { n_jobs }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub params: ForestParams,
    pub n_features: usize,
    pub trees: Vec<RegressionTree>,
}

impl RandomForest {
    fn fit(
        x: ArrayView2<'_, f64>,
        target: ArrayView1<'_, f64>,
        params: &ForestParams,
    ) -> Result<Self, EnsembleError> {
        if params.n_estimators == 0 {
            return Err(EnsembleError::InvalidParameter {
                name: "n_estimators",
                reason: "a forest needs at least one tree".into(),
            });
        }
        let n = x.nrows();
        let gradient: Vec<f64> = target.iter().map(|v| -v).collect();
        let hessian = vec![1.0; n];
        let features: Vec<usize> = (0..x.ncols()).collect();
        let grow_params = GrowParams {
            max_depth: depth_limit(params.max_depth),
            max_leaves: None,
            min_samples_leaf: params.min_samples_leaf.max(1),
            min_child_weight: 0.0,
            reg_lambda: 0.0,
            gamma: 0.0,
            max_features: params.max_features.resolve(x.ncols()),
        };

        let mut master = StdRng::seed_from_u64(params.seed);
        let seeds: Vec<u64> = (0..params.n_estimators)
            .map(|_| master.next_u64())
            .collect();

        let build = |seed: &u64| {
            let mut rng = StdRng::seed_from_u64(*seed);
            let rows: Vec<usize> = if params.bootstrap {
                (0..n).map(|_| rng.gen_range(0..n)).collect()
            } else {
                (0..n).collect()
            };
            tree::grow(
                x,
                &gradient,
                &hessian,
                rows,
                &features,
                &grow_params,
                &mut rng,
            )
        };

        let threads = resolve_jobs(params.n_jobs);
        let trees: Vec<RegressionTree> = if threads == 1 {
            seeds.iter().map(build).collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| EnsembleError::ThreadPool(e.to_string()))?;
            pool.install(|| seeds.par_iter().map(build).collect())
        };

        log::debug!(
            "Grew {} trees on {} rows ({} nodes in total)",
            trees.len(),
            n,
            trees.iter().map(RegressionTree::n_nodes).sum::<usize>()
        );

        Ok(Self {
            params: params.clone(),
            n_features: x.ncols(),
            trees,
        })
    }

    fn predict_mean(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        if x.ncols() != self.n_features {
            return Err(EnsembleError::FeatureCountMismatch {
                expected: self.n_features,
                found: x.ncols(),
            });
        }
        let scale = 1.0 / self.trees.len() as f64;
        Ok(Array1::from_shape_fn(x.nrows(), |i| {
            let row = x.row(i);
            self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() * scale
        }))
    }

    pub fn validate(&self) -> Result<(), EnsembleError> {
        if self.trees.is_empty() {
            return Err(EnsembleError::CorruptTree("forest has no trees".into()));
        }
        for tree in &self.trees {
            if tree.n_features != self.n_features {
                return Err(EnsembleError::CorruptTree(format!(
                    "tree expects {} features, forest expects {}",
                    tree.n_features, self.n_features
                )));
            }
            tree.validate()?;
        }
        Ok(())
    }
}

/// Probability of class 1 is the average leaf fraction of positives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RandomForestClassifier(pub RandomForest);

impl RandomForestClassifier {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: &ForestParams,
    ) -> Result<Self, EnsembleError> {
        super::check_binary_problem(x, y)?;
        RandomForest::fit(x, y, params).map(Self)
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        Ok(self.0.predict_mean(x)?.mapv(|p| p.clamp(0.0, 1.0)))
    }

    pub fn params(&self) -> &ForestParams {
        &self.0.params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RandomForestRegressor(pub RandomForest);

impl RandomForestRegressor {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: &ForestParams,
    ) -> Result<Self, EnsembleError> {
        super::check_design(x)?;
        if x.nrows() != y.len() {
            return Err(EnsembleError::LabelLengthMismatch {
                rows: x.nrows(),
                labels: y.len(),
            });
        }
        if let Some(row) = y.iter().position(|v| !v.is_finite()) {
            return Err(EnsembleError::NonFiniteInput { row, column: x.ncols() });
        }
        RandomForest::fit(x, y, params).map(Self)
    }

    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        self.0.predict_mean(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn separable(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => i as f64,
            1 => ((i * 7) % 11) as f64,
            _ => ((i * 3) % 5) as f64,
        });
        let y = Array1::from_shape_fn(n, |i| if i >= n / 2 { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn classifier_separates_a_threshold_rule() {
        let (x, y) = separable(80);
        let params = ForestParams {
            n_estimators: 25,
            max_features: MaxFeatures::All,
            min_samples_leaf: 1,
            ..Default::default()
        };
        let forest = RandomForestClassifier::fit(x.view(), y.view(), &params).unwrap();
        forest.0.validate().unwrap();
        let query = array![[2.0, 3.0, 1.0], [77.0, 3.0, 1.0]];
        let p = forest.predict_proba(query.view()).unwrap();
        assert!(p[0] < 0.2, "low row scored {}", p[0]);
        assert!(p[1] > 0.8, "high row scored {}", p[1]);
    }

    #[test]
    fn worker_count_does_not_change_the_forest() {
        let (x, y) = separable(60);
        let single = ForestParams {
            n_estimators: 12,
            n_jobs: 1,
            ..Default::default()
        };
        let pooled = ForestParams {
            n_jobs: 3,
            ..single.clone()
        };
        let a = RandomForestClassifier::fit(x.view(), y.view(), &single).unwrap();
        let b = RandomForestClassifier::fit(x.view(), y.view(), &pooled).unwrap();
        assert_eq!(a.0.trees, b.0.trees);
    }

    #[test]
    fn regressor_without_bootstrap_fits_training_means() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![1.0, 1.0, 4.0, 4.0];
        let params = ForestParams {
            n_estimators: 3,
            bootstrap: false,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            ..Default::default()
        };
        let forest = RandomForestRegressor::fit(x.view(), y.view(), &params).unwrap();
        let pred = forest.predict(x.view()).unwrap();
        for (p, t) in pred.iter().zip(y.iter()) {
            assert_abs_diff_eq!(*p, *t, epsilon = 1e-12);
        }
    }

    #[test]
    fn wrong_width_is_rejected_at_predict() {
        let (x, y) = separable(40);
        let forest = RandomForestClassifier::fit(
            x.view(),
            y.view(),
            &ForestParams {
                n_estimators: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let narrow = Array2::zeros((1, 2));
        assert!(matches!(
            forest.predict_proba(narrow.view()),
            Err(EnsembleError::FeatureCountMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn max_features_resolution() {
        assert_eq!(MaxFeatures::Sqrt.resolve(10), 3);
        assert_eq!(MaxFeatures::All.resolve(10), 10);
        assert_eq!(MaxFeatures::Fraction(0.01).resolve(10), 1);
    }
}
