//! Gradient-boosted trees on the logistic loss.
//!
//! Two growth policies share one learner: depth-wise trees (every node
//! expanded level by level up to `max_depth`) and leaf-wise trees (the leaf
//! with the largest gain is expanded next, up to `max_leaves`). Split gains
//! and leaf weights use Newton steps with L2 regularization on leaf values:
//!
//!   gain   = 1/2 [G_L^2/(H_L+lambda) + G_R^2/(H_R+lambda) - G^2/(H+lambda)] - gamma
//!   weight = -G / (H + lambda)
//!
//! Row and column subsampling are drawn from a seeded generator per round.

use super::tree::{self, GrowParams, RegressionTree};
use super::{EnsembleError, sigmoid};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum GrowthPolicy {
    DepthWise,
    LeafWise { max_leaves: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    /// Depth limit; `0` leaves depth unbounded (leaf-wise growth only).
    pub max_depth: usize,
    pub growth: GrowthPolicy,
    pub min_child_weight: f64,
    pub min_samples_leaf: usize,
    pub reg_lambda: f64,
    pub gamma: f64,
    /// Fraction of rows drawn without replacement for each tree.
    pub subsample: f64,
    /// Fraction of columns available to each tree.
    pub colsample: f64,
    pub seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self::depth_wise()
    }
}

impl BoostParams {
    /// Level-wise trees of bounded depth.
    pub fn depth_wise() -> Self {
        Self {
            n_estimators: 200,
            learning_rate: 0.1,
            max_depth: 4,
            growth: GrowthPolicy::DepthWise,
            min_child_weight: 1.0,
            min_samples_leaf: 1,
            reg_lambda: 1.0,
            gamma: 0.0,
            subsample: 0.8,
            colsample: 0.8,
            seed: 42,
        }
    }

    /// Best-first trees bounded by leaf count.
    pub fn leaf_wise() -> Self {
        Self {
            n_estimators: 200,
            learning_rate: 0.05,
            max_depth: 0,
            growth: GrowthPolicy::LeafWise { max_leaves: 31 },
            min_child_weight: 1e-3,
            min_samples_leaf: 20,
            reg_lambda: 0.0,
            gamma: 0.0,
            subsample: 1.0,
            colsample: 1.0,
            seed: 42,
        }
    }

    fn check(&self) -> Result<(), EnsembleError> {
        let fraction_ok = |f: f64| f > 0.0 && f <= 1.0;
        if self.n_estimators == 0 {
            return Err(EnsembleError::InvalidParameter {
                name: "n_estimators",
                reason: "at least one boosting round is required".into(),
            });
        }
        if !(self.learning_rate > 0.0) {
            return Err(EnsembleError::InvalidParameter {
                name: "learning_rate",
                reason: format!("must be positive, got {}", self.learning_rate),
            });
        }
        if !fraction_ok(self.subsample) {
            return Err(EnsembleError::InvalidParameter {
                name: "subsample",
                reason: format!("must lie in (0, 1], got {}", self.subsample),
            });
        }
        if !fraction_ok(self.colsample) {
            return Err(EnsembleError::InvalidParameter {
                name: "colsample",
                reason: format!("must lie in (0, 1], got {}", self.colsample),
            });
        }
        if self.reg_lambda < 0.0 || self.gamma < 0.0 || self.min_child_weight < 0.0 {
            return Err(EnsembleError::InvalidParameter {
                name: "reg_lambda/gamma/min_child_weight",
                reason: "regularization terms cannot be negative".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedClassifier {
    pub params: BoostParams,
    pub n_features: usize,
    /// Log-odds of the training prevalence; the starting margin of every row.
    pub base_margin: f64,
    pub trees: Vec<RegressionTree>,
}

impl GradientBoostedClassifier {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: &BoostParams,
    ) -> Result<Self, EnsembleError> {
        super::check_binary_problem(x, y)?;
        params.check()?;

        let n = x.nrows();
        let n_cols = x.ncols();
        let prevalence = (y.sum() / n as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (prevalence / (1.0 - prevalence)).ln();

        let grow_params = GrowParams {
            max_depth: super::forest::depth_limit(params.max_depth),
            max_leaves: match params.growth {
                GrowthPolicy::DepthWise => None,
                GrowthPolicy::LeafWise { max_leaves } => Some(max_leaves.max(2)),
            },
            min_samples_leaf: params.min_samples_leaf.max(1),
            min_child_weight: params.min_child_weight,
            reg_lambda: params.reg_lambda,
            gamma: params.gamma,
            max_features: usize::MAX,
        };
        let rows_per_tree = ((params.subsample * n as f64).round() as usize).clamp(1, n);
        let cols_per_tree = ((params.colsample * n_cols as f64).round() as usize).clamp(1, n_cols);

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut margin = vec![base_margin; n];
        let mut gradient = vec![0.0; n];
        let mut hessian = vec![0.0; n];
        let mut trees = Vec::with_capacity(params.n_estimators);

        for round in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margin[i]);
                gradient[i] = p - y[i];
                hessian[i] = (p * (1.0 - p)).max(1e-16);
            }

            let mut rows = if rows_per_tree < n {
                rand::seq::index::sample(&mut rng, n, rows_per_tree).into_vec()
            } else {
                (0..n).collect()
            };
            rows.sort_unstable();
            let mut features = if cols_per_tree < n_cols {
                rand::seq::index::sample(&mut rng, n_cols, cols_per_tree).into_vec()
            } else {
                (0..n_cols).collect()
            };
            features.sort_unstable();

            let mut tree = tree::grow(
                x,
                &gradient,
                &hessian,
                rows,
                &features,
                &grow_params,
                &mut rng,
            );
            tree.scale_leaves(params.learning_rate);
            for (i, m) in margin.iter_mut().enumerate() {
                *m += tree.predict_row(x.row(i));
            }
            trees.push(tree);

            if (round + 1) % 50 == 0 {
                let loss = log_loss(&margin, y);
                log::debug!("Boosting round {}: training log-loss {loss:.6}", round + 1);
            }
        }

        Ok(Self {
            params: params.clone(),
            n_features: n_cols,
            base_margin,
            trees,
        })
    }

    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        if x.ncols() != self.n_features {
            return Err(EnsembleError::FeatureCountMismatch {
                expected: self.n_features,
                found: x.ncols(),
            });
        }
        Ok(Array1::from_shape_fn(x.nrows(), |i| {
            let row = x.row(i);
            self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
        }))
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        Ok(self.decision_function(x)?.mapv(sigmoid))
    }

    pub fn validate(&self) -> Result<(), EnsembleError> {
        if self.trees.is_empty() || !self.base_margin.is_finite() {
            return Err(EnsembleError::CorruptTree(
                "boosted model has no trees or a non-finite base margin".into(),
            ));
        }
        for tree in &self.trees {
            if tree.n_features != self.n_features {
                return Err(EnsembleError::CorruptTree(format!(
                    "tree expects {} features, model expects {}",
                    tree.n_features, self.n_features
                )));
            }
            tree.validate()?;
        }
        Ok(())
    }
}

fn log_loss(margin: &[f64], y: ArrayView1<'_, f64>) -> f64 {
    let total: f64 = margin
        .iter()
        .zip(y.iter())
        .map(|(&m, &t)| softplus(m) - t * m)
        .sum();
    total / margin.len() as f64
}

#[inline]
pub(crate) fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn noisy_problem(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 4), |(i, j)| match j {
            0 => (i % 37) as f64 / 37.0,
            1 => ((i * 13) % 29) as f64 / 29.0,
            2 => ((i * 5) % 7) as f64,
            _ => ((i * 17) % 101) as f64 / 101.0,
        });
        // Positive when the first two features are jointly large.
        let y = Array1::from_shape_fn(n, |i| {
            if x[[i, 0]] + x[[i, 1]] > 1.1 { 1.0 } else { 0.0 }
        });
        (x, y)
    }

    fn auc_of(p: &Array1<f64>, y: &Array1<f64>) -> f64 {
        let mut pairs = 0.0;
        let mut wins = 0.0;
        for i in 0..y.len() {
            for j in 0..y.len() {
                if y[i] == 1.0 && y[j] == 0.0 {
                    pairs += 1.0;
                    if p[i] > p[j] {
                        wins += 1.0;
                    } else if p[i] == p[j] {
                        wins += 0.5;
                    }
                }
            }
        }
        wins / pairs
    }

    #[test]
    fn both_policies_learn_an_interaction() {
        let (x, y) = noisy_problem(300);
        for params in [
            BoostParams {
                n_estimators: 60,
                ..BoostParams::depth_wise()
            },
            BoostParams {
                n_estimators: 60,
                min_samples_leaf: 5,
                learning_rate: 0.2,
                ..BoostParams::leaf_wise()
            },
        ] {
            let model = GradientBoostedClassifier::fit(x.view(), y.view(), &params).unwrap();
            model.validate().unwrap();
            let p = model.predict_proba(x.view()).unwrap();
            assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
            let auc = auc_of(&p, &y);
            assert!(auc > 0.95, "{:?} reached AUC {auc}", params.growth);
        }
    }

    #[test]
    fn leaf_wise_trees_respect_leaf_limit() {
        let (x, y) = noisy_problem(200);
        let params = BoostParams {
            n_estimators: 5,
            min_samples_leaf: 1,
            growth: GrowthPolicy::LeafWise { max_leaves: 6 },
            ..BoostParams::leaf_wise()
        };
        let model = GradientBoostedClassifier::fit(x.view(), y.view(), &params).unwrap();
        assert!(model.trees.iter().all(|t| t.n_leaves() <= 6));
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let (x, y) = noisy_problem(150);
        let params = BoostParams {
            n_estimators: 10,
            ..BoostParams::depth_wise()
        };
        let a = GradientBoostedClassifier::fit(x.view(), y.view(), &params).unwrap();
        let b = GradientBoostedClassifier::fit(x.view(), y.view(), &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_subsample_is_rejected() {
        let (x, y) = noisy_problem(50);
        let params = BoostParams {
            subsample: 0.0,
            ..BoostParams::depth_wise()
        };
        assert!(matches!(
            GradientBoostedClassifier::fit(x.view(), y.view(), &params),
            Err(EnsembleError::InvalidParameter { name: "subsample", .. })
        ));
    }

    #[test]
    fn softplus_is_stable() {
        assert!((softplus(800.0) - 800.0).abs() < 1e-12);
        assert!(softplus(-800.0) >= 0.0);
        assert!((softplus(0.0) - 2f64.ln()).abs() < 1e-15);
    }
}
