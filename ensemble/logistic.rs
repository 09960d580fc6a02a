//! Class-weighted, L2-penalized logistic regression for the meta layer.
//!
//! The objective follows the liblinear formulation, in which the intercept is
//! an ordinary coefficient on a constant column and is penalized with the
//! rest:
//!
//!   f(w) = 1/2 ||w||^2 + C * sum_i s_i * log(1 + exp(-t_i * w.x_i))
//!
//! where `s_i` is the weight of the row's class and `t_i` is +/-1. The
//! objective is divided by the total row weight before optimisation so that
//! the BFGS tolerance means the same thing for any sample size; the minimiser
//! is unchanged.

use super::boosting::softplus;
use super::{EnsembleError, sigmoid};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeight {
    pub negative: f64,
    pub positive: f64,
}

impl Default for ClassWeight {
    fn default() -> Self {
        Self {
            negative: 1.0,
            positive: 13.96,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    /// Inverse regularization strength.
    pub c: f64,
    pub class_weight: ClassWeight,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            class_weight: ClassWeight::default(),
            max_iter: 2000,
            tol: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub params: LogisticParams,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Optimizer iterations used by the fit.
    pub iterations: usize,
}

impl LogisticRegression {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: &LogisticParams,
    ) -> Result<Self, EnsembleError> {
        super::check_binary_problem(x, y)?;
        if !(params.c > 0.0) {
            return Err(EnsembleError::InvalidParameter {
                name: "c",
                reason: format!("must be positive, got {}", params.c),
            });
        }
        let ClassWeight { negative, positive } = params.class_weight;
        if !(negative > 0.0 && positive > 0.0) {
            return Err(EnsembleError::InvalidParameter {
                name: "class_weight",
                reason: format!("weights must be positive, got {{0: {negative}, 1: {positive}}}"),
            });
        }

        let k = x.ncols();
        let row_weight: Vec<f64> = y
            .iter()
            .map(|&t| if t == 1.0 { positive } else { negative })
            .collect();
        let total_weight: f64 = row_weight.iter().sum();
        let c = params.c;

        // Parameter layout: k coefficients followed by the intercept.
        let objective = |w: &Array1<f64>| -> (f64, Array1<f64>) {
            let beta = w.slice(ndarray::s![..k]);
            let b = w[k];
            let mut value = 0.5 * w.dot(w);
            let mut grad = w.clone();
            for (i, row) in x.outer_iter().enumerate() {
                let z = row.dot(&beta) + b;
                let s = c * row_weight[i];
                value += s * (softplus(z) - y[i] * z);
                let r = s * (sigmoid(z) - y[i]);
                for j in 0..k {
                    grad[j] += r * row[j];
                }
                grad[k] += r;
            }
            (value / total_weight, grad / total_weight)
        };

        let BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        } = Bfgs::new(Array1::zeros(k + 1), objective)
            .with_tolerance(params.tol)
            .with_max_iterations(params.max_iter)
            .run()
            .map_err(|e| EnsembleError::MetaOptimization(format!("{e:?}")))?;

        log::info!(
            "Meta-estimator converged in {iterations} iterations (objective {final_value:.6})"
        );

        if final_point.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::MetaOptimization(
                "optimizer returned non-finite coefficients".into(),
            ));
        }

        Ok(Self {
            params: params.clone(),
            coefficients: final_point.slice(ndarray::s![..k]).to_vec(),
            intercept: final_point[k],
            iterations,
        })
    }

    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        if x.ncols() != self.coefficients.len() {
            return Err(EnsembleError::FeatureCountMismatch {
                expected: self.coefficients.len(),
                found: x.ncols(),
            });
        }
        let beta = ArrayView1::from(&self.coefficients[..]);
        Ok(x.dot(&beta) + self.intercept)
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, EnsembleError> {
        Ok(self.decision_function(x)?.mapv(sigmoid))
    }
}
