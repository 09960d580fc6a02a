//! Stratified fold assignment and train/validation holdout.
//!
//! Indices of each class are shuffled with a seeded generator and then dealt
//! round-robin across folds, so every fold receives the class ratio of the
//! full sample to within one member per class. The same seed always gives
//! the same assignment.

use super::EnsembleError;
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StratifiedKFold {
    pub n_splits: usize,
    pub shuffle: bool,
    pub seed: u64,
}

/// One fold: rows used for fitting and rows held out for prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Default for StratifiedKFold {
    fn default() -> Self {
        Self {
            n_splits: 5,
            shuffle: true,
            seed: 42,
        }
    }
}

/// Row indices of the negative and positive class, in row order.
fn class_members(y: ArrayView1<'_, f64>) -> [Vec<usize>; 2] {
    let mut members = [Vec::new(), Vec::new()];
    for (i, &label) in y.iter().enumerate() {
        members[usize::from(label == 1.0)].push(i);
    }
    members
}

impl StratifiedKFold {
    pub fn split(&self, y: ArrayView1<'_, f64>) -> Result<Vec<Fold>, EnsembleError> {
        if self.n_splits < 2 {
            return Err(EnsembleError::InvalidParameter {
                name: "n_splits",
                reason: format!("need at least 2 folds, got {}", self.n_splits),
            });
        }
        let mut members = class_members(y);
        for (class, rows) in members.iter().enumerate() {
            if rows.len() < self.n_splits {
                return Err(EnsembleError::TooFewMembers {
                    n_splits: self.n_splits,
                    class: class as u8,
                    count: rows.len(),
                });
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut assignment = vec![0usize; y.len()];
        // The negative class continues dealing where the positive class stopped
        // so fold sizes stay within one of each other.
        let mut next = 0usize;
        for rows in members.iter_mut().rev() {
            if self.shuffle {
                rows.shuffle(&mut rng);
            }
            for &row in rows.iter() {
                assignment[row] = next % self.n_splits;
                next += 1;
            }
        }

        Ok((0..self.n_splits)
            .map(|k| {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..y.len()).partition(|&row| assignment[row] == k);
                Fold { train, test }
            })
            .collect())
    }
}

/// Splits rows into (fit, holdout) keeping the class ratio. Each class
/// contributes `round(fraction * count)` rows to the holdout, at least one.
pub fn stratified_holdout(
    y: ArrayView1<'_, f64>,
    fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), EnsembleError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(EnsembleError::InvalidParameter {
            name: "holdout_fraction",
            reason: format!("must lie strictly between 0 and 1, got {fraction}"),
        });
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fit = Vec::new();
    let mut holdout = Vec::new();
    for (class, mut rows) in class_members(y).into_iter().enumerate() {
        if rows.len() < 2 {
            return Err(EnsembleError::TooFewMembers {
                n_splits: 2,
                class: class as u8,
                count: rows.len(),
            });
        }
        rows.shuffle(&mut rng);
        let take = ((rows.len() as f64 * fraction).round() as usize).clamp(1, rows.len() - 1);
        holdout.extend_from_slice(&rows[..take]);
        fit.extend_from_slice(&rows[take..]);
    }
    fit.sort_unstable();
    holdout.sort_unstable();
    Ok((fit, holdout))
}
