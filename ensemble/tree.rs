//! Regression trees grown from first- and second-order loss statistics.
//!
//! A single growth routine serves both tree learners. The random forest grows
//! squared-error trees by passing `gradient = -y`, `hessian = 1` and no
//! regularization, in which case the split gain reduces to the variance
//! reduction and every leaf value to the target mean. Gradient boosting
//! passes the logistic-loss derivatives and its own regularization.
//!
//! Trees are stored as parallel arrays (feature, threshold, children, value),
//! with `LEAF` in the feature slot of terminal nodes. Rows whose value is
//! `<= threshold` go left. Children are always stored after their parent.

use super::EnsembleError;
use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Feature marker for terminal nodes.
pub const LEAF: i32 = -2;

/// Gains at or below this are treated as no improvement.
const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub n_features: usize,
    pub feature: Vec<i32>,
    pub threshold: Vec<f64>,
    pub left: Vec<i32>,
    pub right: Vec<i32>,
    pub value: Vec<f64>,
}

/// Controls for a single tree.
#[derive(Debug, Clone)]
pub struct GrowParams {
    pub max_depth: Option<usize>,
    /// Best-first growth up to this many leaves; depth-first when `None`.
    pub max_leaves: Option<usize>,
    pub min_samples_leaf: usize,
    pub min_child_weight: f64,
    pub reg_lambda: f64,
    pub gamma: f64,
    /// Number of candidate features drawn at every split.
    pub max_features: usize,
}

impl RegressionTree {
    fn with_capacity(n_features: usize, capacity: usize) -> Self {
        Self {
            n_features,
            feature: Vec::with_capacity(capacity),
            threshold: Vec::with_capacity(capacity),
            left: Vec::with_capacity(capacity),
            right: Vec::with_capacity(capacity),
            value: Vec::with_capacity(capacity),
        }
    }

    fn push_leaf(&mut self, value: f64) -> usize {
        self.feature.push(LEAF);
        self.threshold.push(0.0);
        self.left.push(-1);
        self.right.push(-1);
        self.value.push(value);
        self.value.len() - 1
    }

    fn set_split(&mut self, node: usize, feature: usize, threshold: f64, left: usize, right: usize) {
        self.feature[node] = feature as i32;
        self.threshold[node] = threshold;
        self.left[node] = left as i32;
        self.right[node] = right as i32;
    }

    pub fn n_nodes(&self) -> usize {
        self.feature.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.feature.iter().filter(|&&f| f == LEAF).count()
    }

    /// Prediction for one row. The tree must have passed `validate`.
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut node = 0usize;
        while self.feature[node] != LEAF {
            let f = self.feature[node] as usize;
            node = if row[f] <= self.threshold[node] {
                self.left[node] as usize
            } else {
                self.right[node] as usize
            };
        }
        self.value[node]
    }

    /// Multiplies every leaf value, used for the boosting learning rate.
    pub(crate) fn scale_leaves(&mut self, factor: f64) {
        for (v, &f) in self.value.iter_mut().zip(&self.feature) {
            if f == LEAF {
                *v *= factor;
            }
        }
    }

    /// Structural checks for trees read back from disk: equal array lengths,
    /// in-range features, and children that point forward.
    pub fn validate(&self) -> Result<(), EnsembleError> {
        let n = self.feature.len();
        if n == 0 {
            return Err(EnsembleError::CorruptTree("tree has no nodes".into()));
        }
        if [self.threshold.len(), self.left.len(), self.right.len(), self.value.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err(EnsembleError::CorruptTree("inconsistent array lengths".into()));
        }
        for node in 0..n {
            if !self.value[node].is_finite() {
                return Err(EnsembleError::CorruptTree(format!(
                    "non-finite value at node {node}"
                )));
            }
            if self.feature[node] == LEAF {
                continue;
            }
            let f = self.feature[node];
            if f < 0 || f as usize >= self.n_features {
                return Err(EnsembleError::CorruptTree(format!(
                    "node {node} splits on feature {f} of {}",
                    self.n_features
                )));
            }
            for child in [self.left[node], self.right[node]] {
                if child <= node as i32 || child as usize >= n {
                    return Err(EnsembleError::CorruptTree(format!(
                        "node {node} has child {child} out of range"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
    left_rows: Vec<usize>,
    right_rows: Vec<usize>,
}

/// Grows one tree over `rows` of `x`, considering only `features`.
pub fn grow<'x>(
    x: ArrayView2<'x, f64>,
    gradient: &[f64],
    hessian: &[f64],
    rows: Vec<usize>,
    features: &[usize],
    params: &GrowParams,
    rng: &mut StdRng,
) -> RegressionTree {
    let mut builder = Builder {
        x,
        gradient,
        hessian,
        features,
        params,
        rng,
        tree: RegressionTree::with_capacity(x.ncols(), 64),
    };
    match params.max_leaves {
        Some(max_leaves) => builder.grow_best_first(rows, max_leaves.max(1)),
        None => {
            builder.grow_depth_first(rows, 0);
        }
    }
    builder.tree
}

struct Builder<'x, 'a, 'r> {
    x: ArrayView2<'x, f64>,
    gradient: &'a [f64],
    hessian: &'a [f64],
    features: &'a [usize],
    params: &'a GrowParams,
    rng: &'r mut StdRng,
    tree: RegressionTree,
}

impl Builder<'_, '_, '_> {
    fn sums(&self, rows: &[usize]) -> (f64, f64) {
        rows.iter().fold((0.0, 0.0), |(g, h), &r| {
            (g + self.gradient[r], h + self.hessian[r])
        })
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        let denom = h + self.params.reg_lambda;
        if denom > 0.0 { -g / denom } else { 0.0 }
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        let denom = h + self.params.reg_lambda;
        if denom > 0.0 { g * g / denom } else { 0.0 }
    }

    fn depth_allows_split(&self, depth: usize) -> bool {
        self.params.max_depth.is_none_or(|max| depth < max)
    }

    fn grow_depth_first(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let (g, h) = self.sums(&rows);
        let node = self.tree.push_leaf(self.leaf_value(g, h));
        if !self.depth_allows_split(depth) {
            return node;
        }
        if let Some(split) = self.best_split(&rows, g, h) {
            drop(rows);
            let Split {
                feature,
                threshold,
                left_rows,
                right_rows,
                ..
            } = split;
            let left = self.grow_depth_first(left_rows, depth + 1);
            let right = self.grow_depth_first(right_rows, depth + 1);
            self.tree.set_split(node, feature, threshold, left, right);
        }
        node
    }

    fn grow_best_first(&mut self, rows: Vec<usize>, max_leaves: usize) {
        struct Open {
            node: usize,
            depth: usize,
            split: Split,
        }

        let (g, h) = self.sums(&rows);
        let root = self.tree.push_leaf(self.leaf_value(g, h));
        let mut open: Vec<Open> = Vec::new();
        if self.depth_allows_split(0) {
            if let Some(split) = self.best_split(&rows, g, h) {
                open.push(Open {
                    node: root,
                    depth: 0,
                    split,
                });
            }
        }

        let mut leaves = 1;
        while leaves < max_leaves && !open.is_empty() {
            let mut best = 0;
            for (i, candidate) in open.iter().enumerate() {
                if candidate.split.gain > open[best].split.gain {
                    best = i;
                }
            }
            let Open { node, depth, split } = open.swap_remove(best);

            let mut children = [0usize; 2];
            for (slot, child_rows) in [&split.left_rows, &split.right_rows]
                .into_iter()
                .enumerate()
            {
                let (cg, ch) = self.sums(child_rows);
                let child = self.tree.push_leaf(self.leaf_value(cg, ch));
                children[slot] = child;
                if self.depth_allows_split(depth + 1) {
                    if let Some(child_split) = self.best_split(child_rows, cg, ch) {
                        open.push(Open {
                            node: child,
                            depth: depth + 1,
                            split: child_split,
                        });
                    }
                }
            }
            self.tree
                .set_split(node, split.feature, split.threshold, children[0], children[1]);
            leaves += 1;
        }
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let k = self.params.max_features.clamp(1, self.features.len());
        if k == self.features.len() {
            return self.features.to_vec();
        }
        let mut picked: Vec<usize> = rand::seq::index::sample(&mut *self.rng, self.features.len(), k)
            .into_iter()
            .map(|i| self.features[i])
            .collect();
        picked.sort_unstable();
        picked
    }

    /// Exact greedy search over midpoints between consecutive distinct values.
    fn best_split(&mut self, rows: &[usize], g_total: f64, h_total: f64) -> Option<Split> {
        let min_leaf = self.params.min_samples_leaf.max(1);
        if rows.len() < 2 * min_leaf || h_total < 2.0 * self.params.min_child_weight {
            return None;
        }
        let parent_score = self.score(g_total, h_total);

        let mut best: Option<(usize, f64, f64)> = None;
        let mut best_gain = MIN_GAIN;
        let mut order: Vec<usize> = rows.to_vec();

        for feature in self.candidate_features() {
            let column = self.x.column(feature);
            order.sort_by(|&a, &b| column[a].total_cmp(&column[b]));

            let (mut gl, mut hl) = (0.0, 0.0);
            for i in 0..order.len() - 1 {
                let r = order[i];
                gl += self.gradient[r];
                hl += self.hessian[r];
                let left_count = i + 1;
                let right_count = order.len() - left_count;
                if left_count < min_leaf {
                    continue;
                }
                if right_count < min_leaf {
                    break;
                }
                let lo = column[r];
                let hi = column[order[i + 1]];
                if lo == hi {
                    continue;
                }
                let hr = h_total - hl;
                if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                    continue;
                }
                let gr = g_total - gl;
                let gain = 0.5 * (self.score(gl, hl) + self.score(gr, hr) - parent_score)
                    - self.params.gamma;
                if gain > best_gain {
                    best_gain = gain;
                    let mut threshold = lo + (hi - lo) / 2.0;
                    if threshold >= hi {
                        threshold = lo;
                    }
                    best = Some((feature, threshold, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        let column = self.x.column(feature);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&r| column[r] <= threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return None;
        }
        Some(Split {
            feature,
            threshold,
            gain,
            left_rows,
            right_rows,
        })
    }
}
