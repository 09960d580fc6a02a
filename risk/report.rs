//! Evaluation metrics and the tab-separated reports written after training.

use ndarray::ArrayView1;
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const METRICS_FILE: &str = "metrics.tsv";
pub const THRESHOLD_SWEEP_FILE: &str = "threshold_sweep.tsv";
pub const TEST_PREDICTIONS_FILE: &str = "test_predictions.tsv";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create report '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write report '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{labels} labels but {predictions} predictions.")]
    LengthMismatch { labels: usize, predictions: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConfusionMatrix {
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_positives: usize,
}

impl ConfusionMatrix {
    /// Counts at `threshold`; a row is called positive when `p >= threshold`.
    pub fn at_threshold(y: ArrayView1<'_, f64>, p: ArrayView1<'_, f64>, threshold: f64) -> Self {
        let mut cm = Self::default();
        for (&truth, &prob) in y.iter().zip(p.iter()) {
            match (truth > 0.5, prob >= threshold) {
                (false, false) => cm.true_negatives += 1,
                (false, true) => cm.false_positives += 1,
                (true, false) => cm.false_negatives += 1,
                (true, true) => cm.true_positives += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.true_negatives + self.false_positives + self.false_negatives + self.true_positives
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_positives)
    }

    pub fn f1(&self) -> f64 {
        let (precision, recall) = (self.precision(), self.recall());
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }
}

// Zero denominators count as 0.
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Area under the ROC curve via the Mann-Whitney rank statistic, averaging
/// ranks over tied scores. Returns 0.5 when only one class is present.
pub fn roc_auc(y: ArrayView1<'_, f64>, p: ArrayView1<'_, f64>) -> f64 {
    let n = y.len();
    let n_pos = y.iter().filter(|&&t| t > 0.5).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| p[i].partial_cmp(&p[j]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && p[order[j]] == p[order[i]] {
            j += 1;
        }
        let average = (i + j - 1) as f64 / 2.0 + 1.0;
        for &row in &order[i..j] {
            ranks[row] = average;
        }
        i = j;
    }

    let positive_rank_sum: f64 = (0..n).filter(|&i| y[i] > 0.5).map(|i| ranks[i]).sum();
    (positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMetrics {
    pub threshold: f64,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub roc_auc: f64,
    pub confusion: ConfusionMatrix,
}

impl ClassificationMetrics {
    pub fn compute(
        y: ArrayView1<'_, f64>,
        p: ArrayView1<'_, f64>,
        threshold: f64,
    ) -> Result<Self, ReportError> {
        check_lengths(y, p)?;
        let confusion = ConfusionMatrix::at_threshold(y, p, threshold);
        Ok(Self {
            threshold,
            accuracy: confusion.accuracy(),
            balanced_accuracy: (confusion.recall() + confusion.specificity()) / 2.0,
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            roc_auc: roc_auc(y, p),
            confusion,
        })
    }
}

fn check_lengths(y: ArrayView1<'_, f64>, p: ArrayView1<'_, f64>) -> Result<(), ReportError> {
    if y.len() != p.len() {
        return Err(ReportError::LengthMismatch {
            labels: y.len(),
            predictions: p.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdPoint {
    pub threshold: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Metrics at every threshold from 0.00 to 1.00 in steps of 0.01.
pub fn threshold_sweep(
    y: ArrayView1<'_, f64>,
    p: ArrayView1<'_, f64>,
) -> Result<Vec<ThresholdPoint>, ReportError> {
    check_lengths(y, p)?;
    Ok((0..=100)
        .map(|step| {
            let threshold = step as f64 / 100.0;
            let cm = ConfusionMatrix::at_threshold(y, p, threshold);
            ThresholdPoint {
                threshold,
                accuracy: cm.accuracy(),
                precision: cm.precision(),
                recall: cm.recall(),
                f1: cm.f1(),
            }
        })
        .collect())
}

#[derive(Serialize)]
struct MetricsRecord<'a> {
    split: &'a str,
    rows: usize,
    threshold: f64,
    accuracy: f64,
    balanced_accuracy: f64,
    precision: f64,
    recall: f64,
    f1: f64,
    roc_auc: f64,
    true_negatives: usize,
    false_positives: usize,
    false_negatives: usize,
    true_positives: usize,
}

#[derive(Serialize)]
struct SweepRecord<'a> {
    split: &'a str,
    threshold: f64,
    accuracy: f64,
    precision: f64,
    recall: f64,
    f1: f64,
}

#[derive(Serialize)]
struct PredictionRecord<'a> {
    id: &'a str,
    probability: f64,
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, ReportError> {
    let file = File::create(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file)))
}

fn write_records<S: Serialize>(path: &Path, records: impl IntoIterator<Item = S>) -> Result<(), ReportError> {
    let csv_err = |source| ReportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = tsv_writer(path)?;
    for record in records {
        writer.serialize(record).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// One row per named split (e.g. `train`, `validation`).
pub fn write_metrics(path: &Path, splits: &[(&str, &ClassificationMetrics)]) -> Result<(), ReportError> {
    write_records(
        path,
        splits.iter().map(|(split, m)| MetricsRecord {
            split,
            rows: m.confusion.total(),
            threshold: m.threshold,
            accuracy: m.accuracy,
            balanced_accuracy: m.balanced_accuracy,
            precision: m.precision,
            recall: m.recall,
            f1: m.f1,
            roc_auc: m.roc_auc,
            true_negatives: m.confusion.true_negatives,
            false_positives: m.confusion.false_positives,
            false_negatives: m.confusion.false_negatives,
            true_positives: m.confusion.true_positives,
        }),
    )
}

pub fn write_threshold_sweep(
    path: &Path,
    splits: &[(&str, &[ThresholdPoint])],
) -> Result<(), ReportError> {
    write_records(
        path,
        splits.iter().flat_map(|(split, points)| {
            points.iter().map(move |point| SweepRecord {
                split,
                threshold: point.threshold,
                accuracy: point.accuracy,
                precision: point.precision,
                recall: point.recall,
                f1: point.f1,
            })
        }),
    )
}

pub fn write_predictions(
    path: &Path,
    ids: &[String],
    probabilities: ArrayView1<'_, f64>,
) -> Result<(), ReportError> {
    if ids.len() != probabilities.len() {
        return Err(ReportError::LengthMismatch {
            labels: ids.len(),
            predictions: probabilities.len(),
        });
    }
    write_records(
        path,
        ids.iter()
            .zip(probabilities.iter())
            .map(|(id, &probability)| PredictionRecord { id, probability }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn auc_of_a_perfect_ranking_is_one() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        let p = array![0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(roc_auc(y.view(), p.view()), 1.0);
        let reversed = array![0.9, 0.8, 0.2, 0.1];
        assert_abs_diff_eq!(roc_auc(y.view(), reversed.view()), 0.0);
    }

    #[test]
    fn auc_averages_ties() {
        let y = array![0.0, 1.0];
        let p = array![0.5, 0.5];
        assert_abs_diff_eq!(roc_auc(y.view(), p.view()), 0.5);
    }

    #[test]
    fn metrics_at_half() {
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0];
        let p = array![0.1, 0.6, 0.2, 0.7, 0.4];
        let m = ClassificationMetrics::compute(y.view(), p.view(), 0.5).unwrap();
        assert_eq!(
            m.confusion,
            ConfusionMatrix {
                true_negatives: 2,
                false_positives: 1,
                false_negatives: 1,
                true_positives: 1,
            }
        );
        assert_abs_diff_eq!(m.accuracy, 0.6);
        assert_abs_diff_eq!(m.precision, 0.5);
        assert_abs_diff_eq!(m.recall, 0.5);
        assert_abs_diff_eq!(m.f1, 0.5);
        assert_abs_diff_eq!(m.balanced_accuracy, (0.5 + 2.0 / 3.0) / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn sweep_covers_the_unit_interval_and_zero_divisions_are_zero() {
        let y = array![0.0, 1.0, 0.0];
        let p = array![0.2, 0.3, 0.4];
        let sweep = threshold_sweep(y.view(), p.view()).unwrap();
        assert_eq!(sweep.len(), 101);
        assert_eq!(sweep[0].threshold, 0.0);
        assert_eq!(sweep[100].threshold, 1.0);
        // nothing is called positive at 1.0
        assert_eq!(sweep[100].precision, 0.0);
        assert_eq!(sweep[100].f1, 0.0);
        assert_eq!(sweep[0].recall, 1.0);
    }

    #[test]
    fn reports_are_tab_separated_with_headers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TEST_PREDICTIONS_FILE);
        let ids = vec!["7".to_string(), "8".to_string()];
        write_predictions(&path, &ids, array![0.25, 0.5].view()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["id\tprobability", "7\t0.25", "8\t0.5"]);

        let y = array![0.0, 1.0];
        let m = ClassificationMetrics::compute(y.view(), array![0.3, 0.9].view(), 0.5).unwrap();
        let metrics_path = dir.path().join(METRICS_FILE);
        write_metrics(&metrics_path, &[("train", &m)]).unwrap();
        let text = std::fs::read_to_string(&metrics_path).unwrap();
        assert!(text.starts_with("split\trows\tthreshold\taccuracy"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let y = array![0.0, 1.0];
        let p = array![0.3];
        assert!(matches!(
            ClassificationMetrics::compute(y.view(), p.view(), 0.5),
            Err(ReportError::LengthMismatch { .. })
        ));
    }
}
