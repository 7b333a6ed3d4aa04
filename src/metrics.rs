//! Classification metrics for the positive class `1`.
//!
//! Ratios with a zero denominator evaluate to 0.0; the caller is told which
//! ones through [`Evaluation::undefined`] so it can warn about them.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::ensure_parent_dir;
use crate::error::{PipelineError, StepResult};

/// The four published metrics, serialized with exactly these keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

impl MetricsRecord {
    pub fn save(&self, path: &Path) -> StepResult<()> {
        ensure_parent_dir(path)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::Compute(format!("cannot encode metrics: {err}")))?;
        std::fs::write(path, json).map_err(|err| PipelineError::io(path, err))
    }

    pub fn load(path: &Path) -> StepResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
        serde_json::from_str(&text).map_err(|err| PipelineError::parse(path, err.to_string()))
    }
}

impl fmt::Display for MetricsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Accuracy: {:.4}, Precision: {:.4}, Recall: {:.4}, F1: {:.4}",
            self.accuracy, self.precision, self.recall, self.f1_score
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_count: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(predictions: &[i64], labels: &[i64]) -> StepResult<Self> {
        if predictions.len() != labels.len() {
            return Err(PipelineError::Consistency(format!(
                "{} predictions for {} labels",
                predictions.len(),
                labels.len()
            )));
        }
        let mut matrix = Self::default();
        for (&pred, &label) in predictions.iter().zip(labels) {
            match (pred == 1, label == 1) {
                (true, true) => matrix.tp += 1,
                (true, false) => matrix.fp += 1,
                (false, false) => matrix.tn += 1,
                (false, true) => matrix.fn_count += 1,
            }
        }
        Ok(matrix)
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_count
    }

    /// Per-class scores with class `positive` treated as the positive class.
    fn class_scores(&self, positive: bool) -> ClassScores {
        let (tp, fp, fn_count) = if positive {
            (self.tp, self.fp, self.fn_count)
        } else {
            (self.tn, self.fn_count, self.fp)
        };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_count);
        ClassScores {
            precision,
            recall,
            f1: harmonic_mean(precision, recall),
            support: tp + fn_count,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn harmonic_mean(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Metrics plus the names of the ones whose denominator was zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub record: MetricsRecord,
    pub confusion: ConfusionMatrix,
    pub undefined: Vec<&'static str>,
}

pub fn evaluate_predictions(predictions: &[i64], labels: &[i64]) -> StepResult<Evaluation> {
    let confusion = ConfusionMatrix::from_predictions(predictions, labels)?;
    let mut undefined = Vec::new();
    if confusion.total() == 0 {
        undefined.push("accuracy");
    }
    if confusion.tp + confusion.fp == 0 {
        undefined.push("precision");
    }
    if confusion.tp + confusion.fn_count == 0 {
        undefined.push("recall");
    }
    let positive = confusion.class_scores(true);
    if positive.precision + positive.recall == 0.0 {
        undefined.push("f1_score");
    }
    Ok(Evaluation {
        record: MetricsRecord {
            accuracy: ratio(confusion.tp + confusion.tn, confusion.total()),
            precision: positive.precision,
            recall: positive.recall,
            f1_score: positive.f1,
        },
        confusion,
        undefined,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ClassScores {
    precision: f64,
    recall: f64,
    f1: f64,
    support: usize,
}

/// Text table with per-class precision/recall/F1/support and their averages.
pub fn classification_report(confusion: &ConfusionMatrix) -> String {
    let rows = [
        ("0", confusion.class_scores(false)),
        ("1", confusion.class_scores(true)),
    ];
    let total = confusion.total();
    let macro_avg = ClassScores {
        precision: (rows[0].1.precision + rows[1].1.precision) / 2.0,
        recall: (rows[0].1.recall + rows[1].1.recall) / 2.0,
        f1: (rows[0].1.f1 + rows[1].1.f1) / 2.0,
        support: total,
    };
    let weight = |pick: fn(&ClassScores) -> f64| {
        rows.iter()
            .map(|(_, s)| pick(s) * s.support as f64)
            .sum::<f64>()
            / total.max(1) as f64
    };
    let weighted_avg = ClassScores {
        precision: weight(|s| s.precision),
        recall: weight(|s| s.recall),
        f1: weight(|s| s.f1),
        support: total,
    };

    let line = |name: &str, s: &ClassScores| {
        format!(
            "{name:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
            s.precision, s.recall, s.f1, s.support
        )
    };
    let mut out = vec![format!(
        "{:>12} {:>9} {:>9} {:>9} {:>9}",
        "", "precision", "recall", "f1-score", "support"
    )];
    out.extend(rows.iter().map(|(name, s)| line(name, s)));
    out.push(String::new());
    out.push(format!(
        "{:>12} {:>9} {:>9} {:>9.2} {:>9}",
        "accuracy",
        "",
        "",
        ratio(confusion.tp + confusion.tn, total),
        total
    ));
    out.push(line("macro avg", &macro_avg));
    out.push(line("weighted avg", &weighted_avg));
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn perfect_predictions_score_one() {
        let labels = [0, 1, 1, 0, 1];
        let eval = evaluate_predictions(&labels, &labels).unwrap();
        assert_eq!(eval.record.accuracy, 1.0);
        assert_eq!(eval.record.precision, 1.0);
        assert_eq!(eval.record.recall, 1.0);
        assert_eq!(eval.record.f1_score, 1.0);
        assert!(eval.undefined.is_empty());
    }

    #[test]
    fn mixed_predictions() {
        // 3 TP, 1 FP, 2 TN, 1 FN
        let preds = [1, 1, 1, 1, 0, 0, 0];
        let labels = [1, 1, 1, 0, 0, 0, 1];
        let eval = evaluate_predictions(&preds, &labels).unwrap();
        assert_eq!(
            eval.confusion,
            ConfusionMatrix {
                tp: 3,
                fp: 1,
                tn: 2,
                fn_count: 1
            }
        );
        assert!((eval.record.accuracy - 5.0 / 7.0).abs() < 1e-12);
        assert!((eval.record.precision - 0.75).abs() < 1e-12);
        assert!((eval.record.recall - 0.75).abs() < 1e-12);
        assert!((eval.record.f1_score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_yield_zero_and_flag() {
        let eval = evaluate_predictions(&[0, 0, 0], &[0, 1, 1]).unwrap();
        assert_eq!(eval.record.precision, 0.0);
        assert_eq!(eval.record.f1_score, 0.0);
        assert!(eval.undefined.contains(&"precision"));
        assert!(!eval.undefined.contains(&"recall"));
    }

    #[test]
    fn length_mismatch_is_consistency_error() {
        assert!(matches!(
            evaluate_predictions(&[0, 1], &[0]),
            Err(PipelineError::Consistency(_))
        ));
    }

    #[test]
    fn metrics_json_has_exactly_four_keys() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("results/metrics.json");
        let record = MetricsRecord {
            accuracy: 0.9,
            precision: 0.8,
            recall: 0.75,
            f1_score: 0.774,
        };
        record.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(MetricsRecord::load(&path).unwrap(), record);
    }

    #[test]
    fn report_lists_classes_and_averages() {
        let confusion = ConfusionMatrix::from_predictions(&[1, 0, 1, 0], &[1, 0, 0, 0]).unwrap();
        let report = classification_report(&confusion);
        for needle in ["precision", "accuracy", "macro avg", "weighted avg"] {
            assert!(report.contains(needle), "missing {needle}:\n{report}");
        }
        assert_eq!(report.lines().count(), 7);
    }
}
