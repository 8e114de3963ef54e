//! Classification metrics used for model search and audit.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub weighted_f1: f64,
}

impl ClassificationMetrics {
    pub fn compute(truth: &[usize], predicted: &[usize]) -> Self {
        Self {
            accuracy: accuracy(truth, predicted),
            macro_f1: macro_f1(truth, predicted),
            weighted_f1: weighted_f1(truth, predicted),
        }
    }

    pub fn score(&self, metric: ScoringMetric) -> f64 {
        match metric {
            ScoringMetric::MacroF1 => self.macro_f1,
            ScoringMetric::WeightedF1 => self.weighted_f1,
            ScoringMetric::Accuracy => self.accuracy,
        }
    }

    /// Element-wise mean; empty input yields zeros.
    pub fn mean(all: &[Self]) -> Self {
        if all.is_empty() {
            return Self::default();
        }
        let n = all.len() as f64;
        Self {
            accuracy: all.iter().map(|m| m.accuracy).sum::<f64>() / n,
            macro_f1: all.iter().map(|m| m.macro_f1).sum::<f64>() / n,
            weighted_f1: all.iter().map(|m| m.weighted_f1).sum::<f64>() / n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMetric {
    #[default]
    MacroF1,
    WeightedF1,
    Accuracy,
}

impl fmt::Display for ScoringMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MacroF1 => "macro_f1",
            Self::WeightedF1 => "weighted_f1",
            Self::Accuracy => "accuracy",
        })
    }
}

impl FromStr for ScoringMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "macro_f1" | "f1_macro" => Ok(Self::MacroF1),
            "weighted_f1" | "f1_weighted" => Ok(Self::WeightedF1),
            "accuracy" => Ok(Self::Accuracy),
            other => Err(format!("unknown scoring metric '{other}'")),
        }
    }
}

pub fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    hits as f64 / truth.len() as f64
}

/// Per-label (f1, support) over the labels present in truth or predictions.
fn per_label_f1(truth: &[usize], predicted: &[usize]) -> Vec<(f64, usize)> {
    let labels: BTreeSet<usize> = truth.iter().chain(predicted).copied().collect();
    labels
        .into_iter()
        .map(|label| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (&t, &p) in truth.iter().zip(predicted) {
                match (t == label, p == label) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_ += 1,
                    (false, false) => {}
                }
            }
            let denom = 2 * tp + fp + fn_;
            let f1 = if denom == 0 {
                0.0
            } else {
                2.0 * tp as f64 / denom as f64
            };
            (f1, tp + fn_)
        })
        .collect()
}

pub fn macro_f1(truth: &[usize], predicted: &[usize]) -> f64 {
    let scores = per_label_f1(truth, predicted);
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|(f1, _)| f1).sum::<f64>() / scores.len() as f64
}

pub fn weighted_f1(truth: &[usize], predicted: &[usize]) -> f64 {
    let scores = per_label_f1(truth, predicted);
    let support: usize = scores.iter().map(|(_, s)| s).sum();
    if support == 0 {
        return 0.0;
    }
    scores.iter().map(|(f1, s)| f1 * *s as f64).sum::<f64>() / support as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_score_one() {
        let y = [0, 1, 2, 2];
        let m = ClassificationMetrics::compute(&y, &y);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.macro_f1, 1.0);
        assert_eq!(m.weighted_f1, 1.0);
    }

    #[test]
    fn macro_f1_is_not_dominated_by_majority_class() {
        let truth = [0, 0, 0, 0, 0, 0, 1, 2];
        let predicted = [0; 8];
        let m = ClassificationMetrics::compute(&truth, &predicted);
        assert_eq!(m.accuracy, 0.75);
        // f1(0) = 12/14, f1(1) = f1(2) = 0
        assert!((m.macro_f1 - (12.0 / 14.0) / 3.0).abs() < 1e-12);
        assert!((m.weighted_f1 - (12.0 / 14.0) * 0.75).abs() < 1e-12);
    }

    #[test]
    fn empty_inputs_are_finite() {
        let m = ClassificationMetrics::compute(&[], &[]);
        assert_eq!(m, ClassificationMetrics::default());
        assert!(ClassificationMetrics::mean(&[]).macro_f1.is_finite());
    }

    #[test]
    fn scoring_metric_parses_common_spellings() {
        assert_eq!("f1-macro".parse::<ScoringMetric>(), Ok(ScoringMetric::MacroF1));
        assert_eq!("weighted_f1".parse::<ScoringMetric>(), Ok(ScoringMetric::WeightedF1));
        assert!("auc".parse::<ScoringMetric>().is_err());
    }
}
