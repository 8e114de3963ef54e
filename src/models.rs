use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One biometric or weather measurement as delivered by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub subject_id: String,
    pub timestamp: NaiveDateTime,
    pub feature: String,
    pub value: f64,
    #[serde(default)]
    pub location: Option<String>,
}

/// A self-reported fatigue label: the 1-5 rating or a 3-class text label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatigueLabel {
    Rating(u8),
    Category(String),
}

impl FatigueLabel {
    /// Parses a raw label cell; whole numbers (`4` or `4.0`) become ratings,
    /// anything else a category.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(rating) = trimmed.parse::<u8>() {
            return Some(Self::Rating(rating));
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(&value) => {
                Some(Self::Rating(value as u8))
            }
            _ => Some(Self::Category(trimmed.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReport {
    pub subject_id: String,
    pub date: NaiveDate,
    pub label: FatigueLabel,
}

/// Everything ingestion supplies for one subject.
#[derive(Debug, Clone, Default)]
pub struct SubjectData {
    pub observations: Vec<RawObservation>,
    pub reports: Vec<SelfReport>,
}

/// One row per (subject, date) after resampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub subject_id: String,
    pub date: NaiveDate,
    pub values: BTreeMap<String, f64>,
    pub label: Option<FatigueLabel>,
}

impl DailyRecord {
    pub fn value(&self, feature: &str) -> Option<f64> {
        self.values.get(feature).copied()
    }
}

/// Fixed-width numeric row in catalog slot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub subject_id: String,
    pub date: NaiveDate,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub features: FeatureVector,
    pub target: usize,
}

impl LabeledSample {
    pub fn subject_id(&self) -> &str {
        &self.features.subject_id
    }
}

/// Audit counters kept per subject while building a cohort dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAudit {
    pub daily_records: usize,
    pub rejected_observations: usize,
    pub dropped_dates: usize,
    pub excluded_samples: usize,
    pub unlabeled_samples: usize,
}

/// All labeled samples for one user type.
///
/// Subject ids ride along with each sample for fold assignment only; they are
/// never part of the feature matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortDataset {
    pub cohort: String,
    pub feature_names: Vec<String>,
    pub samples: Vec<LabeledSample>,
    pub audit: BTreeMap<String, SubjectAudit>,
}

impl CohortDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Distinct subjects that contributed at least one sample, sorted.
    pub fn subject_ids(&self) -> Vec<String> {
        self.samples
            .iter()
            .map(|sample| sample.subject_id().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Feature matrix and targets for the given sample indices, in that order.
    pub fn matrix(&self, indices: &[usize]) -> (Array2<f64>, Vec<usize>) {
        let width = self.feature_names.len();
        let x = Array2::from_shape_fn((indices.len(), width), |(row, col)| {
            self.samples[indices[row]].features.values[col]
        });
        let y = indices.iter().map(|&idx| self.samples[idx].target).collect();
        (x, y)
    }

    pub fn full_matrix(&self) -> (Array2<f64>, Vec<usize>) {
        let all: Vec<usize> = (0..self.samples.len()).collect();
        self.matrix(&all)
    }

    pub fn class_counts(&self, classes: usize) -> Vec<usize> {
        let mut counts = vec![0; classes];
        for sample in &self.samples {
            if sample.target < classes {
                counts[sample.target] += 1;
            }
        }
        counts
    }
}
