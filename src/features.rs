//! Feature building: trailing-window biometric statistics joined with lagged
//! weather readings, plus the parallel per-subject dataset assembly.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate_subject, DateRange};
use crate::catalog::{FeatureCatalog, SlotKind};
use crate::error::{HistoryGap, InsufficientHistory};
use crate::models::{
    CohortDataset, DailyRecord, FatigueLabel, FeatureVector, LabeledSample, SubjectAudit,
    SubjectData,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltRow {
    pub vector: FeatureVector,
    pub label: Option<FatigueLabel>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutcome {
    pub rows: Vec<BuiltRow>,
    pub exclusions: Vec<InsufficientHistory>,
}

impl BuildOutcome {
    pub fn vectors(&self) -> Vec<FeatureVector> {
        self.rows.iter().map(|row| row.vector.clone()).collect()
    }
}

/// Builds the feature vector for `date` from one subject's daily records.
///
/// Only records dated on or before `date` are read.
pub fn vector_for_date(
    catalog: &FeatureCatalog,
    by_date: &BTreeMap<NaiveDate, &DailyRecord>,
    subject_id: &str,
    date: NaiveDate,
) -> Result<FeatureVector, InsufficientHistory> {
    let gap = |gap| InsufficientHistory {
        subject_id: subject_id.to_string(),
        date,
        gap,
    };

    let mut window = Vec::with_capacity(catalog.window_days);
    for back in (0..catalog.window_days as i64).rev() {
        let day = date - Duration::days(back);
        match by_date.get(&day) {
            Some(record) => window.push(*record),
            None => return Err(gap(HistoryGap::MissingWindowDay { date: day })),
        }
    }
    let current = window[window.len() - 1];

    let mut values = Vec::with_capacity(catalog.width());
    for slot in catalog.slots() {
        let value = match &slot.kind {
            SlotKind::Raw { feature } => current.value(feature).ok_or_else(|| {
                gap(HistoryGap::MissingFeature {
                    feature: feature.clone(),
                    date,
                })
            })?,
            SlotKind::WindowMean { feature } => {
                let mut total = 0.0;
                for record in &window {
                    total += record.value(feature).ok_or_else(|| {
                        gap(HistoryGap::MissingFeature {
                            feature: feature.clone(),
                            date: record.date,
                        })
                    })?;
                }
                total / window.len() as f64
            }
            SlotKind::WeatherLag { feature, lag } => by_date
                .get(&(date - Duration::days(i64::from(*lag))))
                .and_then(|record| record.value(feature))
                .ok_or_else(|| {
                    gap(HistoryGap::MissingLag {
                        feature: feature.clone(),
                        lag: *lag,
                    })
                })?,
        };
        if !value.is_finite() {
            return Err(gap(HistoryGap::NonFinite { slot: slot.name }));
        }
        values.push(value);
    }

    Ok(FeatureVector {
        subject_id: subject_id.to_string(),
        date,
        values,
    })
}

/// Builds every vector one subject's records can support.
pub fn build_vectors(catalog: &FeatureCatalog, records: &[DailyRecord]) -> BuildOutcome {
    let by_date: BTreeMap<NaiveDate, &DailyRecord> =
        records.iter().map(|record| (record.date, record)).collect();
    let mut outcome = BuildOutcome::default();

    for (date, record) in &by_date {
        match vector_for_date(catalog, &by_date, &record.subject_id, *date) {
            Ok(vector) => outcome.rows.push(BuiltRow {
                vector,
                label: record.label.clone(),
            }),
            Err(excluded) => outcome.exclusions.push(excluded),
        }
    }
    outcome
}

/// Aggregates and builds one subject, returning its labeled samples and audit.
pub fn build_subject(
    catalog: &FeatureCatalog,
    subject_id: &str,
    data: &SubjectData,
    range: Option<DateRange>,
) -> (Vec<LabeledSample>, SubjectAudit) {
    let aggregated = aggregate_subject(catalog, subject_id, data, range);
    let built = build_vectors(catalog, &aggregated.records);

    let mut audit = SubjectAudit {
        daily_records: aggregated.records.len(),
        rejected_observations: aggregated.rejected.len(),
        dropped_dates: aggregated.dropped.len(),
        excluded_samples: built.exclusions.len(),
        unlabeled_samples: 0,
    };
    let mut samples = Vec::with_capacity(built.rows.len());
    for row in built.rows {
        let target = row.label.as_ref().and_then(|label| {
            let mapped = catalog.map_label(label);
            if mapped.is_none() {
                warn!(subject = subject_id, date = %row.vector.date, ?label, "unmappable fatigue label");
            }
            mapped
        });
        match target {
            Some(target) => samples.push(LabeledSample {
                features: row.vector,
                target,
            }),
            None => audit.unlabeled_samples += 1,
        }
    }

    debug!(
        subject = subject_id,
        samples = samples.len(),
        excluded = audit.excluded_samples,
        rejected = audit.rejected_observations,
        "built subject"
    );
    (samples, audit)
}

/// Fans subjects out across the rayon pool and concatenates in subject-id
/// order, so the dataset never depends on completion order.
pub fn build_cohort_dataset(
    catalog: &FeatureCatalog,
    cohort: &str,
    subjects: &BTreeMap<String, SubjectData>,
    range: Option<DateRange>,
) -> CohortDataset {
    let units: Vec<(&String, &SubjectData)> = subjects.iter().collect();
    let built: Vec<(String, Vec<LabeledSample>, SubjectAudit)> = units
        .par_iter()
        .map(|(subject_id, data)| {
            let (samples, audit) = build_subject(catalog, subject_id, data, range);
            ((*subject_id).clone(), samples, audit)
        })
        .collect();

    let mut samples = Vec::new();
    let mut audit = BTreeMap::new();
    for (subject_id, subject_samples, subject_audit) in built {
        samples.extend(subject_samples);
        audit.insert(subject_id, subject_audit);
    }

    let excluded: usize = audit.values().map(|a: &SubjectAudit| a.excluded_samples).sum();
    info!(
        cohort,
        subjects = audit.len(),
        samples = samples.len(),
        excluded,
        "assembled cohort dataset"
    );

    CohortDataset {
        cohort: cohort.to_string(),
        feature_names: catalog.slot_names(),
        samples,
        audit,
    }
}
