//! Daily aggregation: raw observation streams become one record per
//! (subject, calendar date).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{Aggregation, FeatureCatalog, FillPolicy};
use crate::error::{DataQualityError, DataQualityIssue};
use crate::models::{DailyRecord, FatigueLabel, RawObservation, SubjectData};

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedDate {
    pub date: NaiveDate,
    pub coverage: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationOutcome {
    pub records: Vec<DailyRecord>,
    pub rejected: Vec<DataQualityError>,
    pub dropped: Vec<DroppedDate>,
    pub ignored_observations: usize,
    /// Weather readings taken away from the subject's primary location.
    pub foreign_weather: usize,
}

/// Strict single-observation check against the catalog's physical ranges.
///
/// Observations of features the catalog does not declare pass; the
/// aggregator ignores them.
pub fn validate_observation(
    catalog: &FeatureCatalog,
    observation: &RawObservation,
) -> Result<(), DataQualityError> {
    let reject = |issue| DataQualityError {
        subject_id: observation.subject_id.clone(),
        timestamp: observation.timestamp,
        feature: observation.feature.clone(),
        value: observation.value,
        issue,
    };

    if observation.subject_id.trim().is_empty() {
        return Err(reject(DataQualityIssue::Malformed {
            detail: "empty subject id".into(),
        }));
    }
    if observation.feature.trim().is_empty() {
        return Err(reject(DataQualityIssue::Malformed {
            detail: "empty feature name".into(),
        }));
    }
    let Some(range) = catalog.range_for(&observation.feature) else {
        return Ok(());
    };
    if !observation.value.is_finite() {
        return Err(reject(DataQualityIssue::NonFinite));
    }
    if !range.contains(observation.value) {
        return Err(reject(DataQualityIssue::OutOfRange {
            min: range.min,
            max: range.max,
        }));
    }
    Ok(())
}

fn reduce(aggregation: Aggregation, samples: &[(NaiveDateTime, f64)]) -> Option<f64> {
    let values = samples.iter().map(|(_, value)| *value);
    match aggregation {
        Aggregation::Mean if !samples.is_empty() => {
            Some(values.sum::<f64>() / samples.len() as f64)
        }
        Aggregation::Mean => None,
        Aggregation::Sum => Some(values.sum()),
        Aggregation::Min => values.reduce(f64::min),
        Aggregation::Max => values.reduce(f64::max),
        Aggregation::Latest => samples.last().map(|(_, value)| *value),
    }
}

/// The location that supplies most of the subject's weather readings in
/// range; ties go to the smallest name. Unlocated readings are not counted.
fn primary_weather_location<'a>(
    catalog: &FeatureCatalog,
    observations: &'a [RawObservation],
    range: Option<DateRange>,
) -> Option<&'a str> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for observation in observations {
        if range.is_some_and(|range| !range.contains(observation.timestamp.date()))
            || catalog.weather_feature(&observation.feature).is_none()
        {
            continue;
        }
        if let Some(location) = observation.location.as_deref() {
            *counts.entry(location).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (location, count)| match best {
            Some((_, top)) if top >= count => best,
            _ => Some((location, count)),
        })
        .map(|(location, _)| location)
}

type DayBuckets = BTreeMap<NaiveDate, BTreeMap<String, Vec<(NaiveDateTime, f64)>>>;

/// Resamples one subject's observations into daily records.
///
/// A rejected observation drops its whole date; dates whose biometric
/// coverage stays below the catalog threshold after bounded filling are
/// reported in `dropped`. Weather comes from a single location per subject:
/// readings tagged with any other location are skipped, unlocated ones kept.
pub fn aggregate_subject(
    catalog: &FeatureCatalog,
    subject_id: &str,
    data: &SubjectData,
    range: Option<DateRange>,
) -> AggregationOutcome {
    let mut outcome = AggregationOutcome::default();
    let mut buckets: DayBuckets = BTreeMap::new();
    let mut rejected_dates = BTreeSet::new();
    let weather_location = primary_weather_location(catalog, &data.observations, range);

    for observation in &data.observations {
        let date = observation.timestamp.date();
        if range.is_some_and(|range| !range.contains(date)) {
            continue;
        }
        if observation.subject_id != subject_id {
            outcome.rejected.push(DataQualityError {
                subject_id: observation.subject_id.clone(),
                timestamp: observation.timestamp,
                feature: observation.feature.clone(),
                value: observation.value,
                issue: DataQualityIssue::Malformed {
                    detail: format!("observation routed to subject '{subject_id}'"),
                },
            });
            continue;
        }
        if catalog.weather_feature(&observation.feature).is_some()
            && observation
                .location
                .as_deref()
                .is_some_and(|location| Some(location) != weather_location)
        {
            outcome.foreign_weather += 1;
            continue;
        }
        if let Err(error) = validate_observation(catalog, observation) {
            warn!(%error, "rejecting observation");
            rejected_dates.insert(date);
            outcome.rejected.push(error);
            continue;
        }
        if catalog.range_for(&observation.feature).is_none() {
            outcome.ignored_observations += 1;
            continue;
        }
        buckets
            .entry(date)
            .or_default()
            .entry(observation.feature.clone())
            .or_default()
            .push((observation.timestamp, observation.value));
    }
    if outcome.ignored_observations > 0 {
        debug!(
            subject = subject_id,
            count = outcome.ignored_observations,
            "ignored observations of undeclared features"
        );
    }
    if outcome.foreign_weather > 0 {
        debug!(
            subject = subject_id,
            location = weather_location.unwrap_or("-"),
            count = outcome.foreign_weather,
            "skipped weather readings from other locations"
        );
    }
    for date in &rejected_dates {
        buckets.remove(date);
    }

    let span = match range {
        Some(range) => Some((range.start, range.end)),
        None => buckets
            .keys()
            .next()
            .zip(buckets.keys().next_back())
            .map(|(first, last)| (*first, *last)),
    };
    let Some((start, end)) = span else {
        return outcome;
    };

    let mut observed: BTreeMap<NaiveDate, BTreeMap<String, f64>> = BTreeMap::new();
    for (date, features) in &mut buckets {
        let day = observed.entry(*date).or_default();
        for (feature, samples) in features.iter_mut() {
            samples.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
            let aggregation = catalog.aggregation_for(feature).unwrap_or(Aggregation::Mean);
            if let Some(value) = reduce(aggregation, samples) {
                day.insert(feature.clone(), value);
            }
        }
    }

    let labels: BTreeMap<NaiveDate, &FatigueLabel> = data
        .reports
        .iter()
        .filter(|report| report.subject_id == subject_id)
        .map(|report| (report.date, &report.label))
        .collect();

    let feature_names: Vec<&str> = catalog
        .biometric
        .iter()
        .map(|f| f.name.as_str())
        .chain(catalog.weather.iter().map(|f| f.name.as_str()))
        .collect();

    let mut date = start;
    while date <= end {
        if rejected_dates.contains(&date) {
            date += Duration::days(1);
            continue;
        }
        let mut values = observed.get(&date).cloned().unwrap_or_default();
        for name in &feature_names {
            if values.contains_key(*name) {
                continue;
            }
            if let Some(value) = fill_value(&observed, name, date, catalog.fill_for(name)) {
                values.insert((*name).to_string(), value);
            }
        }

        let present = catalog
            .biometric
            .iter()
            .filter(|feature| values.contains_key(&feature.name))
            .count();
        let coverage = present as f64 / catalog.biometric.len() as f64;
        if coverage < catalog.min_coverage {
            if observed.contains_key(&date) {
                debug!(subject = subject_id, %date, coverage, "dropping under-covered date");
            }
            outcome.dropped.push(DroppedDate { date, coverage });
        } else {
            outcome.records.push(DailyRecord {
                subject_id: subject_id.to_string(),
                date,
                values,
                label: labels.get(&date).map(|label| (*label).clone()),
            });
        }
        date += Duration::days(1);
    }

    outcome
}

/// Nearest observed value within the fill bound, preferring the past.
fn fill_value(
    observed: &BTreeMap<NaiveDate, BTreeMap<String, f64>>,
    feature: &str,
    date: NaiveDate,
    policy: FillPolicy,
) -> Option<f64> {
    let lookup = |offset: i64| {
        observed
            .get(&(date + Duration::days(offset)))
            .and_then(|day| day.get(feature))
            .copied()
    };
    match policy {
        FillPolicy::None => None,
        FillPolicy::Forward(days) => (1..=i64::from(days)).find_map(|back| lookup(-back)),
        FillPolicy::ForwardBackward(days) => (1..=i64::from(days))
            .find_map(|back| lookup(-back))
            .or_else(|| (1..=i64::from(days)).find_map(lookup)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SelfReport;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn obs(feature: &str, day: u32, hour: u32, value: f64) -> RawObservation {
        RawObservation {
            subject_id: "s01".to_string(),
            timestamp: at(day, hour),
            feature: feature.to_string(),
            value,
            location: None,
        }
    }

    fn full_day(day: u32) -> Vec<RawObservation> {
        let catalog = FeatureCatalog::default();
        catalog
            .biometric
            .iter()
            .map(|f| obs(&f.name, day, 12, 10.0_f64.max(f.range.min)))
            .collect()
    }

    #[test]
    fn aggregation_rules_follow_feature_family() {
        let catalog = FeatureCatalog::default();
        let mut observations = full_day(1);
        observations.retain(|o| {
            !matches!(
                o.feature.as_str(),
                "heart_rate_avg" | "heart_rate_min" | "heart_rate_max" | "steps" | "sleep_quality"
            )
        });
        observations.extend([
            obs("heart_rate_avg", 1, 8, 60.0),
            obs("heart_rate_avg", 1, 20, 80.0),
            obs("heart_rate_min", 1, 3, 48.0),
            obs("heart_rate_min", 1, 9, 52.0),
            obs("heart_rate_max", 1, 9, 150.0),
            obs("heart_rate_max", 1, 18, 170.0),
            obs("steps", 1, 10, 4000.0),
            obs("steps", 1, 18, 6500.0),
            obs("sleep_quality", 1, 7, 60.0),
            obs("sleep_quality", 1, 23, 75.0),
        ]);
        let data = SubjectData {
            observations,
            reports: vec![],
        };

        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.value("heart_rate_avg"), Some(70.0));
        assert_eq!(record.value("heart_rate_min"), Some(48.0));
        assert_eq!(record.value("heart_rate_max"), Some(170.0));
        assert_eq!(record.value("steps"), Some(10_500.0));
        assert_eq!(record.value("sleep_quality"), Some(75.0));
    }

    #[test]
    fn negative_heart_rate_is_rejected_with_context() {
        let catalog = FeatureCatalog::default();
        let bad = obs("heart_rate_avg", 2, 9, -5.0);
        let error = validate_observation(&catalog, &bad).unwrap_err();
        assert_eq!(error.subject_id, "s01");
        assert_eq!(error.timestamp, at(2, 9));
        assert_eq!(error.feature, "heart_rate_avg");
        assert!(matches!(error.issue, DataQualityIssue::OutOfRange { .. }));

        let mut observations = full_day(1);
        observations.extend(full_day(2));
        observations.push(bad);
        let data = SubjectData {
            observations,
            reports: vec![],
        };
        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].timestamp, at(2, 9));
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.value("heart_rate_avg") != Some(-5.0)));
        assert!(outcome.records.iter().all(|r| r.date != at(2, 9).date()));
    }

    #[test]
    fn sleep_quality_carries_forward_one_day_only() {
        let catalog = FeatureCatalog::default();
        let mut observations = full_day(1);
        for day in 2..=3 {
            observations.extend(full_day(day).into_iter().filter(|o| o.feature != "sleep_quality"));
        }
        let data = SubjectData {
            observations,
            reports: vec![],
        };
        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        let quality: Vec<Option<f64>> = outcome
            .records
            .iter()
            .map(|r| r.value("sleep_quality"))
            .collect();
        assert_eq!(quality, vec![Some(10.0), Some(10.0), None]);
    }

    #[test]
    fn weather_fills_short_gaps_both_ways() {
        let catalog = FeatureCatalog::default();
        let mut observations = Vec::new();
        for day in 1..=3 {
            observations.extend(full_day(day));
        }
        observations.push(obs("temperature", 2, 12, 18.0));
        let data = SubjectData {
            observations,
            reports: vec![],
        };
        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        let temps: Vec<Option<f64>> = outcome
            .records
            .iter()
            .map(|r| r.value("temperature"))
            .collect();
        assert_eq!(temps, vec![Some(18.0), Some(18.0), Some(18.0)]);
    }

    #[test]
    fn weather_follows_the_primary_location() {
        let catalog = FeatureCatalog::default();
        let located = |day, hour, value, location: &str| RawObservation {
            location: Some(location.to_string()),
            ..obs("temperature", day, hour, value)
        };
        let mut observations = full_day(1);
        observations.extend(full_day(2));
        observations.extend([
            located(1, 9, 10.0, "seoul"),
            located(1, 15, 14.0, "seoul"),
            located(2, 12, 16.0, "seoul"),
            located(1, 12, 30.0, "busan"),
            obs("temperature", 2, 18, 20.0),
        ]);
        let data = SubjectData {
            observations,
            reports: vec![],
        };
        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        assert_eq!(outcome.foreign_weather, 1);
        let temps: Vec<Option<f64>> = outcome
            .records
            .iter()
            .map(|r| r.value("temperature"))
            .collect();
        assert_eq!(temps, vec![Some(12.0), Some(18.0)]);
    }

    #[test]
    fn under_covered_dates_are_dropped_not_imputed() {
        let catalog = FeatureCatalog::default();
        let mut observations = full_day(1);
        observations.push(obs("steps", 2, 12, 3000.0));
        observations.extend(full_day(3));
        let data = SubjectData {
            observations,
            reports: vec![SelfReport {
                subject_id: "s01".into(),
                date: at(3, 0).date(),
                label: FatigueLabel::Rating(4),
            }],
        };
        let outcome = aggregate_subject(&catalog, "s01", &data, None);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].date, at(2, 0).date());
        assert_eq!(outcome.records[1].label, Some(FatigueLabel::Rating(4)));
        assert_eq!(outcome.records[0].label, None);
    }

    #[test]
    fn range_limits_output_dates() {
        let catalog = FeatureCatalog::default();
        let mut observations = Vec::new();
        for day in 1..=5 {
            observations.extend(full_day(day));
        }
        let data = SubjectData {
            observations,
            reports: vec![],
        };
        let range = DateRange::new(at(2, 0).date(), at(4, 0).date());
        let outcome = aggregate_subject(&catalog, "s01", &data, Some(range));
        let dates: Vec<NaiveDate> = outcome.records.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![at(2, 0).date(), at(3, 0).date(), at(4, 0).date()]);
    }
}
