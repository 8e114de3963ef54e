//! CSV input and output for observations, self-reports and cohort membership.
//!
//! ```text
//! observations.csv  subject_id,timestamp,feature,value,location
//! labels.csv        subject_id,date,label
//! subjects.csv      subject_id,cohort
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::models::{FatigueLabel, RawObservation, SelfReport, SubjectData};

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Deserialize, Serialize)]
struct ObservationRow {
    subject_id: String,
    timestamp: String,
    feature: String,
    value: f64,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct LabelRow {
    subject_id: String,
    date: NaiveDate,
    label: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct MembershipRow {
    subject_id: String,
    cohort: String,
}

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> IngestError + '_ {
    move |source| IngestError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(chrono::NaiveTime::default()))
        })
}

/// Reads raw observations. Values are kept as written, including non-finite
/// ones; range and finiteness checks happen during aggregation.
pub fn read_observations(path: &Path) -> Result<Vec<RawObservation>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
    let mut observations = Vec::new();
    for (idx, result) in reader.deserialize::<ObservationRow>().enumerate() {
        let row = result.map_err(csv_error(path))?;
        let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| IngestError::Row {
            path: path.to_path_buf(),
            line: idx as u64 + 2,
            message: format!("unparseable timestamp '{}'", row.timestamp),
        })?;
        observations.push(RawObservation {
            subject_id: row.subject_id,
            timestamp,
            feature: row.feature,
            value: row.value,
            location: row.location.filter(|location| !location.is_empty()),
        });
    }
    info!(path = %path.display(), rows = observations.len(), "read observations");
    Ok(observations)
}

/// Reads self-reports; blank labels are skipped.
pub fn read_labels(path: &Path) -> Result<Vec<SelfReport>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
    let mut reports = Vec::new();
    let mut blank = 0usize;
    for result in reader.deserialize::<LabelRow>() {
        let row = result.map_err(csv_error(path))?;
        match FatigueLabel::parse(&row.label) {
            Some(label) => reports.push(SelfReport {
                subject_id: row.subject_id,
                date: row.date,
                label,
            }),
            None => blank += 1,
        }
    }
    if blank > 0 {
        warn!(path = %path.display(), blank, "skipped blank labels");
    }
    info!(path = %path.display(), rows = reports.len(), "read labels");
    Ok(reports)
}

/// Subject id to cohort id.
pub fn read_membership(path: &Path) -> Result<BTreeMap<String, String>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
    let mut membership = BTreeMap::new();
    for (idx, result) in reader.deserialize::<MembershipRow>().enumerate() {
        let row = result.map_err(csv_error(path))?;
        if let Some(previous) = membership.insert(row.subject_id.clone(), row.cohort.clone()) {
            if previous != row.cohort {
                return Err(IngestError::Row {
                    path: path.to_path_buf(),
                    line: idx as u64 + 2,
                    message: format!(
                        "subject '{}' listed in cohorts '{previous}' and '{}'",
                        row.subject_id, row.cohort
                    ),
                });
            }
        }
    }
    Ok(membership)
}

/// Groups observations and reports per subject.
pub fn group_by_subject(
    observations: Vec<RawObservation>,
    reports: Vec<SelfReport>,
) -> BTreeMap<String, SubjectData> {
    let mut subjects: BTreeMap<String, SubjectData> = BTreeMap::new();
    for observation in observations {
        subjects
            .entry(observation.subject_id.clone())
            .or_default()
            .observations
            .push(observation);
    }
    for report in reports {
        subjects
            .entry(report.subject_id.clone())
            .or_default()
            .reports
            .push(report);
    }
    subjects
}

/// Keeps the subjects assigned to `cohort`. Without a membership map every
/// subject belongs to it.
pub fn select_cohort(
    subjects: &BTreeMap<String, SubjectData>,
    membership: Option<&BTreeMap<String, String>>,
    cohort: &str,
) -> BTreeMap<String, SubjectData> {
    subjects
        .iter()
        .filter(|(subject_id, _)| {
            membership.map_or(true, |map| map.get(*subject_id).is_some_and(|c| c == cohort))
        })
        .map(|(subject_id, data)| (subject_id.clone(), data.clone()))
        .collect()
}

pub fn write_observations<'a>(
    path: &Path,
    observations: impl IntoIterator<Item = &'a RawObservation>,
) -> Result<usize, IngestError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_error(path))?;
    let mut written = 0;
    for observation in observations {
        writer
            .serialize(ObservationRow {
                subject_id: observation.subject_id.clone(),
                timestamp: observation.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
                feature: observation.feature.clone(),
                value: observation.value,
                location: observation.location.clone(),
            })
            .map_err(csv_error(path))?;
        written += 1;
    }
    writer.flush().map_err(|source| IngestError::Csv {
        path: path.to_path_buf(),
        source: source.into(),
    })?;
    Ok(written)
}

pub fn write_labels<'a>(
    path: &Path,
    reports: impl IntoIterator<Item = &'a SelfReport>,
) -> Result<usize, IngestError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_error(path))?;
    let mut written = 0;
    for report in reports {
        let label = match &report.label {
            FatigueLabel::Rating(rating) => rating.to_string(),
            FatigueLabel::Category(text) => text.clone(),
        };
        writer
            .serialize(LabelRow {
                subject_id: report.subject_id.clone(),
                date: report.date,
                label,
            })
            .map_err(csv_error(path))?;
        written += 1;
    }
    writer.flush().map_err(|source| IngestError::Csv {
        path: path.to_path_buf(),
        source: source.into(),
    })?;
    Ok(written)
}

pub fn write_membership<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<usize, IngestError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_error(path))?;
    let mut written = 0;
    for (subject_id, cohort) in rows {
        writer
            .serialize(MembershipRow {
                subject_id: subject_id.to_string(),
                cohort: cohort.to_string(),
            })
            .map_err(csv_error(path))?;
        written += 1;
    }
    writer.flush().map_err(|source| IngestError::Csv {
        path: path.to_path_buf(),
        source: source.into(),
    })?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FeatureCatalog;
    use crate::synth::{synthetic_cohort, SynthConfig};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn synthetic_cohort_survives_a_csv_roundtrip() {
        let dir = TempDir::new().unwrap();
        let catalog = FeatureCatalog::default();
        let cohort = synthetic_cohort(
            &catalog,
            &SynthConfig {
                subjects: 2,
                days: 3,
                ..SynthConfig::default()
            },
        );
        let observations: Vec<&RawObservation> =
            cohort.values().flat_map(|data| &data.observations).collect();
        let reports: Vec<&SelfReport> = cohort.values().flat_map(|data| &data.reports).collect();

        let obs_path = dir.path().join("observations.csv");
        let label_path = dir.path().join("labels.csv");
        assert_eq!(
            write_observations(&obs_path, observations.iter().copied()).unwrap(),
            observations.len()
        );
        write_labels(&label_path, reports.iter().copied()).unwrap();

        let grouped = group_by_subject(
            read_observations(&obs_path).unwrap(),
            read_labels(&label_path).unwrap(),
        );
        assert_eq!(grouped.len(), 2);
        for (subject_id, data) in &cohort {
            assert_eq!(grouped[subject_id].reports, data.reports);
            assert_eq!(grouped[subject_id].observations.len(), data.observations.len());
            for (read, written) in grouped[subject_id].observations.iter().zip(&data.observations) {
                assert_eq!(read.timestamp, written.timestamp);
                assert_eq!(read.feature, written.feature);
                assert!((read.value - written.value).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn accepts_space_separated_timestamps_and_skips_blank_labels() {
        let dir = TempDir::new().unwrap();
        let obs_path = dir.path().join("obs.csv");
        fs::write(
            &obs_path,
            "subject_id,timestamp,feature,value,location\n\
             u1,2024-05-01 08:30:00,heart_rate_avg,71.5,\n\
             u1,2024-05-01T09:00,temperature,NaN,seoul\n",
        )
        .unwrap();
        let observations = read_observations(&obs_path).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].location, None);
        assert!(observations[1].value.is_nan());
        assert_eq!(observations[1].location.as_deref(), Some("seoul"));

        let label_path = dir.path().join("labels.csv");
        fs::write(&label_path, "subject_id,date,label\nu1,2024-05-01,나쁨\nu1,2024-05-02,\n").unwrap();
        let reports = read_labels(&label_path).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].label, FatigueLabel::Category("나쁨".into()));
    }

    #[test]
    fn bad_timestamps_report_their_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obs.csv");
        fs::write(
            &path,
            "subject_id,timestamp,feature,value,location\n\
             u1,2024-05-01T08:00:00,steps,10,\n\
             u1,yesterday,steps,10,\n",
        )
        .unwrap();
        match read_observations(&path) {
            Err(IngestError::Row { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn membership_selects_cohorts_and_rejects_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subjects.csv");
        write_membership(&path, [("a", "student"), ("b", "worker")]).unwrap();
        let membership = read_membership(&path).unwrap();

        let subjects: BTreeMap<String, SubjectData> = ["a", "b", "c"]
            .into_iter()
            .map(|id| (id.to_string(), SubjectData::default()))
            .collect();
        let students = select_cohort(&subjects, Some(&membership), "student");
        assert_eq!(students.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(select_cohort(&subjects, None, "student").len(), 3);

        fs::write(&path, "subject_id,cohort\na,student\na,worker\n").unwrap();
        assert!(matches!(read_membership(&path), Err(IngestError::Row { line: 3, .. })));
    }
}
