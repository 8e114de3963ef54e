use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{PgPool, Row};

use crate::aggregate::DateRange;
use crate::models::{FatigueLabel, RawObservation, SelfReport};

// The schema is owned by the collection service; these queries only read.

fn observation_query(cohort: bool, range: bool) -> String {
    let mut query = String::from(
        "SELECT o.subject_id, o.observed_at, o.feature, o.value, o.location \
         FROM fatigue.observations o \
         JOIN fatigue.subjects s ON s.subject_id = o.subject_id \
         WHERE TRUE",
    );
    let mut param = 1;
    if cohort {
        query.push_str(&format!(" AND s.cohort = ${param}"));
        param += 1;
    }
    if range {
        query.push_str(&format!(
            " AND o.observed_at::date BETWEEN ${} AND ${}",
            param,
            param + 1
        ));
    }
    query.push_str(" ORDER BY o.subject_id, o.observed_at");
    query
}

fn report_query(cohort: bool, range: bool) -> String {
    let mut query = String::from(
        "SELECT r.subject_id, r.report_date, r.label \
         FROM fatigue.self_reports r \
         JOIN fatigue.subjects s ON s.subject_id = r.subject_id \
         WHERE TRUE",
    );
    let mut param = 1;
    if cohort {
        query.push_str(&format!(" AND s.cohort = ${param}"));
        param += 1;
    }
    if range {
        query.push_str(&format!(
            " AND r.report_date BETWEEN ${} AND ${}",
            param,
            param + 1
        ));
    }
    query.push_str(" ORDER BY r.subject_id, r.report_date");
    query
}

pub async fn fetch_observations(
    pool: &PgPool,
    cohort: Option<&str>,
    range: Option<DateRange>,
) -> anyhow::Result<Vec<RawObservation>> {
    let query = observation_query(cohort.is_some(), range.is_some());
    let mut rows = sqlx::query(&query);
    if let Some(value) = cohort {
        rows = rows.bind(value);
    }
    if let Some(range) = range {
        rows = rows.bind(range.start).bind(range.end);
    }

    let records = rows.fetch_all(pool).await?;
    let mut observations = Vec::with_capacity(records.len());
    for row in records {
        let timestamp: NaiveDateTime = row.get("observed_at");
        observations.push(RawObservation {
            subject_id: row.get("subject_id"),
            timestamp,
            feature: row.get("feature"),
            value: row.get("value"),
            location: row.get("location"),
        });
    }
    Ok(observations)
}

/// Self-reports; rows with a blank label are skipped.
pub async fn fetch_reports(
    pool: &PgPool,
    cohort: Option<&str>,
    range: Option<DateRange>,
) -> anyhow::Result<Vec<SelfReport>> {
    let query = report_query(cohort.is_some(), range.is_some());
    let mut rows = sqlx::query(&query);
    if let Some(value) = cohort {
        rows = rows.bind(value);
    }
    if let Some(range) = range {
        rows = rows.bind(range.start).bind(range.end);
    }

    let records = rows.fetch_all(pool).await?;
    let mut reports = Vec::with_capacity(records.len());
    for row in records {
        let raw: String = row.get("label");
        let date: NaiveDate = row.get("report_date");
        if let Some(label) = FatigueLabel::parse(&raw) {
            reports.push(SelfReport {
                subject_id: row.get("subject_id"),
                date,
                label,
            });
        }
    }
    Ok(reports)
}

/// Subject id to cohort id for every registered subject.
pub async fn fetch_membership(pool: &PgPool) -> anyhow::Result<BTreeMap<String, String>> {
    let records = sqlx::query("SELECT subject_id, cohort FROM fatigue.subjects")
        .fetch_all(pool)
        .await?;
    Ok(records
        .into_iter()
        .map(|row| (row.get("subject_id"), row.get("cohort")))
        .collect())
}
