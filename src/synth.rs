//! Deterministic synthetic cohorts for demos and end-to-end tests.
//!
//! Every subject gets a full daily stream of the catalog's biometric and
//! weather features plus a daily self-report whose fatigue level depends on
//! sleep, heart-rate load and a pressure drop, so the learners have signal.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::catalog::FeatureCatalog;
use crate::models::{FatigueLabel, RawObservation, SelfReport, SubjectData};
use crate::training::derive_seed;

const WEATHER_STREAM: u64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    pub subjects: usize,
    pub days: usize,
    pub seed: u64,
    pub start: NaiveDate,
    pub prefix: String,
    /// Intra-day readings for features aggregated from several samples.
    pub readings_per_day: usize,
    /// Share of days without a self-report.
    pub unlabeled_rate: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            subjects: 16,
            days: 60,
            seed: 42,
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap_or_default(),
            prefix: "subj".into(),
            readings_per_day: 4,
            unlabeled_rate: 0.1,
        }
    }
}

/// Per-subject physiology the daily values vary around.
struct Baseline {
    resting_hr: f64,
    hrv: f64,
    sleep_need: f64,
    activity: f64,
}

impl Baseline {
    fn draw(rng: &mut SmallRng) -> Self {
        Self {
            resting_hr: rng.gen_range(55.0..72.0),
            hrv: rng.gen_range(35.0..80.0),
            sleep_need: rng.gen_range(6.5..8.0),
            activity: rng.gen_range(0.6..1.4),
        }
    }
}

struct WeatherDay {
    values: BTreeMap<&'static str, f64>,
    pressure_drop: f64,
}

fn weather_series(config: &SynthConfig) -> Vec<WeatherDay> {
    let mut rng = SmallRng::seed_from_u64(derive_seed(config.seed, &[WEATHER_STREAM]));
    let mut pressure: f64 = 1013.0;
    let mut days = Vec::with_capacity(config.days);
    for day in 0..config.days {
        let season = (day as f64 / 365.0 * std::f64::consts::TAU).sin();
        let previous = pressure;
        pressure = (pressure + rng.gen_range(-6.0..6.0)).clamp(985.0, 1040.0);
        let cloud: f64 = rng.gen_range(0.0..100.0);
        let values = BTreeMap::from([
            ("temperature", 12.0 + 10.0 * season + rng.gen_range(-4.0..4.0)),
            ("humidity", rng.gen_range(30.0..95.0)),
            (
                "precipitation",
                if cloud > 70.0 { rng.gen_range(0.0..25.0) } else { 0.0 },
            ),
            ("wind_speed", rng.gen_range(0.0..12.0)),
            ("pressure", pressure),
            ("cloud_cover", cloud),
            ("uv_index", (8.0 * (1.0 - cloud / 100.0)).max(0.0)),
            ("pm10", rng.gen_range(10.0..120.0)),
        ]);
        days.push(WeatherDay {
            values,
            pressure_drop: (previous - pressure).max(0.0),
        });
    }
    days
}

struct DayDraw {
    values: BTreeMap<String, Vec<f64>>,
    fatigue: f64,
}

fn biometric_day(baseline: &Baseline, weather: &WeatherDay, rng: &mut SmallRng) -> DayDraw {
    let sleep = (baseline.sleep_need + rng.gen_range(-2.5..1.5)).clamp(3.0, 11.0);
    let debt = baseline.sleep_need - sleep;
    let strain: f64 = rng.gen_range(-1.0..1.0);
    let resting = baseline.resting_hr + 3.0 * debt.max(0.0) + 4.0 * strain;
    let hrv = (baseline.hrv - 6.0 * debt - 5.0 * strain).max(5.0);
    let steps = (8_000.0 * baseline.activity * (1.0 - 0.1 * debt) + rng.gen_range(-2_500.0..2_500.0))
        .max(300.0);
    let avg_hr = resting + 12.0 + steps / 2_000.0;

    let fatigue = 0.9 * debt + 0.45 * strain + 0.12 * weather.pressure_drop - 0.03 * (hrv - baseline.hrv)
        + rng.gen_range(-0.4..0.4);

    let mut values = BTreeMap::new();
    values.insert(
        "heart_rate_avg".to_string(),
        vec![avg_hr - 4.0, avg_hr + 1.0, avg_hr + 6.0, avg_hr - 3.0],
    );
    values.insert("heart_rate_min".to_string(), vec![resting - 8.0, resting - 4.0]);
    values.insert("heart_rate_max".to_string(), vec![avg_hr + 40.0, avg_hr + 25.0]);
    values.insert("resting_heart_rate".to_string(), vec![resting]);
    values.insert("hrv_sdnn".to_string(), vec![hrv, hrv + rng.gen_range(-5.0..5.0)]);
    values.insert("steps".to_string(), vec![steps * 0.3, steps * 0.5, steps * 0.2]);
    values.insert("active_calories".to_string(), vec![steps * 0.04]);
    values.insert(
        "exercise_minutes".to_string(),
        vec![(steps / 250.0).min(180.0)],
    );
    values.insert(
        "stand_hours".to_string(),
        vec![(8.0 + baseline.activity * 3.0 - debt).clamp(1.0, 16.0)],
    );
    values.insert("sleep_hours".to_string(), vec![sleep * 0.6, sleep * 0.4]);
    values.insert(
        "sleep_quality".to_string(),
        vec![(75.0 - 8.0 * debt + rng.gen_range(-8.0..8.0)).clamp(0.0, 100.0)],
    );
    DayDraw { values, fatigue }
}

fn rating_for(fatigue: f64) -> u8 {
    (3.0 + fatigue).round().clamp(1.0, 5.0) as u8
}

fn category_for(rating: u8, rng: &mut SmallRng) -> String {
    let (korean, english) = match rating {
        1 | 2 => ("좋음", "low"),
        3 => ("보통", "medium"),
        _ => ("나쁨", "high"),
    };
    let label = if rng.gen_bool(0.5) { korean } else { english };
    label.to_string()
}

/// Spreads `readings` evenly over the waking hours of `date`.
fn reading_times(date: NaiveDate, readings: usize) -> Vec<NaiveDateTime> {
    let midnight = date.and_time(NaiveTime::default());
    let step = 14 * 60 / readings.max(1) as i64;
    (0..readings.max(1) as i64)
        .map(|i| midnight + Duration::hours(7) + Duration::minutes(i * step))
        .collect()
}

/// Generates one cohort keyed by subject id.
///
/// Only features the catalog declares are emitted. The same config always
/// yields the same observations and labels.
pub fn synthetic_cohort(
    catalog: &FeatureCatalog,
    config: &SynthConfig,
) -> BTreeMap<String, SubjectData> {
    let weather = weather_series(config);
    let mut cohort = BTreeMap::new();

    for subject in 0..config.subjects {
        let subject_id = format!("{}{:03}", config.prefix, subject + 1);
        let mut rng =
            SmallRng::seed_from_u64(derive_seed(config.seed, &[subject as u64 + 1]));
        let baseline = Baseline::draw(&mut rng);
        let mut data = SubjectData::default();

        for (offset, weather_day) in weather.iter().enumerate() {
            let date = config.start + Duration::days(offset as i64);
            let draw = biometric_day(&baseline, weather_day, &mut rng);

            for feature in &catalog.biometric {
                let Some(samples) = draw.values.get(&feature.name) else {
                    continue;
                };
                let times = reading_times(date, samples.len());
                for (timestamp, value) in times.into_iter().zip(samples) {
                    data.observations.push(RawObservation {
                        subject_id: subject_id.clone(),
                        timestamp,
                        feature: feature.name.clone(),
                        value: feature.range.min.max(value.min(feature.range.max)),
                        location: None,
                    });
                }
            }
            for feature in &catalog.weather {
                let Some(&mean) = weather_day.values.get(feature.name.as_str()) else {
                    continue;
                };
                let times = reading_times(date, config.readings_per_day);
                let count = times.len();
                for (i, timestamp) in times.into_iter().enumerate() {
                    // Symmetric intra-day swing keeps the daily mean exact.
                    let swing = if count > 1 {
                        (i as f64 / (count - 1) as f64 - 0.5) * 0.02 * mean.abs()
                    } else {
                        0.0
                    };
                    let value = feature.range.min.max((mean + swing).min(feature.range.max));
                    data.observations.push(RawObservation {
                        subject_id: subject_id.clone(),
                        timestamp,
                        feature: feature.name.clone(),
                        value,
                        location: Some("synthetic".into()),
                    });
                }
            }

            if rng.gen_bool(config.unlabeled_rate.clamp(0.0, 1.0)) {
                continue;
            }
            let rating = rating_for(draw.fatigue);
            let label = if rng.gen_bool(0.2) {
                FatigueLabel::Category(category_for(rating, &mut rng))
            } else {
                FatigueLabel::Rating(rating)
            };
            data.reports.push(SelfReport {
                subject_id: subject_id.clone(),
                date,
                label,
            });
        }
        cohort.insert(subject_id, data);
    }
    cohort
}
