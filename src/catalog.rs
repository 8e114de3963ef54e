//! Feature catalog: the declared feature set, its daily aggregation rules,
//! the weather-lag expansion and the target-class mapping.
//!
//! A catalog is an explicit value handed to every stage. Its slot order is
//! the contract between training and inference; [`FeatureCatalog::fingerprint`]
//! identifies it inside persisted bundles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::models::FatigueLabel;

pub const DEFAULT_WINDOW_DAYS: usize = 7;
pub const DEFAULT_LAGS: [u32; 4] = [0, 1, 3, 7];
pub const CLASS_COUNT: usize = 3;

/// How the day's samples of a feature collapse into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Sum,
    Min,
    Max,
    /// Most recent sample of the day.
    Latest,
}

/// Bounded gap filling applied after daily aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "days")]
pub enum FillPolicy {
    None,
    Forward(u32),
    ForwardBackward(u32),
}

/// The single daily-representative weather reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyReading {
    DailyMean,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Which window slots a biometric feature emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSlots {
    pub raw: bool,
    pub mean: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricFeature {
    pub name: String,
    pub aggregation: Aggregation,
    pub fill: FillPolicy,
    pub range: ValueRange,
    pub slots: WindowSlots,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherFeature {
    pub name: String,
    pub reading: DailyReading,
    pub fill: FillPolicy,
    pub range: ValueRange,
}

/// One column of the feature vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Raw { feature: String },
    WindowMean { feature: String },
    WeatherLag { feature: String, lag: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub kind: SlotKind,
}

/// Many-to-one mapping from self-reports onto the three ordinal classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMapping {
    pub ratings: BTreeMap<u8, usize>,
    pub categories: BTreeMap<String, usize>,
    pub class_labels: Vec<String>,
}

impl Default for TargetMapping {
    fn default() -> Self {
        let ratings = BTreeMap::from([(1, 0), (2, 0), (3, 1), (4, 2), (5, 2)]);
        let categories = [
            ("좋음", 0),
            ("low", 0),
            ("good", 0),
            ("보통", 1),
            ("medium", 1),
            ("normal", 1),
            ("나쁨", 2),
            ("high", 2),
            ("bad", 2),
        ]
        .into_iter()
        .map(|(label, class)| (label.to_string(), class))
        .collect();
        Self {
            ratings,
            categories,
            class_labels: vec!["Low".into(), "Medium".into(), "High".into()],
        }
    }
}

impl TargetMapping {
    pub fn map(&self, label: &FatigueLabel) -> Option<usize> {
        match label {
            FatigueLabel::Rating(rating) => self.ratings.get(rating).copied(),
            FatigueLabel::Category(text) => {
                self.categories.get(&text.trim().to_lowercase()).copied()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCatalog {
    pub version: u32,
    pub window_days: usize,
    pub lags: Vec<u32>,
    pub min_coverage: f64,
    pub biometric: Vec<BiometricFeature>,
    pub weather: Vec<WeatherFeature>,
    pub target: TargetMapping,
}

fn biometric(
    name: &str,
    aggregation: Aggregation,
    fill: FillPolicy,
    range: ValueRange,
    raw: bool,
    mean: bool,
) -> BiometricFeature {
    BiometricFeature {
        name: name.to_string(),
        aggregation,
        fill,
        range,
        slots: WindowSlots { raw, mean },
    }
}

fn weather(name: &str, range: ValueRange) -> WeatherFeature {
    WeatherFeature {
        name: name.to_string(),
        reading: DailyReading::DailyMean,
        fill: FillPolicy::ForwardBackward(1),
        range,
    }
}

impl Default for FeatureCatalog {
    fn default() -> Self {
        use Aggregation::*;
        let none = FillPolicy::None;
        Self {
            version: 1,
            window_days: DEFAULT_WINDOW_DAYS,
            lags: DEFAULT_LAGS.to_vec(),
            min_coverage: 0.8,
            biometric: vec![
                biometric("heart_rate_avg", Mean, none, ValueRange::new(20.0, 250.0), true, true),
                biometric("heart_rate_min", Min, none, ValueRange::new(20.0, 250.0), true, false),
                biometric("heart_rate_max", Max, none, ValueRange::new(20.0, 250.0), true, false),
                biometric("resting_heart_rate", Mean, none, ValueRange::new(20.0, 200.0), false, true),
                biometric("hrv_sdnn", Mean, none, ValueRange::new(0.0, 500.0), true, true),
                biometric("steps", Sum, none, ValueRange::new(0.0, 100_000.0), true, true),
                biometric("active_calories", Sum, none, ValueRange::new(0.0, 10_000.0), false, true),
                biometric("exercise_minutes", Sum, none, ValueRange::new(0.0, 1_440.0), false, true),
                biometric("stand_hours", Sum, none, ValueRange::new(0.0, 24.0), true, false),
                biometric("sleep_hours", Sum, none, ValueRange::new(0.0, 24.0), true, true),
                biometric(
                    "sleep_quality",
                    Latest,
                    FillPolicy::Forward(1),
                    ValueRange::new(0.0, 100.0),
                    true,
                    true,
                ),
            ],
            weather: vec![
                weather("temperature", ValueRange::new(-60.0, 60.0)),
                weather("humidity", ValueRange::new(0.0, 100.0)),
                weather("precipitation", ValueRange::new(0.0, 500.0)),
                weather("wind_speed", ValueRange::new(0.0, 100.0)),
                weather("pressure", ValueRange::new(850.0, 1_100.0)),
                weather("cloud_cover", ValueRange::new(0.0, 100.0)),
                weather("uv_index", ValueRange::new(0.0, 20.0)),
                weather("pm10", ValueRange::new(0.0, 1_000.0)),
            ],
            target: TargetMapping::default(),
        }
    }
}

impl FeatureCatalog {
    /// Ordered slot list: biometric raw/mean slots, then weather × lag.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for feature in &self.biometric {
            if feature.slots.raw {
                slots.push(Slot {
                    name: feature.name.clone(),
                    kind: SlotKind::Raw {
                        feature: feature.name.clone(),
                    },
                });
            }
            if feature.slots.mean {
                slots.push(Slot {
                    name: format!("{}_mean{}", feature.name, self.window_days),
                    kind: SlotKind::WindowMean {
                        feature: feature.name.clone(),
                    },
                });
            }
        }
        for feature in &self.weather {
            for &lag in &self.lags {
                slots.push(Slot {
                    name: format!("{}_lag{}", feature.name, lag),
                    kind: SlotKind::WeatherLag {
                        feature: feature.name.clone(),
                        lag,
                    },
                });
            }
        }
        slots
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.slots().into_iter().map(|slot| slot.name).collect()
    }

    pub fn width(&self) -> usize {
        self.slots().len()
    }

    /// SHA-256 over the catalog version and the ordered slot names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for name in self.slot_names() {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn biometric_feature(&self, name: &str) -> Option<&BiometricFeature> {
        self.biometric.iter().find(|feature| feature.name == name)
    }

    pub fn weather_feature(&self, name: &str) -> Option<&WeatherFeature> {
        self.weather.iter().find(|feature| feature.name == name)
    }

    pub fn range_for(&self, name: &str) -> Option<ValueRange> {
        self.biometric_feature(name)
            .map(|feature| feature.range)
            .or_else(|| self.weather_feature(name).map(|feature| feature.range))
    }

    /// Weather values are reduced by their declared reading, biometrics by their aggregation.
    pub fn aggregation_for(&self, name: &str) -> Option<Aggregation> {
        if let Some(feature) = self.biometric_feature(name) {
            return Some(feature.aggregation);
        }
        self.weather_feature(name).map(|feature| match feature.reading {
            DailyReading::DailyMean => Aggregation::Mean,
        })
    }

    pub fn fill_for(&self, name: &str) -> FillPolicy {
        self.biometric_feature(name)
            .map(|feature| feature.fill)
            .or_else(|| self.weather_feature(name).map(|feature| feature.fill))
            .unwrap_or(FillPolicy::None)
    }

    pub fn map_label(&self, label: &FatigueLabel) -> Option<usize> {
        self.target.map(label)
    }

    pub fn class_labels(&self) -> &[String] {
        &self.target.class_labels
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        if self.window_days == 0 {
            return Err(invalid("window_days", "must be at least 1".into()));
        }
        if self.biometric.is_empty() {
            return Err(invalid("biometric", "no biometric features declared".into()));
        }
        if !(0.0..=1.0).contains(&self.min_coverage) {
            return Err(invalid("min_coverage", format!("{} is not a fraction", self.min_coverage)));
        }
        let distinct: BTreeSet<u32> = self.lags.iter().copied().collect();
        if distinct.len() != self.lags.len() || !self.lags.windows(2).all(|w| w[0] < w[1]) {
            return Err(invalid("lags", format!("{:?} must be strictly increasing", self.lags)));
        }
        let mut names = BTreeSet::new();
        for name in self
            .biometric
            .iter()
            .map(|f| &f.name)
            .chain(self.weather.iter().map(|f| &f.name))
        {
            if !names.insert(name.as_str()) {
                return Err(invalid("features", format!("'{name}' declared twice")));
            }
        }
        if self.target.class_labels.len() != CLASS_COUNT {
            return Err(invalid(
                "class_labels",
                format!("expected {CLASS_COUNT} labels, found {}", self.target.class_labels.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_48_slots_biometric_first() {
        let catalog = FeatureCatalog::default();
        let names = catalog.slot_names();
        assert_eq!(names.len(), 48);
        assert_eq!(names[0], "heart_rate_avg");
        assert_eq!(names[1], "heart_rate_avg_mean7");
        assert_eq!(names[16], "temperature_lag0");
        assert_eq!(names[19], "temperature_lag7");
        assert_eq!(names[47], "pm10_lag7");
        assert!(catalog.validate().is_ok());
    }

    #[test]
    fn fingerprint_tracks_slot_order() {
        let catalog = FeatureCatalog::default();
        let mut reordered = catalog.clone();
        reordered.weather.swap(0, 1);
        assert_ne!(catalog.fingerprint(), reordered.fingerprint());
        assert_eq!(catalog.fingerprint(), FeatureCatalog::default().fingerprint());
    }

    #[test]
    fn ratings_and_text_labels_map_to_three_classes() {
        let catalog = FeatureCatalog::default();
        let expected = [(1, 0), (2, 0), (3, 1), (4, 2), (5, 2)];
        for (rating, class) in expected {
            assert_eq!(catalog.map_label(&FatigueLabel::Rating(rating)), Some(class));
        }
        assert_eq!(catalog.map_label(&FatigueLabel::Rating(6)), None);
        assert_eq!(catalog.map_label(&FatigueLabel::Category("나쁨".into())), Some(2));
        assert_eq!(catalog.map_label(&FatigueLabel::Category("Medium".into())), Some(1));
        assert_eq!(catalog.map_label(&FatigueLabel::Category("tired".into())), None);
    }

    #[test]
    fn validate_rejects_unsorted_lags() {
        let catalog = FeatureCatalog {
            lags: vec![0, 3, 1],
            ..FeatureCatalog::default()
        };
        assert!(matches!(
            catalog.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "lags"
        ));
    }
}
