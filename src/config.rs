//! TOML pipeline configuration.
//!
//! Every key is optional; missing keys fall back to the defaults below and
//! CLI flags override whatever the file says.
//!
//! ```toml
//! cohorts = ["student", "worker", "general"]
//! store_dir = "model_store"
//!
//! [features]
//! window_days = 7
//! lags = [0, 1, 3, 7]
//! min_coverage = 0.8
//!
//! [training]
//! n_iter = 50
//! seed = 42
//! scoring = "macro_f1"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{FeatureCatalog, DEFAULT_LAGS, DEFAULT_WINDOW_DAYS};
use crate::error::ConfigError;
use crate::metrics::ScoringMetric;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_window_days")]
    pub window_days: usize,
    #[serde(default = "default_lags")]
    pub lags: Vec<u32>,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_n_iter")]
    pub n_iter: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub scoring: ScoringMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_cohorts")]
    pub cohorts: Vec<String>,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

fn default_window_days() -> usize {
    DEFAULT_WINDOW_DAYS
}

fn default_lags() -> Vec<u32> {
    DEFAULT_LAGS.to_vec()
}

fn default_min_coverage() -> f64 {
    0.8
}

fn default_n_iter() -> usize {
    50
}

fn default_seed() -> u64 {
    42
}

fn default_cohorts() -> Vec<String> {
    vec!["student".into(), "worker".into(), "general".into()]
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("model_store")
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            lags: default_lags(),
            min_coverage: default_min_coverage(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_iter: default_n_iter(),
            seed: default_seed(),
            scoring: ScoringMetric::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cohorts: default_cohorts(),
            store_dir: default_store_dir(),
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// The default catalog with this configuration's window, lags and coverage.
    pub fn catalog(&self) -> Result<FeatureCatalog, ConfigError> {
        let catalog = FeatureCatalog {
            window_days: self.features.window_days,
            lags: self.features.lags.clone(),
            min_coverage: self.features.min_coverage,
            ..FeatureCatalog::default()
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.training.n_iter == 0 {
            return Err(ConfigError::InvalidValue {
                key: "training.n_iter".into(),
                message: "at least one search iteration is required".into(),
            });
        }
        if self.cohorts.iter().any(|cohort| !is_valid_cohort(cohort)) {
            return Err(ConfigError::InvalidValue {
                key: "cohorts".into(),
                message: format!("{:?} contains an invalid identifier", self.cohorts),
            });
        }
        self.catalog().map(|_| ())
    }

    pub fn knows_cohort(&self, cohort: &str) -> bool {
        self.cohorts.iter().any(|known| known == cohort)
    }

    /// The cohorts a training run covers: the requested one, checked as a
    /// store identifier, or every configured cohort.
    pub fn resolve_cohorts(&self, requested: Option<&str>) -> Result<Vec<String>, ConfigError> {
        match requested {
            None => Ok(self.cohorts.clone()),
            Some(cohort) if !is_valid_cohort(cohort) => Err(ConfigError::InvalidValue {
                key: "cohort".into(),
                message: format!("'{cohort}' must be ASCII letters, digits, '-' or '_'"),
            }),
            Some(cohort) => {
                if !self.knows_cohort(cohort) {
                    warn!(%cohort, configured = ?self.cohorts, "training a cohort missing from the configuration");
                }
                Ok(vec![cohort.to_string()])
            }
        }
    }
}

/// Cohort ids name store directories: ASCII alphanumerics, `-` and `_`.
pub fn is_valid_cohort(cohort: &str) -> bool {
    !cohort.is_empty()
        && cohort
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
