//! Error taxonomy for the fatigue pipeline.
//!
//! Per-observation and per-sample errors are recovered locally by the stage
//! that raises them (dropped, counted, logged). Whole-run errors carry the
//! cohort, seed and stage so a failed run can be reproduced.

use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a raw observation was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DataQualityIssue {
    NonFinite,
    OutOfRange { min: f64, max: f64 },
    Malformed { detail: String },
}

impl fmt::Display for DataQualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinite => write!(f, "value is not finite"),
            Self::OutOfRange { min, max } => write!(f, "outside physical range [{min}, {max}]"),
            Self::Malformed { detail } => write!(f, "malformed: {detail}"),
        }
    }
}

/// A malformed or physically impossible raw observation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("data quality error for subject '{subject_id}' at {timestamp} ({feature} = {value}): {issue}")]
pub struct DataQualityError {
    pub subject_id: String,
    pub timestamp: NaiveDateTime,
    pub feature: String,
    pub value: f64,
    pub issue: DataQualityIssue,
}

/// Reason a (subject, date) produced no feature vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HistoryGap {
    MissingWindowDay { date: NaiveDate },
    MissingFeature { feature: String, date: NaiveDate },
    MissingLag { feature: String, lag: u32 },
    NonFinite { slot: String },
}

impl fmt::Display for HistoryGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingWindowDay { date } => write!(f, "no daily record for window day {date}"),
            Self::MissingFeature { feature, date } => write!(f, "'{feature}' missing on {date}"),
            Self::MissingLag { feature, lag } => write!(f, "'{feature}' missing at lag {lag}d"),
            Self::NonFinite { slot } => write!(f, "slot '{slot}' is not finite"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("insufficient history for subject '{subject_id}' on {date}: {gap}")]
pub struct InsufficientHistory {
    pub subject_id: String,
    pub date: NaiveDate,
    pub gap: HistoryGap,
}

/// A single fit that did not produce a usable model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvergenceError {
    #[error("training partition is empty")]
    EmptyPartition,
    #[error("label {label} is outside the {classes}-class target space")]
    InvalidLabel { label: usize, classes: usize },
    #[error("non-finite {quantity} after {iteration} iterations")]
    NonFinite { quantity: &'static str, iteration: usize },
    #[error("{0}")]
    Degenerate(String),
}

/// Pipeline stage that failed a whole cohort run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    Dataset,
    Search,
    Evaluation,
    Refit,
    Persist,
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dataset => "dataset",
            Self::Search => "search",
            Self::Evaluation => "evaluation",
            Self::Refit => "refit",
            Self::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("training failed for cohort '{cohort}' (seed {seed}, stage {stage}): {reason}")]
pub struct CohortTrainingFailure {
    pub cohort: String,
    pub seed: u64,
    pub stage: TrainingStage,
    pub reason: String,
}

/// An inference request that does not match the trained feature contract.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("feature vector has {actual} values but the model expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("feature at position {position} is '{found}' but the model expects '{expected}'")]
    OrderMismatch {
        position: usize,
        expected: String,
        found: String,
    },
    #[error("feature '{name}' at position {position} is not finite")]
    NonFinite { position: usize, name: String },
}

#[derive(Error, Debug)]
pub enum ArtifactStoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize bundle at {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no bundle stored for cohort '{0}'")]
    NotFound(String),
    #[error("invalid cohort identifier '{0}'")]
    InvalidCohort(String),
    #[error("stale bundle for cohort '{cohort}': {reason}")]
    Stale { cohort: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("line {line} of {path}: {message}")]
    Row {
        path: PathBuf,
        line: u64,
        message: String,
    },
}

/// Umbrella error for library entry points.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Training(#[from] CohortTrainingFailure),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error(transparent)]
    Store(#[from] ArtifactStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
