//! Cohort-level fatigue forecasting from wearable biometrics and weather.
//!
//! Raw observations are resampled into daily records ([`aggregate`]),
//! expanded into fixed-width vectors ([`features`]), and trained per cohort
//! with leave-one-subject-out validation ([`training`]). The resulting bundle
//! is persisted ([`store`]) and served ([`inference`]).

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod cv;
pub mod db;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod inference;
pub mod ingest;
pub mod learners;
pub mod metrics;
pub mod models;
pub mod report;
pub mod scaler;
pub mod store;
pub mod synth;
pub mod training;
