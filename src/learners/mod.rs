//! Base learners behind a common probabilistic classifier interface.
//!
//! Every family exposes `fit` and `predict_proba`; the soft-voting combiner
//! and the search loop only ever talk to [`Classifier`].

mod boosting;
mod forest;
mod logistic;
mod tree;

pub use boosting::{BoostingParams, GradientBoosting};
pub use forest::{ForestParams, RandomForest};
pub use logistic::{LogisticParams, LogisticRegression};

use std::fmt;

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConvergenceError;

pub trait Classifier {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError>;

    /// One row per sample, one column per class; rows sum to 1.
    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    LogisticRegression,
    RandomForest,
    GradientBoosting,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [
        ModelFamily::LogisticRegression,
        ModelFamily::RandomForest,
        ModelFamily::GradientBoosting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::LogisticRegression => "logistic_regression",
            Self::RandomForest => "random_forest",
            Self::GradientBoosting => "gradient_boosting",
        }
    }

    /// Draws one configuration from the family's declared search space.
    pub fn sample(&self, rng: &mut SmallRng) -> HyperParams {
        match self {
            Self::LogisticRegression => HyperParams::Logistic(LogisticParams {
                learning_rate: log_uniform(rng, 0.01, 0.5),
                l2: log_uniform(rng, 1e-4, 1.0),
                epochs: rng.gen_range(100..=400),
            }),
            Self::RandomForest => HyperParams::Forest(ForestParams {
                n_estimators: rng.gen_range(10..=60),
                max_depth: rng.gen_range(3..=8),
                min_samples_leaf: rng.gen_range(1..=8),
            }),
            Self::GradientBoosting => HyperParams::Boosting(BoostingParams {
                n_estimators: rng.gen_range(10..=60),
                learning_rate: log_uniform(rng, 0.03, 0.3),
                max_depth: rng.gen_range(1..=3),
                subsample: rng.gen_range(0.6..=1.0),
            }),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn log_uniform(rng: &mut SmallRng, low: f64, high: f64) -> f64 {
    rng.gen_range(low.ln()..=high.ln()).exp()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "family")]
pub enum HyperParams {
    Logistic(LogisticParams),
    Forest(ForestParams),
    Boosting(BoostingParams),
}

impl HyperParams {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Logistic(_) => ModelFamily::LogisticRegression,
            Self::Forest(_) => ModelFamily::RandomForest,
            Self::Boosting(_) => ModelFamily::GradientBoosting,
        }
    }

    /// An unfitted model for this configuration.
    pub fn build(&self, classes: usize, seed: u64) -> FittedModel {
        match self {
            Self::Logistic(params) => {
                FittedModel::Logistic(LogisticRegression::new(params.clone(), classes))
            }
            Self::Forest(params) => {
                FittedModel::Forest(RandomForest::new(params.clone(), classes, seed))
            }
            Self::Boosting(params) => {
                FittedModel::Boosting(GradientBoosting::new(params.clone(), classes, seed))
            }
        }
    }
}

/// Serializable union of the concrete families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "family")]
pub enum FittedModel {
    Logistic(LogisticRegression),
    Forest(RandomForest),
    Boosting(GradientBoosting),
}

impl FittedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Logistic(_) => ModelFamily::LogisticRegression,
            Self::Forest(_) => ModelFamily::RandomForest,
            Self::Boosting(_) => ModelFamily::GradientBoosting,
        }
    }
}

impl Classifier for FittedModel {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError> {
        match self {
            Self::Logistic(model) => model.fit(x, y),
            Self::Forest(model) => model.fit(x, y),
            Self::Boosting(model) => model.fit(x, y),
        }
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        match self {
            Self::Logistic(model) => model.predict_proba(x),
            Self::Forest(model) => model.predict_proba(x),
            Self::Boosting(model) => model.predict_proba(x),
        }
    }
}

pub(crate) fn check_training_input(
    x: ArrayView2<'_, f64>,
    y: &[usize],
    classes: usize,
) -> Result<(), ConvergenceError> {
    if x.nrows() == 0 || y.is_empty() {
        return Err(ConvergenceError::EmptyPartition);
    }
    if x.nrows() != y.len() {
        return Err(ConvergenceError::Degenerate(format!(
            "{} rows but {} labels",
            x.nrows(),
            y.len()
        )));
    }
    if let Some(&label) = y.iter().find(|&&label| label >= classes) {
        return Err(ConvergenceError::InvalidLabel { label, classes });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ConvergenceError::NonFinite {
            quantity: "input",
            iteration: 0,
        });
    }
    Ok(())
}

/// Row-wise softmax in place, shifted by the row max for stability.
pub(crate) fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
}

/// One-hot encoding of class labels.
pub(crate) fn one_hot(y: &[usize], classes: usize) -> Array2<f64> {
    let mut encoded = Array2::zeros((y.len(), classes));
    for (row, &label) in y.iter().enumerate() {
        encoded[[row, label]] = 1.0;
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    /// Three tight clusters placed 120 degrees apart on a circle.
    pub(crate) fn toy_problem() -> (Array2<f64>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for class in 0..3 {
            let angle = class as f64 * 2.0 * std::f64::consts::PI / 3.0;
            for i in 0..20 {
                rows.push([
                    3.0 * angle.cos() + 0.3 * (i as f64 * 0.37).sin(),
                    3.0 * angle.sin() + 0.3 * (i as f64 * 0.53).cos(),
                ]);
                y.push(class);
            }
        }
        let x = Array2::from_shape_fn((rows.len(), 2), |(r, c)| rows[r][c]);
        (x, y)
    }

    #[test]
    fn every_family_learns_separable_classes() {
        let (x, y) = toy_problem();
        let mut rng = SmallRng::seed_from_u64(7);
        for family in ModelFamily::ALL {
            let params = family.sample(&mut rng);
            assert_eq!(params.family(), family);
            let mut model = params.build(3, 11);
            model.fit(x.view(), &y).unwrap();
            let proba = model.predict_proba(x.view());
            assert_eq!(proba.dim(), (60, 3));
            let mut hits = 0;
            for (row, &label) in proba.axis_iter(Axis(0)).zip(&y) {
                assert!((row.sum() - 1.0).abs() < 1e-9, "{family} rows must sum to 1");
                let best = (0..3).fold(0, |b, k| if row[k] > row[b] { k } else { b });
                hits += usize::from(best == label);
            }
            assert!(hits >= 54, "{family} only classified {hits}/60");
        }
    }

    #[test]
    fn sampling_is_deterministic_for_a_seed() {
        let mut a = SmallRng::seed_from_u64(42);
        let mut b = SmallRng::seed_from_u64(42);
        for family in ModelFamily::ALL {
            assert_eq!(family.sample(&mut a), family.sample(&mut b));
        }
    }

    #[test]
    fn invalid_inputs_are_convergence_errors() {
        let x = array![[1.0, 2.0]];
        let mut model = HyperParams::Logistic(LogisticParams {
            learning_rate: 0.1,
            l2: 0.01,
            epochs: 10,
        })
        .build(3, 0);
        assert_eq!(
            model.fit(x.view(), &[5]),
            Err(ConvergenceError::InvalidLabel { label: 5, classes: 3 })
        );
        assert_eq!(
            model.fit(x.slice(ndarray::s![0..0, ..]), &[]),
            Err(ConvergenceError::EmptyPartition)
        );
        let bad = array![[f64::NAN, 0.0]];
        assert!(matches!(
            model.fit(bad.view(), &[0]),
            Err(ConvergenceError::NonFinite { .. })
        ));
    }
}
