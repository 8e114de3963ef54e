use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::tree::{grow, GrowConfig, Newton, Presorted, Tree};
use super::{check_training_input, one_hot, softmax_rows, Classifier};
use crate::error::ConvergenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    /// Fraction of rows drawn without replacement for each round.
    pub subsample: f64,
}

/// Multi-class gradient boosting on the softmax loss: one regression tree
/// per class per round, Newton-step leaves, shrunk by the learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    params: BoostingParams,
    classes: usize,
    seed: u64,
    init: Vec<f64>,
    rounds: Vec<Vec<Tree>>,
}

impl GradientBoosting {
    pub fn new(params: BoostingParams, classes: usize, seed: u64) -> Self {
        Self {
            params,
            classes,
            seed,
            init: vec![0.0; classes],
            rounds: Vec::new(),
        }
    }

    fn raw_scores(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut scores = Array2::zeros((x.nrows(), self.classes));
        for (row, mut out) in x.axis_iter(Axis(0)).zip(scores.axis_iter_mut(Axis(0))) {
            for k in 0..self.classes {
                out[k] = self.init[k];
            }
            for trees in &self.rounds {
                for (k, tree) in trees.iter().enumerate() {
                    out[k] += self.params.learning_rate * tree.leaf_value(row)[0];
                }
            }
        }
        scores
    }
}

impl Classifier for GradientBoosting {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError> {
        check_training_input(x, y, self.classes)?;
        if !(self.params.subsample > 0.0 && self.params.subsample <= 1.0) {
            return Err(ConvergenceError::Degenerate(format!(
                "subsample {} outside (0, 1]",
                self.params.subsample
            )));
        }
        let rows = x.nrows();
        let k_classes = self.classes;
        let targets = one_hot(y, k_classes);

        // Smoothed log priors as the starting score.
        let mut counts = vec![1.0; k_classes];
        for &label in y {
            counts[label] += 1.0;
        }
        let total: f64 = counts.iter().sum();
        self.init = counts.iter().map(|c| (c / total).ln()).collect();
        self.rounds.clear();

        let mut scores = Array2::from_shape_fn((rows, k_classes), |(_, k)| self.init[k]);
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let presorted = Presorted::new(x);
        let config = GrowConfig {
            max_depth: self.params.max_depth,
            min_samples_leaf: 1,
            max_features: None,
        };
        let drawn = ((self.params.subsample * rows as f64).round() as usize).clamp(1, rows);
        let shrink = (k_classes as f64 - 1.0) / k_classes as f64;

        for round in 0..self.params.n_estimators {
            let mut proba = scores.clone();
            softmax_rows(&mut proba);

            let mut weights = vec![0.0; rows];
            if drawn == rows {
                weights.fill(1.0);
            } else {
                for row in index::sample(&mut rng, rows, drawn) {
                    weights[row] = 1.0;
                }
            }

            let mut trees = Vec::with_capacity(k_classes);
            for k in 0..k_classes {
                let gradients: Vec<f64> = (0..rows).map(|i| targets[[i, k]] - proba[[i, k]]).collect();
                let hessians: Vec<f64> = (0..rows)
                    .map(|i| proba[[i, k]] * (1.0 - proba[[i, k]]))
                    .collect();
                let criterion = Newton {
                    gradients: &gradients,
                    hessians: &hessians,
                    shrink,
                };
                let tree = grow(x, &presorted, &weights, &criterion, config, &mut rng);
                for (i, row) in x.axis_iter(Axis(0)).enumerate() {
                    scores[[i, k]] += self.params.learning_rate * tree.leaf_value(row)[0];
                }
                trees.push(tree);
            }
            self.rounds.push(trees);

            if scores.iter().any(|v| !v.is_finite()) {
                return Err(ConvergenceError::NonFinite {
                    quantity: "scores",
                    iteration: round + 1,
                });
            }
        }
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut proba = self.raw_scores(x);
        softmax_rows(&mut proba);
        proba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learners::tests::toy_problem;

    fn params(subsample: f64) -> BoostingParams {
        BoostingParams {
            n_estimators: 20,
            learning_rate: 0.2,
            max_depth: 2,
            subsample,
        }
    }

    #[test]
    fn training_loss_decreases_with_rounds() {
        let (x, y) = toy_problem();
        let log_loss = |model: &GradientBoosting| {
            let proba = model.predict_proba(x.view());
            y.iter()
                .enumerate()
                .map(|(i, &label)| -proba[[i, label]].ln())
                .sum::<f64>()
        };
        let mut short = GradientBoosting::new(BoostingParams { n_estimators: 2, ..params(1.0) }, 3, 1);
        let mut long = GradientBoosting::new(params(1.0), 3, 1);
        short.fit(x.view(), &y).unwrap();
        long.fit(x.view(), &y).unwrap();
        assert!(log_loss(&long) < log_loss(&short));
    }

    #[test]
    fn subsampling_is_seeded() {
        let (x, y) = toy_problem();
        let mut a = GradientBoosting::new(params(0.7), 3, 5);
        let mut b = GradientBoosting::new(params(0.7), 3, 5);
        a.fit(x.view(), &y).unwrap();
        b.fit(x.view(), &y).unwrap();
        assert_eq!(a.predict_proba(x.view()), b.predict_proba(x.view()));
    }

    #[test]
    fn invalid_subsample_is_rejected() {
        let (x, y) = toy_problem();
        let mut model = GradientBoosting::new(params(0.0), 3, 5);
        assert!(matches!(
            model.fit(x.view(), &y),
            Err(ConvergenceError::Degenerate(_))
        ));
    }
}
