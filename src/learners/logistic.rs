use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{check_training_input, one_hot, softmax_rows, Classifier};
use crate::error::ConvergenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub l2: f64,
    pub epochs: usize,
}

/// Multinomial (softmax) logistic regression trained by full-batch gradient
/// descent with an L2 penalty on the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    params: LogisticParams,
    classes: usize,
    weights: Array2<f64>,
    bias: Array1<f64>,
}

impl LogisticRegression {
    pub fn new(params: LogisticParams, classes: usize) -> Self {
        Self {
            params,
            classes,
            weights: Array2::zeros((0, classes)),
            bias: Array1::zeros(classes),
        }
    }

    fn scores(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError> {
        check_training_input(x, y, self.classes)?;
        let n = x.nrows() as f64;
        let targets = one_hot(y, self.classes);
        self.weights = Array2::zeros((x.ncols(), self.classes));
        self.bias = Array1::zeros(self.classes);

        for epoch in 0..self.params.epochs {
            let mut proba = self.scores(x);
            softmax_rows(&mut proba);
            let residual = &proba - &targets;

            let grad_w = x.t().dot(&residual) / n + &self.weights * self.params.l2;
            let grad_b = residual.sum_axis(Axis(0)) / n;
            self.weights.scaled_add(-self.params.learning_rate, &grad_w);
            self.bias.scaled_add(-self.params.learning_rate, &grad_b);

            if self.weights.iter().chain(self.bias.iter()).any(|v| !v.is_finite()) {
                return Err(ConvergenceError::NonFinite {
                    quantity: "weights",
                    iteration: epoch + 1,
                });
            }
        }
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        if self.weights.nrows() != x.ncols() {
            return Array2::from_elem((x.nrows(), self.classes), 1.0 / self.classes as f64);
        }
        let mut proba = self.scores(x);
        softmax_rows(&mut proba);
        proba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn unfitted_model_is_uniform() {
        let model = LogisticRegression::new(
            LogisticParams {
                learning_rate: 0.1,
                l2: 0.0,
                epochs: 1,
            },
            3,
        );
        let proba = model.predict_proba(array![[1.0, 2.0]].view());
        assert!(proba.iter().all(|p| (p - 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn exploding_learning_rate_is_reported() {
        let x = array![[1e200, -1e200], [-1e200, 1e200]];
        let mut model = LogisticRegression::new(
            LogisticParams {
                learning_rate: 1e200,
                l2: 0.0,
                epochs: 5,
            },
            3,
        );
        assert!(matches!(
            model.fit(x.view(), &[0, 1]),
            Err(ConvergenceError::NonFinite { quantity: "weights", .. })
        ));
    }
}
