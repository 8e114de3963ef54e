//! Equal-weight soft voting over any set of [`Classifier`]s.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::ConvergenceError;
use crate::learners::Classifier;

/// Arg-max that resolves exact ties toward the lower class index, i.e. the
/// more benign fatigue level.
pub fn argmax_benign(row: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (idx, &value) in row.iter().enumerate().skip(1) {
        if value > row[best] {
            best = idx;
        }
    }
    best
}

pub fn predicted_classes(proba: ArrayView2<'_, f64>) -> Vec<usize> {
    proba.rows().into_iter().map(argmax_benign).collect()
}

/// Weighted average of probability matrices of identical shape.
pub fn soft_vote(probas: &[Array2<f64>], weights: &[f64]) -> Option<Array2<f64>> {
    let first = probas.first()?;
    let total: f64 = weights.iter().sum();
    let mut combined = Array2::zeros(first.raw_dim());
    for (proba, weight) in probas.iter().zip(weights) {
        combined.scaled_add(*weight / total, proba);
    }
    Some(combined)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftVotingEnsemble<C> {
    members: Vec<C>,
    weights: Vec<f64>,
}

impl<C> SoftVotingEnsemble<C> {
    pub fn uniform(members: Vec<C>) -> Self {
        let weights = vec![1.0; members.len()];
        Self { members, weights }
    }

    pub fn members(&self) -> &[C] {
        &self.members
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<C: Classifier> Classifier for SoftVotingEnsemble<C> {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError> {
        for member in &mut self.members {
            member.fit(x, y)?;
        }
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let probas: Vec<Array2<f64>> = self
            .members
            .iter()
            .map(|member| member.predict_proba(x))
            .collect();
        soft_vote(&probas, &self.weights).unwrap_or_else(|| Array2::zeros((x.nrows(), 0)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;
    use std::cell::Cell;

    /// Returns the same probability row for every input and counts calls.
    pub(crate) struct FixedProba {
        pub row: Vec<f64>,
        pub calls: Cell<usize>,
    }

    impl FixedProba {
        pub(crate) fn new(row: Vec<f64>) -> Self {
            Self {
                row,
                calls: Cell::new(0),
            }
        }
    }

    impl Classifier for FixedProba {
        fn fit(&mut self, _x: ArrayView2<'_, f64>, _y: &[usize]) -> Result<(), ConvergenceError> {
            Ok(())
        }

        fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
            self.calls.set(self.calls.get() + 1);
            Array2::from_shape_fn((x.nrows(), self.row.len()), |(_, k)| self.row[k])
        }
    }

    #[test]
    fn equal_probabilities_resolve_to_lower_class() {
        let ensemble = SoftVotingEnsemble::uniform(vec![
            FixedProba::new(vec![0.5, 0.5, 0.0]),
            FixedProba::new(vec![0.3, 0.3, 0.4]),
        ]);
        let proba = ensemble.predict_proba(array![[0.0]].view());
        assert_eq!(proba[[0, 0]], proba[[0, 1]]);
        assert_eq!(predicted_classes(proba.view()), vec![0]);

        assert_eq!(argmax_benign(array![0.2, 0.4, 0.4].view()), 1);
        assert_eq!(argmax_benign(array![0.1, 0.2, 0.7].view()), 2);
    }

    #[test]
    fn soft_vote_averages_with_equal_weight() {
        let ensemble = SoftVotingEnsemble::uniform(vec![
            FixedProba::new(vec![0.6, 0.3, 0.1]),
            FixedProba::new(vec![0.2, 0.2, 0.6]),
            FixedProba::new(vec![0.1, 0.7, 0.2]),
        ]);
        let proba = ensemble.predict_proba(array![[1.0], [2.0]].view());
        assert_eq!(proba.dim(), (2, 3));
        assert!((proba[[1, 0]] - 0.3).abs() < 1e-12);
        assert!((proba[[1, 1]] - 0.4).abs() < 1e-12);
        assert!((proba[[1, 2]] - 0.3).abs() < 1e-12);
        assert_eq!(ensemble.weights(), &[1.0, 1.0, 1.0]);
        assert!(ensemble.members().iter().all(|m| m.calls.get() == 1));
    }
}
