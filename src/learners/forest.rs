use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::tree::{grow, Gini, GrowConfig, Presorted, Tree};
use super::{check_training_input, Classifier};
use crate::error::ConvergenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

/// Bagged gini trees with `sqrt(width)` candidate features per split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    classes: usize,
    seed: u64,
    trees: Vec<Tree>,
}

impl RandomForest {
    pub fn new(params: ForestParams, classes: usize, seed: u64) -> Self {
        Self {
            params,
            classes,
            seed,
            trees: Vec::new(),
        }
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<(), ConvergenceError> {
        check_training_input(x, y, self.classes)?;
        if self.params.n_estimators == 0 {
            return Err(ConvergenceError::Degenerate("forest needs at least one tree".into()));
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let rows = x.nrows();
        let config = GrowConfig {
            max_depth: self.params.max_depth,
            min_samples_leaf: self.params.min_samples_leaf,
            max_features: Some(((x.ncols() as f64).sqrt().round() as usize).max(1)),
        };
        let criterion = Gini {
            labels: y,
            classes: self.classes,
        };
        let presorted = Presorted::new(x);

        self.trees = (0..self.params.n_estimators)
            .map(|_| {
                let mut bootstrap = vec![0.0; rows];
                for _ in 0..rows {
                    bootstrap[rng.gen_range(0..rows)] += 1.0;
                }
                grow(x, &presorted, &bootstrap, &criterion, config, &mut rng)
            })
            .collect();
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut proba = Array2::zeros((x.nrows(), self.classes));
        if self.trees.is_empty() {
            proba.fill(1.0 / self.classes as f64);
            return proba;
        }
        for (row, mut out) in x.axis_iter(Axis(0)).zip(proba.axis_iter_mut(Axis(0))) {
            for tree in &self.trees {
                for (slot, value) in out.iter_mut().zip(tree.leaf_value(row)) {
                    *slot += value;
                }
            }
            out.mapv_inplace(|v| v / self.trees.len() as f64);
        }
        proba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learners::tests::toy_problem;

    fn params() -> ForestParams {
        ForestParams {
            n_estimators: 15,
            max_depth: 4,
            min_samples_leaf: 2,
        }
    }

    #[test]
    fn same_seed_grows_identical_forests() {
        let (x, y) = toy_problem();
        let mut a = RandomForest::new(params(), 3, 9);
        let mut b = RandomForest::new(params(), 3, 9);
        a.fit(x.view(), &y).unwrap();
        b.fit(x.view(), &y).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tree_count(), 15);
        assert_eq!(a.predict_proba(x.view()), b.predict_proba(x.view()));
    }

    #[test]
    fn zero_trees_is_a_convergence_error() {
        let (x, y) = toy_problem();
        let mut forest = RandomForest::new(
            ForestParams {
                n_estimators: 0,
                ..params()
            },
            3,
            0,
        );
        assert!(matches!(
            forest.fit(x.view(), &y),
            Err(ConvergenceError::Degenerate(_))
        ));
    }
}
