//! CART trees shared by the forest (gini, class distributions in leaves) and
//! the booster (squared error on gradients, Newton leaf values).
//!
//! Columns are sorted once per fit ([`Presorted`]); a tree is grown over
//! per-row sample weights, so bootstrap multiplicity and row subsampling are
//! both just weights.

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn leaf_value(&self, row: ArrayView1<'_, f64>) -> &[f64] {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Row order of every column, ascending by value then row index.
pub struct Presorted {
    orders: Vec<Vec<usize>>,
}

impl Presorted {
    pub fn new(x: ArrayView2<'_, f64>) -> Self {
        let orders = x
            .columns()
            .into_iter()
            .map(|column| {
                let mut order: Vec<usize> = (0..column.len()).collect();
                order.sort_by(|&a, &b| column[a].total_cmp(&column[b]).then(a.cmp(&b)));
                order
            })
            .collect();
        Self { orders }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GrowConfig {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means all.
    pub max_features: Option<usize>,
}

/// Split cost bookkeeping. Costs are additive over children and lower is
/// better, so a split gains `cost(parent) - cost(left) - cost(right)`.
pub trait Criterion {
    type Acc: Clone;

    fn empty(&self) -> Self::Acc;
    fn add(&self, acc: &mut Self::Acc, sample: usize, weight: f64);
    fn cost(&self, acc: &Self::Acc) -> f64;
    fn leaf(&self, samples: &[usize], weights: &[f64]) -> Vec<f64>;
}

/// Gini impurity over class labels; leaves hold class proportions.
pub struct Gini<'a> {
    pub labels: &'a [usize],
    pub classes: usize,
}

impl Criterion for Gini<'_> {
    type Acc = (Vec<f64>, f64);

    fn empty(&self) -> Self::Acc {
        (vec![0.0; self.classes], 0.0)
    }

    fn add(&self, acc: &mut Self::Acc, sample: usize, weight: f64) {
        acc.0[self.labels[sample]] += weight;
        acc.1 += weight;
    }

    fn cost(&self, (counts, n): &Self::Acc) -> f64 {
        if *n <= 0.0 {
            return 0.0;
        }
        n - counts.iter().map(|c| c * c).sum::<f64>() / n
    }

    fn leaf(&self, samples: &[usize], weights: &[f64]) -> Vec<f64> {
        let mut counts = vec![0.0; self.classes];
        let mut total = 0.0;
        for &sample in samples {
            counts[self.labels[sample]] += weights[sample];
            total += weights[sample];
        }
        if total <= 0.0 {
            return vec![1.0 / self.classes as f64; self.classes];
        }
        counts.iter().map(|c| c / total).collect()
    }
}

/// Squared error on gradient targets; leaves take one Newton step.
pub struct Newton<'a> {
    pub gradients: &'a [f64],
    pub hessians: &'a [f64],
    /// Multiplier on the Newton step, `(K - 1) / K` for K-class softmax.
    pub shrink: f64,
}

impl Criterion for Newton<'_> {
    type Acc = (f64, f64, f64);

    fn empty(&self) -> Self::Acc {
        (0.0, 0.0, 0.0)
    }

    fn add(&self, acc: &mut Self::Acc, sample: usize, weight: f64) {
        let g = self.gradients[sample];
        acc.0 += weight * g;
        acc.1 += weight * g * g;
        acc.2 += weight;
    }

    fn cost(&self, (sum, sum_sq, n): &Self::Acc) -> f64 {
        if *n <= 0.0 {
            return 0.0;
        }
        sum_sq - sum * sum / n
    }

    fn leaf(&self, samples: &[usize], weights: &[f64]) -> Vec<f64> {
        let grad: f64 = samples.iter().map(|&s| weights[s] * self.gradients[s]).sum();
        let hess: f64 = samples.iter().map(|&s| weights[s] * self.hessians[s]).sum();
        vec![self.shrink * grad / hess.max(1e-12)]
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Grower<'x, 'a, C: Criterion> {
    x: ArrayView2<'x, f64>,
    presorted: &'a Presorted,
    weights: &'a [f64],
    criterion: &'a C,
    config: GrowConfig,
    in_node: Vec<bool>,
    nodes: Vec<Node>,
}

impl<C: Criterion> Grower<'_, '_, C> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize, rng: &mut SmallRng) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value: Vec::new() });

        let weight: f64 = rows.iter().map(|&r| self.weights[r]).sum();
        let min_leaf = self.config.min_samples_leaf.max(1) as f64;
        let split = if depth < self.config.max_depth && rows.len() >= 2 && weight >= 2.0 * min_leaf {
            self.best_split(&rows, weight, rng)
        } else {
            None
        };

        let Some(split) = split else {
            self.nodes[id] = Node::Leaf {
                value: self.criterion.leaf(&rows, self.weights),
            };
            return id;
        };

        let (feature, threshold) = (split.feature, split.threshold);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.x[[r, feature]] <= threshold);
        let left = self.grow(left_rows, depth + 1, rng);
        let right = self.grow(right_rows, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn best_split(&mut self, rows: &[usize], weight: f64, rng: &mut SmallRng) -> Option<BestSplit> {
        let width = self.x.ncols();
        let features: Vec<usize> = match self.config.max_features {
            Some(k) if k < width => {
                let mut picked = index::sample(rng, width, k.max(1)).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..width).collect(),
        };

        let mut total = self.criterion.empty();
        for &row in rows {
            self.criterion.add(&mut total, row, self.weights[row]);
            self.in_node[row] = true;
        }
        let parent_cost = self.criterion.cost(&total);
        let min_leaf = self.config.min_samples_leaf.max(1) as f64;
        let mut best: Option<BestSplit> = None;

        for feature in features {
            let mut left = self.criterion.empty();
            let mut right = total.clone();
            let mut left_weight = 0.0;
            let mut previous: Option<f64> = None;
            for &row in &self.presorted.orders[feature] {
                if !self.in_node[row] {
                    continue;
                }
                let value = self.x[[row, feature]];
                if let Some(prev) = previous {
                    if value > prev && left_weight >= min_leaf && weight - left_weight >= min_leaf {
                        let gain =
                            parent_cost - self.criterion.cost(&left) - self.criterion.cost(&right);
                        if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                            best = Some(BestSplit {
                                feature,
                                threshold: prev + (value - prev) / 2.0,
                                gain,
                            });
                        }
                    }
                }
                let w = self.weights[row];
                self.criterion.add(&mut left, row, w);
                self.criterion.add(&mut right, row, -w);
                left_weight += w;
                previous = Some(value);
            }
        }

        for &row in rows {
            self.in_node[row] = false;
        }
        best
    }
}

/// Grows a tree over the rows with positive weight.
pub fn grow<C: Criterion>(
    x: ArrayView2<'_, f64>,
    presorted: &Presorted,
    weights: &[f64],
    criterion: &C,
    config: GrowConfig,
    rng: &mut SmallRng,
) -> Tree {
    let rows: Vec<usize> = (0..x.nrows()).filter(|&r| weights[r] > 0.0).collect();
    let mut grower = Grower {
        x,
        presorted,
        weights,
        criterion,
        config,
        in_node: vec![false; x.nrows()],
        nodes: Vec::new(),
    };
    grower.grow(rows, 0, rng);
    Tree {
        nodes: grower.nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn config(max_depth: usize) -> GrowConfig {
        GrowConfig {
            max_depth,
            min_samples_leaf: 1,
            max_features: None,
        }
    }

    #[test]
    fn gini_tree_isolates_pure_regions() {
        let x = array![[0.0], [1.0], [2.0], [10.0], [11.0], [12.0]];
        let labels = [0, 0, 0, 2, 2, 2];
        let criterion = Gini {
            labels: &labels,
            classes: 3,
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let presorted = Presorted::new(x.view());
        let tree = grow(x.view(), &presorted, &[1.0; 6], &criterion, config(4), &mut rng);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.leaf_value(array![1.5].view()), &[1.0, 0.0, 0.0]);
        assert_eq!(tree.leaf_value(array![9.0].view()), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn constant_features_produce_a_single_leaf() {
        let x = array![[3.0], [3.0], [3.0], [3.0]];
        let labels = [0, 1, 2, 1];
        let criterion = Gini {
            labels: &labels,
            classes: 3,
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let presorted = Presorted::new(x.view());
        let tree = grow(x.view(), &presorted, &[1.0; 4], &criterion, config(5), &mut rng);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.leaf_value(array![3.0].view()), &[0.25, 0.5, 0.25]);
    }

    #[test]
    fn zero_weight_rows_are_ignored_and_repeats_count() {
        let x = array![[0.0], [1.0], [5.0]];
        let labels = [0, 1, 1];
        let criterion = Gini {
            labels: &labels,
            classes: 3,
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let presorted = Presorted::new(x.view());
        let tree = grow(x.view(), &presorted, &[3.0, 1.0, 0.0], &criterion, config(0), &mut rng);
        assert_eq!(tree.leaf_value(array![5.0].view()), &[0.75, 0.25, 0.0]);
    }

    /// The view outlives the locally built criterion and presort.
    fn fit_view(x: ArrayView2<'_, f64>, labels: &[usize], max_features: Option<usize>) -> Tree {
        let criterion = Gini {
            labels,
            classes: 2,
        };
        let presorted = Presorted::new(x);
        let weights = vec![1.0; x.nrows()];
        let mut rng = SmallRng::seed_from_u64(7);
        let settings = GrowConfig {
            max_features,
            ..config(3)
        };
        grow(x, &presorted, &weights, &criterion, settings, &mut rng)
    }

    #[test]
    fn grows_from_a_borrowed_sub_view() {
        let x = array![
            [0.0, 9.0],
            [1.0, 8.0],
            [2.0, 1.0],
            [3.0, 0.0],
            [100.0, 100.0]
        ];
        let labels = [0, 0, 1, 1];
        let rows = x.slice(ndarray::s![..4, ..]);
        let tree = fit_view(rows, &labels, None);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.leaf_value(array![0.5, 8.5].view()), &[1.0, 0.0]);
        assert_eq!(tree.leaf_value(array![2.5, 0.5].view()), &[0.0, 1.0]);

        let sampled = fit_view(rows, &labels, Some(1));
        assert_eq!(sampled.depth(), 1);
    }

    #[test]
    fn newton_leaves_scale_gradient_by_hessian() {
        let x = array![[0.0], [0.0]];
        let gradients = [0.5, 0.3];
        let hessians = [0.25, 0.25];
        let criterion = Newton {
            gradients: &gradients,
            hessians: &hessians,
            shrink: 0.5,
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let presorted = Presorted::new(x.view());
        let tree = grow(x.view(), &presorted, &[1.0, 1.0], &criterion, config(2), &mut rng);
        assert!((tree.leaf_value(array![0.0].view())[0] - 0.8).abs() < 1e-12);
    }
}
