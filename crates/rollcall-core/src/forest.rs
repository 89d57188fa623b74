//! Random-forest classifier over descriptors.
//!
//! Bootstrap-aggregated CART trees with Gini impurity, `sqrt(n_features)`
//! candidate features per split and class-frequency leaves. Training is
//! fully determined by the input order and [`ForestParams::seed`].

use crate::types::Identity;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Values closer than this are treated as equal when placing thresholds.
const FEATURE_EPSILON: f32 = 1e-7;

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("{samples} samples but {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("expected {expected}-dim features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid forest parameters: {0}")]
    InvalidParams(&'static str),
    #[error("corrupt forest: {0}")]
    Corrupt(String),
}

/// Multi-class probabilistic classifier.
pub trait Classifier {
    /// Class labels, in the order of [`predict_proba`](Self::predict_proba) output.
    fn classes(&self) -> &[Identity];

    /// Probability of every class for one feature vector. Sums to 1.
    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ForestError>;
}

/// Forest hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub seed: u64,
    /// Nodes with fewer distinct samples become leaves.
    pub min_samples_split: usize,
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 15,
            seed: 42,
            min_samples_split: 2,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Node {
    Leaf {
        distribution: Vec<f32>,
    },
    Split {
        feature: u32,
        threshold: f32,
        left: u32,
        right: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf_for(&self, features: &[f32]) -> &[f32] {
        let mut idx = 0usize;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { distribution } => return distribution,
                Node::Split { feature, threshold, left, right } => {
                    idx = if features[*feature as usize] <= *threshold {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
            }
        }
    }
}

/// Fitted random forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    classes: Vec<Identity>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Fit a forest on `rows` labelled by `labels`.
    pub fn fit<R: AsRef<[f32]>>(
        rows: &[R],
        labels: &[Identity],
        params: &ForestParams,
    ) -> Result<Self, ForestError> {
        if rows.is_empty() {
            return Err(ForestError::EmptyTrainingSet);
        }
        if rows.len() != labels.len() {
            return Err(ForestError::LengthMismatch { samples: rows.len(), labels: labels.len() });
        }
        if params.n_trees == 0 {
            return Err(ForestError::InvalidParams("n_trees must be at least 1"));
        }
        if params.max_depth == 0 {
            return Err(ForestError::InvalidParams("max_depth must be at least 1"));
        }

        let n_features = rows[0].as_ref().len();
        if n_features == 0 {
            return Err(ForestError::DimensionMismatch { expected: 1, actual: 0 });
        }
        if let Some(bad) = rows.iter().find(|r| r.as_ref().len() != n_features) {
            return Err(ForestError::DimensionMismatch { expected: n_features, actual: bad.as_ref().len() });
        }

        let mut classes = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let targets: Vec<usize> = labels
            .iter()
            .map(|l| classes.binary_search(l).unwrap_or_default())
            .collect();

        let rows: Vec<&[f32]> = rows.iter().map(|r| r.as_ref()).collect();
        let max_features = ((n_features as f64).sqrt().floor() as usize).max(1);
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_trees)
            .map(|_| {
                let mut tree_rng = StdRng::seed_from_u64(rng.gen());
                let weights = sample_weights(rows.len(), params.bootstrap, &mut tree_rng);
                TreeBuilder {
                    rows: &rows,
                    targets: &targets,
                    weights: &weights,
                    n_classes: classes.len(),
                    max_features,
                    params,
                    rng: tree_rng,
                    feature_order: (0..n_features as u32).collect(),
                    nodes: Vec::new(),
                }
                .build()
            })
            .collect();

        tracing::debug!(
            samples = rows.len(),
            classes = classes.len(),
            n_features,
            trees = params.n_trees,
            "random forest fitted"
        );

        Ok(Self { classes, n_features, trees })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Structural check for forests read back from disk, so prediction
    /// can index without bounds failures or cycles.
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.classes.is_empty() {
            return Err(ForestError::Corrupt("no classes".into()));
        }
        if self.trees.is_empty() {
            return Err(ForestError::Corrupt("no trees".into()));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(ForestError::Corrupt(format!("tree {t} has no nodes")));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                match node {
                    Node::Leaf { distribution } if distribution.len() != self.classes.len() => {
                        return Err(ForestError::Corrupt(format!(
                            "tree {t} node {i}: {} probabilities for {} classes",
                            distribution.len(),
                            self.classes.len()
                        )));
                    }
                    Node::Split { feature, left, right, .. } => {
                        let in_range = |c: u32| (c as usize) > i && (c as usize) < tree.nodes.len();
                        if *feature as usize >= self.n_features || !in_range(*left) || !in_range(*right) {
                            return Err(ForestError::Corrupt(format!("tree {t} node {i}: bad split")));
                        }
                    }
                    Node::Leaf { .. } => {}
                }
            }
        }
        Ok(())
    }
}

impl Classifier for RandomForest {
    fn classes(&self) -> &[Identity] {
        &self.classes
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ForestError> {
        if features.len() != self.n_features {
            return Err(ForestError::DimensionMismatch { expected: self.n_features, actual: features.len() });
        }

        let mut acc = vec![0.0f64; self.classes.len()];
        for tree in &self.trees {
            for (a, p) in acc.iter_mut().zip(tree.leaf_for(features)) {
                *a += *p as f64;
            }
        }

        let n = self.trees.len() as f64;
        Ok(acc.into_iter().map(|a| (a / n) as f32).collect())
    }
}

/// Per-sample multiplicity: bootstrap draw counts, or all ones.
fn sample_weights(n: usize, bootstrap: bool, rng: &mut StdRng) -> Vec<f32> {
    if !bootstrap {
        return vec![1.0; n];
    }
    let mut weights = vec![0.0f32; n];
    for _ in 0..n {
        weights[rng.gen_range(0..n)] += 1.0;
    }
    weights
}

struct SplitCandidate {
    feature: u32,
    threshold: f32,
    score: f64,
}

struct TreeBuilder<'a> {
    rows: &'a [&'a [f32]],
    targets: &'a [usize],
    weights: &'a [f32],
    n_classes: usize,
    max_features: usize,
    params: &'a ForestParams,
    rng: StdRng,
    feature_order: Vec<u32>,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn build(mut self) -> DecisionTree {
        let root: Vec<usize> = (0..self.rows.len()).filter(|&i| self.weights[i] > 0.0).collect();
        self.grow(root, 0);
        DecisionTree { nodes: self.nodes }
    }

    fn class_weights(&self, samples: &[usize]) -> Vec<f64> {
        let mut counts = vec![0.0f64; self.n_classes];
        for &i in samples {
            counts[self.targets[i]] += self.weights[i] as f64;
        }
        counts
    }

    /// Grow the subtree for `samples` and return its node index.
    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> u32 {
        let counts = self.class_weights(&samples);
        let total: f64 = counts.iter().sum();
        let pure = counts.iter().filter(|&&c| c > 0.0).count() <= 1;

        let idx = self.nodes.len();
        self.nodes.push(leaf(&counts, total));

        if pure || depth >= self.params.max_depth || samples.len() < self.params.min_samples_split.max(2) {
            return idx as u32;
        }

        let Some(split) = self.best_split(&samples) else {
            return idx as u32;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.rows[i][split.feature as usize] <= split.threshold);

        let left = self.grow(left, depth + 1);
        let right = self.grow(right, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx as u32
    }

    /// Search random features until `max_features` non-constant ones have
    /// been examined (or all features are exhausted).
    fn best_split(&mut self, samples: &[usize]) -> Option<SplitCandidate> {
        let n_features = self.feature_order.len();
        let mut best: Option<SplitCandidate> = None;
        let mut examined = 0usize;
        let mut column: Vec<(f32, usize, f64)> = Vec::with_capacity(samples.len());

        for pos in 0..n_features {
            if examined >= self.max_features {
                break;
            }
            let pick = self.rng.gen_range(pos..n_features);
            self.feature_order.swap(pos, pick);
            let feature = self.feature_order[pos];

            column.clear();
            column.extend(
                samples
                    .iter()
                    .map(|&i| (self.rows[i][feature as usize], self.targets[i], self.weights[i] as f64)),
            );
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (lo, hi) = (column[0].0, column[column.len() - 1].0);
            if hi <= lo + FEATURE_EPSILON {
                continue;
            }
            examined += 1;

            if let Some(candidate) = self.scan_feature(feature, &column) {
                if best.as_ref().map_or(true, |b| candidate.score > b.score) {
                    best = Some(candidate);
                }
            }
        }

        best
    }

    /// Best Gini split along one sorted column.
    ///
    /// Maximises `Σ left_c² / w_left + Σ right_c² / w_right`, which is
    /// equivalent to minimising the weighted child impurity.
    fn scan_feature(&self, feature: u32, column: &[(f32, usize, f64)]) -> Option<SplitCandidate> {
        let mut right = vec![0.0f64; self.n_classes];
        for &(_, class, w) in column {
            right[class] += w;
        }
        let mut left = vec![0.0f64; self.n_classes];
        let mut w_left = 0.0f64;
        let mut w_right: f64 = right.iter().sum();

        let mut best: Option<SplitCandidate> = None;
        for k in 0..column.len() - 1 {
            let (value, class, w) = column[k];
            left[class] += w;
            right[class] -= w;
            w_left += w;
            w_right -= w;

            let next = column[k + 1].0;
            if next <= value + FEATURE_EPSILON || w_left <= 0.0 || w_right <= 0.0 {
                continue;
            }

            let score = left.iter().map(|c| c * c).sum::<f64>() / w_left
                + right.iter().map(|c| c * c).sum::<f64>() / w_right;
            if best.as_ref().map_or(true, |b| score > b.score) {
                let mut threshold = value / 2.0 + next / 2.0;
                if threshold >= next || !threshold.is_finite() {
                    threshold = value;
                }
                best = Some(SplitCandidate { feature, threshold, score });
            }
        }

        best
    }
}

fn leaf(counts: &[f64], total: f64) -> Node {
    let distribution = if total > 0.0 {
        counts.iter().map(|&c| (c / total) as f32).collect()
    } else {
        vec![1.0 / counts.len() as f32; counts.len()]
    };
    Node::Leaf { distribution }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ForestParams {
        ForestParams { n_trees: 25, ..ForestParams::default() }
    }

    /// Two well-separated clusters in 16 dimensions.
    fn clusters() -> (Vec<Vec<f32>>, Vec<Identity>) {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (label, centre) in [(Identity(5), 0.2f32), (Identity(9), 0.8f32)] {
            for _ in 0..12 {
                rows.push((0..16).map(|_| centre + rng.gen_range(-0.05..0.05)).collect());
                labels.push(label);
            }
        }
        (rows, labels)
    }

    #[test]
    fn test_fit_classifies_clusters() {
        let (rows, labels) = clusters();
        let forest = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        assert_eq!(forest.classes(), &[Identity(5), Identity(9)]);

        let p = forest.predict_proba(&[0.21; 16]).unwrap();
        assert!(p[0] > 0.9, "{p:?}");
        let p = forest.predict_proba(&[0.79; 16]).unwrap();
        assert!(p[1] > 0.9, "{p:?}");
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let (rows, labels) = clusters();
        let forest = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        let p = forest.predict_proba(&[0.5; 16]).unwrap();
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (rows, labels) = clusters();
        let a = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        let b = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        for query in [[0.1f32; 16], [0.5; 16], [0.9; 16]] {
            assert_eq!(a.predict_proba(&query).unwrap(), b.predict_proba(&query).unwrap());
        }
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn test_single_class_is_certain() {
        let rows = vec![vec![0.1f32, 0.2], vec![0.3, 0.4]];
        let labels = vec![Identity(3), Identity(3)];
        let forest = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        assert_eq!(forest.predict_proba(&[0.9, 0.9]).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_constant_features_yield_leaf() {
        // No feature varies: every tree is a single leaf holding the class mix.
        let rows = vec![vec![0.5f32; 4]; 6];
        let labels = vec![Identity(1), Identity(1), Identity(1), Identity(2), Identity(2), Identity(2)];
        let params = ForestParams { bootstrap: false, ..small_params() };
        let forest = RandomForest::fit(&rows, &labels, &params).unwrap();
        let p = forest.predict_proba(&[0.5; 4]).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-6 && (p[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_finds_the_only_informative_feature() {
        // One informative feature among many constant ones must still be found.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            let mut row = vec![0.5f32; 100];
            row[73] = if i < 5 { 0.1 } else { 0.9 };
            rows.push(row);
            labels.push(Identity(if i < 5 { 1 } else { 2 }));
        }
        let params = ForestParams { bootstrap: false, ..small_params() };
        let forest = RandomForest::fit(&rows, &labels, &params).unwrap();

        let mut query = vec![0.5f32; 100];
        query[73] = 0.85;
        assert_eq!(forest.predict_proba(&query).unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_max_depth_is_respected() {
        let (rows, labels) = clusters();
        let params = ForestParams { max_depth: 1, ..small_params() };
        let forest = RandomForest::fit(&rows, &labels, &params).unwrap();
        assert!(forest.trees.iter().all(|t| t.nodes.len() <= 3));
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let empty: Vec<Vec<f32>> = vec![];
        assert!(matches!(
            RandomForest::fit(&empty, &[], &small_params()),
            Err(ForestError::EmptyTrainingSet)
        ));
        assert!(matches!(
            RandomForest::fit(&[vec![0.0f32]], &[], &small_params()),
            Err(ForestError::LengthMismatch { samples: 1, labels: 0 })
        ));
        assert!(matches!(
            RandomForest::fit(&[vec![0.0f32, 1.0], vec![0.0]], &[Identity(1), Identity(2)], &small_params()),
            Err(ForestError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        let params = ForestParams { n_trees: 0, ..small_params() };
        assert!(matches!(
            RandomForest::fit(&[vec![0.0f32]], &[Identity(1)], &params),
            Err(ForestError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_predict_rejects_wrong_dimension() {
        let (rows, labels) = clusters();
        let forest = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        assert!(matches!(
            forest.predict_proba(&[0.1; 3]),
            Err(ForestError::DimensionMismatch { expected: 16, actual: 3 })
        ));
    }

    #[test]
    fn test_validate_detects_corruption() {
        let (rows, labels) = clusters();
        let mut forest = RandomForest::fit(&rows, &labels, &small_params()).unwrap();
        assert!(forest.validate().is_ok());

        forest.trees[0].nodes[0] = Node::Split { feature: 0, threshold: 0.5, left: 0, right: 0 };
        assert!(matches!(forest.validate(), Err(ForestError::Corrupt(_))));
    }
}
