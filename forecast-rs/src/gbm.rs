//! Gradient-boosted regression trees.
//!
//! Squared-error boosting: start from the mean target, then fit each stage's
//! tree to the current residuals and add it with shrinkage. Trees are exact
//! greedy CART regressors stored as flat node arrays.
//!
//! # Tree Traversal
//!
//! - Start at node 0 (root)
//! - A `Leaf` returns its value
//! - A `Split` goes `left` if `features[feature] <= threshold` or is NaN,
//!   otherwise `right`
//!
//! Training is deterministic: split candidates are scanned by ascending
//! feature index then ascending threshold and only a strictly better gain
//! replaces the incumbent. Row subsampling draws from a seeded `StdRng`.

use crate::error::ForecastError;
use crate::Result;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Splits must reduce the squared error by more than this.
const MIN_GAIN: f64 = 1e-12;

/// Boosting hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    /// Number of boosting stages (trees)
    pub n_estimators: usize,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Shrinkage applied to every tree
    pub learning_rate: f64,
    /// Minimum samples required to split a node
    pub min_samples_split: usize,
    /// Minimum samples required in a leaf node
    pub min_samples_leaf: usize,
    /// Fraction of rows drawn (without replacement) per stage
    pub subsample: f64,
    /// Seed for row subsampling
    pub seed: u64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 4,
            learning_rate: 0.1,
            min_samples_split: 2,
            min_samples_leaf: 1,
            subsample: 1.0,
            seed: 42,
        }
    }
}

impl GbmParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(ForecastError::config("n_estimators must be at least 1"));
        }
        if self.max_depth == 0 {
            return Err(ForecastError::config("max_depth must be at least 1"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ForecastError::config(format!(
                "learning_rate {} must be positive",
                self.learning_rate
            )));
        }
        if self.min_samples_split < 2 {
            return Err(ForecastError::config("min_samples_split must be at least 2"));
        }
        if self.min_samples_leaf == 0 {
            return Err(ForecastError::config("min_samples_leaf must be at least 1"));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return Err(ForecastError::config(format!(
                "subsample {} must be in (0, 1]",
                self.subsample
            )));
        }
        Ok(())
    }
}

/// A node of a regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// One regression tree in pre-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn predict(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row[*feature];
                    idx = if x <= *threshold || x.is_nan() {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Depth of the deepest leaf (a lone leaf has depth 0).
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match &nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    fn check(&self, n_features: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ForecastError::Serialization("tree has no nodes".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                // Pre-order: children always follow their parent
                if *left <= i || *right <= i || *left >= self.nodes.len() || *right >= self.nodes.len()
                {
                    return Err(ForecastError::Serialization(format!(
                        "node {} has invalid children {}/{}",
                        i, left, right
                    )));
                }
                if *feature >= n_features {
                    return Err(ForecastError::Serialization(format!(
                        "node {} splits on feature {} of {}",
                        i, feature, n_features
                    )));
                }
            }
        }
        Ok(())
    }
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct TreeBuilder<'a, 'x> {
    x: ArrayView2<'x, f64>,
    residuals: &'a [f64],
    params: &'a GbmParams,
    nodes: Vec<TreeNode>,
    importance: &'a mut [f64],
}

impl TreeBuilder<'_, '_> {
    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let value = rows.iter().map(|&r| self.residuals[r]).sum::<f64>() / rows.len() as f64;
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value });

        if depth >= self.params.max_depth || rows.len() < self.params.min_samples_split {
            return idx;
        }
        let Some(split) = self.best_split(&rows) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.iter().partition(|&&r| {
            let x = self.x[[r, split.feature]];
            x <= split.threshold || x.is_nan()
        });
        self.importance[split.feature] += split.gain;

        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        self.nodes[idx] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn best_split(&self, rows: &[usize]) -> Option<Split> {
        let n = rows.len();
        let min_leaf = self.params.min_samples_leaf;
        let total: f64 = rows.iter().map(|&r| self.residuals[r]).sum();
        let base = total * total / n as f64;

        let mut best: Option<Split> = None;
        let mut order = rows.to_vec();
        for feature in 0..self.x.ncols() {
            let column = self.x.column(feature);
            order.sort_by(|&a, &b| column[a].total_cmp(&column[b]).then(a.cmp(&b)));

            let mut left_sum = 0.0;
            for k in 0..n - 1 {
                left_sum += self.residuals[order[k]];
                let n_left = k + 1;
                let n_right = n - n_left;
                if n_right < min_leaf {
                    break;
                }
                if n_left < min_leaf {
                    continue;
                }
                let (a, b) = (column[order[k]], column[order[k + 1]]);
                if !(a < b) {
                    continue;
                }

                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / n_left as f64
                    + right_sum * right_sum / n_right as f64
                    - base;
                let incumbent = best.as_ref().map_or(MIN_GAIN, |s| s.gain);
                if gain > incumbent {
                    let mid = a + (b - a) / 2.0;
                    best = Some(Split {
                        feature,
                        threshold: if mid < b { mid } else { a },
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Regression metrics on a set of predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
}

impl ModelMetrics {
    /// `None` if the inputs are empty or of different length.
    pub fn regression(y_true: &[f64], y_pred: &[f64]) -> Option<Self> {
        let n = y_true.len();
        if n == 0 || n != y_pred.len() {
            return None;
        }
        let nf = n as f64;

        let ss_res: f64 = y_true
            .iter()
            .zip(y_pred)
            .map(|(t, p)| (t - p).powi(2))
            .sum();
        let mae = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()).sum::<f64>() / nf;
        let mean_true = y_true.iter().sum::<f64>() / nf;
        let ss_tot: f64 = y_true.iter().map(|t| (t - mean_true).powi(2)).sum();
        let mse = ss_res / nf;

        Some(Self {
            mse,
            rmse: mse.sqrt(),
            mae,
            r2: if ss_tot != 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 },
        })
    }
}

/// A fitted boosted ensemble. Immutable once trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    params: GbmParams,
    feature_names: Vec<String>,
    init_value: f64,
    trees: Vec<RegressionTree>,
    importance: Vec<f64>,
}

impl TrainedModel {
    /// Fit an ensemble on `features` (one row per sample) and `targets`.
    ///
    /// # Errors
    /// * `Configuration` for invalid params or a name/width mismatch
    /// * `Alignment` if rows and targets differ in length
    /// * `InsufficientData` if there are no rows
    /// * `InvalidSeries` if a target is not finite
    pub fn train(
        features: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
        feature_names: &[String],
        params: &GbmParams,
    ) -> Result<Self> {
        params.validate()?;
        let n = features.nrows();
        if targets.len() != n {
            return Err(ForecastError::Alignment {
                expected: n,
                actual: targets.len(),
            });
        }
        if n == 0 {
            return Err(ForecastError::insufficient("no training rows"));
        }
        if feature_names.len() != features.ncols() {
            return Err(ForecastError::config(format!(
                "{} feature names for {} columns",
                feature_names.len(),
                features.ncols()
            )));
        }
        if targets.iter().any(|t| !t.is_finite()) {
            return Err(ForecastError::InvalidSeries(
                "training targets must be finite".to_string(),
            ));
        }

        let y: Vec<f64> = targets.to_vec();
        let init_value = y.iter().sum::<f64>() / n as f64;
        let mut fitted = vec![init_value; n];
        let mut importance = vec![0.0; features.ncols()];
        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_size = ((params.subsample * n as f64).round() as usize).clamp(1, n);

        for stage in 0..params.n_estimators {
            let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(t, f)| t - f).collect();
            let rows = if sample_size < n {
                let mut rows = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                rows.sort_unstable();
                rows
            } else {
                (0..n).collect()
            };

            let mut builder = TreeBuilder {
                x: features.view(),
                residuals: &residuals,
                params,
                nodes: Vec::new(),
                importance: &mut importance,
            };
            builder.build(rows, 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };

            for (f, row) in fitted.iter_mut().zip(features.axis_iter(Axis(0))) {
                *f += params.learning_rate * tree.predict(row);
            }
            if stage % 25 == 0 {
                debug!(stage, nodes = tree.nodes.len(), "boosting stage");
            }
            trees.push(tree);
        }

        let total: f64 = importance.iter().sum();
        if total > 0.0 {
            importance.iter_mut().for_each(|v| *v /= total);
        }

        let model = Self {
            params: params.clone(),
            feature_names: feature_names.to_vec(),
            init_value,
            trees,
            importance,
        };

        if let Some(metrics) = ModelMetrics::regression(&y, &fitted) {
            info!(
                rows = n,
                features = model.n_features(),
                trees = model.trees.len(),
                rmse = metrics.rmse,
                mae = metrics.mae,
                r2 = metrics.r2,
                "trained gradient boosted regressor"
            );
        }
        Ok(model)
    }

    pub fn params(&self) -> &GbmParams {
        &self.params
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Predict one (already scaled) row.
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> Result<f64> {
        if row.len() != self.n_features() {
            return Err(ForecastError::config(format!(
                "model expects {} features, row has {}",
                self.n_features(),
                row.len()
            )));
        }
        Ok(self.init_value
            + self
                .trees
                .iter()
                .map(|t| self.params.learning_rate * t.predict(row))
                .sum::<f64>())
    }

    /// Predict every row of a matrix.
    pub fn predict(&self, rows: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        rows.axis_iter(Axis(0))
            .map(|row| self.predict_row(row))
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from)
    }

    /// Normalised split gain per feature, highest first.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.importance.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Save model to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load model from JSON, checking tree structure against the feature count.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: TrainedModel = serde_json::from_str(json)?;
        if model.importance.len() != model.feature_names.len() {
            return Err(ForecastError::Serialization(format!(
                "{} importances for {} features",
                model.importance.len(),
                model.feature_names.len()
            )));
        }
        for tree in &model.trees {
            tree.check(model.n_features())?;
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn names(k: usize) -> Vec<String> {
        (0..k).map(|j| format!("f{}", j)).collect()
    }

    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| {
            if j == 0 {
                i as f64
            } else {
                ((i * 7) % 11) as f64
            }
        });
        let y = Array1::from_shape_fn(40, |i| if i < 20 { 1.0 } else { 5.0 });
        (x, y)
    }

    #[test]
    fn test_default_params() {
        let params = GbmParams::default();
        assert_eq!(params.n_estimators, 100);
        assert_eq!(params.max_depth, 4);
        assert_abs_diff_eq!(params.learning_rate, 0.1);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_invalid_params() {
        let mut params = GbmParams::default();
        params.subsample = 0.0;
        assert!(params.validate().is_err());
        let mut params = GbmParams::default();
        params.learning_rate = -1.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_tree_traversal_sends_nan_left() {
        let tree = RegressionTree {
            nodes: vec![
                TreeNode::Split {
                    feature: 0,
                    threshold: 0.5,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf { value: -1.0 },
                TreeNode::Leaf { value: 1.0 },
            ],
        };
        assert_eq!(tree.predict(array![0.5].view()), -1.0);
        assert_eq!(tree.predict(array![0.6].view()), 1.0);
        assert_eq!(tree.predict(array![f64::NAN].view()), -1.0);
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_learns_step_function() {
        let (x, y) = step_data();
        let model = TrainedModel::train(x.view(), y.view(), &names(2), &GbmParams::default())
            .unwrap();

        assert_eq!(model.n_trees(), 100);
        let pred = model.predict(x.view()).unwrap();
        let metrics = ModelMetrics::regression(y.as_slice().unwrap(), pred.as_slice().unwrap())
            .unwrap();
        assert!(metrics.mae < 1e-3, "mae {}", metrics.mae);
        // The step lives entirely in feature 0
        assert_eq!(model.feature_importance()[0].0, "f0");
        // First split sits halfway between 19 and 20
        match &model.trees()[0].nodes()[0] {
            TreeNode::Split {
                feature, threshold, ..
            } => {
                assert_eq!(*feature, 0);
                assert_abs_diff_eq!(*threshold, 19.5);
            }
            other => panic!("expected split, got {:?}", other),
        }
    }

    #[test]
    fn test_respects_max_depth() {
        let x = Array2::from_shape_fn((64, 1), |(i, _)| i as f64);
        let y = Array1::from_shape_fn(64, |i| ((i as f64) * 0.3).sin());
        let params = GbmParams {
            max_depth: 2,
            n_estimators: 5,
            ..GbmParams::default()
        };
        let model = TrainedModel::train(x.view(), y.view(), &names(1), &params).unwrap();
        assert!(model.trees().iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn test_model_outlives_training_view() {
        let model = {
            let (x, y) = step_data();
            let params = GbmParams {
                n_estimators: 3,
                ..GbmParams::default()
            };
            TrainedModel::train(x.view(), y.view(), &names(2), &params).unwrap()
        };
        let importance = model.feature_importance();
        assert_eq!(importance.len(), 2);
        let total: f64 = importance.iter().map(|(_, v)| v).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_training_is_deterministic_with_subsample() {
        let (x, y) = step_data();
        let params = GbmParams {
            subsample: 0.5,
            n_estimators: 20,
            ..GbmParams::default()
        };
        let a = TrainedModel::train(x.view(), y.view(), &names(2), &params).unwrap();
        let b = TrainedModel::train(x.view(), y.view(), &names(2), &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_constant_target_gives_single_leaves() {
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let y = Array1::from_elem(10, 3.0);
        let model = TrainedModel::train(x.view(), y.view(), &names(1), &GbmParams::default())
            .unwrap();
        assert!(model.trees().iter().all(|t| t.nodes().len() == 1));
        assert_abs_diff_eq!(model.predict_row(array![100.0].view()).unwrap(), 3.0);
    }

    #[test]
    fn test_train_errors() {
        let x = Array2::<f64>::zeros((5, 2));
        let params = GbmParams::default();
        assert!(matches!(
            TrainedModel::train(x.view(), Array1::zeros(4).view(), &names(2), &params),
            Err(ForecastError::Alignment { .. })
        ));
        assert!(matches!(
            TrainedModel::train(x.view(), Array1::zeros(5).view(), &names(3), &params),
            Err(ForecastError::Configuration(_))
        ));
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            TrainedModel::train(empty.view(), Array1::zeros(0).view(), &names(2), &params),
            Err(ForecastError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_predict_row_width_mismatch() {
        let (x, y) = step_data();
        let model = TrainedModel::train(x.view(), y.view(), &names(2), &GbmParams::default())
            .unwrap();
        assert!(matches!(
            model.predict_row(array![1.0].view()),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_json_round_trip_and_validation() {
        let (x, y) = step_data();
        let params = GbmParams {
            n_estimators: 3,
            ..GbmParams::default()
        };
        let model = TrainedModel::train(x.view(), y.view(), &names(2), &params).unwrap();
        let json = model.to_json().unwrap();
        assert_eq!(TrainedModel::from_json(&json).unwrap(), model);

        let broken = json.replace("\"feature\":0", "\"feature\":9");
        assert!(matches!(
            TrainedModel::from_json(&broken),
            Err(ForecastError::Serialization(_))
        ));
    }

    #[test]
    fn test_metrics() {
        let m = ModelMetrics::regression(&[1.0, 2.0, 3.0], &[1.0, 2.0, 5.0]).unwrap();
        assert_abs_diff_eq!(m.mse, 4.0 / 3.0);
        assert_abs_diff_eq!(m.mae, 2.0 / 3.0);
        assert_abs_diff_eq!(m.r2, 1.0 - 4.0 / 2.0);
        assert!(ModelMetrics::regression(&[], &[]).is_none());
    }
}
