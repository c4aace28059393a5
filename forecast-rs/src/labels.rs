//! Supervised training set alignment.
//!
//! Pairs the feature row at index `t` with the close price at `t + L`, after
//! dropping the warm-up prefix `[0, S)` and the last `L` rows, which have no
//! target yet.

use crate::error::ForecastError;
use crate::Result;
use ndarray::{s, Array1, Array2, ArrayView2};
use tracing::debug;

/// Rows and targets ready for the regressor.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    /// Feature rows `[S, N - L)`
    pub features: Array2<f64>,

    /// `price[S + L..N]`, one per feature row
    pub targets: Array1<f64>,

    /// Series index of the first feature row (S)
    pub first_index: usize,

    /// Lookahead in rows (L)
    pub lookahead: usize,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Align feature rows with future prices.
///
/// # Arguments
/// * `features` - One row per series index
/// * `prices` - Close prices, same length as `features`
/// * `startup` - Warm-up rows to drop (S)
/// * `lookahead` - Prediction horizon in rows (L)
///
/// # Errors
/// * `Configuration` if `L == 0` or `L >= N`
/// * `Alignment` if the table and prices differ in length
/// * `InsufficientData` if `N <= S + L`
pub fn align_labels(
    features: ArrayView2<'_, f64>,
    prices: &[f64],
    startup: usize,
    lookahead: usize,
) -> Result<TrainingSet> {
    let n = prices.len();
    if lookahead == 0 || lookahead >= n {
        return Err(ForecastError::config(format!(
            "lookahead {} must be in 1..{}",
            lookahead, n
        )));
    }
    if features.nrows() != n {
        return Err(ForecastError::Alignment {
            expected: n,
            actual: features.nrows(),
        });
    }
    if n <= startup + lookahead {
        return Err(ForecastError::insufficient(format!(
            "{} rows leave nothing to train on after {} warm-up and {} lookahead rows",
            n, startup, lookahead
        )));
    }

    let features = features.slice(s![startup..n - lookahead, ..]).to_owned();
    let targets = Array1::from(prices[startup + lookahead..].to_vec());
    debug_assert_eq!(features.nrows(), targets.len());

    debug!(
        rows = targets.len(),
        startup, lookahead, "aligned training labels"
    );
    Ok(TrainingSet {
        features,
        targets,
        first_index: startup,
        lookahead,
    })
}
