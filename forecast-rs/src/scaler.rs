//! Robust per-column scaling.
//!
//! Each column is centred on its median and divided by its interquartile
//! range. The state is fit once per training run and then only read; a
//! prediction never refits it.

use crate::error::ForecastError;
use crate::features::FeatureTable;
use crate::Result;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Linear-interpolated percentile of sorted values, `q` in `[0, 100]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn fill_nan(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x
    }
}

/// Fitted median/IQR per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    columns: Vec<String>,
    center: Array1<f64>,
    scale: Array1<f64>,
}

impl ScalerState {
    /// Fit on every row of `table`. NaNs count as zero.
    pub fn fit(table: &FeatureTable) -> Result<Self> {
        if table.nrows() == 0 {
            return Err(ForecastError::insufficient("cannot fit scaler on an empty table"));
        }

        let width = table.ncols();
        let mut center = Array1::<f64>::zeros(width);
        let mut scale = Array1::<f64>::ones(width);
        let mut flat = 0usize;

        for (j, column) in table.data().columns().into_iter().enumerate() {
            let mut sorted: Vec<f64> = column.iter().map(|&v| fill_nan(v)).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));

            center[j] = percentile(&sorted, 50.0);
            let iqr = percentile(&sorted, 75.0) - percentile(&sorted, 25.0);
            if iqr > 0.0 && iqr.is_finite() {
                scale[j] = iqr;
            } else {
                flat += 1;
            }
        }

        if flat > 0 {
            warn!(
                columns = flat,
                width, "zero interquartile range, leaving those columns unscaled"
            );
        }
        debug!(rows = table.nrows(), width, "fitted robust scaler");

        Ok(Self {
            columns: table.columns().to_vec(),
            center,
            scale,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Per-column medians.
    pub fn center(&self) -> &Array1<f64> {
        &self.center
    }

    /// Per-column IQRs (1.0 where the column was flat).
    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    /// Scale a whole table with the fitted parameters.
    pub fn transform(&self, table: &FeatureTable) -> Result<Array2<f64>> {
        if table.columns() != self.columns.as_slice() {
            return Err(ForecastError::config(format!(
                "scaler fit on {} columns, table has {} with different names",
                self.columns.len(),
                table.ncols()
            )));
        }

        let mut out = table.data().clone();
        for mut row in out.rows_mut() {
            Zip::from(&mut row)
                .and(&self.center)
                .and(&self.scale)
                .for_each(|x, &c, &s| *x = fill_nan((fill_nan(*x) - c) / s));
        }
        Ok(out)
    }

    /// Scale a single row; the row must have the fitted width.
    pub fn transform_row(&self, row: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if row.len() != self.columns.len() {
            return Err(ForecastError::config(format!(
                "scaler fit on {} columns, row has {}",
                self.columns.len(),
                row.len()
            )));
        }
        Ok(Zip::from(&row)
            .and(&self.center)
            .and(&self.scale)
            .map_collect(|&x, &c, &s| fill_nan((fill_nan(x) - c) / s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn table(data: Array2<f64>) -> FeatureTable {
        let names = (0..data.ncols()).map(|j| format!("c{}", j)).collect();
        FeatureTable::new(names, data).unwrap()
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(percentile(&v, 50.0), 2.5);
        assert_abs_diff_eq!(percentile(&v, 25.0), 1.75);
        assert_abs_diff_eq!(percentile(&v, 75.0), 3.25);
        assert_eq!(percentile(&[7.0], 90.0), 7.0);
    }

    #[test]
    fn test_fit_median_and_iqr() {
        let t = table(array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0]]);
        let scaler = ScalerState::fit(&t).unwrap();
        assert_abs_diff_eq!(scaler.center()[0], 2.5);
        assert_abs_diff_eq!(scaler.scale()[0], 1.5);
        // Flat column keeps unit scale
        assert_abs_diff_eq!(scaler.center()[1], 5.0);
        assert_abs_diff_eq!(scaler.scale()[1], 1.0);
    }

    #[test]
    fn test_transform_is_idempotent_and_pure() {
        let t = table(array![[1.0, -2.0], [2.0, f64::NAN], [3.0, 8.0], [10.0, 0.5]]);
        let scaler = ScalerState::fit(&t).unwrap();
        let before = scaler.clone();

        let a = scaler.transform(&t).unwrap();
        let b = scaler.transform(&t).unwrap();
        assert_eq!(a, b);
        assert_eq!(scaler, before);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_nan_treated_as_zero() {
        let t = table(array![[0.0], [4.0], [8.0], [12.0]]);
        let scaler = ScalerState::fit(&t).unwrap();
        let nan = scaler.transform_row(array![f64::NAN].view()).unwrap();
        let zero = scaler.transform_row(array![0.0].view()).unwrap();
        assert_eq!(nan, zero);
    }

    #[test]
    fn test_transform_row_matches_table() {
        let t = table(array![[1.0, 10.0], [2.0, 30.0], [4.0, 20.0], [8.0, 40.0]]);
        let scaler = ScalerState::fit(&t).unwrap();
        let full = scaler.transform(&t).unwrap();
        for i in 0..t.nrows() {
            assert_eq!(scaler.transform_row(t.row(i)).unwrap(), full.row(i));
        }
    }

    #[test]
    fn test_rejects_different_columns() {
        let scaler = ScalerState::fit(&table(array![[1.0, 2.0], [3.0, 4.0]])).unwrap();
        let other = FeatureTable::new(
            vec!["x".to_string(), "y".to_string()],
            array![[1.0, 2.0]],
        )
        .unwrap();
        assert!(matches!(
            scaler.transform(&other).unwrap_err(),
            ForecastError::Configuration(_)
        ));
        assert!(scaler.transform_row(array![1.0].view()).is_err());
    }

    #[test]
    fn test_empty_table() {
        let empty = table(Array2::zeros((0, 3)));
        assert!(matches!(
            ScalerState::fit(&empty).unwrap_err(),
            ForecastError::InsufficientData(_)
        ));
    }
}
