//! Rolling wavelet feature construction.
//!
//! Slides a window of length W across the close prices and denoises each
//! window independently, producing one feature row per series index.
//!
//! **Critical for correctness**: row `i` depends only on closes
//! `[i - W + 1, i]`. Rows before the first full window are zero. The table
//! always has exactly one row per candle; any mismatch is an alignment error
//! because every downstream merge assumes it.

use crate::denoise::{DenoiseMode, Denoiser, DenoiserConfig};
use crate::error::ForecastError;
use crate::series::{Candle, Series};
use crate::Result;
use ndarray::{s, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Raw series columns prepended by [`FeatureTable::merge_series`].
pub const SERIES_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Column name for the smoothed last-value feature.
pub const SMOOTHED_COLUMN: &str = "dwt_model";

/// Configuration for window feature construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Window length (power of two)
    pub window_len: usize,

    /// Denoiser output used as features
    pub mode: DenoiseMode,

    /// Wavelet/threshold settings
    pub denoiser: DenoiserConfig,

    /// Denoise windows on the calling thread even if `parallel` is enabled
    pub force_sequential: bool,
}

impl FeatureConfig {
    /// Default denoiser settings for `mode` with a window of `window_len`.
    pub fn new(window_len: usize, mode: DenoiseMode) -> Self {
        Self {
            window_len,
            mode,
            denoiser: DenoiserConfig::for_mode(mode),
            force_sequential: false,
        }
    }

    /// Column names produced for a denoiser of the given output width.
    pub fn column_names(&self, width: usize) -> Vec<String> {
        match self.mode {
            DenoiseMode::Smoothed => vec![SMOOTHED_COLUMN.to_string()],
            DenoiseMode::Coefficients => (0..width).map(|i| format!("coeff_{}", i)).collect(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self::new(128, DenoiseMode::Coefficients)
    }
}

/// Fixed-width numeric table with static column names, one row per candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    columns: Vec<String>,
    data: Array2<f64>,
}

impl FeatureTable {
    /// Wrap a matrix, checking that every column is named.
    pub fn new(columns: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if columns.len() != data.ncols() {
            return Err(ForecastError::config(format!(
                "{} column names for {} columns",
                columns.len(),
                data.ncols()
            )));
        }
        Ok(Self { columns, data })
    }

    /// Column names, in column order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Underlying `rows x columns` matrix.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Number of rows (one per candle).
    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    /// Row at a series index. Panics if out of bounds.
    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.row(index)
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|j| self.data.column(j))
    }

    /// Copy of a contiguous row range.
    pub fn slice_rows(&self, rows: Range<usize>) -> Result<FeatureTable> {
        if rows.start > rows.end || rows.end > self.nrows() {
            return Err(ForecastError::Alignment {
                expected: self.nrows(),
                actual: rows.end,
            });
        }
        Ok(FeatureTable {
            columns: self.columns.clone(),
            data: self.data.slice(s![rows, ..]).to_owned(),
        })
    }

    /// Whether every value in row `index` is zero.
    pub fn is_zero_row(&self, index: usize) -> bool {
        self.data.row(index).iter().all(|&v| v == 0.0)
    }

    /// Fail unless the table has exactly `expected` rows.
    pub fn ensure_rows(&self, expected: usize) -> Result<()> {
        if self.nrows() != expected {
            return Err(ForecastError::Alignment {
                expected,
                actual: self.nrows(),
            });
        }
        Ok(())
    }

    /// Prepend the raw series columns (`date` as epoch nanoseconds).
    pub fn merge_series(&self, series: &Series) -> Result<FeatureTable> {
        self.ensure_rows(series.len())?;

        let mut raw = Array2::<f64>::zeros((series.len(), SERIES_COLUMNS.len()));
        for (mut row, candle) in raw.axis_iter_mut(Axis(0)).zip(series.candles()) {
            for (dst, v) in row.iter_mut().zip(series_values(candle)) {
                *dst = v;
            }
        }

        let data = ndarray::concatenate(Axis(1), &[raw.view(), self.data.view()])
            .map_err(|e| ForecastError::config(format!("cannot merge series columns: {}", e)))?;
        let columns = SERIES_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.columns.iter().cloned())
            .collect();
        Ok(FeatureTable { columns, data })
    }
}

/// Raw values of one candle in [`SERIES_COLUMNS`] order.
pub fn series_values(candle: &Candle) -> [f64; 6] {
    [
        candle.epoch_nanos() as f64,
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
    ]
}

/// Denoise every full window, in index order.
///
/// Windows are independent, so they may be spread over the rayon pool; the
/// collected vector is still ordered by window end index.
fn denoise_windows(
    closes: &[f64],
    denoiser: &Denoiser,
    mode: DenoiseMode,
    force_sequential: bool,
) -> Result<Vec<Vec<f64>>> {
    let w = denoiser.window_len();
    let ends: Vec<usize> = (w - 1..closes.len()).collect();
    let run = |&end: &usize| denoiser.denoise(&closes[end + 1 - w..=end], mode);

    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            ends.iter().map(run).collect()
        } else {
            ends.par_iter().map(run).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        ends.iter().map(run).collect()
    }
}

/// Build the feature table for a whole series.
///
/// # Arguments
/// * `series` - Price series, oldest first
/// * `config` - Window length, denoise mode and wavelet settings
///
/// # Returns
/// One row per candle; rows `< W - 1` are zero. A series shorter than one
/// window yields an all-zero table of the denoiser's output width, the same
/// rows [`latest_row`] gives for those prefixes.
///
/// # Errors
/// * `Configuration` if the window length is unsupported (before any work)
/// * `InsufficientData` if a window is degenerate
/// * `Alignment` if the assembled table does not match the series
pub fn build_features(series: &Series, config: &FeatureConfig) -> Result<FeatureTable> {
    let denoiser = Denoiser::new(config.window_len, config.denoiser.clone())?;
    let w = denoiser.window_len();
    let n = series.len();
    let width = denoiser.output_width(config.mode);

    let closes = series.closes();
    let rows = denoise_windows(&closes, &denoiser, config.mode, config.force_sequential)?;
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(ForecastError::Alignment {
            expected: width,
            actual: bad.len(),
        });
    }

    let mut data = Array2::<f64>::zeros((n, width));
    for (offset, values) in rows.iter().enumerate() {
        for (j, &v) in values.iter().enumerate() {
            data[[w - 1 + offset, j]] = v;
        }
    }

    let table = FeatureTable::new(config.column_names(width), data)?;
    table.ensure_rows(n)?;

    debug!(
        rows = n,
        width,
        window = w,
        wavelet = %config.denoiser.wavelet,
        "built wavelet feature table"
    );
    Ok(table)
}

/// Feature row for the window ending at the last candle of `closes`.
///
/// Matches row `closes.len() - 1` of [`build_features`] on any series with
/// the same trailing `W` closes. Fewer than `W` closes give a zero row.
pub fn latest_row(closes: &[f64], denoiser: &Denoiser, mode: DenoiseMode) -> Result<Vec<f64>> {
    let w = denoiser.window_len();
    if closes.len() < w {
        return Ok(vec![0.0; denoiser.output_width(mode)]);
    }
    denoiser.denoise(&closes[closes.len() - w..], mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn series(n: usize) -> Series {
        let closes: Vec<f64> = (0..n)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 3.0 + i as f64 * 0.1)
            .collect();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Series::from_closes(t0, Duration::minutes(5), &closes).unwrap()
    }

    #[test]
    fn test_feature_config_default() {
        let config = FeatureConfig::default();
        assert_eq!(config.window_len, 128);
        assert_eq!(config.mode, DenoiseMode::Coefficients);
        assert!(!config.force_sequential);
    }

    #[test]
    fn test_build_features_shape_and_padding() {
        let config = FeatureConfig::new(128, DenoiseMode::Coefficients);
        let s = series(150);
        let table = build_features(&s, &config).unwrap();

        assert_eq!(table.nrows(), 150);
        assert_eq!(table.ncols(), 173);
        assert_eq!(table.columns()[0], "coeff_0");
        for i in 0..127 {
            assert!(table.is_zero_row(i), "row {} should be zero", i);
        }
        assert!(!table.is_zero_row(127));
    }

    #[test]
    fn test_build_features_smoothed_column() {
        let config = FeatureConfig::new(64, DenoiseMode::Smoothed);
        let table = build_features(&series(100), &config).unwrap();
        assert_eq!(table.columns(), &[SMOOTHED_COLUMN.to_string()]);
        assert_eq!(table.ncols(), 1);
        assert!(table.row(99)[0] > 0.0);
    }

    #[test]
    fn test_build_features_rejects_bad_window() {
        let config = FeatureConfig::new(100, DenoiseMode::Coefficients);
        let err = build_features(&series(200), &config).unwrap_err();
        assert!(matches!(err, ForecastError::Configuration(_)));
    }

    #[test]
    fn test_build_features_short_series() {
        let config = FeatureConfig::new(128, DenoiseMode::Coefficients);
        let table = build_features(&series(127), &config).unwrap();
        assert_eq!(table.nrows(), 127);
        assert_eq!(table.ncols(), 173);
        assert!((0..127).all(|i| table.is_zero_row(i)));

        let empty = build_features(&series(0), &config).unwrap();
        assert_eq!((empty.nrows(), empty.ncols()), (0, 173));
    }

    #[test]
    fn test_warmup_prefix_matches_latest_row() {
        let s = series(200);
        let config = FeatureConfig::new(128, DenoiseMode::Coefficients);
        let denoiser = Denoiser::new(128, config.denoiser.clone()).unwrap();
        let closes = s.closes();

        for len in [1, 50, 127, 128] {
            let prefix = build_features(&s.truncated(len), &config).unwrap();
            let row = latest_row(&closes[..len], &denoiser, config.mode).unwrap();
            assert_eq!(prefix.row(len - 1).to_vec(), row);
        }
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let s = series(160);
        let mut config = FeatureConfig::new(128, DenoiseMode::Coefficients);
        let pooled = build_features(&s, &config).unwrap();
        config.force_sequential = true;
        let sequential = build_features(&s, &config).unwrap();
        assert_eq!(pooled, sequential);
    }

    #[test]
    fn test_latest_row_matches_table() {
        let s = series(200);
        let config = FeatureConfig::new(128, DenoiseMode::Coefficients);
        let table = build_features(&s, &config).unwrap();
        let denoiser = Denoiser::new(128, config.denoiser.clone()).unwrap();
        let closes = s.closes();

        let row = latest_row(&closes[..150], &denoiser, config.mode).unwrap();
        assert_eq!(row.len(), table.ncols());
        for (a, b) in row.iter().zip(table.row(149).iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        let warm = latest_row(&closes[..10], &denoiser, config.mode).unwrap();
        assert!(warm.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_merge_series() {
        let s = series(80);
        let config = FeatureConfig::new(64, DenoiseMode::Smoothed);
        let merged = build_features(&s, &config).unwrap().merge_series(&s).unwrap();

        assert_eq!(merged.ncols(), SERIES_COLUMNS.len() + 1);
        assert_eq!(merged.columns()[0], "date");
        assert_eq!(merged.columns()[6], SMOOTHED_COLUMN);
        let close = merged.column("close").unwrap();
        assert_abs_diff_eq!(close[5], s.candles()[5].close);
        let date = merged.column("date").unwrap();
        assert_eq!(date[1] - date[0], 300.0e9);
    }

    #[test]
    fn test_merge_series_length_mismatch() {
        let s = series(80);
        let config = FeatureConfig::new(64, DenoiseMode::Smoothed);
        let table = build_features(&s, &config).unwrap();
        let err = table.merge_series(&s.truncated(79)).unwrap_err();
        assert_eq!(
            err,
            ForecastError::Alignment {
                expected: 79,
                actual: 80
            }
        );
    }

    #[test]
    fn test_slice_rows() {
        let s = series(80);
        let table = build_features(&s, &FeatureConfig::new(64, DenoiseMode::Smoothed)).unwrap();
        let tail = table.slice_rows(70..80).unwrap();
        assert_eq!(tail.nrows(), 10);
        assert_eq!(tail.row(0), table.row(70));
        assert!(table.slice_rows(70..81).is_err());
    }
}
