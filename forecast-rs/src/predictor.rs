//! Price prediction inference.
//!
//! Two historical modes over a prebuilt feature table:
//!
//! - **Batch**: scale every row and predict every row in one pass.
//! - **Rolling**: walk the index in order and predict each row on its own,
//!   reproducing what a live process would have emitted candle by candle.
//!
//! Neither mode refits the scaler or touches the model. A rolling pass is
//! atomic: the first failing row aborts it and nothing partial is returned.
//!
//! [`StreamingPredictor`] is the live counterpart: it buffers the last `W`
//! candles and emits, for each new candle, the same value the rolling pass
//! produces at that index.

use crate::buffer::CandleWindow;
use crate::denoise::{DenoiseMode, Denoiser};
use crate::error::ForecastError;
use crate::features::{self, FeatureConfig, FeatureTable, SERIES_COLUMNS};
use crate::gbm::TrainedModel;
use crate::scaler::ScalerState;
use crate::series::Candle;
use crate::Result;
use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// How the host process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    DryRun,
    Backtest,
    Hyperopt,
    Plot,
}

impl RunMode {
    /// Historical runs replay candle by candle; live runs predict in bulk.
    pub fn inference_mode(&self) -> InferenceMode {
        match self {
            RunMode::Backtest | RunMode::Hyperopt | RunMode::Plot => InferenceMode::Rolling,
            RunMode::Live | RunMode::DryRun => InferenceMode::Batch,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Live => "live",
            RunMode::DryRun => "dry_run",
            RunMode::Backtest => "backtest",
            RunMode::Hyperopt => "hyperopt",
            RunMode::Plot => "plot",
        };
        f.write_str(name)
    }
}

impl FromStr for RunMode {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(RunMode::Live),
            "dry_run" | "dry-run" | "dryrun" => Ok(RunMode::DryRun),
            "backtest" => Ok(RunMode::Backtest),
            "hyperopt" => Ok(RunMode::Hyperopt),
            "plot" => Ok(RunMode::Plot),
            other => Err(ForecastError::config(format!("unknown run mode '{}'", other))),
        }
    }
}

/// Prediction strategy over a feature table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    Batch,
    Rolling,
}

/// Predictions aligned one-to-one with the series index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSeries {
    values: Vec<f64>,
    warmup: usize,
}

impl PredictionSeries {
    /// Predicted closes, one per series index.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of predictions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Prediction at a series index.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Number of leading predictions made from zero-padded warm-up rows.
    pub fn warmup(&self) -> usize {
        self.warmup
    }

    /// Whether the prediction at `index` came from a zero-padded row.
    pub fn is_warmup(&self, index: usize) -> bool {
        index < self.warmup
    }

    /// Percentage gap between prediction and close, `100 * (pred - close) / close`.
    pub fn divergence_pct(&self, closes: &[f64]) -> Result<Vec<f64>> {
        if closes.len() != self.values.len() {
            return Err(ForecastError::Alignment {
                expected: self.values.len(),
                actual: closes.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(closes)
            .map(|(p, c)| 100.0 * (p - c) / c)
            .collect())
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }
}

fn check_artifacts(table: &FeatureTable, model: &TrainedModel, scaler: &ScalerState) -> Result<()> {
    if model.feature_names() != scaler.columns() {
        return Err(ForecastError::config(format!(
            "model trained on {} features, scaler fit on {}",
            model.n_features(),
            scaler.columns().len()
        )));
    }
    if table.columns() != scaler.columns() {
        return Err(ForecastError::config(format!(
            "feature table has {} columns, scaler fit on {} with different names",
            table.ncols(),
            scaler.columns().len()
        )));
    }
    Ok(())
}

/// Scale and predict every row at once.
///
/// Warm-up rows are predicted too; the result reports no warm-up because
/// the window length is not known here.
pub fn predict_batch(
    table: &FeatureTable,
    model: &TrainedModel,
    scaler: &ScalerState,
) -> Result<PredictionSeries> {
    check_artifacts(table, model, scaler)?;
    let scaled = scaler.transform(table)?;
    let values = model.predict(scaled.view())?.to_vec();
    debug!(rows = values.len(), "batch prediction");
    Ok(PredictionSeries { values, warmup: 0 })
}

/// Bounded, in-order iterator of single-row predictions.
///
/// Each step reads only the row at its own index.
pub struct RollingPredictions<'a> {
    table: &'a FeatureTable,
    model: &'a TrainedModel,
    scaler: &'a ScalerState,
    next: usize,
}

impl<'a> RollingPredictions<'a> {
    pub fn new(
        table: &'a FeatureTable,
        model: &'a TrainedModel,
        scaler: &'a ScalerState,
    ) -> Result<Self> {
        check_artifacts(table, model, scaler)?;
        Ok(Self {
            table,
            model,
            scaler,
            next: 0,
        })
    }
}

impl Iterator for RollingPredictions<'_> {
    type Item = Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.table.nrows() {
            return None;
        }
        let row = self.table.row(self.next);
        self.next += 1;
        Some(
            self.scaler
                .transform_row(row)
                .and_then(|scaled| self.model.predict_row(scaled.view())),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.table.nrows() - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for RollingPredictions<'_> {}

/// Replay predictions one index at a time.
///
/// # Arguments
/// * `table` - Feature table built from the full series
/// * `model` / `scaler` - Artifacts from one fit
/// * `window_len` - W; the first `W - 1` predictions are flagged warm-up
///
/// # Errors
/// Any row failure aborts the whole pass.
pub fn predict_rolling(
    table: &FeatureTable,
    model: &TrainedModel,
    scaler: &ScalerState,
    window_len: usize,
) -> Result<PredictionSeries> {
    if window_len == 0 {
        return Err(ForecastError::config("window length must be positive"));
    }
    let values = RollingPredictions::new(table, model, scaler)?.collect::<Result<Vec<f64>>>()?;
    let warmup = (window_len - 1).min(values.len());
    debug!(rows = values.len(), warmup, "rolling prediction");
    Ok(PredictionSeries { values, warmup })
}

/// Dispatch on an inference mode.
pub fn predict(
    table: &FeatureTable,
    model: &TrainedModel,
    scaler: &ScalerState,
    mode: InferenceMode,
    window_len: usize,
) -> Result<PredictionSeries> {
    match mode {
        InferenceMode::Batch => predict_batch(table, model, scaler),
        InferenceMode::Rolling => predict_rolling(table, model, scaler, window_len),
    }
}

/// One live prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePrediction {
    /// Series index of the candle the prediction was made at
    pub index: usize,

    /// Timestamp of that candle
    pub timestamp: DateTime<Utc>,

    /// Predicted close `lookahead` candles ahead
    pub value: f64,

    /// Made before a full window was buffered
    pub warmup: bool,
}

/// Live predictor fed one candle at a time.
///
/// Shares its model and scaler with the pipeline that trained them.
pub struct StreamingPredictor {
    model: Arc<TrainedModel>,
    scaler: Arc<ScalerState>,
    denoiser: Denoiser,
    mode: DenoiseMode,
    include_series_columns: bool,
    window: CandleWindow,
}

impl StreamingPredictor {
    /// Build a live predictor for artifacts fit on tables produced by
    /// `features` (optionally merged with the raw series columns).
    ///
    /// # Errors
    /// `Configuration` if the window is invalid or the artifacts were fit on
    /// a different column layout.
    pub fn new(
        model: Arc<TrainedModel>,
        scaler: Arc<ScalerState>,
        features: &FeatureConfig,
        include_series_columns: bool,
    ) -> Result<Self> {
        let denoiser = Denoiser::new(features.window_len, features.denoiser.clone())?;
        let feature_width = denoiser.output_width(features.mode);
        let mut columns: Vec<String> = if include_series_columns {
            SERIES_COLUMNS.iter().map(|c| c.to_string()).collect()
        } else {
            Vec::new()
        };
        columns.extend(features.column_names(feature_width));

        if scaler.columns() != columns.as_slice() || model.feature_names() != scaler.columns() {
            return Err(ForecastError::config(format!(
                "artifacts fit on {} columns, live features produce {}",
                scaler.columns().len(),
                columns.len()
            )));
        }

        info!(
            window = features.window_len,
            width = columns.len(),
            "streaming predictor ready"
        );
        Ok(Self {
            model,
            scaler,
            denoiser,
            mode: features.mode,
            include_series_columns,
            window: CandleWindow::new(features.window_len),
        })
    }

    /// Append the next candle.
    pub fn update(&mut self, candle: Candle) -> Result<()> {
        self.window.push(candle)
    }

    /// Predict at the latest candle. `None` until a candle has been seen.
    pub fn predict(&self) -> Result<Option<LivePrediction>> {
        let (Some(candle), Some(index)) = (self.window.latest(), self.window.index()) else {
            return Ok(None);
        };

        let mut row = Vec::with_capacity(self.scaler.columns().len());
        if self.include_series_columns {
            row.extend(features::series_values(candle));
        }
        row.extend(features::latest_row(
            &self.window.closes(),
            &self.denoiser,
            self.mode,
        )?);

        let scaled = self.scaler.transform_row(Array1::from(row).view())?;
        let value = self.model.predict_row(scaled.view())?;
        Ok(Some(LivePrediction {
            index,
            timestamp: candle.timestamp,
            value,
            warmup: !self.window.is_ready(),
        }))
    }

    /// Drop buffered candles (e.g. after a data gap).
    ///
    /// Prediction indices keep counting from the candles already seen, and
    /// the next candle must still be newer than the last one.
    pub fn clear(&mut self) {
        self.window.clear();
    }

    /// Number of buffered candles.
    pub fn buffer_len(&self) -> usize {
        self.window.len()
    }
}
