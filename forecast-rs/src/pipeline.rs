//! End-to-end forecasting pipeline.
//!
//! Wires the feature builder, label aligner, scaler and regressor together
//! and owns the trained artifacts:
//!
//! ```text
//! Untrained --train--> Trained --train--> Trained (artifacts replaced)
//! ```
//!
//! Predicting never changes state. The model and scaler are held behind
//! `Arc` so live predictors can share them; retraining swaps in new
//! artifacts without disturbing predictors already handed out.

use crate::denoise::{DenoiseMode, Denoiser, DenoiserConfig};
use crate::error::ForecastError;
use crate::features::{build_features, FeatureConfig, FeatureTable};
use crate::gbm::{GbmParams, TrainedModel};
use crate::labels::align_labels;
use crate::predictor::{self, PredictionSeries, RunMode, StreamingPredictor};
use crate::scaler::ScalerState;
use crate::series::Series;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Window length W (power of two)
    pub window_len: usize,

    /// Prediction horizon in candles (L)
    pub lookahead: usize,

    /// Warm-up rows excluded from training (S); at least `W - 1`
    pub startup_count: usize,

    /// Denoiser output used as features
    pub mode: DenoiseMode,

    /// Wavelet settings; `None` uses the defaults for `mode`
    pub denoiser: Option<DenoiserConfig>,

    /// Prepend raw date/OHLCV columns to the wavelet features
    pub include_series_columns: bool,

    /// Build features on the calling thread only
    pub force_sequential: bool,

    /// Regressor hyperparameters
    pub gbm: GbmParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_len: 128,
            lookahead: 6,
            startup_count: 128,
            mode: DenoiseMode::Coefficients,
            denoiser: None,
            include_series_columns: true,
            force_sequential: false,
            gbm: GbmParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting before any data is touched.
    pub fn validate(&self) -> Result<()> {
        Denoiser::new(self.window_len, self.denoiser_config())?;
        if self.lookahead == 0 {
            return Err(ForecastError::config("lookahead must be at least 1"));
        }
        if self.startup_count + 1 < self.window_len {
            return Err(ForecastError::config(format!(
                "startup count {} would train on warm-up rows of a {}-candle window",
                self.startup_count, self.window_len
            )));
        }
        self.gbm.validate()
    }

    pub fn denoiser_config(&self) -> DenoiserConfig {
        self.denoiser
            .clone()
            .unwrap_or_else(|| DenoiserConfig::for_mode(self.mode))
    }

    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            window_len: self.window_len,
            mode: self.mode,
            denoiser: self.denoiser_config(),
            force_sequential: self.force_sequential,
        }
    }

    /// Fewest candles a training series needs.
    pub fn min_training_len(&self) -> usize {
        self.startup_count + self.lookahead + 1
    }
}

/// Fit the scaler and regressor on one series.
///
/// The scaler is fit on every row of `features`; the regressor on rows
/// `[startup_count, N - lookahead)` against `close[startup_count + lookahead..]`.
///
/// # Returns
/// `(model, scaler)`, both immutable values owned by the caller.
pub fn fit(
    series: &Series,
    features: &FeatureTable,
    startup_count: usize,
    lookahead: usize,
    params: &GbmParams,
) -> Result<(TrainedModel, ScalerState)> {
    features.ensure_rows(series.len())?;

    let scaler = ScalerState::fit(features)?;
    let scaled = scaler.transform(features)?;
    let set = align_labels(scaled.view(), &series.closes(), startup_count, lookahead)?;
    let model = TrainedModel::train(
        set.features.view(),
        set.targets.view(),
        features.columns(),
        params,
    )?;

    info!(
        rows = set.len(),
        columns = features.ncols(),
        startup_count,
        lookahead,
        "fitted forecasting artifacts"
    );
    Ok((model, scaler))
}

#[derive(Debug, Clone)]
enum PipelineState {
    Untrained,
    Trained {
        model: Arc<TrainedModel>,
        scaler: Arc<ScalerState>,
    },
}

/// A configured pipeline and, once trained, its artifacts.
#[derive(Debug, Clone)]
pub struct ForecastPipeline {
    config: PipelineConfig,
    state: PipelineState,
}

impl ForecastPipeline {
    /// Validate `config` and start untrained.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: PipelineState::Untrained,
        })
    }

    /// Start trained from previously fit (e.g. persisted) artifacts.
    pub fn with_artifacts(
        config: PipelineConfig,
        model: TrainedModel,
        scaler: ScalerState,
    ) -> Result<Self> {
        config.validate()?;
        if model.feature_names() != scaler.columns() {
            return Err(ForecastError::config(
                "model and scaler were fit on different columns",
            ));
        }
        Ok(Self {
            config,
            state: PipelineState::Trained {
                model: Arc::new(model),
                scaler: Arc::new(scaler),
            },
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        matches!(self.state, PipelineState::Trained { .. })
    }

    pub fn model(&self) -> Option<Arc<TrainedModel>> {
        match &self.state {
            PipelineState::Trained { model, .. } => Some(Arc::clone(model)),
            PipelineState::Untrained => None,
        }
    }

    pub fn scaler(&self) -> Option<Arc<ScalerState>> {
        match &self.state {
            PipelineState::Trained { scaler, .. } => Some(Arc::clone(scaler)),
            PipelineState::Untrained => None,
        }
    }

    fn artifacts(&self) -> Result<(&TrainedModel, &ScalerState)> {
        match &self.state {
            PipelineState::Trained { model, scaler } => Ok((&**model, &**scaler)),
            PipelineState::Untrained => Err(ForecastError::NotTrained),
        }
    }

    /// Feature table for `series`, merged with the raw columns if configured.
    pub fn features(&self, series: &Series) -> Result<FeatureTable> {
        let table = build_features(series, &self.config.feature_config())?;
        if self.config.include_series_columns {
            table.merge_series(series)
        } else {
            Ok(table)
        }
    }

    /// Fit (or refit) on `series`, replacing any previous artifacts.
    pub fn train(&mut self, series: &Series) -> Result<()> {
        if series.len() < self.config.min_training_len() {
            return Err(ForecastError::insufficient(format!(
                "training needs at least {} candles, got {}",
                self.config.min_training_len(),
                series.len()
            )));
        }
        let table = self.features(series)?;
        let (model, scaler) = fit(
            series,
            &table,
            self.config.startup_count,
            self.config.lookahead,
            &self.config.gbm,
        )?;

        let retrained = self.is_trained();
        self.state = PipelineState::Trained {
            model: Arc::new(model),
            scaler: Arc::new(scaler),
        };
        info!(candles = series.len(), retrained, "pipeline trained");
        Ok(())
    }

    /// Predictions for every index of `series`, batch or rolling per `run_mode`.
    pub fn predict(&self, series: &Series, run_mode: RunMode) -> Result<PredictionSeries> {
        let (model, scaler) = self.artifacts()?;
        let table = self.features(series)?;
        let mode = run_mode.inference_mode();
        info!(%run_mode, ?mode, candles = series.len(), "predicting");
        predictor::predict(&table, model, scaler, mode, self.config.window_len)
    }

    /// Live predictor sharing this pipeline's current artifacts.
    pub fn streaming(&self) -> Result<StreamingPredictor> {
        let PipelineState::Trained { model, scaler } = &self.state else {
            return Err(ForecastError::NotTrained);
        };
        StreamingPredictor::new(
            Arc::clone(model),
            Arc::clone(scaler),
            &self.config.feature_config(),
            self.config.include_series_columns,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(n: usize) -> Series {
        let closes: Vec<f64> = (0..n)
            .map(|i| 20.0 + (i as f64 * 0.15).sin() + i as f64 * 0.02)
            .collect();
        let t0 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        Series::from_closes(t0, Duration::minutes(15), &closes).unwrap()
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            window_len: 64,
            startup_count: 64,
            mode: DenoiseMode::Smoothed,
            gbm: GbmParams {
                n_estimators: 10,
                ..GbmParams::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_len, 128);
        assert_eq!(config.lookahead, 6);
        assert_eq!(config.startup_count, 128);
        assert_eq!(config.denoiser_config(), DenoiserConfig::coefficients());
    }

    #[test]
    fn test_config_from_json() {
        let config =
            PipelineConfig::from_json_str(r#"{"window_len": 64, "startup_count": 70, "mode": "smoothed"}"#)
                .unwrap();
        assert_eq!(config.window_len, 64);
        assert_eq!(config.lookahead, 6);
        assert_eq!(config.denoiser_config(), DenoiserConfig::smoothed());

        let err = PipelineConfig::from_json_str(r#"{"window_len": 100}"#).unwrap_err();
        assert!(matches!(err, ForecastError::Configuration(_)));
        assert!(matches!(
            PipelineConfig::from_json_str("{"),
            Err(ForecastError::Serialization(_))
        ));
    }

    #[test]
    fn test_config_rejects_short_startup() {
        let config = PipelineConfig {
            startup_count: 10,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ForecastError::Configuration(_))
        ));
        let zero = PipelineConfig {
            lookahead: 0,
            ..PipelineConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_predict_before_train() {
        let pipeline = ForecastPipeline::new(small_config()).unwrap();
        assert!(!pipeline.is_trained());
        assert_eq!(
            pipeline.predict(&series(100), RunMode::Backtest).unwrap_err(),
            ForecastError::NotTrained
        );
        assert!(matches!(pipeline.streaming(), Err(ForecastError::NotTrained)));
    }

    #[test]
    fn test_train_then_predict() {
        let mut pipeline = ForecastPipeline::new(small_config()).unwrap();
        let s = series(120);
        pipeline.train(&s).unwrap();
        assert!(pipeline.is_trained());

        let rolling = pipeline.predict(&s, RunMode::Backtest).unwrap();
        let batch = pipeline.predict(&s, RunMode::Live).unwrap();
        assert_eq!(rolling.len(), 120);
        assert_eq!(rolling.warmup(), 63);
        assert_eq!(rolling.values(), batch.values());
    }

    #[test]
    fn test_retrain_replaces_artifacts() {
        let mut pipeline = ForecastPipeline::new(small_config()).unwrap();
        pipeline.train(&series(100)).unwrap();
        let first = pipeline.model().unwrap();
        let live = pipeline.streaming().unwrap();

        pipeline.train(&series(140)).unwrap();
        let second = pipeline.model().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        // Predictors already handed out keep their artifacts
        assert_eq!(live.buffer_len(), 0);
        assert_eq!(Arc::strong_count(&first), 2);
    }

    #[test]
    fn test_train_needs_enough_candles() {
        let mut pipeline = ForecastPipeline::new(small_config()).unwrap();
        let err = pipeline.train(&series(70)).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData(_)));
        assert!(!pipeline.is_trained());
    }

    #[test]
    fn test_fit_uses_trimmed_rows() {
        let s = series(100);
        let config = small_config();
        let table = build_features(&s, &config.feature_config()).unwrap();
        let (model, scaler) = fit(&s, &table, 64, 6, &config.gbm).unwrap();
        assert_eq!(model.feature_names(), scaler.columns());
        assert_eq!(model.n_features(), 1);

        let err = fit(&s.truncated(99), &table, 64, 6, &config.gbm).unwrap_err();
        assert!(matches!(err, ForecastError::Alignment { .. }));
    }

    #[test]
    fn test_with_artifacts() {
        let mut trained = ForecastPipeline::new(small_config()).unwrap();
        trained.train(&series(100)).unwrap();
        let model = TrainedModel::from_json(&trained.model().unwrap().to_json().unwrap()).unwrap();
        let scaler = (*trained.scaler().unwrap()).clone();

        let restored = ForecastPipeline::with_artifacts(small_config(), model, scaler).unwrap();
        let s = series(100);
        assert_eq!(
            restored.predict(&s, RunMode::Plot).unwrap(),
            trained.predict(&s, RunMode::Plot).unwrap()
        );
    }
}
