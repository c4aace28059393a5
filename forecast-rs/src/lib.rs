//! Causal wavelet-denoised price forecasting.
//!
//! Slides a power-of-two window over a close-price series, denoises each
//! window with a discrete wavelet transform, and trains a gradient-boosted
//! regressor to predict the close `lookahead` candles ahead. Feature row `i`
//! only ever sees candles `0..=i`, so a rolling historical replay produces
//! exactly what a live process would have produced candle by candle.
//!
//! ```no_run
//! use dwt_forecast::{ForecastPipeline, PipelineConfig, RunMode, Series};
//!
//! # fn run(history: Series) -> dwt_forecast::Result<()> {
//! let mut pipeline = ForecastPipeline::new(PipelineConfig::default())?;
//! pipeline.train(&history)?;
//! let predictions = pipeline.predict(&history, RunMode::Backtest)?;
//! let divergence = predictions.divergence_pct(&history.closes())?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod denoise;
pub mod error;
pub mod features;
pub mod gbm;
pub mod labels;
pub mod pipeline;
pub mod predictor;
pub mod scaler;
pub mod series;
pub mod wavelet;

pub use buffer::{CandleWindow, RollingBuffer};
pub use denoise::{DenoiseMode, Denoiser, DenoiserConfig};
pub use error::ForecastError;
pub use features::{build_features, FeatureConfig, FeatureTable};
pub use gbm::{GbmParams, ModelMetrics, TrainedModel};
pub use labels::{align_labels, TrainingSet};
pub use pipeline::{fit, ForecastPipeline, PipelineConfig};
pub use predictor::{
    predict_batch, predict_rolling, InferenceMode, LivePrediction, PredictionSeries,
    RollingPredictions, RunMode, StreamingPredictor,
};
pub use scaler::ScalerState;
pub use series::{Candle, Series};
pub use wavelet::{ExtensionMode, Wavelet};

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, ForecastError>;
