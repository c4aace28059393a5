//! Error kinds surfaced by the forecasting core.
//!
//! Every failure is fatal for the call that raised it. Fallback policy
//! (skip the pair, wait for more history) belongs to the caller.

use thiserror::Error;

/// Errors raised while building features, fitting or predicting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// Invalid configuration, detected before any computation starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A table or vector does not line up with the series it was built from.
    #[error("alignment error: expected {expected} rows, got {actual}")]
    Alignment { expected: usize, actual: usize },

    /// Not enough history (or a numerically degenerate window).
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Prediction requested before a model and scaler were fit.
    #[error("model not trained")]
    NotTrained,

    /// Input series violates its ordering or value invariants.
    #[error("invalid series: {0}")]
    InvalidSeries(String),

    /// Model (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ForecastError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ForecastError::Configuration(msg.into())
    }

    pub(crate) fn insufficient(msg: impl Into<String>) -> Self {
        ForecastError::InsufficientData(msg.into())
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(e: serde_json::Error) -> Self {
        ForecastError::Serialization(e.to_string())
    }
}
