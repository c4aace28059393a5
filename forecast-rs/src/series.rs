//! OHLCV price series.
//!
//! One row per time step with strictly increasing timestamps. Gaps are the
//! caller's concern; the series only checks ordering and finiteness.

use crate::error::ForecastError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Timestamp as integer epoch nanoseconds.
    ///
    /// Falls back to microseconds scaled up when the instant lies outside the
    /// range representable in `i64` nanoseconds (years beyond ~2262).
    pub fn epoch_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000))
    }
}

/// An ordered, validated sequence of candles.
///
/// Deserializes through [`Series::new`], so the same checks apply to data
/// loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Candle>", into = "Vec<Candle>")]
pub struct Series {
    candles: Vec<Candle>,
}

impl Series {
    /// Build a series, rejecting out-of-order timestamps and non-finite closes.
    pub fn new(candles: Vec<Candle>) -> Result<Self> {
        for (i, pair) in candles.windows(2).enumerate() {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(ForecastError::InvalidSeries(format!(
                    "timestamp at index {} is not after index {}",
                    i + 1,
                    i
                )));
            }
        }
        if let Some(i) = candles.iter().position(|c| !c.close.is_finite()) {
            return Err(ForecastError::InvalidSeries(format!(
                "close price at index {} is not finite",
                i
            )));
        }
        Ok(Self { candles })
    }

    /// Build a series from close prices only, one candle per `step`.
    ///
    /// Open/high/low are set to the close and volume to zero.
    pub fn from_closes(
        start: DateTime<Utc>,
        step: chrono::Duration,
        closes: &[f64],
    ) -> Result<Self> {
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let timestamp = i32::try_from(i)
                    .ok()
                    .and_then(|k| step.checked_mul(k))
                    .and_then(|offset| start.checked_add_signed(offset))
                    .ok_or_else(|| {
                        ForecastError::InvalidSeries(format!(
                            "timestamp at index {} is out of range",
                            i
                        ))
                    })?;
                Ok(Candle::new(timestamp, c, c, c, c, 0.0))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(candles)
    }

    /// Number of candles.
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// All candles, oldest first.
    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Close prices, oldest to newest.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// The first `len` candles as a new series.
    ///
    /// Used to replay history as it looked at an earlier point in time.
    pub fn truncated(&self, len: usize) -> Series {
        Series {
            candles: self.candles[..len.min(self.candles.len())].to_vec(),
        }
    }
}

impl TryFrom<Vec<Candle>> for Series {
    type Error = ForecastError;

    fn try_from(candles: Vec<Candle>) -> Result<Self> {
        Series::new(candles)
    }
}

impl From<Series> for Vec<Candle> {
    fn from(series: Series) -> Self {
        series.candles
    }
}
