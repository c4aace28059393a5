//! Rolling candle buffers for live inference.
//!
//! The streaming path only ever needs the last `W` candles, so they are kept
//! in a fixed-capacity circular buffer instead of re-materialising the whole
//! series on every tick.

use crate::error::ForecastError;
use crate::series::Candle;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A generic rolling buffer with fixed capacity.
///
/// Uses a circular buffer to maintain a sliding window of data without
/// reallocations.
#[derive(Debug, Clone)]
pub struct RollingBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingBuffer<T> {
    /// Create a new rolling buffer with the specified capacity.
    ///
    /// # Example
    /// ```
    /// use dwt_forecast::RollingBuffer;
    /// let buffer: RollingBuffer<f64> = RollingBuffer::new(128);
    /// assert!(buffer.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a new element, evicting the oldest one when full.
    pub fn push(&mut self, value: T) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(value);
    }

    /// Get the current number of elements.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// Get the buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear all elements from the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Most recently pushed element.
    pub fn last(&self) -> Option<&T> {
        self.buffer.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }
}

/// The last `W` candles seen by a live predictor.
///
/// Enforces the same ordering rule as [`crate::Series`]: every pushed candle
/// must be strictly newer than the previous one. Also counts candles so a
/// live prediction can be matched to its series index. Both the count and
/// the ordering survive [`CandleWindow::clear`].
#[derive(Debug, Clone)]
pub struct CandleWindow {
    candles: RollingBuffer<Candle>,
    seen: usize,
    last_timestamp: Option<DateTime<Utc>>,
}

impl CandleWindow {
    /// Create an empty window holding up to `window_len` candles.
    pub fn new(window_len: usize) -> Self {
        Self {
            candles: RollingBuffer::new(window_len),
            seen: 0,
            last_timestamp: None,
        }
    }

    /// Append a candle.
    ///
    /// # Errors
    /// `InvalidSeries` if the candle is not newer than the last one or its
    /// close is not finite. The window is left unchanged.
    pub fn push(&mut self, candle: Candle) -> Result<()> {
        if let Some(last) = self.last_timestamp {
            if candle.timestamp <= last {
                return Err(ForecastError::InvalidSeries(format!(
                    "candle at {} is not after {}",
                    candle.timestamp, last
                )));
            }
        }
        if !candle.close.is_finite() {
            return Err(ForecastError::InvalidSeries(format!(
                "close price at {} is not finite",
                candle.timestamp
            )));
        }
        self.last_timestamp = Some(candle.timestamp);
        self.candles.push(candle);
        self.seen += 1;
        Ok(())
    }

    /// Closes currently held, oldest to newest.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Most recent buffered candle.
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Whether a full window is available.
    pub fn is_ready(&self) -> bool {
        self.candles.is_full()
    }

    /// Number of buffered candles.
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Candles needed for a full window.
    pub fn window_len(&self) -> usize {
        self.candles.capacity()
    }

    /// Total candles pushed since creation.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Series index of the latest candle pushed, buffered or not.
    pub fn index(&self) -> Option<usize> {
        self.seen.checked_sub(1)
    }

    /// Drop buffered candles. The index and the ordering rule carry on.
    pub fn clear(&mut self) {
        self.candles.clear();
    }
}
