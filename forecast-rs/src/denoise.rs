//! Wavelet denoising of a fixed-length price window.
//!
//! The window is decomposed, the noise level is estimated from one detail
//! band, every detail band is hard-thresholded at the universal threshold
//! `sigma * sqrt(2 ln W)`, and the result is either reconstructed (smoothed
//! mode) or flattened into a feature vector (coefficient mode).
//!
//! A [`Denoiser`] validates its window length once at construction and is a
//! pure function of its input window afterwards.

use crate::error::ForecastError;
use crate::wavelet::{self, ExtensionMode, Wavelet};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Gaussian consistency constant for the absolute-deviation noise estimate.
const MAD_GAUSSIAN_SCALE: f64 = 0.6745;

/// How a window is turned into regressor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseMode {
    /// Reconstruct the denoised window and keep only its last value.
    Smoothed,
    /// Flatten all thresholded coefficient bands.
    #[default]
    Coefficients,
}

/// Denoiser configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserConfig {
    /// Wavelet family
    pub wavelet: Wavelet,

    /// Signal extension used by the analysis filters
    pub extension: ExtensionMode,

    /// Detail band (counted from the finest, 1-based) used to estimate sigma
    pub threshold_level: usize,

    /// Decomposition depth; `None` decomposes as deep as the window allows
    pub decomposition_level: Option<usize>,

    /// Normalize the window to zero mean / unit std before decomposing
    pub detrend: bool,
}

impl DenoiserConfig {
    /// Haar, fully decomposed, detrended: for the smoothed last-value model.
    pub fn smoothed() -> Self {
        Self {
            wavelet: Wavelet::Haar,
            extension: ExtensionMode::Smooth,
            threshold_level: 2,
            decomposition_level: None,
            detrend: true,
        }
    }

    /// db12 on raw prices: for coefficient features.
    pub fn coefficients() -> Self {
        Self {
            wavelet: Wavelet::Daubechies(12),
            extension: ExtensionMode::Smooth,
            threshold_level: 2,
            decomposition_level: None,
            detrend: false,
        }
    }

    /// Default configuration for the given output mode.
    pub fn for_mode(mode: DenoiseMode) -> Self {
        match mode {
            DenoiseMode::Smoothed => Self::smoothed(),
            DenoiseMode::Coefficients => Self::coefficients(),
        }
    }
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self::coefficients()
    }
}

/// Mean absolute deviation around the mean.
pub fn madev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).abs()).sum::<f64>() / n
}

/// Universal threshold from a detail band and the window length.
pub fn universal_threshold(band: &[f64], window_len: usize) -> f64 {
    let sigma = madev(band) / MAD_GAUSSIAN_SCALE;
    sigma * (2.0 * (window_len as f64).ln()).sqrt()
}

/// Zero every coefficient whose magnitude is below `threshold`.
pub fn hard_threshold(band: &mut [f64], threshold: f64) {
    for c in band.iter_mut() {
        if c.abs() < threshold {
            *c = 0.0;
        }
    }
}

/// Validated denoiser for windows of one fixed length.
#[derive(Debug, Clone)]
pub struct Denoiser {
    config: DenoiserConfig,
    window_len: usize,
    levels: usize,
    band_lens: Vec<usize>,
}

impl Denoiser {
    /// Validate `window_len` against the configured wavelet and levels.
    ///
    /// Fails with [`ForecastError::Configuration`] when the window is not a
    /// power of two, is too short for the wavelet, or cannot supply the
    /// detail band used for the noise estimate.
    pub fn new(window_len: usize, config: DenoiserConfig) -> Result<Self> {
        if window_len < 2 || !window_len.is_power_of_two() {
            return Err(ForecastError::config(format!(
                "window length {} must be a power of two >= 2",
                window_len
            )));
        }

        let filter_len = config.wavelet.filter_bank()?.len();
        let deepest = wavelet::max_level(window_len, filter_len);
        let levels = config.decomposition_level.unwrap_or(deepest);
        if levels == 0 || levels > deepest {
            return Err(ForecastError::config(format!(
                "window length {} supports 1..={} levels of {}, requested {}",
                window_len, deepest, config.wavelet, levels
            )));
        }
        if config.threshold_level == 0 || config.threshold_level > levels {
            return Err(ForecastError::config(format!(
                "threshold level {} outside the {} detail bands of {} on {} samples",
                config.threshold_level, levels, config.wavelet, window_len
            )));
        }

        // [cA_n, cD_n, ..., cD_1]
        let mut detail_lens = Vec::with_capacity(levels);
        let mut len = window_len;
        for _ in 0..levels {
            len = wavelet::dwt_coeff_len(len, filter_len);
            detail_lens.push(len);
        }
        let mut band_lens = vec![len];
        band_lens.extend(detail_lens.into_iter().rev());

        Ok(Self {
            config,
            window_len,
            levels,
            band_lens,
        })
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Number of decomposition levels applied to each window.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Length of the flattened coefficient vector.
    pub fn coefficient_count(&self) -> usize {
        self.band_lens.iter().sum()
    }

    /// Output width for a denoise mode.
    pub fn output_width(&self, mode: DenoiseMode) -> usize {
        match mode {
            DenoiseMode::Smoothed => 1,
            DenoiseMode::Coefficients => self.coefficient_count(),
        }
    }

    fn check_len(&self, window: &[f64]) -> Result<()> {
        if window.len() != self.window_len {
            return Err(ForecastError::config(format!(
                "denoiser built for windows of {} samples, got {}",
                self.window_len,
                window.len()
            )));
        }
        Ok(())
    }

    /// Returns the (optionally) normalized window and its (mean, std).
    fn prepare(&self, window: &[f64]) -> Result<(Vec<f64>, f64, f64)> {
        self.check_len(window)?;
        if !self.config.detrend {
            return Ok((window.to_vec(), 0.0, 1.0));
        }

        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let std = (window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if !(std > 0.0 && std.is_finite()) {
            return Err(ForecastError::insufficient(
                "window has zero variance and cannot be detrended",
            ));
        }
        Ok((window.iter().map(|v| (v - mean) / std).collect(), mean, std))
    }

    fn thresholded_bands(&self, signal: &[f64]) -> Result<Vec<Vec<f64>>> {
        let mut coeffs = wavelet::wavedec(
            signal,
            self.config.wavelet,
            self.config.extension,
            Some(self.levels),
        )?;

        let band = &coeffs[coeffs.len() - self.config.threshold_level];
        let threshold = universal_threshold(band, self.window_len);
        for detail in coeffs.iter_mut().skip(1) {
            hard_threshold(detail, threshold);
        }
        Ok(coeffs)
    }

    /// Denoised reconstruction of the whole window, in price units.
    pub fn smooth(&self, window: &[f64]) -> Result<Vec<f64>> {
        let (signal, mean, std) = self.prepare(window)?;
        let coeffs = self.thresholded_bands(&signal)?;
        let restored = wavelet::waverec(&coeffs, self.config.wavelet)?;
        Ok(restored
            .iter()
            .take(self.window_len)
            .map(|v| v * std + mean)
            .collect())
    }

    /// Last value of the denoised reconstruction.
    pub fn smoothed_last(&self, window: &[f64]) -> Result<f64> {
        let restored = self.smooth(window)?;
        restored
            .last()
            .copied()
            .ok_or_else(|| ForecastError::insufficient("empty reconstruction"))
    }

    /// Flattened thresholded coefficients `[cA_n, cD_n, ..., cD_1]`.
    pub fn coefficients(&self, window: &[f64]) -> Result<Vec<f64>> {
        let (signal, _, _) = self.prepare(window)?;
        let coeffs = self.thresholded_bands(&signal)?;
        Ok(coeffs.into_iter().flatten().collect())
    }

    /// Feature vector for one window in the given mode.
    pub fn denoise(&self, window: &[f64], mode: DenoiseMode) -> Result<Vec<f64>> {
        match mode {
            DenoiseMode::Smoothed => Ok(vec![self.smoothed_last(window)?]),
            DenoiseMode::Coefficients => self.coefficients(window),
        }
    }
}
