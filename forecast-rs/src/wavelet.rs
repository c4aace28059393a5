//! Discrete wavelet transform.
//!
//! Orthogonal filter banks (Haar and Daubechies `dbN`), single-level
//! analysis/synthesis and the multilevel `wavedec`/`waverec` pair.
//!
//! Conventions follow the common reference implementation so coefficient
//! layouts are interchangeable with features trained elsewhere:
//!
//! - analysis output length is `floor((N + F - 1) / 2)` (full convolution,
//!   downsampled, with the signal extended past its edges),
//! - synthesis keeps only the valid part, length `2N - F + 2`,
//! - `wavedec` returns `[cA_n, cD_n, ..., cD_1]`.

use crate::error::ForecastError;
use crate::Result;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};
use std::fmt;
use std::str::FromStr;

/// Highest Daubechies order supported by the filter generator.
pub const MAX_DAUBECHIES_ORDER: usize = 20;

const ROOT_MAX_ITER: usize = 1000;
const ROOT_TOL: f64 = 1e-15;

/// Wavelet family.
///
/// Serialized by name (`"haar"`, `"db12"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Wavelet {
    /// Haar wavelet, identical to `db1`. Handles sharp transitions well.
    Haar,
    /// Daubechies wavelet with `N` vanishing moments (filter length `2N`).
    Daubechies(usize),
}

impl Wavelet {
    /// Number of taps in each filter of the bank.
    pub fn filter_len(&self) -> usize {
        match self {
            Wavelet::Haar => 2,
            Wavelet::Daubechies(n) => 2 * n,
        }
    }

    /// Build the analysis/synthesis filter bank.
    pub fn filter_bank(&self) -> Result<FilterBank> {
        let dec_lo = match *self {
            Wavelet::Haar | Wavelet::Daubechies(1) => vec![1.0 / SQRT_2; 2],
            Wavelet::Daubechies(n) if (2..=MAX_DAUBECHIES_ORDER).contains(&n) => {
                daubechies_dec_lo(n)
            }
            Wavelet::Daubechies(n) => {
                return Err(ForecastError::config(format!(
                    "unsupported wavelet db{} (supported: db1..db{})",
                    n, MAX_DAUBECHIES_ORDER
                )))
            }
        };
        Ok(FilterBank::from_dec_lo(dec_lo))
    }
}

impl fmt::Display for Wavelet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wavelet::Haar => write!(f, "haar"),
            Wavelet::Daubechies(n) => write!(f, "db{}", n),
        }
    }
}

impl FromStr for Wavelet {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        if name == "haar" {
            return Ok(Wavelet::Haar);
        }
        let order = name
            .strip_prefix("db")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ForecastError::config(format!("unknown wavelet '{}'", s)))?;
        if order == 0 || order > MAX_DAUBECHIES_ORDER {
            return Err(ForecastError::config(format!(
                "unsupported wavelet '{}' (supported: haar, db1..db{})",
                s, MAX_DAUBECHIES_ORDER
            )));
        }
        Ok(Wavelet::Daubechies(order))
    }
}

impl TryFrom<String> for Wavelet {
    type Error = ForecastError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Wavelet> for String {
    fn from(w: Wavelet) -> Self {
        w.to_string()
    }
}

/// How the signal is extended past its edges during analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionMode {
    /// First-derivative extrapolation from the two edge samples.
    #[default]
    Smooth,
    /// Repeat the edge sample.
    Constant,
    /// Pad with zeros.
    Zero,
    /// Half-sample symmetric reflection.
    Symmetric,
}

impl ExtensionMode {
    /// Value of `x` at a possibly out-of-range index.
    fn sample(&self, x: &[f64], idx: isize) -> f64 {
        let n = x.len() as isize;
        if (0..n).contains(&idx) {
            return x[idx as usize];
        }
        match self {
            ExtensionMode::Zero => 0.0,
            ExtensionMode::Constant => {
                if idx < 0 {
                    x[0]
                } else {
                    x[(n - 1) as usize]
                }
            }
            ExtensionMode::Smooth => {
                if n == 1 {
                    return x[0];
                }
                if idx < 0 {
                    x[0] + idx as f64 * (x[1] - x[0])
                } else {
                    let last = x[(n - 1) as usize];
                    last + (idx - n + 1) as f64 * (last - x[(n - 2) as usize])
                }
            }
            ExtensionMode::Symmetric => {
                let m = idx.rem_euclid(2 * n);
                if m < n {
                    x[m as usize]
                } else {
                    x[(2 * n - 1 - m) as usize]
                }
            }
        }
    }
}

/// Orthogonal two-channel filter bank.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterBank {
    pub dec_lo: Vec<f64>,
    pub dec_hi: Vec<f64>,
    pub rec_lo: Vec<f64>,
    pub rec_hi: Vec<f64>,
}

impl FilterBank {
    /// Derive the full quadrature-mirror bank from the analysis low-pass.
    pub fn from_dec_lo(dec_lo: Vec<f64>) -> Self {
        let rec_lo: Vec<f64> = dec_lo.iter().rev().copied().collect();
        let rec_hi: Vec<f64> = dec_lo
            .iter()
            .enumerate()
            .map(|(i, &h)| if i % 2 == 0 { h } else { -h })
            .collect();
        let dec_hi: Vec<f64> = rec_hi.iter().rev().copied().collect();
        Self {
            dec_lo,
            dec_hi,
            rec_lo,
            rec_hi,
        }
    }

    pub fn len(&self) -> usize {
        self.dec_lo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dec_lo.is_empty()
    }
}

/// Deepest useful decomposition level for a signal of `data_len` samples.
pub fn max_level(data_len: usize, filter_len: usize) -> usize {
    if filter_len < 2 || data_len < filter_len - 1 {
        return 0;
    }
    let mut level = 0;
    while (filter_len - 1) << (level + 1) <= data_len {
        level += 1;
    }
    level
}

/// Length of the coefficient band produced by one analysis step.
pub fn dwt_coeff_len(data_len: usize, filter_len: usize) -> usize {
    (data_len + filter_len - 1) / 2
}

fn downsample_convolve(x: &[f64], filter: &[f64], mode: ExtensionMode) -> Vec<f64> {
    let n = x.len();
    let f = filter.len();
    let out_len = dwt_coeff_len(n, f);
    (0..out_len)
        .map(|o| {
            let i = (2 * o + 1) as isize;
            filter
                .iter()
                .enumerate()
                .map(|(j, &h)| h * mode.sample(x, i - j as isize))
                .sum()
        })
        .collect()
}

/// Single-level analysis: returns `(cA, cD)`.
pub fn dwt(x: &[f64], bank: &FilterBank, mode: ExtensionMode) -> Result<(Vec<f64>, Vec<f64>)> {
    if x.is_empty() {
        return Err(ForecastError::insufficient("cannot transform an empty signal"));
    }
    Ok((
        downsample_convolve(x, &bank.dec_lo, mode),
        downsample_convolve(x, &bank.dec_hi, mode),
    ))
}

fn upsample_convolve_valid(coeffs: &[f64], filter: &[f64], out: &mut [f64]) {
    let half = filter.len() / 2;
    for (o, i) in (half - 1..coeffs.len()).enumerate() {
        let mut even = 0.0;
        let mut odd = 0.0;
        for j in 0..half {
            even += filter[2 * j] * coeffs[i - j];
            odd += filter[2 * j + 1] * coeffs[i - j];
        }
        out[2 * o] += even;
        out[2 * o + 1] += odd;
    }
}

/// Single-level synthesis from equal-length `cA` and `cD`.
pub fn idwt(ca: &[f64], cd: &[f64], bank: &FilterBank) -> Result<Vec<f64>> {
    if ca.len() != cd.len() {
        return Err(ForecastError::Alignment {
            expected: ca.len(),
            actual: cd.len(),
        });
    }
    let f = bank.len();
    if ca.len() < f / 2 {
        return Err(ForecastError::insufficient(format!(
            "{} coefficients cannot be reconstructed with a {}-tap filter",
            ca.len(),
            f
        )));
    }
    let mut out = vec![0.0; 2 * ca.len() + 2 - f];
    upsample_convolve_valid(ca, &bank.rec_lo, &mut out);
    upsample_convolve_valid(cd, &bank.rec_hi, &mut out);
    Ok(out)
}

/// Multilevel decomposition: `[cA_n, cD_n, ..., cD_1]`.
///
/// `level = None` decomposes to [`max_level`].
pub fn wavedec(
    x: &[f64],
    wavelet: Wavelet,
    mode: ExtensionMode,
    level: Option<usize>,
) -> Result<Vec<Vec<f64>>> {
    let bank = wavelet.filter_bank()?;
    let deepest = max_level(x.len(), bank.len());
    let level = level.unwrap_or(deepest);
    if level > deepest {
        return Err(ForecastError::config(format!(
            "level {} too deep for {} samples with {} (max {})",
            level,
            x.len(),
            wavelet,
            deepest
        )));
    }

    let mut details = Vec::with_capacity(level);
    let mut approx = x.to_vec();
    for _ in 0..level {
        let (ca, cd) = dwt(&approx, &bank, mode)?;
        details.push(cd);
        approx = ca;
    }

    let mut coeffs = Vec::with_capacity(level + 1);
    coeffs.push(approx);
    coeffs.extend(details.into_iter().rev());
    Ok(coeffs)
}

/// Multilevel reconstruction, inverse of [`wavedec`].
pub fn waverec(coeffs: &[Vec<f64>], wavelet: Wavelet) -> Result<Vec<f64>> {
    let bank = wavelet.filter_bank()?;
    let (first, details) = coeffs
        .split_first()
        .ok_or_else(|| ForecastError::insufficient("no coefficient bands to reconstruct"))?;

    let mut approx = first.clone();
    for cd in details {
        if approx.len() == cd.len() + 1 {
            approx.truncate(cd.len());
        }
        approx = idwt(&approx, cd, &bank)?;
    }
    Ok(approx)
}

// ---------------------------------------------------------------------------
// Daubechies filter generation
// ---------------------------------------------------------------------------

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

fn poly_eval(coeffs: &[Complex64], z: Complex64) -> Complex64 {
    coeffs
        .iter()
        .rev()
        .fold(Complex64::new(0.0, 0.0), |acc, &c| acc * z + c)
}

fn poly_mul(a: &[Complex64], b: &[Complex64]) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Roots of a real polynomial given in ascending powers (Durand-Kerner).
fn poly_roots(coeffs: &[f64]) -> Vec<Complex64> {
    let degree = coeffs.len() - 1;
    let lead = coeffs[degree];
    let monic: Vec<Complex64> = coeffs
        .iter()
        .map(|&c| Complex64::new(c / lead, 0.0))
        .collect();
    let radius = 1.0 + monic[..degree].iter().map(|c| c.norm()).fold(0.0, f64::max);

    let mut roots: Vec<Complex64> = (0..degree)
        .map(|k| Complex64::from_polar(radius, 2.0 * PI * k as f64 / degree as f64 + 0.4))
        .collect();

    for _ in 0..ROOT_MAX_ITER {
        let mut max_step: f64 = 0.0;
        for i in 0..degree {
            let zi = roots[i];
            let denom = (0..degree)
                .filter(|&j| j != i)
                .fold(Complex64::new(1.0, 0.0), |acc, j| acc * (zi - roots[j]));
            let step = poly_eval(&monic, zi) / denom;
            roots[i] = zi - step;
            max_step = max_step.max(step.norm());
        }
        if max_step < ROOT_TOL {
            break;
        }
    }
    roots
}

/// Extremal-phase Daubechies analysis low-pass filter of order `n >= 2`.
///
/// Spectral factorisation: `|H(w)|^2 ∝ cos^{2n}(w/2) P(sin^2(w/2))` with
/// `P(y) = Σ_{k<n} C(n-1+k, k) y^k`. Each root `y_i` of `P` maps to a
/// reciprocal pair in `z`; the one inside the unit circle is kept.
fn daubechies_dec_lo(n: usize) -> Vec<f64> {
    let p: Vec<f64> = (0..n).map(|k| binomial(n - 1 + k, k)).collect();
    let one = Complex64::new(1.0, 0.0);

    let mut poly = vec![one];
    for _ in 0..n {
        poly = poly_mul(&poly, &[one, one]);
    }
    for y in poly_roots(&p) {
        let a = one - 2.0 * y;
        let disc = (a * a - one).sqrt();
        let z = if (a + disc).norm() < 1.0 { a + disc } else { a - disc };
        poly = poly_mul(&poly, &[-z, one]);
    }

    let taps: Vec<f64> = poly.iter().map(|c| c.re).collect();
    let sum: f64 = taps.iter().sum();
    taps.iter().map(|t| t * SQRT_2 / sum).collect()
}
