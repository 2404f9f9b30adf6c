//! Statistics helpers shared by the steady-state, replicate and sensitivity
//! code.
//!
//! Moments and normal quantiles come from `statrs`; these wrappers return
//! `None` where `statrs` would yield NaN (empty input, too few points,
//! mismatched lengths) so callers can map that onto their own errors.

use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;

/// Arithmetic mean.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().mean())
}

/// Population variance (divides by `n`).
pub fn variance(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().population_variance())
}

/// Population covariance of two equally long samples (divides by `n`).
pub fn covariance(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.is_empty() || xs.len() != ys.len() {
        return None;
    }
    Some(xs.iter().population_covariance(ys.iter()))
}

/// Unbiased sample variance (divides by `n - 1`).
pub fn sample_variance(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    Some(xs.iter().variance())
}

/// Unbiased sample covariance (divides by `n - 1`).
pub fn sample_covariance(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    Some(xs.iter().covariance(ys.iter()))
}

/// Two-sided z value for a confidence level, e.g. `0.95` gives about 1.96.
pub fn z_for_confidence(confidence: f64) -> Option<f64> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return None;
    }
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(normal.inverse_cdf(0.5 + confidence / 2.0))
}

/// Mean with a symmetric normal-approximation confidence half-width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanCi {
    pub mean: f64,
    pub half_width: f64,
}

impl MeanCi {
    pub fn low(&self) -> f64 {
        self.mean - self.half_width
    }

    pub fn high(&self) -> f64 {
        self.mean + self.half_width
    }
}

/// Mean of `samples` with a confidence half-width of `z * s / sqrt(n)`.
///
/// A single sample yields a zero half-width.
pub fn mean_ci(samples: &[f64], confidence: f64) -> Option<MeanCi> {
    let m = mean(samples)?;
    let z = z_for_confidence(confidence)?;
    let half_width = match sample_variance(samples) {
        Some(var) => z * (var / samples.len() as f64).sqrt(),
        None => 0.0,
    };
    Some(MeanCi { mean: m, half_width })
}

/// Difference of two independent sample means, `mean(a) - mean(b)`, with a
/// Welch-style normal-approximation half-width.
pub fn diff_ci(a: &[f64], b: &[f64], confidence: f64) -> Option<MeanCi> {
    let ma = mean(a)?;
    let mb = mean(b)?;
    let z = z_for_confidence(confidence)?;
    let se2 = |xs: &[f64]| sample_variance(xs).map_or(0.0, |v| v / xs.len() as f64);
    Some(MeanCi {
        mean: ma - mb,
        half_width: z * (se2(a) + se2(b)).sqrt(),
    })
}

/// Population covariance of `xs` and `ys` with a confidence half-width.
///
/// The half-width is the normal-approximation interval of the mean of the
/// centred products `(x - mean x)(y - mean y)`.
pub fn covariance_ci(xs: &[f64], ys: &[f64], confidence: f64) -> Option<MeanCi> {
    let cov = covariance(xs, ys)?;
    let mx = mean(xs)?;
    let my = mean(ys)?;
    let products: Vec<f64> = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).collect();
    let half_width = mean_ci(&products, confidence)?.half_width;
    Some(MeanCi { mean: cov, half_width })
}

/// Ordinary least-squares fit `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Standard error of the slope estimate.
    pub slope_std_err: f64,
    /// Number of points used.
    pub n: usize,
}

impl LinearFit {
    /// Whether the slope's confidence interval contains zero.
    pub fn slope_ci_contains_zero(&self, confidence: f64) -> Option<bool> {
        let z = z_for_confidence(confidence)?;
        let half = z * self.slope_std_err;
        Some(self.slope - half <= 0.0 && 0.0 <= self.slope + half)
    }
}

/// Least-squares line through `(xs, ys)`.
///
/// Needs at least three points and a non-constant `xs`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let n = xs.len();
    if n < 3 || ys.len() != n {
        return None;
    }
    let var_x = variance(xs)?;
    if var_x <= 0.0 {
        return None;
    }
    let slope = covariance(xs, ys)? / var_x;
    let intercept = mean(ys)? - slope * mean(xs)?;

    let sse: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    let sxx = var_x * n as f64;
    let slope_std_err = (sse / (n as f64 - 2.0) / sxx).sqrt();

    Some(LinearFit {
        slope,
        intercept,
        slope_std_err,
        n,
    })
}
