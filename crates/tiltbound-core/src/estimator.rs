//! Bias estimator for a single binary sequence.
//!
//! Produces three independent views of the same data:
//! - the point estimate `epsilon_hat = mean(bits) − 0.5`;
//! - the Bayes factor of a symmetric Beta(a, a) biased-coin model against the
//!   fair-coin null, computed in log space;
//! - a nonparametric bootstrap 95% interval on epsilon.
//!
//! The posterior Beta(k + a, n − k + a) also gives an exact credible interval,
//! which is reported alongside the bootstrap interval but never replaces it.
//! The exact Clopper–Pearson interval and the rolling-window deviation back
//! the alternative per-source bounds in [`crate::calibrate::BoundMethod`].
//!
//! # Determinism
//!
//! Resample `r` draws from its own `ChaCha20Rng` seeded with
//! `derive_seed(seed, r)`. Work is split over threads by resample index, so
//! the interval is identical for any `threads` value.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use statrs::function::beta::ln_beta;

use crate::config::CalibrationConfig;
use crate::error::{CalibError, Result};
use crate::stats::{chunk_ranges, derive_seed, quantile};

/// BF10 below this is strong evidence for a fair source.
pub const STRONG_NULL_THRESHOLD: f64 = 1.0 / 3.0;
/// BF10 above this is strong evidence for bias.
pub const STRONG_BIAS_THRESHOLD: f64 = 10.0;

/// Two-sided interval coverage used for bootstrap and credible intervals.
const COVERAGE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    StrongNull,
    Inconclusive,
    StrongBias,
}

impl Evidence {
    pub fn from_bayes_factor(bf: f64) -> Self {
        if bf < STRONG_NULL_THRESHOLD {
            Self::StrongNull
        } else if bf > STRONG_BIAS_THRESHOLD {
            Self::StrongBias
        } else {
            Self::Inconclusive
        }
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StrongNull => "strong evidence for fair",
            Self::Inconclusive => "inconclusive",
            Self::StrongBias => "strong evidence for bias",
        })
    }
}

/// Result of [`estimate`] on one bit sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasEstimate {
    pub n: u64,
    /// Count of ones.
    pub k: u64,
    /// Signed deviation `k/n − 0.5`.
    pub epsilon_hat: f64,
    /// Bootstrap 2.5th percentile, never above `epsilon_hat`.
    pub ci_low: f64,
    /// Bootstrap 97.5th percentile, never below `epsilon_hat`.
    pub ci_high: f64,
    /// BF10, always finite and strictly positive.
    pub bayes_factor: f64,
    pub log_bayes_factor: f64,
    pub prior_concentration: f64,
    /// 95% posterior credible interval on epsilon.
    pub credible_low: f64,
    pub credible_high: f64,
    pub bootstrap_samples: usize,
    pub seed: u64,
}

impl BiasEstimate {
    pub fn evidence(&self) -> Evidence {
        Evidence::from_bayes_factor(self.bayes_factor)
    }

    pub fn ci_width(&self) -> f64 {
        self.ci_high - self.ci_low
    }

    /// True when the bootstrap interval collapsed onto the point estimate.
    pub fn is_degenerate(&self) -> bool {
        self.ci_low == self.ci_high
    }
}

/// Estimate the bias of `bits` under `config`.
///
/// Errors with `InsufficientData` on an empty sequence and `Configuration`
/// on any value other than 0 or 1 or on an invalid config.
pub fn estimate(bits: &[u8], config: &CalibrationConfig) -> Result<BiasEstimate> {
    config.validate()?;
    if bits.is_empty() {
        return Err(CalibError::InsufficientData(
            "cannot estimate bias of an empty bit sequence".to_string(),
        ));
    }
    if let Some(pos) = bits.iter().position(|&b| b > 1) {
        return Err(CalibError::Configuration(format!(
            "bit sequence contains value {} at index {pos}",
            bits[pos]
        )));
    }

    let n = bits.len() as u64;
    let k = bits.iter().filter(|&&b| b == 1).count() as u64;
    let epsilon_hat = k as f64 / n as f64 - 0.5;
    let a = config.prior_concentration;

    let log_bf = log_bayes_factor(n, k, a);
    let bayes_factor = log_bf.exp().clamp(f64::MIN_POSITIVE, f64::MAX);
    let (credible_low, credible_high) = credible_interval(n, k, a)?;

    let (mut ci_low, mut ci_high) = bootstrap_interval(bits, config)?;
    if ci_low > epsilon_hat || ci_high < epsilon_hat {
        log::debug!(
            "bootstrap interval [{ci_low}, {ci_high}] widened to contain epsilon_hat {epsilon_hat}"
        );
        ci_low = ci_low.min(epsilon_hat);
        ci_high = ci_high.max(epsilon_hat);
    }

    log::debug!(
        "estimate: n={n} k={k} eps={epsilon_hat:.6} BF10={bayes_factor:.4e} ci=[{ci_low:.6}, {ci_high:.6}]"
    );

    Ok(BiasEstimate {
        n,
        k,
        epsilon_hat,
        ci_low,
        ci_high,
        bayes_factor,
        log_bayes_factor: log_bf,
        prior_concentration: a,
        credible_low,
        credible_high,
        bootstrap_samples: config.bootstrap_samples,
        seed: config.seed,
    })
}

/// ln BF10 for `k` ones in `n` trials with a Beta(a, a) prior on p.
///
/// Both models share the sequence likelihood form, so the binomial
/// coefficient cancels: ln B(k+a, n−k+a) − ln B(a, a) + n·ln 2.
pub fn log_bayes_factor(n: u64, k: u64, prior_concentration: f64) -> f64 {
    let a = prior_concentration;
    let ones = k as f64;
    let zeros = (n - k) as f64;
    ln_beta(ones + a, zeros + a) - ln_beta(a, a) + n as f64 * std::f64::consts::LN_2
}

/// Central 95% of the Beta(k+a, n−k+a) posterior on p, shifted to epsilon.
pub fn credible_interval(n: u64, k: u64, prior_concentration: f64) -> Result<(f64, f64)> {
    let posterior = Beta::new(k as f64 + prior_concentration, (n - k) as f64 + prior_concentration)
        .map_err(|e| CalibError::Configuration(format!("posterior Beta({k}+a, {n}-{k}+a): {e}")))?;
    let tail = (1.0 - COVERAGE) / 2.0;
    Ok((
        posterior.inverse_cdf(tail) - 0.5,
        posterior.inverse_cdf(1.0 - tail) - 0.5,
    ))
}

/// Exact (Clopper–Pearson) 95% interval on p for `k` ones in `n` trials,
/// shifted to epsilon. The endpoints at k = 0 and k = n are pinned to the
/// edges of [0, 1].
pub fn clopper_pearson_interval(n: u64, k: u64) -> Result<(f64, f64)> {
    if n == 0 || k > n {
        return Err(CalibError::InsufficientData(format!(
            "exact binomial interval needs 0 <= k <= n with n > 0, got k={k} n={n}"
        )));
    }
    let tail = (1.0 - COVERAGE) / 2.0;
    let beta = |a: f64, b: f64| {
        Beta::new(a, b).map_err(|e| CalibError::Configuration(format!("Beta({a}, {b}): {e}")))
    };
    let p_low = if k == 0 {
        0.0
    } else {
        beta(k as f64, (n - k + 1) as f64)?.inverse_cdf(tail)
    };
    let p_high = if k == n {
        1.0
    } else {
        beta((k + 1) as f64, (n - k) as f64)?.inverse_cdf(1.0 - tail)
    };
    Ok((p_low - 0.5, p_high - 0.5))
}

/// Largest |p̂ − 0.5| over every contiguous window of `window` bits.
pub fn max_window_deviation(bits: &[u8], window: usize) -> Result<f64> {
    if window == 0 || window > bits.len() {
        return Err(CalibError::InsufficientData(format!(
            "rolling window of {window} needs at least that many bits, got {}",
            bits.len()
        )));
    }
    let mut ones: usize = bits[..window].iter().map(|&b| usize::from(b)).sum();
    let mut worst = ones;
    let mut best = ones;
    for i in window..bits.len() {
        ones = ones + usize::from(bits[i]) - usize::from(bits[i - window]);
        worst = worst.max(ones);
        best = best.min(ones);
    }
    let w = window as f64;
    Ok((worst as f64 / w - 0.5).abs().max((best as f64 / w - 0.5).abs()))
}

/// Bootstrap percentile interval. With zero resamples the interval is the
/// point estimate itself.
fn bootstrap_interval(bits: &[u8], config: &CalibrationConfig) -> Result<(f64, f64)> {
    let n = bits.len() as f64;
    let point = bits.iter().filter(|&&b| b == 1).count() as f64 / n - 0.5;
    if config.bootstrap_samples == 0 {
        return Ok((point, point));
    }

    let stats = bootstrap_epsilons(bits, config.bootstrap_samples, config.seed, config.threads);
    let tail = (1.0 - COVERAGE) / 2.0;
    Ok((quantile(&stats, tail), quantile(&stats, 1.0 - tail)))
}

/// Epsilon of each resample, in resample-index order.
pub fn bootstrap_epsilons(bits: &[u8], samples: usize, seed: u64, threads: usize) -> Vec<f64> {
    if threads <= 1 || samples < 2 {
        return (0..samples).map(|r| resample_epsilon(bits, seed, r)).collect();
    }
    let ranges = chunk_ranges(samples, threads);
    std::thread::scope(|s| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| {
                s.spawn(move || {
                    range
                        .map(|r| resample_epsilon(bits, seed, r))
                        .collect::<Vec<f64>>()
                })
            })
            .collect();
        let mut out = Vec::with_capacity(samples);
        for h in handles {
            match h.join() {
                Ok(part) => out.extend(part),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        out
    })
}

fn resample_epsilon(bits: &[u8], seed: u64, index: usize) -> f64 {
    let mut rng = ChaCha20Rng::seed_from_u64(derive_seed(seed, index as u64));
    let n = bits.len();
    let mut ones = 0u64;
    for _ in 0..n {
        ones += u64::from(bits[rng.random_range(0..n)]);
    }
    ones as f64 / n as f64 - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn cfg(b: usize) -> CalibrationConfig {
        CalibrationConfig {
            bootstrap_samples: b,
            ..Default::default()
        }
    }

    /// Exactly `k` ones spread evenly over `n` positions.
    fn exact(n: usize, k: usize) -> Vec<u8> {
        (0..n)
            .map(|i| u8::from((i + 1) * k / n > i * k / n))
            .collect()
    }

    #[test]
    fn empty_is_insufficient_data() {
        let err = estimate(&[], &cfg(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[test]
    fn non_binary_value_rejected() {
        let err = estimate(&[0, 1, 2], &cfg(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn invalid_prior_rejected() {
        let c = CalibrationConfig {
            prior_concentration: -1.0,
            ..Default::default()
        };
        assert_eq!(
            estimate(&[0, 1], &c).unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn all_ones_and_all_zeros_are_extreme_not_errors() {
        let ones = estimate(&[1; 500], &cfg(50)).unwrap();
        assert_eq!(ones.epsilon_hat, 0.5);
        assert!(ones.bayes_factor > 1e100);
        assert!(ones.bayes_factor.is_finite());
        assert_eq!((ones.ci_low, ones.ci_high), (0.5, 0.5));

        let zeros = estimate(&[0; 500], &cfg(50)).unwrap();
        assert_eq!(zeros.epsilon_hat, -0.5);
        assert!(zeros.bayes_factor > 1e100);
    }

    #[test]
    fn huge_all_ones_saturates_bayes_factor() {
        let e = estimate(&vec![1u8; 20_000], &cfg(0)).unwrap();
        assert_eq!(e.bayes_factor, f64::MAX);
        assert!(e.log_bayes_factor > 1000.0);
    }

    #[test]
    fn zero_bootstrap_is_degenerate() {
        let bits = exact(1000, 520);
        let e = estimate(&bits, &cfg(0)).unwrap();
        assert!(e.is_degenerate());
        assert_eq!(e.ci_low, e.epsilon_hat);
        assert!((e.epsilon_hat - 0.02).abs() < 1e-12);
    }

    #[test]
    fn log_bayes_factor_closed_form() {
        // n=2, k=1, a=1: B(2,2)/B(1,1) * 4 = (1/6) * 4 = 2/3.
        let lbf = log_bayes_factor(2, 1, 1.0);
        assert!((lbf.exp() - 2.0 / 3.0).abs() < 1e-12);
        // n=1: marginal 1/2 under both models.
        assert!(log_bayes_factor(1, 0, 3.0).abs() < 1e-12);
    }

    #[test]
    fn fair_counts_favor_null() {
        assert!(log_bayes_factor(200_000, 100_000, 1.0).exp() < STRONG_NULL_THRESHOLD);
        assert!(log_bayes_factor(200_000, 101_000, 1.0).exp() > STRONG_BIAS_THRESHOLD);
    }

    #[test]
    fn bootstrap_independent_of_thread_count() {
        let bits = exact(2000, 1030);
        let one = estimate(&bits, &cfg(64)).unwrap();
        let many = estimate(
            &bits,
            &CalibrationConfig {
                bootstrap_samples: 64,
                threads: 5,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(one, many);
    }

    #[test]
    fn interval_contains_point_estimate() {
        let bits = exact(3000, 1480);
        let e = estimate(&bits, &cfg(100)).unwrap();
        assert!(e.ci_low <= e.epsilon_hat && e.epsilon_hat <= e.ci_high);
        assert!(e.credible_low < e.epsilon_hat && e.epsilon_hat < e.credible_high);
        assert!(e.ci_width() > 0.0);
    }

    #[test]
    fn credible_interval_uses_exact_beta_quantiles() {
        // Beta(2, 1): F(x) = x², so quantiles are sqrt(q).
        let (lo, hi) = credible_interval(1, 1, 1.0).unwrap();
        assert!((lo - (0.025f64.sqrt() - 0.5)).abs() < 1e-6);
        assert!((hi - (0.975f64.sqrt() - 0.5)).abs() < 1e-6);

        // Beta(1, 21): F(x) = 1 − (1 − x)^21.
        let (lo, hi) = credible_interval(20, 0, 1.0).unwrap();
        assert!((lo - (0.5 - 0.975f64.powf(1.0 / 21.0))).abs() < 1e-6);
        assert!((hi - (0.5 - 0.025f64.powf(1.0 / 21.0))).abs() < 1e-6);

        // Beta(10, 2), solved numerically from F(x) = x^10 (11 − 10x).
        let (lo, hi) = credible_interval(10, 9, 1.0).unwrap();
        assert!((lo - 0.087_220_083).abs() < 1e-6);
        assert!((hi - 0.477_168_802).abs() < 1e-6);
    }

    #[test]
    fn credible_interval_at_large_n_is_narrow_and_centered() {
        let (lo, hi) = credible_interval(200_000, 101_000, 1.0).unwrap();
        let sd = (0.505f64 * 0.495 / 200_000.0).sqrt();
        assert!((lo - (0.005 - 1.96 * sd)).abs() < 1e-4);
        assert!((hi - (0.005 + 1.96 * sd)).abs() < 1e-4);
    }

    #[test]
    fn clopper_pearson_matches_reference_values() {
        let (lo, hi) = clopper_pearson_interval(10, 5).unwrap();
        assert!((lo - (0.187_086 - 0.5)).abs() < 1e-5);
        assert!((hi - (0.812_914 - 0.5)).abs() < 1e-5);

        // k = 0: upper end solves (1 − p)^10 = 0.025.
        let (lo, hi) = clopper_pearson_interval(10, 0).unwrap();
        assert_eq!(lo, -0.5);
        assert!((hi - (0.5 - 0.025f64.powf(0.1))).abs() < 1e-9);

        let (lo, hi) = clopper_pearson_interval(10, 10).unwrap();
        assert!((lo - (0.025f64.powf(0.1) - 0.5)).abs() < 1e-9);
        assert_eq!(hi, 0.5);

        assert!(clopper_pearson_interval(0, 0).is_err());
    }

    #[test]
    fn clopper_pearson_is_wider_than_credible() {
        let (cp_lo, cp_hi) = clopper_pearson_interval(400, 210).unwrap();
        let (cr_lo, cr_hi) = credible_interval(400, 210, 1.0).unwrap();
        assert!(cp_lo < cr_lo && cp_hi > cr_hi);
    }

    #[test]
    fn window_deviation_finds_local_run() {
        let bits = [0, 0, 0, 0, 1, 1, 1, 1, 0, 1, 0, 1];
        assert_eq!(max_window_deviation(&bits, 4).unwrap(), 0.5);
        assert_eq!(max_window_deviation(&bits, 12).unwrap(), 0.0);
        assert_eq!(max_window_deviation(&[0, 1, 1, 1], 2).unwrap(), 0.5);
        assert!(max_window_deviation(&bits, 13).is_err());
        assert!(max_window_deviation(&bits, 0).is_err());
    }

    #[test]
    fn evidence_thresholds() {
        assert_eq!(Evidence::from_bayes_factor(0.1), Evidence::StrongNull);
        assert_eq!(Evidence::from_bayes_factor(1.0), Evidence::Inconclusive);
        assert_eq!(Evidence::from_bayes_factor(10.0), Evidence::Inconclusive);
        assert_eq!(Evidence::from_bayes_factor(11.0), Evidence::StrongBias);
    }
}
