//! Logistic modulation of the bit probability by a covariate.
//!
//! Fits `P(bit = 1) = σ(α + β·z)` where `z` is the covariate standardized to
//! zero mean and unit variance, so β is the log-odds shift per standard
//! deviation. A stable source shows β near zero for any covariate.
//!
//! [`block_stability`] replaces the covariate with an alternating 0/1 block
//! indicator and refits at several block sizes. A real modulation keeps its
//! sign and size across block sizes; a fluke does not.

use serde::{Deserialize, Serialize};

use crate::error::{CalibError, Result};

/// Block sizes refit by [`block_stability`] when none are given.
pub const DEFAULT_BLOCK_SIZES: [usize; 3] = [2000, 4000, 8000];
/// Largest spread of β across block sizes still called stable.
pub const STABLE_BETA_RANGE: f64 = 0.01;

const MAX_ITERATIONS: usize = 100;
const TOLERANCE: f64 = 1e-10;
/// Keeps `ln` finite at p = 0 or 1.
const LN_GUARD: f64 = 1e-12;

/// Maximum-likelihood logistic fit of bits on one covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulationFit {
    pub n: usize,
    pub alpha: f64,
    /// Log-odds shift per standard deviation of the covariate.
    pub beta: f64,
    /// Wald standard error of β; `None` when the covariate is constant.
    pub beta_std_error: Option<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn standardize(s: &[f64]) -> Vec<f64> {
    let n = s.len() as f64;
    let mean = s.iter().sum::<f64>() / n;
    let sd = (s.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt();
    if sd > 0.0 {
        s.iter().map(|v| (v - mean) / sd).collect()
    } else {
        vec![0.0; s.len()]
    }
}

fn log_likelihood(bits: &[u8], z: &[f64], alpha: f64, beta: f64) -> f64 {
    bits.iter()
        .zip(z)
        .map(|(&y, &x)| {
            let p = sigmoid(alpha + beta * x);
            if y == 1 {
                (p + LN_GUARD).ln()
            } else {
                (1.0 - p + LN_GUARD).ln()
            }
        })
        .sum()
}

/// Fit `bits` against covariate `s` by Newton–Raphson.
///
/// Errors with `Configuration` on mismatched lengths, non-binary bits or a
/// non-finite covariate, and with `InsufficientData` when the bits are
/// empty or all equal.
pub fn fit_logistic_modulation(bits: &[u8], s: &[f64]) -> Result<ModulationFit> {
    if bits.len() != s.len() {
        return Err(CalibError::Configuration(format!(
            "covariate has {} values for {} bits",
            s.len(),
            bits.len()
        )));
    }
    if bits.iter().any(|&b| b > 1) {
        return Err(CalibError::Configuration(
            "modulation fit needs a 0/1 bit sequence".to_string(),
        ));
    }
    if s.iter().any(|v| !v.is_finite()) {
        return Err(CalibError::Configuration(
            "covariate contains a non-finite value".to_string(),
        ));
    }
    let n = bits.len();
    let ones = bits.iter().filter(|&&b| b == 1).count();
    if ones == 0 || ones == n {
        return Err(CalibError::InsufficientData(format!(
            "modulation fit needs both outcomes, got {ones} ones in {n} bits"
        )));
    }

    let z = standardize(s);
    let constant = z.iter().all(|&x| x == 0.0);
    let p_bar = ones as f64 / n as f64;
    let mut alpha = (p_bar / (1.0 - p_bar)).ln();
    let mut beta = 0.0;
    let mut iterations = 0;
    let mut converged = constant;
    let mut info = (0.0, 0.0, 0.0);

    while !converged && iterations < MAX_ITERATIONS {
        iterations += 1;
        let (mut g0, mut g1) = (0.0, 0.0);
        let (mut h00, mut h01, mut h11) = (0.0, 0.0, 0.0);
        for (&y, &x) in bits.iter().zip(&z) {
            let p = sigmoid(alpha + beta * x);
            let r = f64::from(y) - p;
            let w = p * (1.0 - p);
            g0 += r;
            g1 += r * x;
            h00 += w;
            h01 += w * x;
            h11 += w * x * x;
        }
        info = (h00, h01, h11);
        let det = h00 * h11 - h01 * h01;
        if det <= f64::MIN_POSITIVE {
            log::warn!("modulation fit: singular information matrix at iteration {iterations}");
            break;
        }
        let d_alpha = (h11 * g0 - h01 * g1) / det;
        let d_beta = (h00 * g1 - h01 * g0) / det;
        alpha += d_alpha;
        beta += d_beta;
        converged = d_alpha.abs().max(d_beta.abs()) < TOLERANCE;
    }
    if !converged {
        log::warn!(
            "modulation fit did not converge after {iterations} iterations (beta={beta:.6})"
        );
    }

    let (h00, h01, h11) = info;
    let det = h00 * h11 - h01 * h01;
    let beta_std_error = (!constant && det > 0.0).then(|| (h00 / det).sqrt());
    let log_likelihood = log_likelihood(bits, &z, alpha, beta);
    log::debug!(
        "modulation fit: n={n} alpha={alpha:.6} beta={beta:.6} ll={log_likelihood:.3} ({iterations} iterations)"
    );

    Ok(ModulationFit {
        n,
        alpha,
        beta,
        beta_std_error,
        log_likelihood,
        iterations,
        converged,
    })
}

/// Covariate that alternates 0, 1, 0, … per full block of `block_size`.
/// Bits past the last full block get 0.
pub fn block_indicator(n: usize, block_size: usize) -> Vec<f64> {
    let mut s = vec![0.0; n];
    if block_size == 0 {
        return s;
    }
    for (b, chunk) in s.chunks_exact_mut(block_size).enumerate() {
        if b % 2 == 1 {
            chunk.fill(1.0);
        }
    }
    s
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFit {
    pub block_size: usize,
    pub n_blocks: usize,
    pub fit: ModulationFit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStability {
    pub fits: Vec<BlockFit>,
    /// Block sizes with fewer than two full blocks.
    pub skipped: Vec<usize>,
    pub sign_consistent: bool,
    /// max β − min β over `fits`.
    pub beta_range: f64,
    pub stable: bool,
}

/// Refit the block indicator at each of `block_sizes`.
///
/// Errors with `InsufficientData` when no block size yields two full blocks.
pub fn block_stability(bits: &[u8], block_sizes: &[usize]) -> Result<BlockStability> {
    let mut fits = Vec::with_capacity(block_sizes.len());
    let mut skipped = Vec::new();
    for &block_size in block_sizes {
        let n_blocks = bits.len().checked_div(block_size).unwrap_or(0);
        if n_blocks < 2 {
            skipped.push(block_size);
            continue;
        }
        let s = block_indicator(bits.len(), block_size);
        let fit = fit_logistic_modulation(bits, &s)?;
        fits.push(BlockFit {
            block_size,
            n_blocks,
            fit,
        });
    }
    if fits.is_empty() {
        return Err(CalibError::InsufficientData(format!(
            "{} bits give fewer than two blocks at every block size {block_sizes:?}",
            bits.len()
        )));
    }

    let betas: Vec<f64> = fits.iter().map(|f| f.fit.beta).collect();
    let max = betas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = betas.iter().copied().fold(f64::INFINITY, f64::min);
    let sign = |b: f64| if b > 0.0 { 1 } else if b < 0.0 { -1 } else { 0 };
    let sign_consistent = betas.iter().all(|&b| sign(b) == sign(betas[0]));
    let beta_range = max - min;

    Ok(BlockStability {
        fits,
        skipped,
        sign_consistent,
        beta_range,
        stable: sign_consistent && beta_range < STABLE_BETA_RANGE,
    })
}

/// Modulation analysis of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModulation {
    pub source_id: String,
    pub n: usize,
    /// Fit against the recorded `s` column, when the source has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covariate_fit: Option<ModulationFit>,
    pub block_stability: BlockStability,
}

pub fn analyze_source(
    source_id: &str,
    bits: &[u8],
    covariate: Option<&[f64]>,
    block_sizes: &[usize],
) -> Result<SourceModulation> {
    let covariate_fit = covariate
        .map(|s| fit_logistic_modulation(bits, s))
        .transpose()?;
    let block_stability = block_stability(bits, block_sizes)?;
    if !block_stability.stable {
        log::warn!(
            "{source_id}: block modulation unstable (beta range {:.4}, sign consistent: {})",
            block_stability.beta_range,
            block_stability.sign_consistent
        );
    }
    Ok(SourceModulation {
        source_id: source_id.to_string(),
        n: bits.len(),
        covariate_fit,
        block_stability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{biased_control, fair_control};
    use crate::error::ErrorKind;

    /// Blocks of `block` bits alternating between exactly 30% and 70% ones.
    fn modulated(blocks: usize, block: usize) -> Vec<u8> {
        (0..blocks)
            .flat_map(|b| {
                let p = if b % 2 == 1 { 0.7 } else { 0.3 };
                biased_control(block, p, b as u64).unwrap()
            })
            .collect()
    }

    #[test]
    fn recovers_known_log_odds() {
        let bits = modulated(8, 2000);
        let s = block_indicator(bits.len(), 2000);
        let fit = fit_logistic_modulation(&bits, &s).unwrap();
        // z = ±1, so σ(α ± β) = 0.7 / 0.3 gives α = 0 and β = logit(0.7).
        let logit = (0.7f64 / 0.3).ln();
        assert!(fit.converged);
        assert!(fit.alpha.abs() < 1e-8);
        assert!((fit.beta - logit).abs() < 1e-8);
        let expected_ll = 16_000.0 * (0.7 * 0.7f64.ln() + 0.3 * 0.3f64.ln());
        assert!((fit.log_likelihood - expected_ll).abs() < 1e-4);
        let se = fit.beta_std_error.unwrap();
        assert!(se > 0.0 && se < 0.05);
    }

    #[test]
    fn unmodulated_source_has_small_beta() {
        let bits = fair_control(20_000, 11);
        let s: Vec<f64> = (0..20_000).map(|i| (i as f64 * 0.37).sin()).collect();
        let fit = fit_logistic_modulation(&bits, &s).unwrap();
        assert!(fit.converged);
        assert!(fit.beta.abs() < 4.0 * fit.beta_std_error.unwrap());
    }

    #[test]
    fn constant_covariate_fits_intercept_only() {
        let bits = biased_control(1000, 0.6, 1).unwrap();
        let fit = fit_logistic_modulation(&bits, &vec![3.0; 1000]).unwrap();
        assert_eq!(fit.beta, 0.0);
        assert!(fit.beta_std_error.is_none());
        assert!((fit.alpha - (0.6f64 / 0.4).ln()).abs() < 1e-12);
    }

    #[test]
    fn bad_inputs_rejected() {
        let err = fit_logistic_modulation(&[0, 1], &[1.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let err = fit_logistic_modulation(&[1, 1, 1], &[0.0, 1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
        let err = fit_logistic_modulation(&[0, 1], &[0.0, f64::NAN]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn block_indicator_alternates_full_blocks() {
        assert_eq!(
            block_indicator(7, 2),
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn balanced_blocks_are_stable() {
        let bits: Vec<u8> = (0..16_000).map(|i| (i % 2) as u8).collect();
        let report = block_stability(&bits, &DEFAULT_BLOCK_SIZES).unwrap();
        assert_eq!(report.fits.len(), 3);
        assert_eq!(report.fits[2].n_blocks, 2);
        assert!(report.fits.iter().all(|f| f.fit.beta == 0.0));
        assert!(report.sign_consistent);
        assert!(report.stable);
    }

    #[test]
    fn modulation_at_one_scale_is_unstable() {
        let bits = modulated(8, 2000);
        let report = block_stability(&bits, &DEFAULT_BLOCK_SIZES).unwrap();
        let logit = (0.7f64 / 0.3).ln();
        assert!((report.fits[0].fit.beta - logit).abs() < 1e-6);
        // Each 4000- and 8000-bit block holds one high and one low half.
        assert!(report.fits[1].fit.beta.abs() < 1e-9);
        assert!((report.beta_range - logit).abs() < 1e-6);
        assert!(!report.stable);
    }

    #[test]
    fn short_sources_skip_large_blocks() {
        let bits: Vec<u8> = (0..9000).map(|i| (i % 2) as u8).collect();
        let report = block_stability(&bits, &DEFAULT_BLOCK_SIZES).unwrap();
        assert_eq!(report.skipped, vec![8000]);
        assert_eq!(report.fits.len(), 2);

        let err = block_stability(&bits[..3000], &DEFAULT_BLOCK_SIZES).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[test]
    fn analyze_source_fits_recorded_covariate() {
        let bits = modulated(8, 2000);
        let s = block_indicator(bits.len(), 2000);
        let m = analyze_source("anu", &bits, Some(&s), &[2000]).unwrap();
        assert_eq!(m.n, 16_000);
        assert!(m.covariate_fit.unwrap().beta > 0.8);
        assert!(analyze_source("anu", &bits, None, &[2000]).unwrap().covariate_fit.is_none());
    }
}
