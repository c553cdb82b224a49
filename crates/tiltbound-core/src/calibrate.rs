//! Multi-source calibration: pool independent per-source bias estimates into
//! one bound on the QRNG tilt.
//!
//! The default is inverse-variance weighting with a normal-approximation
//! interval `ε̂ ± 1.96·sqrt(1/Σw)`. Every pooled result states which interval
//! method produced it. Inputs are put into a canonical order before any
//! arithmetic, so permuting the input list cannot change a single bit of the
//! output.
//!
//! A bootstrap lower bound landing on exactly 0 is a known finite-sample
//! artifact of discrete data. It is reported through
//! `lower_bound_is_bootstrap_edge_case`, never adjusted.
//!
//! Each source also carries a magnitude bound on |ε| chosen by
//! [`BoundMethod`]; the largest of them is reported as the conservative
//! alternative to the pooled interval.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CalibrationConfig;
use crate::error::{CalibError, Result};
use crate::estimator::{
    BiasEstimate, Evidence, clopper_pearson_interval, estimate, max_window_deviation,
};

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.96;
/// A 95% normal interval spans 2 · 1.96 standard deviations.
pub const CI_WIDTH_PER_SIGMA: f64 = 2.0 * Z_95;

/// Variance proxy for one estimate: `(width / 3.92)²` from its bootstrap
/// interval. A degenerate interval falls back to the binomial variance
/// `p(1 − p)/n`, and to `0.25/n` when that is zero too.
pub fn variance_proxy(est: &BiasEstimate) -> f64 {
    let width = est.ci_high - est.ci_low;
    if width > 0.0 {
        let sigma = width / CI_WIDTH_PER_SIGMA;
        return sigma * sigma;
    }
    let n = est.n.max(1) as f64;
    let p = est.k as f64 / n;
    let binomial = p * (1.0 - p) / n;
    if binomial > 0.0 { binomial } else { 0.25 / n }
}

// ---------------------------------------------------------------------------
// Pooling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMethod {
    /// Weighted mean with `w = 1/variance_proxy`.
    #[default]
    InverseVariance,
    /// Largest-magnitude point estimate with the union of source intervals.
    MaxConservative,
}

impl fmt::Display for PoolingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InverseVariance => "inverse_variance",
            Self::MaxConservative => "max_conservative",
        })
    }
}

// ---------------------------------------------------------------------------
// Per-source bounds
// ---------------------------------------------------------------------------

/// How one source's bound on |ε| is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundMethod {
    /// Bootstrap 95% percentile interval of the estimator.
    #[default]
    #[serde(rename = "bootstrap_95")]
    Bootstrap95,
    /// Exact binomial 95% interval.
    #[serde(rename = "clopper_pearson_95", alias = "chi2_95")]
    ClopperPearson95,
    /// The observed deviation itself, optionally maximized over rolling windows.
    #[serde(rename = "max_deviation")]
    MaxDeviation,
}

impl fmt::Display for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bootstrap95 => "bootstrap_95",
            Self::ClopperPearson95 => "clopper_pearson_95",
            Self::MaxDeviation => "max_deviation",
        })
    }
}

impl std::str::FromStr for BoundMethod {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "bootstrap" | "bootstrap_95" => Ok(Self::Bootstrap95),
            "clopper_pearson" | "clopper_pearson_95" | "exact" | "chi2_95" => {
                Ok(Self::ClopperPearson95)
            }
            "max_deviation" => Ok(Self::MaxDeviation),
            other => Err(CalibError::Configuration(format!(
                "unknown bound method '{other}' (expected bootstrap_95, clopper_pearson_95 or max_deviation)"
            ))),
        }
    }
}

/// Magnitude bound on one source's tilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBound {
    pub method: BoundMethod,
    /// Signed interval on ε the bound is read from.
    pub interval: (f64, f64),
    /// Bound on |ε|.
    pub epsilon_max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    /// Largest |p̂ − 0.5| over rolling windows of `window_size` bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_max_deviation: Option<f64>,
}

/// Bound on |ε| for `bits` under `config.bound_method`.
///
/// With a window set, the max-deviation bound is the rolling maximum; the
/// other methods report the rolling maximum next to their own bound.
pub fn source_bound(
    bits: &[u8],
    est: &BiasEstimate,
    config: &CalibrationConfig,
) -> Result<SourceBound> {
    let window_max_deviation = config
        .window_size
        .map(|w| max_window_deviation(bits, w))
        .transpose()?;
    let (interval, epsilon_max) = match config.bound_method {
        BoundMethod::Bootstrap95 => {
            let iv = (est.ci_low, est.ci_high);
            (iv, iv.0.abs().max(iv.1.abs()))
        }
        BoundMethod::ClopperPearson95 => {
            let iv = clopper_pearson_interval(est.n, est.k)?;
            (iv, iv.0.abs().max(iv.1.abs()))
        }
        BoundMethod::MaxDeviation => (
            (est.epsilon_hat, est.epsilon_hat),
            window_max_deviation.unwrap_or(est.epsilon_hat.abs()),
        ),
    };
    Ok(SourceBound {
        method: config.bound_method,
        interval,
        epsilon_max,
        window_size: config.window_size,
        window_max_deviation,
    })
}

/// How the pooled interval was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalMethod {
    /// `ε̂ ± 1.96·sqrt(1/Σw)`.
    NormalApproximation,
    /// One source: its own bootstrap interval passes through unchanged.
    SingleSourceBootstrap,
    /// `[min ci_low, max ci_high]` over all sources.
    SourceEnvelope,
}

/// One entry of the pooling input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInput {
    pub source_id: String,
    pub estimate: BiasEstimate,
    pub variance_proxy: f64,
}

impl SourceInput {
    /// Pair an estimate with its [`variance_proxy`].
    pub fn new(source_id: impl Into<String>, estimate: BiasEstimate) -> Self {
        let variance_proxy = variance_proxy(&estimate);
        Self {
            source_id: source_id.into(),
            estimate,
            variance_proxy,
        }
    }
}

/// Contribution of one source to a pooled estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWeight {
    pub source_id: String,
    pub n: u64,
    pub epsilon_hat: f64,
    pub variance_proxy: f64,
    /// Normalized weight; weights of one pooled estimate sum to 1.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledEstimate {
    pub epsilon_max: f64,
    pub ci: (f64, f64),
    pub method: PoolingMethod,
    pub interval_method: IntervalMethod,
    pub pooled_variance: f64,
    pub seed: u64,
    /// In canonical (sorted) order.
    pub sources: Vec<SourceWeight>,
    /// Pooled lower bound, or any source's bootstrap lower bound, is exactly 0.
    pub lower_bound_is_bootstrap_edge_case: bool,
    pub edge_case_sources: Vec<String>,
}

fn canonical_cmp(a: &SourceInput, b: &SourceInput) -> Ordering {
    a.source_id
        .cmp(&b.source_id)
        .then_with(|| a.estimate.epsilon_hat.total_cmp(&b.estimate.epsilon_hat))
        .then_with(|| a.estimate.n.cmp(&b.estimate.n))
        .then_with(|| a.variance_proxy.total_cmp(&b.variance_proxy))
        .then_with(|| a.estimate.ci_low.total_cmp(&b.estimate.ci_low))
        .then_with(|| a.estimate.ci_high.total_cmp(&b.estimate.ci_high))
}

/// Pool per-source estimates. The result does not depend on input order.
///
/// Errors with `InsufficientData` on an empty list, `Configuration` on a
/// non-positive variance proxy or on estimates produced with different seeds.
pub fn pool(inputs: &[SourceInput], method: PoolingMethod) -> Result<PooledEstimate> {
    let Some(first) = inputs.first() else {
        return Err(CalibError::InsufficientData(
            "pooling requires at least one source estimate".to_string(),
        ));
    };
    let seed = first.estimate.seed;
    for s in inputs {
        if !s.variance_proxy.is_finite() || s.variance_proxy <= 0.0 {
            return Err(CalibError::Configuration(format!(
                "source '{}' has invalid variance proxy {}",
                s.source_id, s.variance_proxy
            )));
        }
        if s.estimate.seed != seed {
            return Err(CalibError::Configuration(format!(
                "source '{}' was estimated with seed {}, expected {seed}",
                s.source_id, s.estimate.seed
            )));
        }
    }

    let mut sorted: Vec<&SourceInput> = inputs.iter().collect();
    sorted.sort_by(|a, b| canonical_cmp(a, b));

    let total_w: f64 = sorted.iter().map(|s| 1.0 / s.variance_proxy).sum();
    let sources: Vec<SourceWeight> = sorted
        .iter()
        .map(|s| SourceWeight {
            source_id: s.source_id.clone(),
            n: s.estimate.n,
            epsilon_hat: s.estimate.epsilon_hat,
            variance_proxy: s.variance_proxy,
            weight: (1.0 / s.variance_proxy) / total_w,
        })
        .collect();

    let (epsilon_max, ci, interval_method, pooled_variance) = if sorted.len() == 1 {
        let e = &sorted[0].estimate;
        (
            e.epsilon_hat,
            (e.ci_low, e.ci_high),
            IntervalMethod::SingleSourceBootstrap,
            sorted[0].variance_proxy,
        )
    } else {
        match method {
            PoolingMethod::InverseVariance => {
                let weighted: f64 = sorted
                    .iter()
                    .map(|s| s.estimate.epsilon_hat / s.variance_proxy)
                    .sum();
                let eps = weighted / total_w;
                let var = 1.0 / total_w;
                let half = Z_95 * var.sqrt();
                (
                    eps,
                    (eps - half, eps + half),
                    IntervalMethod::NormalApproximation,
                    var,
                )
            }
            PoolingMethod::MaxConservative => {
                let mut widest = sorted[0];
                for s in &sorted[1..] {
                    if s.estimate.epsilon_hat.abs() > widest.estimate.epsilon_hat.abs() {
                        widest = *s;
                    }
                }
                let lo = sorted
                    .iter()
                    .map(|s| s.estimate.ci_low)
                    .fold(f64::INFINITY, f64::min);
                let hi = sorted
                    .iter()
                    .map(|s| s.estimate.ci_high)
                    .fold(f64::NEG_INFINITY, f64::max);
                let max_var = sorted
                    .iter()
                    .map(|s| s.variance_proxy)
                    .fold(0.0, f64::max);
                (
                    widest.estimate.epsilon_hat,
                    (lo, hi),
                    IntervalMethod::SourceEnvelope,
                    max_var,
                )
            }
        }
    };

    let edge_case_sources: Vec<String> = sorted
        .iter()
        .filter(|s| s.estimate.ci_low == 0.0)
        .map(|s| s.source_id.clone())
        .collect();
    let lower_bound_is_bootstrap_edge_case = ci.0 == 0.0 || !edge_case_sources.is_empty();
    if lower_bound_is_bootstrap_edge_case {
        log::warn!(
            "lower bound at exactly 0 (finite-sample bootstrap edge effect) for: {}",
            if edge_case_sources.is_empty() {
                "pooled interval".to_string()
            } else {
                edge_case_sources.join(", ")
            }
        );
    }

    Ok(PooledEstimate {
        epsilon_max,
        ci,
        method,
        interval_method,
        pooled_variance,
        seed,
        sources,
        lower_bound_is_bootstrap_edge_case,
        edge_case_sources,
    })
}

// ---------------------------------------------------------------------------
// Calibration report
// ---------------------------------------------------------------------------

/// Non-fatal sanity-test outcome attached to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub name: String,
    pub statistic: f64,
    pub p_value: Option<f64>,
    pub passed: bool,
}

/// Bits of one source ready for calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBits {
    pub source_id: String,
    pub bits: Vec<u8>,
    /// Hashes of the raw files the bits came from.
    pub content_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub content_hashes: Vec<String>,
    pub estimate: BiasEstimate,
    pub evidence: Evidence,
    pub variance_proxy: f64,
    pub weight: f64,
    pub bound: SourceBound,
    pub diagnostics: Vec<Diagnostic>,
}

/// Library and platform identifiers needed to reproduce a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub tool: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub rng: String,
    pub seed_derivation: String,
}

impl EnvironmentInfo {
    pub fn current() -> Self {
        Self {
            tool: "tiltbound".to_string(),
            version: crate::VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            rng: "ChaCha20 (rand_chacha 0.9)".to_string(),
            seed_derivation: "splitmix64(seed ^ resample_index)".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Pooled point estimate of the tilt.
    pub epsilon_max: f64,
    pub ci: (f64, f64),
    pub method: PoolingMethod,
    pub interval_method: IntervalMethod,
    pub pooled_variance: f64,
    pub lower_bound_is_bootstrap_edge_case: bool,
    pub edge_case_sources: Vec<String>,
    pub bound_method: BoundMethod,
    /// Largest per-source bound on |ε|.
    pub max_source_bound: f64,
    pub sources: Vec<SourceReport>,
    pub seed: u64,
    pub config: CalibrationConfig,
    pub environment: EnvironmentInfo,
}

impl CalibrationReport {
    /// Magnitude bound usable as the QRNG-tilt constraint: the larger of
    /// |ci_low| and |ci_high|.
    pub fn tilt_bound(&self) -> Result<f64> {
        let bound = self.ci.0.abs().max(self.ci.1.abs());
        if bound.is_finite() && bound > 0.0 {
            Ok(bound)
        } else {
            Err(CalibError::Configuration(format!(
                "calibration interval [{}, {}] gives no positive tilt bound",
                self.ci.0, self.ci.1
            )))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// [`calibrate_with`] without diagnostics.
pub fn calibrate(sources: &[SourceBits], config: &CalibrationConfig) -> Result<CalibrationReport> {
    calibrate_with(sources, config, |_| Vec::new())
}

/// Estimate every source, pool with inverse-variance weighting and assemble
/// the report. `diagnose` runs on each source's bits and its results are
/// attached verbatim.
pub fn calibrate_with<F>(
    sources: &[SourceBits],
    config: &CalibrationConfig,
    diagnose: F,
) -> Result<CalibrationReport>
where
    F: Fn(&[u8]) -> Vec<Diagnostic>,
{
    config.validate()?;
    let mut seen = std::collections::BTreeSet::new();
    for s in sources {
        if !seen.insert(s.source_id.as_str()) {
            return Err(CalibError::Configuration(format!(
                "duplicate source_id '{}'; merge its bits before calibrating",
                s.source_id
            )));
        }
    }

    let mut inputs = Vec::with_capacity(sources.len());
    let mut bounds = Vec::with_capacity(sources.len());
    let mut diagnostics = Vec::with_capacity(sources.len());
    for s in sources {
        let with_source = |e: CalibError| match e {
            CalibError::InsufficientData(msg) => {
                CalibError::InsufficientData(format!("source '{}': {msg}", s.source_id))
            }
            other => other,
        };
        let est = estimate(&s.bits, config).map_err(with_source)?;
        bounds.push(source_bound(&s.bits, &est, config).map_err(with_source)?);
        log::info!(
            "{}: n={} eps={:+.6} BF10={:.3e} ({})",
            s.source_id,
            est.n,
            est.epsilon_hat,
            est.bayes_factor,
            est.evidence()
        );
        inputs.push(SourceInput::new(s.source_id.clone(), est));
        diagnostics.push(diagnose(&s.bits));
    }

    let pooled = pool(&inputs, PoolingMethod::InverseVariance)?;

    let max_source_bound = bounds.iter().map(|b| b.epsilon_max).fold(0.0, f64::max);
    let per_source = inputs
        .into_iter()
        .zip(bounds)
        .zip(diagnostics)
        .zip(sources)
        .map(|(((input, bound), diagnostics), src)| {
            let weight = pooled
                .sources
                .iter()
                .find(|w| w.source_id == input.source_id)
                .map_or(0.0, |w| w.weight);
            SourceReport {
                source_id: input.source_id,
                content_hashes: src.content_hashes.clone(),
                evidence: input.estimate.evidence(),
                estimate: input.estimate,
                variance_proxy: input.variance_proxy,
                weight,
                bound,
                diagnostics,
            }
        })
        .collect();

    Ok(CalibrationReport {
        epsilon_max: pooled.epsilon_max,
        ci: pooled.ci,
        method: pooled.method,
        interval_method: pooled.interval_method,
        pooled_variance: pooled.pooled_variance,
        lower_bound_is_bootstrap_edge_case: pooled.lower_bound_is_bootstrap_edge_case,
        edge_case_sources: pooled.edge_case_sources,
        bound_method: config.bound_method,
        max_source_bound,
        sources: per_source,
        seed: config.seed,
        config: *config,
        environment: EnvironmentInfo::current(),
    })
}
