//! Regression/invariance harness and bitstream sanity battery.
//!
//! The harness answers one question: does the pipeline still produce the
//! numbers it produced before? It runs three checks:
//!
//! - **fixed seed**: two estimator runs with the same seed serialize to the
//!   same bytes;
//! - **seed stability**: the pooled `epsilon_max` varies by less than a
//!   coefficient-of-variation threshold across distinct seeds;
//! - **dominance**: a reference sweep keeps its constraint ordering and each
//!   dominant fraction stays inside a tolerance band.
//!
//! A failed check is a [`CalibError::RegressionDrift`].
//!
//! The sanity battery runs on each source's bits and is attached to the
//! calibration report as non-fatal diagnostics: the NIST SP 800-22 monobit,
//! block-frequency and runs statistics, a chi-square test for drift of the
//! one-rate across contiguous blocks, and a scan for repeated 64-bit words
//! that betrays duplicated or re-parsed chunks. [`report_warnings`] adds the
//! cross-source checks that need the whole report.

use std::collections::BTreeMap;
use std::f64::consts::SQRT_2;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, DiscreteCDF, Poisson};
use statrs::function::erf::erfc;

use tiltbound_core::controls::{biased_control, fair_control};
use tiltbound_core::stats::coefficient_of_variation;
use tiltbound_core::{
    CalibError, CalibrationConfig, CalibrationReport, ConstraintConfig, ConstraintName,
    ConstraintSet, Diagnostic, DominanceReport, ExclusionEnvelope, LogAxis, ParameterGrid, Result,
    SourceBits, calibrate, estimate,
};

/// Seeds used by the seed-stability check.
pub const DEFAULT_STABILITY_SEEDS: [u64; 3] = [42, 123, 999];
/// Maximum coefficient of variation of pooled `epsilon_max` across seeds.
pub const DEFAULT_MAX_CV: f64 = 0.01;
/// Absolute tolerance on each dominant fraction.
pub const DEFAULT_DOMINANCE_TOLERANCE: f64 = 0.02;

// ═══════════════════════════════════════════════════════════════════════════════
// Sanity battery
// ═══════════════════════════════════════════════════════════════════════════════

/// A diagnostic passes at p at or above this.
pub const SIGNIFICANCE: f64 = 0.01;
/// Shortest input the monobit and runs tests score.
pub const MIN_BITS: usize = 100;
/// Block length of the block-frequency test.
pub const FREQUENCY_BLOCK: usize = 128;
/// Contiguous blocks compared by [`temporal_drift`].
pub const DRIFT_BLOCKS: usize = 10;
/// Word length scanned by [`repeated_words`].
pub const ARTIFACT_WORD: usize = 64;

fn scored(name: &str, statistic: f64, p: f64) -> Diagnostic {
    Diagnostic {
        name: name.to_string(),
        statistic,
        p_value: Some(p),
        passed: p >= SIGNIFICANCE,
    }
}

fn too_short(name: &str, needed: usize, got: usize) -> Diagnostic {
    log::debug!("{name}: needs {needed} bits, got {got}");
    Diagnostic {
        name: name.to_string(),
        statistic: 0.0,
        p_value: None,
        passed: false,
    }
}

fn ones(bits: &[u8]) -> usize {
    bits.iter().filter(|&&b| b == 1).count()
}

/// Normalized excess of ones, `|#1 − #0| / sqrt(n)`.
pub fn monobit(bits: &[u8]) -> Diagnostic {
    let n = bits.len();
    if n < MIN_BITS {
        return too_short("monobit", MIN_BITS, n);
    }
    let excess = (2 * ones(bits)).abs_diff(n) as f64;
    let s_obs = excess / (n as f64).sqrt();
    scored("monobit", s_obs, erfc(s_obs / SQRT_2))
}

/// Chi-square of per-block one-proportions over [`FREQUENCY_BLOCK`]-bit blocks.
pub fn block_frequency(bits: &[u8]) -> Diagnostic {
    let blocks = bits.len() / FREQUENCY_BLOCK;
    if blocks < 10 {
        return too_short("block_frequency", 10 * FREQUENCY_BLOCK, bits.len());
    }
    let m = FREQUENCY_BLOCK as f64;
    let chi2: f64 = bits
        .chunks_exact(FREQUENCY_BLOCK)
        .map(|block| {
            let dev = ones(block) as f64 / m - 0.5;
            4.0 * m * dev * dev
        })
        .sum();
    match ChiSquared::new(blocks as f64) {
        Ok(dist) => scored("block_frequency", chi2, dist.sf(chi2)),
        Err(_) => too_short("block_frequency", 10 * FREQUENCY_BLOCK, bits.len()),
    }
}

/// Number of runs against its expectation given the observed one-rate.
/// A stream too unbalanced for the test to apply fails outright.
pub fn runs(bits: &[u8]) -> Diagnostic {
    let n = bits.len();
    if n < MIN_BITS {
        return too_short("runs", MIN_BITS, n);
    }
    let nf = n as f64;
    let pi = ones(bits) as f64 / nf;
    if (pi - 0.5).abs() >= 2.0 / nf.sqrt() {
        return scored("runs", 0.0, 0.0);
    }
    let observed = 1 + bits.windows(2).filter(|w| w[0] != w[1]).count();
    let spread = 2.0 * (2.0 * nf).sqrt() * pi * (1.0 - pi);
    let z = (observed as f64 - 2.0 * nf * pi * (1.0 - pi)).abs() / spread;
    scored("runs", z, erfc(z / SQRT_2))
}

/// Homogeneity of the one-rate across [`DRIFT_BLOCKS`] contiguous blocks.
/// Trailing bits that do not fill a block are ignored.
pub fn temporal_drift(bits: &[u8]) -> Diagnostic {
    let needed = DRIFT_BLOCKS * MIN_BITS;
    if bits.len() < needed {
        return too_short("temporal_drift", needed, bits.len());
    }
    let m = bits.len() / DRIFT_BLOCKS;
    let counts: Vec<f64> = bits
        .chunks_exact(m)
        .take(DRIFT_BLOCKS)
        .map(|c| ones(c) as f64)
        .collect();
    let p_bar = counts.iter().sum::<f64>() / (DRIFT_BLOCKS * m) as f64;
    let var = m as f64 * p_bar * (1.0 - p_bar);
    if var == 0.0 {
        return scored("temporal_drift", 0.0, 1.0);
    }
    let expected = m as f64 * p_bar;
    let chi2: f64 = counts.iter().map(|k| (k - expected).powi(2) / var).sum();
    match ChiSquared::new((DRIFT_BLOCKS - 1) as f64) {
        Ok(dist) => scored("temporal_drift", chi2, dist.sf(chi2)),
        Err(_) => too_short("temporal_drift", needed, bits.len()),
    }
}

/// Adjacent identical [`ARTIFACT_WORD`]-bit words, scored against the
/// Poisson count expected from the observed one-rate.
pub fn repeated_words(bits: &[u8]) -> Diagnostic {
    let words: Vec<&[u8]> = bits.chunks_exact(ARTIFACT_WORD).collect();
    if words.len() < 2 {
        return too_short("repeated_words", 2 * ARTIFACT_WORD, bits.len());
    }
    let repeats = words.windows(2).filter(|w| w[0] == w[1]).count() as u64;
    if repeats == 0 {
        return scored("repeated_words", 0.0, 1.0);
    }
    let p = ones(bits) as f64 / bits.len() as f64;
    let match_prob = (p * p + (1.0 - p) * (1.0 - p)).powi(ARTIFACT_WORD as i32);
    let lambda = (words.len() - 1) as f64 * match_prob;
    match Poisson::new(lambda) {
        Ok(dist) => scored("repeated_words", repeats as f64, dist.sf(repeats - 1)),
        Err(_) => too_short("repeated_words", 2 * ARTIFACT_WORD, bits.len()),
    }
}

/// Run the battery on one source's bits.
pub fn diagnose(bits: &[u8]) -> Vec<Diagnostic> {
    let tests: [fn(&[u8]) -> Diagnostic; 5] =
        [monobit, block_frequency, runs, temporal_drift, repeated_words];
    tests.iter().map(|t| t(bits)).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Report-level sanity
// ═══════════════════════════════════════════════════════════════════════════════

/// Largest |ε̂| may exceed the mean |ε̂| across sources by this factor.
pub const CONSISTENCY_RATIO: f64 = 3.0;
/// Sources with BF10 above this, next to sources below its inverse, disagree.
pub const MIXED_EVIDENCE_BF: f64 = 3.0;
/// Pooled |ε| above this is implausible for a working QRNG.
pub const LARGE_TILT: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityWarning {
    pub check: String,
    pub message: String,
}

impl SanityWarning {
    fn new(check: &str, message: String) -> Self {
        Self {
            check: check.to_string(),
            message,
        }
    }
}

/// Cross-source warnings for a finished calibration. Empty when nothing
/// looks off.
pub fn report_warnings(report: &CalibrationReport) -> Vec<SanityWarning> {
    let mut out = Vec::new();
    let eps: Vec<f64> = report
        .sources
        .iter()
        .map(|s| s.estimate.epsilon_hat.abs())
        .collect();
    if eps.len() >= 2 {
        let mean = eps.iter().sum::<f64>() / eps.len() as f64;
        let max = eps.iter().copied().fold(0.0, f64::max);
        if mean > 0.0 && max > CONSISTENCY_RATIO * mean {
            out.push(SanityWarning::new(
                "source_consistency",
                format!("max |eps| {max:.6} exceeds {CONSISTENCY_RATIO}x mean |eps| {mean:.6}"),
            ));
        }
    }

    let biased = sources_where(report, |bf| bf > MIXED_EVIDENCE_BF);
    let fair = sources_where(report, |bf| bf < 1.0 / MIXED_EVIDENCE_BF);
    if !biased.is_empty() && !fair.is_empty() {
        out.push(SanityWarning::new(
            "mixed_evidence",
            format!(
                "BF10 > {MIXED_EVIDENCE_BF} for [{}] but < 1/{MIXED_EVIDENCE_BF} for [{}]",
                biased.join(", "),
                fair.join(", ")
            ),
        ));
    }

    if report.epsilon_max.abs() > LARGE_TILT {
        out.push(SanityWarning::new(
            "large_tilt",
            format!(
                "pooled |eps| {:.6} above {LARGE_TILT}; check for a stuck or mislabeled source",
                report.epsilon_max.abs()
            ),
        ));
    }
    out
}

fn sources_where(report: &CalibrationReport, bayes_factor: impl Fn(f64) -> bool) -> Vec<&str> {
    report
        .sources
        .iter()
        .filter(|s| bayes_factor(s.estimate.bayes_factor))
        .map(|s| s.source_id.as_str())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Regression checks
// ═══════════════════════════════════════════════════════════════════════════════

/// Measurements of one harness check that passed. A failing check is an
/// error, never a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub check: String,
    /// Check-specific measure: byte length, CV, or largest fraction deviation.
    pub statistic: f64,
    pub threshold: f64,
    pub details: String,
}

fn drift(check: &str, detail: String) -> CalibError {
    log::error!("regression drift in {check}: {detail}");
    CalibError::RegressionDrift {
        check: check.to_string(),
        detail,
    }
}

/// Run the estimator twice with identical input and seed; the JSON
/// serializations must match byte for byte.
pub fn check_fixed_seed(bits: &[u8], config: &CalibrationConfig) -> Result<CheckReport> {
    let first = serde_json::to_vec(&estimate(bits, config)?)?;
    let second = serde_json::to_vec(&estimate(bits, config)?)?;
    if first != second {
        let at = first
            .iter()
            .zip(&second)
            .position(|(a, b)| a != b)
            .unwrap_or(first.len().min(second.len()));
        return Err(drift(
            "fixed_seed",
            format!("outputs for seed {} differ at byte {at}", config.seed),
        ));
    }
    Ok(CheckReport {
        check: "fixed_seed".to_string(),
        statistic: first.len() as f64,
        threshold: 0.0,
        details: format!("{} identical bytes for seed {}", first.len(), config.seed),
    })
}

/// Calibrate `sources` once per seed; the coefficient of variation of the
/// pooled `epsilon_max` must stay at or below `max_cv`. Interval bounds are
/// free to move.
pub fn check_seed_stability(
    sources: &[SourceBits],
    config: &CalibrationConfig,
    seeds: &[u64],
    max_cv: f64,
) -> Result<CheckReport> {
    if seeds.len() < 2 {
        return Err(CalibError::Configuration(
            "seed stability needs at least two seeds".to_string(),
        ));
    }
    if !(max_cv.is_finite() && max_cv > 0.0) {
        return Err(CalibError::Configuration(format!(
            "max_cv must be positive, got {max_cv}"
        )));
    }
    let mut values = Vec::with_capacity(seeds.len());
    for &seed in seeds {
        let report = calibrate(sources, &config.with_seed(seed))?;
        log::info!("seed {seed}: epsilon_max = {:+.8}", report.epsilon_max);
        values.push(report.epsilon_max);
    }
    let cv = coefficient_of_variation(&values);
    let details = format!("epsilon_max over seeds {seeds:?}: {values:?}, CV={cv:.6}");
    if cv > max_cv {
        return Err(drift("seed_stability", details));
    }
    Ok(CheckReport {
        check: "seed_stability".to_string(),
        statistic: cv,
        threshold: max_cv,
        details,
    })
}

/// Recorded dominance fractions for a fixed sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominanceBaseline {
    pub fractions: BTreeMap<ConstraintName, f64>,
    /// Absolute band allowed around each fraction.
    pub tolerance: f64,
}

impl DominanceBaseline {
    /// Baseline for [`reference_sweep`].
    pub fn reference() -> Self {
        Self {
            fractions: BTreeMap::from([
                (ConstraintName::AtlasMu, 0.0),
                (ConstraintName::HiggsInv, 0.0),
                (ConstraintName::FifthForce, 0.3492),
                (ConstraintName::QrngTilt, 0.6508),
            ]),
            tolerance: DEFAULT_DOMINANCE_TOLERANCE,
        }
    }

    /// Record a new baseline from a sweep.
    pub fn from_report(report: &DominanceReport, tolerance: f64) -> Self {
        Self {
            fractions: report.dominant_fraction.clone(),
            tolerance,
        }
    }

    /// Constraints whose baseline fraction exceeds the tolerance, by
    /// descending fraction. Only these have an ordering to preserve.
    pub fn ordering(&self) -> Vec<ConstraintName> {
        significant_ordering(&self.fractions, self.tolerance)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CalibError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn significant_ordering(
    fractions: &BTreeMap<ConstraintName, f64>,
    tolerance: f64,
) -> Vec<ConstraintName> {
    let mut names: Vec<(ConstraintName, f64)> = fractions
        .iter()
        .filter(|&(_, &f)| f > tolerance)
        .map(|(&n, &f)| (n, f))
        .collect();
    names.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    names.into_iter().map(|(n, _)| n).collect()
}

/// Compare a sweep against a recorded baseline. The ordering of significant
/// constraints must match, and every fraction must sit within the tolerance.
pub fn check_dominance(
    report: &DominanceReport,
    baseline: &DominanceBaseline,
) -> Result<CheckReport> {
    let mut worst = 0.0f64;
    let mut out_of_band = Vec::new();
    for (name, &expected) in &baseline.fractions {
        let observed = report.fraction(*name);
        let dev = (observed - expected).abs();
        worst = worst.max(dev);
        if dev > baseline.tolerance {
            out_of_band.push(format!("{name}: {observed:.4} vs {expected:.4}"));
        }
    }
    if !out_of_band.is_empty() {
        return Err(drift(
            "dominance",
            format!(
                "fractions outside ±{}: {}",
                baseline.tolerance,
                out_of_band.join(", ")
            ),
        ));
    }

    let expected_order = baseline.ordering();
    let observed_order: Vec<ConstraintName> =
        significant_ordering(&report.dominant_fraction, baseline.tolerance)
            .into_iter()
            .filter(|n| expected_order.contains(n))
            .collect();
    if observed_order != expected_order {
        return Err(drift(
            "dominance",
            format!("ordering {observed_order:?} differs from baseline {expected_order:?}"),
        ));
    }

    Ok(CheckReport {
        check: "dominance".to_string(),
        statistic: worst,
        threshold: baseline.tolerance,
        details: format!(
            "ordering {expected_order:?}; largest deviation {worst:.4} over {} viable points",
            report.viable_points
        ),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reference fixtures
// ═══════════════════════════════════════════════════════════════════════════════

/// 100 × 100 log grid: λ ∈ [1 µm, 10 cm], α ∈ [1e-12, 1e-6].
pub fn reference_grid() -> Result<ParameterGrid> {
    Ok(ParameterGrid::yukawa(
        LogAxis::new(1e-6, 1e-1, 100)?,
        LogAxis::new(1e-12, 1e-6, 100)?,
    ))
}

/// Defaults with ε_max = 1e-4 and a two-point fifth-force envelope
/// falling from 3e-4 at 1 µm to 3e-10 at 10 cm.
pub fn reference_config() -> Result<ConstraintConfig> {
    let mut cfg = ConstraintConfig::default().with_epsilon_max(1e-4);
    cfg.fifth_force.envelope = ExclusionEnvelope::from_points(vec![(1e-6, 3e-4), (1e-1, 3e-10)])?;
    Ok(cfg)
}

/// The sweep [`DominanceBaseline::reference`] was recorded from.
pub fn reference_sweep(threads: usize) -> Result<DominanceReport> {
    let set = ConstraintSet::from_config(&reference_config()?)?;
    set.sweep_parallel(&reference_grid()?, threads)
}

/// Three biased exact-count sources with ε ≈ 0.005, 0.005, 0.0052.
pub fn reference_sources(n: usize) -> Result<Vec<SourceBits>> {
    [("ref_a", 0.505, 1u64), ("ref_b", 0.505, 2), ("ref_c", 0.5052, 3)]
        .into_iter()
        .map(|(id, p, seed)| {
            Ok(SourceBits {
                source_id: id.to_string(),
                bits: biased_control(n, p, seed)?,
                content_hashes: Vec::new(),
            })
        })
        .collect()
}

/// Run all three checks on the reference fixtures.
///
/// `n` is the per-source length for the determinism and stability checks.
pub fn run_regression_suite(
    config: &CalibrationConfig,
    n: usize,
) -> Result<Vec<CheckReport>> {
    let fair = fair_control(n, config.seed);
    let fixed = check_fixed_seed(&fair, config)?;
    log::info!("{}", fixed.details);

    let sources = reference_sources(n)?;
    let stability = check_seed_stability(&sources, config, &DEFAULT_STABILITY_SEEDS, DEFAULT_MAX_CV)?;
    log::info!("{}", stability.details);

    let sweep = reference_sweep(config.threads)?;
    let dominance = check_dominance(&sweep, &DominanceBaseline::reference())?;
    log::info!("{}", dominance.details);

    Ok(vec![fixed, stability, dominance])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiltbound_core::ErrorKind;

    fn quick() -> CalibrationConfig {
        CalibrationConfig {
            bootstrap_samples: 100,
            threads: 4,
            ..Default::default()
        }
    }

    fn source(id: &str, bits: Vec<u8>) -> SourceBits {
        SourceBits {
            source_id: id.to_string(),
            bits,
            content_hashes: Vec::new(),
        }
    }

    fn names(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn battery_passes_fair_control() {
        let bits = fair_control(10_000, 42);
        let results = diagnose(&bits);
        assert_eq!(
            names(&results),
            ["monobit", "block_frequency", "runs", "temporal_drift", "repeated_words"]
        );
        // Exactly balanced, so the monobit statistic is zero.
        assert_eq!(results[0].statistic, 0.0);
        assert!(results[0].p_value.unwrap() > 0.99);
        for d in &results {
            assert!(d.p_value.is_some(), "{} unscored", d.name);
        }
        assert!(results[4].passed);
    }

    #[test]
    fn monobit_fails_constant_stream() {
        let d = monobit(&[1u8; 1000]);
        assert!(!d.passed);
        assert!((d.statistic - 1000f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn runs_fails_alternating_stream() {
        let bits: Vec<u8> = (0..1000).map(|i| (i % 2) as u8).collect();
        let d = runs(&bits);
        assert!(!d.passed);
        assert!(d.statistic > 10.0);
    }

    #[test]
    fn short_input_is_unscored() {
        let d = block_frequency(&[0, 1, 0]);
        assert!(!d.passed);
        assert!(d.p_value.is_none());
        let all = diagnose(&[1, 0]);
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|d| d.p_value.is_none() && !d.passed));
    }

    #[test]
    fn drift_between_halves_is_flagged() {
        let mut bits = biased_control(5_000, 0.45, 1).unwrap();
        bits.extend(biased_control(5_000, 0.55, 2).unwrap());
        let d = temporal_drift(&bits);
        assert!(!d.passed);
        assert!(d.p_value.unwrap() < 1e-6);

        // Same bits, shuffled together: no drift.
        let steady = biased_control(10_000, 0.5, 3).unwrap();
        assert!(temporal_drift(&steady).passed);
    }

    #[test]
    fn drift_on_constant_stream_is_trivially_homogeneous() {
        let d = temporal_drift(&[0u8; 2000]);
        assert_eq!(d.statistic, 0.0);
        assert_eq!(d.p_value, Some(1.0));
    }

    #[test]
    fn duplicated_chunk_is_a_format_artifact() {
        let word = fair_control(ARTIFACT_WORD, 9);
        let mut bits = fair_control(6_400, 10);
        bits.extend(&word);
        bits.extend(&word);
        let d = repeated_words(&bits);
        assert_eq!(d.statistic, 1.0);
        assert!(!d.passed);

        assert_eq!(repeated_words(&fair_control(6_400, 10)).statistic, 0.0);
    }

    #[test]
    fn repeated_words_expected_for_heavy_bias() {
        // p = 0.99 makes identical words common without any artifact.
        let bits = biased_control(64_000, 0.99, 4).unwrap();
        let d = repeated_words(&bits);
        assert!(d.statistic > 200.0);
        assert!(d.p_value.unwrap() > 1e-4);
    }

    fn quick_report(sources: &[SourceBits]) -> CalibrationReport {
        calibrate(
            sources,
            &CalibrationConfig {
                bootstrap_samples: 50,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn consistent_fair_sources_raise_no_warning() {
        let report = quick_report(&[
            source("a", biased_control(20_000, 0.501, 1).unwrap()),
            source("b", biased_control(20_000, 0.502, 2).unwrap()),
            source("c", biased_control(20_000, 0.5015, 3).unwrap()),
        ]);
        assert!(report_warnings(&report).is_empty());
    }

    #[test]
    fn outlier_source_and_mixed_evidence_are_warned() {
        let report = quick_report(&[
            source("fair_a", fair_control(20_000, 1)),
            source("fair_b", fair_control(20_000, 2)),
            source("fair_c", biased_control(20_000, 0.5005, 3).unwrap()),
            source("stuck", biased_control(20_000, 0.6, 4).unwrap()),
        ]);
        let warnings = report_warnings(&report);
        let checks: Vec<&str> = warnings.iter().map(|w| w.check.as_str()).collect();
        assert!(checks.contains(&"source_consistency"));
        assert!(checks.contains(&"mixed_evidence"));
        let mixed = warnings.iter().find(|w| w.check == "mixed_evidence").unwrap();
        assert!(mixed.message.contains("stuck"));
        assert!(mixed.message.contains("fair_a"));
    }

    #[test]
    fn large_pooled_tilt_is_warned() {
        let report = quick_report(&[source("hot", biased_control(10_000, 0.55, 1).unwrap())]);
        let warnings = report_warnings(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].check, "large_tilt");
    }

    #[test]
    fn fixed_seed_check_passes() {
        let bits = fair_control(5_000, 1);
        let report = check_fixed_seed(&bits, &quick()).unwrap();
        assert_eq!(report.check, "fixed_seed");
        assert!(report.statistic > 0.0);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("passed").is_none());
    }

    #[test]
    fn fixed_seed_propagates_estimator_errors() {
        let err = check_fixed_seed(&[], &quick()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[test]
    fn seed_stability_under_one_percent() {
        let sources = reference_sources(20_000).unwrap();
        let report =
            check_seed_stability(&sources, &quick(), &DEFAULT_STABILITY_SEEDS, DEFAULT_MAX_CV)
                .unwrap();
        assert!(report.statistic < DEFAULT_MAX_CV);
    }

    #[test]
    fn seed_stability_needs_two_seeds() {
        let sources = reference_sources(1_000).unwrap();
        let err = check_seed_stability(&sources, &quick(), &[42], 0.01).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn reference_sweep_matches_baseline() {
        let report = reference_sweep(4).unwrap();
        assert_eq!(report.total_points, 10_000);
        let check = check_dominance(&report, &DominanceBaseline::reference()).unwrap();
        assert!(check.statistic <= DEFAULT_DOMINANCE_TOLERANCE);
        assert_eq!(
            report.ordering[..2],
            [ConstraintName::QrngTilt, ConstraintName::FifthForce]
        );
        assert_eq!(report.fraction(ConstraintName::AtlasMu), 0.0);
        assert!(report.excluded_by[&ConstraintName::AtlasMu] > 0);
    }

    #[test]
    fn shifted_fraction_is_drift() {
        let report = reference_sweep(2).unwrap();
        let mut baseline = DominanceBaseline::reference();
        baseline.fractions.insert(ConstraintName::QrngTilt, 0.60);
        let err = check_dominance(&report, &baseline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegressionDrift);
        assert!(err.to_string().contains("QRNG_tilt"));
    }

    #[test]
    fn swapped_ordering_is_drift() {
        let report = reference_sweep(2).unwrap();
        let baseline = DominanceBaseline {
            fractions: BTreeMap::from([
                (ConstraintName::FifthForce, 0.6508),
                (ConstraintName::QrngTilt, 0.3492),
            ]),
            tolerance: 0.5,
        };
        let err = check_dominance(&report, &baseline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegressionDrift);
        assert!(err.to_string().contains("ordering"));
    }

    #[test]
    fn baseline_round_trips_through_file() {
        let report = reference_sweep(1).unwrap();
        let baseline = DominanceBaseline::from_report(&report, 0.02);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        std::fs::write(&path, serde_json::to_string_pretty(&baseline).unwrap()).unwrap();
        let loaded = DominanceBaseline::load(&path).unwrap();
        assert_eq!(loaded.ordering(), baseline.ordering());
        assert!(check_dominance(&report, &loaded).is_ok());
    }
}
