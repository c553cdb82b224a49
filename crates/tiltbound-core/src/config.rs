//! Explicit, immutable run configuration.
//!
//! Components never read process-wide defaults: every knob that affects a
//! numeric result is carried in one of these structs, passed in at
//! construction and echoed into the emitted report.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibrate::BoundMethod;
use crate::constraints::ExclusionEnvelope;
use crate::error::{CalibError, Result};

/// Default RNG seed for every randomized operation.
pub const DEFAULT_SEED: u64 = 42;
/// Default number of bootstrap resamples per source.
pub const DEFAULT_BOOTSTRAP_SAMPLES: usize = 1000;
/// Default symmetric Beta prior shape (uniform prior on p).
pub const DEFAULT_PRIOR_CONCENTRATION: f64 = 1.0;
/// Default pooled QRNG tilt bound, data-derived from the within-run LFDR logs.
pub const DEFAULT_EPSILON_MAX: f64 = 0.002292;

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Knobs for the bias estimator and the multi-source calibrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Shape `a` of the symmetric Beta(a, a) prior under the biased model.
    pub prior_concentration: f64,
    /// Bootstrap resamples; 0 yields a degenerate interval at the point estimate.
    pub bootstrap_samples: usize,
    /// Global seed; per-resample seeds are derived from it.
    pub seed: u64,
    /// Worker threads for bootstrap resampling. Does not affect results.
    pub threads: usize,
    /// How each source's magnitude bound is derived.
    pub bound_method: BoundMethod,
    /// Rolling window length for the max-deviation statistic.
    pub window_size: Option<usize>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            prior_concentration: DEFAULT_PRIOR_CONCENTRATION,
            bootstrap_samples: DEFAULT_BOOTSTRAP_SAMPLES,
            seed: DEFAULT_SEED,
            threads: 1,
            bound_method: BoundMethod::default(),
            window_size: None,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.prior_concentration.is_finite() || self.prior_concentration <= 0.0 {
            return Err(CalibError::Configuration(format!(
                "prior_concentration must be a positive finite number, got {}",
                self.prior_concentration
            )));
        }
        if self.threads == 0 {
            return Err(CalibError::Configuration(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.window_size == Some(0) {
            return Err(CalibError::Configuration(
                "window_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Convert a caller-supplied signed bootstrap count, rejecting negatives.
pub fn bootstrap_samples_from_signed(n: i64) -> Result<usize> {
    usize::try_from(n).map_err(|_| {
        CalibError::Configuration(format!("bootstrap sample count must be >= 0, got {n}"))
    })
}

// ---------------------------------------------------------------------------
// Constraint families
// ---------------------------------------------------------------------------

/// Unit-conversion constants used to map fundamental parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalConstants {
    /// ħc in GeV·m.
    pub hbar_c_gev_m: f64,
    /// Higgs mass in GeV.
    pub higgs_mass_gev: f64,
}

impl Default for PhysicalConstants {
    fn default() -> Self {
        Self {
            hbar_c_gev_m: 197.3e-15,
            higgs_mass_gev: 125.0,
        }
    }
}

/// Collider signal-strength constraint (ATLAS μ).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColliderConfig {
    pub mu_central: f64,
    pub mu_sigma: f64,
    /// Width of the allowed band in units of `mu_sigma`.
    pub n_sigma: f64,
    /// Provisional linear scaling: Δμ = mu_per_alpha · α.
    pub mu_per_alpha: f64,
}

impl Default for ColliderConfig {
    fn default() -> Self {
        Self {
            mu_central: 1.023,
            mu_sigma: 0.056,
            n_sigma: 2.0,
            mu_per_alpha: 1e6,
        }
    }
}

/// Higgs invisible branching-ratio constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiggsInvisibleConfig {
    /// 0.145 conservative, 0.107 tight.
    pub br_max: f64,
    /// Provisional linear scaling: BR = br_per_alpha · α while m_φ < m_h/2.
    pub br_per_alpha: f64,
}

impl Default for HiggsInvisibleConfig {
    fn default() -> Self {
        Self {
            br_max: 0.145,
            br_per_alpha: 0.1,
        }
    }
}

/// Fifth-force (Yukawa) exclusion constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FifthForceConfig {
    /// Lab screening factor Θ_lab in (0, 1]; α_eff = Θ_lab² · α.
    pub theta_lab: f64,
    pub envelope: ExclusionEnvelope,
}

impl Default for FifthForceConfig {
    fn default() -> Self {
        Self {
            theta_lab: 1.0,
            envelope: ExclusionEnvelope::flat(1e-6),
        }
    }
}

/// QRNG tilt constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrngTiltConfig {
    /// Calibrated tilt bound |ε| ≤ epsilon_max.
    pub epsilon_max: f64,
    /// Provisional linear scaling: ε = tilt_per_alpha · α.
    pub tilt_per_alpha: f64,
}

impl Default for QrngTiltConfig {
    fn default() -> Self {
        Self {
            epsilon_max: DEFAULT_EPSILON_MAX,
            tilt_per_alpha: 1e3,
        }
    }
}

/// Everything the constraint normalizer needs, in one immutable value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub constants: PhysicalConstants,
    pub collider: ColliderConfig,
    pub higgs_invisible: HiggsInvisibleConfig,
    pub fifth_force: FifthForceConfig,
    pub qrng_tilt: QrngTiltConfig,
}

impl ConstraintConfig {
    pub fn with_epsilon_max(mut self, epsilon_max: f64) -> Self {
        self.qrng_tilt.epsilon_max = epsilon_max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("constants.hbar_c_gev_m", self.constants.hbar_c_gev_m),
            ("constants.higgs_mass_gev", self.constants.higgs_mass_gev),
            ("collider.mu_sigma", self.collider.mu_sigma),
            ("collider.n_sigma", self.collider.n_sigma),
            ("higgs_invisible.br_max", self.higgs_invisible.br_max),
            ("qrng_tilt.epsilon_max", self.qrng_tilt.epsilon_max),
        ];
        for (name, v) in positive {
            if !v.is_finite() || v <= 0.0 {
                return Err(CalibError::Configuration(format!(
                    "{name} must be positive and finite, got {v}"
                )));
            }
        }
        let theta = self.fifth_force.theta_lab;
        if !(theta > 0.0 && theta <= 1.0) {
            return Err(CalibError::Configuration(format!(
                "fifth_force.theta_lab must be in (0, 1], got {theta}"
            )));
        }
        let upper = self.collider.mu_central + self.collider.n_sigma * self.collider.mu_sigma;
        let lower = self.collider.mu_central - self.collider.n_sigma * self.collider.mu_sigma;
        if !(lower < 1.0 && upper > 1.0) {
            return Err(CalibError::Configuration(format!(
                "collider band [{lower}, {upper}] must contain the SM expectation 1.0"
            )));
        }
        self.fifth_force.envelope.validate()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults_are_valid() {
        assert!(CalibrationConfig::default().validate().is_ok());
        assert!(ConstraintConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_prior() {
        for a in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let cfg = CalibrationConfig {
                prior_concentration: a,
                ..Default::default()
            };
            let err = cfg.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
    }

    #[test]
    fn rejects_zero_threads() {
        let cfg = CalibrationConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_window() {
        let cfg = CalibrationConfig {
            window_size: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Configuration);
        let cfg = CalibrationConfig {
            window_size: Some(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bound_method_reads_from_json() {
        let cfg: CalibrationConfig =
            serde_json::from_str(r#"{"bound_method": "chi2_95", "window_size": 500}"#).unwrap();
        assert_eq!(cfg.bound_method, BoundMethod::ClopperPearson95);
        assert_eq!(cfg.window_size, Some(500));
        assert_eq!(CalibrationConfig::default().bound_method, BoundMethod::Bootstrap95);
    }

    #[test]
    fn negative_bootstrap_is_configuration_error() {
        assert_eq!(bootstrap_samples_from_signed(0).unwrap(), 0);
        assert_eq!(bootstrap_samples_from_signed(500).unwrap(), 500);
        let err = bootstrap_samples_from_signed(-1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: CalibrationConfig = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.bootstrap_samples, DEFAULT_BOOTSTRAP_SAMPLES);
        assert_eq!(cfg.prior_concentration, DEFAULT_PRIOR_CONCENTRATION);
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"prior_concentration": 2.0, "bootstrap_samples": 10}"#)
            .unwrap();
        let cfg = CalibrationConfig::load(&good).unwrap();
        assert_eq!(cfg.prior_concentration, 2.0);
        assert_eq!(cfg.bootstrap_samples, 10);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"prior_concentration": -2.0}"#).unwrap();
        assert_eq!(
            CalibrationConfig::load(&bad).unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn theta_lab_out_of_range_rejected() {
        let mut cfg = ConstraintConfig::default();
        cfg.fifth_force.theta_lab = 1.5;
        assert!(cfg.validate().is_err());
        cfg.fifth_force.theta_lab = 0.0;
        assert!(cfg.validate().is_err());
    }
}
