//! Constraint normalizer and dominance sweep.
//!
//! Each registered constraint family maps a parameter point to a
//! `(value, bound)` pair. Slack is `bound − value` and the normalized slack
//! is `slack / bound`, which is scale-invariant and therefore comparable
//! across families whose raw bounds differ by many orders of magnitude.
//!
//! A point is viable when every slack is non-negative. At a viable point the
//! dominant constraint is the one with the smallest normalized slack; ties go
//! to the earlier [`ConstraintName`] in declaration order:
//!
//! 1. `ATLAS_mu`
//! 2. `Higgs_inv`
//! 3. `Fifth_force`
//! 4. `QRNG_tilt`
//!
//! Points share no state, so [`ConstraintSet::sweep_parallel`] returns the
//! same report as [`ConstraintSet::sweep`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{ConstraintConfig, PhysicalConstants};
use crate::error::{CalibError, Result};
use crate::ingest::RawTable;
use crate::stats::chunk_ranges;

// ---------------------------------------------------------------------------
// Names and constraints
// ---------------------------------------------------------------------------

/// Constraint family identifier. `Ord` is the tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConstraintName {
    #[serde(rename = "ATLAS_mu")]
    AtlasMu,
    #[serde(rename = "Higgs_inv")]
    HiggsInv,
    #[serde(rename = "Fifth_force")]
    FifthForce,
    #[serde(rename = "QRNG_tilt")]
    QrngTilt,
}

impl ConstraintName {
    pub const ALL: [Self; 4] = [Self::AtlasMu, Self::HiggsInv, Self::FifthForce, Self::QrngTilt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtlasMu => "ATLAS_mu",
            Self::HiggsInv => "Higgs_inv",
            Self::FifthForce => "Fifth_force",
            Self::QrngTilt => "QRNG_tilt",
        }
    }
}

impl fmt::Display for ConstraintName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConstraintName {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CalibError::Configuration(format!("unknown constraint '{s}'")))
    }
}

/// One evaluated constraint at one parameter point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: ConstraintName,
    pub value: f64,
    pub bound: f64,
    pub slack: f64,
    pub normalized_slack: f64,
}

impl Constraint {
    /// Requires a finite value and a positive finite bound.
    pub fn new(name: ConstraintName, value: f64, bound: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(CalibError::Configuration(format!(
                "{name}: value must be finite, got {value}"
            )));
        }
        if !bound.is_finite() || bound <= 0.0 {
            return Err(CalibError::Configuration(format!(
                "{name}: bound must be positive and finite, got {bound}"
            )));
        }
        let slack = bound - value;
        Ok(Self {
            name,
            value,
            bound,
            slack,
            normalized_slack: slack / bound,
        })
    }

    pub fn is_satisfied(&self) -> bool {
        self.slack >= 0.0
    }
}

// ---------------------------------------------------------------------------
// Parameter space
// ---------------------------------------------------------------------------

/// A point in (λ, α) space with its mediator mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterPoint {
    /// Yukawa range in meters.
    pub lambda_m: f64,
    /// Coupling strength relative to gravity.
    pub alpha: f64,
    pub m_phi_gev: f64,
}

impl ParameterPoint {
    /// Point given (λ, α); m_φ = ħc/λ.
    pub fn yukawa(lambda_m: f64, alpha: f64, constants: &PhysicalConstants) -> Self {
        Self {
            lambda_m,
            alpha,
            m_phi_gev: constants.hbar_c_gev_m / lambda_m,
        }
    }

    /// Point given mediator mass and mixing angle; λ = ħc/m_φ, α = model(θ).
    pub fn portal(
        m_phi_gev: f64,
        theta: f64,
        model: &PortalModel,
        constants: &PhysicalConstants,
    ) -> Self {
        Self {
            lambda_m: constants.hbar_c_gev_m / m_phi_gev,
            alpha: model.alpha(theta, constants),
            m_phi_gev,
        }
    }
}

/// Mapping from Higgs-portal mixing angle θ to α.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum PortalModel {
    /// α = θ².
    Simple,
    /// α = θ² (μ_sb / m_h)².
    ScaleBreaking { mu_sb_gev: f64 },
    /// α = θ² g².
    Portal { g: f64 },
}

impl PortalModel {
    pub fn alpha(&self, theta: f64, constants: &PhysicalConstants) -> f64 {
        let t2 = theta * theta;
        match *self {
            Self::Simple => t2,
            Self::ScaleBreaking { mu_sb_gev } => {
                let r = mu_sb_gev / constants.higgs_mass_gev;
                t2 * r * r
            }
            Self::Portal { g } => t2 * g * g,
        }
    }
}

/// Log-spaced axis: `count` values from `min` to `max` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogAxis {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl LogAxis {
    pub fn new(min: f64, max: f64, count: usize) -> Result<Self> {
        let axis = Self { min, max, count };
        axis.validate()?;
        Ok(axis)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite() && self.min > 0.0 && self.max >= self.min)
        {
            return Err(CalibError::Configuration(format!(
                "log axis needs 0 < min <= max, got [{}, {}]",
                self.min, self.max
            )));
        }
        if self.count == 0 {
            return Err(CalibError::Configuration(
                "log axis needs at least one point".to_string(),
            ));
        }
        Ok(())
    }

    pub fn values(&self) -> Vec<f64> {
        if self.count == 1 {
            return vec![self.min];
        }
        let lo = self.min.log10();
        let hi = self.max.log10();
        let step = (hi - lo) / (self.count - 1) as f64;
        (0..self.count)
            .map(|i| 10f64.powf(lo + step * i as f64))
            .collect()
    }
}

/// Coordinates the grid axes are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridSpace {
    /// x = λ (m), y = α.
    Yukawa,
    /// x = m_φ (GeV), y = θ, mapped through the model.
    Portal(PortalModel),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub space: GridSpace,
    pub x: LogAxis,
    pub y: LogAxis,
}

impl ParameterGrid {
    pub fn yukawa(lambda: LogAxis, alpha: LogAxis) -> Self {
        Self {
            space: GridSpace::Yukawa,
            x: lambda,
            y: alpha,
        }
    }

    pub fn portal(model: PortalModel, m_phi: LogAxis, theta: LogAxis) -> Self {
        Self {
            space: GridSpace::Portal(model),
            x: m_phi,
            y: theta,
        }
    }

    pub fn len(&self) -> usize {
        self.x.count * self.y.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major points: y outer, x inner.
    pub fn points(&self, constants: &PhysicalConstants) -> Result<Vec<ParameterPoint>> {
        self.x.validate()?;
        self.y.validate()?;
        let xs = self.x.values();
        let ys = self.y.values();
        let mut out = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                out.push(match &self.space {
                    GridSpace::Yukawa => ParameterPoint::yukawa(x, y, constants),
                    GridSpace::Portal(model) => ParameterPoint::portal(x, y, model, constants),
                });
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Fifth-force exclusion envelope
// ---------------------------------------------------------------------------

/// Upper limit α_max(λ) from a measured exclusion curve.
///
/// Interpolated linearly in (log10 λ, log10 α); outside the measured range
/// the nearest end value is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionEnvelope {
    /// `(lambda_m, alpha_max)` with strictly increasing λ.
    pub points: Vec<(f64, f64)>,
}

impl ExclusionEnvelope {
    /// Same limit at every λ.
    pub fn flat(alpha_max: f64) -> Self {
        Self {
            points: vec![(1.0, alpha_max)],
        }
    }

    pub fn from_points(points: Vec<(f64, f64)>) -> Result<Self> {
        let env = Self { points };
        env.validate()?;
        Ok(env)
    }

    /// Parse CSV with `lambda` and `alpha` columns (extra columns ignored).
    /// Rows are sorted by λ before validation.
    pub fn from_csv_str(text: &str) -> Result<Self> {
        let table = RawTable::parse(text).ok_or_else(|| {
            CalibError::Configuration("envelope CSV has no header row".to_string())
        })?;
        let col = |name: &str| {
            table
                .header
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    CalibError::Configuration(format!("envelope CSV lacks a '{name}' column"))
                })
        };
        let li = col("lambda")?;
        let ai = col("alpha")?;
        let mut points = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let field = |i: usize| -> Result<f64> {
                let raw = row.fields.get(i).map(|s| s.trim()).unwrap_or_default();
                raw.parse::<f64>().map_err(|_| {
                    CalibError::Configuration(format!(
                        "envelope line {}: cannot parse {raw:?} as a number",
                        row.line
                    ))
                })
            };
            points.push((field(li)?, field(ai)?));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self::from_points(points)
    }

    pub fn from_csv_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        Self::from_csv_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.points.is_empty() {
            return Err(CalibError::Configuration(
                "exclusion envelope has no points".to_string(),
            ));
        }
        for &(l, a) in &self.points {
            if !(l.is_finite() && l > 0.0 && a.is_finite() && a > 0.0) {
                return Err(CalibError::Configuration(format!(
                    "envelope point ({l}, {a}) must have positive finite λ and α"
                )));
            }
        }
        if let Some(w) = self.points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(CalibError::Configuration(format!(
                "envelope λ must be strictly increasing ({} then {})",
                w[0].0, w[1].0
            )));
        }
        Ok(())
    }

    pub fn alpha_max(&self, lambda_m: f64) -> f64 {
        let (Some(&first), Some(&last)) = (self.points.first(), self.points.last()) else {
            return f64::NAN;
        };
        if lambda_m <= first.0 {
            return first.1;
        }
        if lambda_m >= last.0 {
            return last.1;
        }
        let hi = self.points.partition_point(|p| p.0 <= lambda_m);
        let (x0, y0) = self.points[hi - 1];
        let (x1, y1) = self.points[hi];
        let t = (lambda_m.log10() - x0.log10()) / (x1.log10() - x0.log10());
        10f64.powf(y0.log10() + t * (y1.log10() - y0.log10()))
    }
}

// ---------------------------------------------------------------------------
// Families
// ---------------------------------------------------------------------------

/// A pure mapping from a parameter point to `(value, bound)`.
pub trait ConstraintFamily: Send + Sync {
    fn name(&self) -> ConstraintName;

    fn value_and_bound(&self, point: &ParameterPoint) -> (f64, f64);

    fn evaluate(&self, point: &ParameterPoint) -> Result<Constraint> {
        let (value, bound) = self.value_and_bound(point);
        Constraint::new(self.name(), value, bound)
    }
}

/// Coupling → QRNG tilt mapping. Swappable: the physical form of this mapping
/// is not settled, so any pure function of the point can be plugged in.
pub trait TiltMapping: Send + Sync {
    fn tilt(&self, point: &ParameterPoint) -> f64;
}

impl<F> TiltMapping for F
where
    F: Fn(&ParameterPoint) -> f64 + Send + Sync,
{
    fn tilt(&self, point: &ParameterPoint) -> f64 {
        self(point)
    }
}

/// ε = per_alpha · α.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTilt {
    pub per_alpha: f64,
}

impl TiltMapping for LinearTilt {
    fn tilt(&self, point: &ParameterPoint) -> f64 {
        self.per_alpha * point.alpha
    }
}

/// Collider signal strength: Δμ = mu_per_alpha · α against the nσ band.
pub struct ColliderFamily {
    config: crate::config::ColliderConfig,
}

impl ConstraintFamily for ColliderFamily {
    fn name(&self) -> ConstraintName {
        ConstraintName::AtlasMu
    }

    fn value_and_bound(&self, point: &ParameterPoint) -> (f64, f64) {
        let c = &self.config;
        let delta = c.mu_per_alpha * point.alpha;
        let bound = if delta >= 0.0 {
            c.mu_central + c.n_sigma * c.mu_sigma - 1.0
        } else {
            1.0 - (c.mu_central - c.n_sigma * c.mu_sigma)
        };
        (delta.abs(), bound)
    }
}

/// BR(H → inv), open only while the mediator is lighter than m_h/2.
pub struct HiggsInvisibleFamily {
    config: crate::config::HiggsInvisibleConfig,
    higgs_mass_gev: f64,
}

impl ConstraintFamily for HiggsInvisibleFamily {
    fn name(&self) -> ConstraintName {
        ConstraintName::HiggsInv
    }

    fn value_and_bound(&self, point: &ParameterPoint) -> (f64, f64) {
        let br = if point.m_phi_gev < self.higgs_mass_gev / 2.0 {
            self.config.br_per_alpha * point.alpha
        } else {
            0.0
        };
        (br.abs(), self.config.br_max)
    }
}

/// Screened Yukawa coupling Θ²α against the exclusion envelope.
pub struct FifthForceFamily {
    theta_lab: f64,
    envelope: ExclusionEnvelope,
}

impl ConstraintFamily for FifthForceFamily {
    fn name(&self) -> ConstraintName {
        ConstraintName::FifthForce
    }

    fn value_and_bound(&self, point: &ParameterPoint) -> (f64, f64) {
        let alpha_eff = self.theta_lab * self.theta_lab * point.alpha;
        (alpha_eff.abs(), self.envelope.alpha_max(point.lambda_m))
    }
}

/// |ε(point)| against the calibrated tilt bound.
pub struct QrngTiltFamily {
    epsilon_max: f64,
    mapping: Box<dyn TiltMapping>,
}

impl QrngTiltFamily {
    pub fn new(epsilon_max: f64, mapping: Box<dyn TiltMapping>) -> Self {
        Self {
            epsilon_max,
            mapping,
        }
    }
}

impl ConstraintFamily for QrngTiltFamily {
    fn name(&self) -> ConstraintName {
        ConstraintName::QrngTilt
    }

    fn value_and_bound(&self, point: &ParameterPoint) -> (f64, f64) {
        (self.mapping.tilt(point).abs(), self.epsilon_max)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DominanceResult {
    Dominant(ConstraintName),
    Excluded { violated: Vec<ConstraintName> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEvaluation {
    pub point: ParameterPoint,
    /// In priority order.
    pub constraints: Vec<Constraint>,
    pub outcome: DominanceResult,
}

impl PointEvaluation {
    pub fn is_viable(&self) -> bool {
        matches!(self.outcome, DominanceResult::Dominant(_))
    }

    pub fn dominant(&self) -> Option<ConstraintName> {
        match self.outcome {
            DominanceResult::Dominant(name) => Some(name),
            DominanceResult::Excluded { .. } => None,
        }
    }
}

/// Pick the outcome for one point. `constraints` must be in priority order.
fn classify(constraints: &[Constraint]) -> DominanceResult {
    let violated: Vec<ConstraintName> = constraints
        .iter()
        .filter(|c| !c.is_satisfied())
        .map(|c| c.name)
        .collect();
    if !violated.is_empty() {
        return DominanceResult::Excluded { violated };
    }
    let mut best = &constraints[0];
    for c in &constraints[1..] {
        if c.normalized_slack < best.normalized_slack {
            best = c;
        }
    }
    DominanceResult::Dominant(best.name)
}

/// Per-axis extent of the viable region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IslandSummary {
    pub lambda_min_m: f64,
    pub lambda_max_m: f64,
    pub alpha_min: f64,
    pub alpha_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominanceReport {
    pub total_points: usize,
    pub viable_points: usize,
    pub excluded_points: usize,
    /// Share of viable points where each constraint dominates (0–1).
    pub dominant_fraction: BTreeMap<ConstraintName, f64>,
    pub dominant_counts: BTreeMap<ConstraintName, usize>,
    /// Excluded points each constraint is violated at; a point may count
    /// toward several constraints.
    pub excluded_by: BTreeMap<ConstraintName, usize>,
    /// Constraints by descending dominant count, ties in priority order.
    pub ordering: Vec<ConstraintName>,
    pub island: Option<IslandSummary>,
    pub grid: ParameterGrid,
    pub epsilon_max: f64,
    /// Families replaced by custom mappings.
    pub custom_families: Vec<ConstraintName>,
    pub config: ConstraintConfig,
}

impl DominanceReport {
    pub fn fraction(&self, name: ConstraintName) -> f64 {
        self.dominant_fraction.get(&name).copied().unwrap_or(0.0)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Registered constraint families plus the config they were built from.
pub struct ConstraintSet {
    families: Vec<Box<dyn ConstraintFamily>>,
    config: ConstraintConfig,
    custom: Vec<ConstraintName>,
}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstraintSet")
            .field("families", &self.names())
            .field("custom", &self.custom)
            .finish()
    }
}

impl ConstraintSet {
    /// The four standard families, with the linear tilt mapping.
    pub fn from_config(config: &ConstraintConfig) -> Result<Self> {
        config.validate()?;
        let families: Vec<Box<dyn ConstraintFamily>> = vec![
            Box::new(ColliderFamily {
                config: config.collider,
            }),
            Box::new(HiggsInvisibleFamily {
                config: config.higgs_invisible,
                higgs_mass_gev: config.constants.higgs_mass_gev,
            }),
            Box::new(FifthForceFamily {
                theta_lab: config.fifth_force.theta_lab,
                envelope: config.fifth_force.envelope.clone(),
            }),
            Box::new(QrngTiltFamily::new(
                config.qrng_tilt.epsilon_max,
                Box::new(LinearTilt {
                    per_alpha: config.qrng_tilt.tilt_per_alpha,
                }),
            )),
        ];
        Ok(Self {
            families,
            config: config.clone(),
            custom: Vec::new(),
        })
    }

    /// Register `family`, replacing any family with the same name.
    pub fn with_family(mut self, family: Box<dyn ConstraintFamily>) -> Self {
        let name = family.name();
        self.families.retain(|f| f.name() != name);
        self.families.push(family);
        self.families.sort_by_key(|f| f.name());
        if !self.custom.contains(&name) {
            self.custom.push(name);
            self.custom.sort();
        }
        log::debug!("constraint family {name} replaced by custom mapping");
        self
    }

    /// Swap the coupling → tilt mapping, keeping the configured ε bound.
    pub fn with_tilt_mapping(self, mapping: Box<dyn TiltMapping>) -> Self {
        let eps = self.config.qrng_tilt.epsilon_max;
        self.with_family(Box::new(QrngTiltFamily::new(eps, mapping)))
    }

    pub fn names(&self) -> Vec<ConstraintName> {
        self.families.iter().map(|f| f.name()).collect()
    }

    pub fn config(&self) -> &ConstraintConfig {
        &self.config
    }

    /// Evaluate every family at `point`.
    pub fn evaluate_point(&self, point: &ParameterPoint) -> Result<PointEvaluation> {
        if self.families.is_empty() {
            return Err(CalibError::Configuration(
                "no constraint families registered".to_string(),
            ));
        }
        let constraints = self
            .families
            .iter()
            .map(|f| f.evaluate(point))
            .collect::<Result<Vec<_>>>()?;
        let outcome = classify(&constraints);
        Ok(PointEvaluation {
            point: *point,
            constraints,
            outcome,
        })
    }

    /// Evaluate every grid point sequentially.
    pub fn sweep(&self, grid: &ParameterGrid) -> Result<DominanceReport> {
        let points = grid.points(&self.config.constants)?;
        let evals = points
            .iter()
            .map(|p| self.evaluate_point(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.summarize(&evals, grid))
    }

    /// Same as [`sweep`](Self::sweep), with points split over `threads`.
    pub fn sweep_parallel(&self, grid: &ParameterGrid, threads: usize) -> Result<DominanceReport> {
        if threads <= 1 {
            return self.sweep(grid);
        }
        let points = grid.points(&self.config.constants)?;
        let ranges = chunk_ranges(points.len(), threads);
        let parts: Vec<Result<Vec<PointEvaluation>>> = std::thread::scope(|s| {
            let handles: Vec<_> = ranges
                .into_iter()
                .map(|range| {
                    let chunk = &points[range];
                    s.spawn(move || {
                        chunk
                            .iter()
                            .map(|p| self.evaluate_point(p))
                            .collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(part) => part,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });
        let mut evals = Vec::with_capacity(points.len());
        for part in parts {
            evals.extend(part?);
        }
        Ok(self.summarize(&evals, grid))
    }

    /// Aggregate evaluations. Depends only on counts and extrema, so the
    /// order of `evals` does not matter.
    pub fn summarize(&self, evals: &[PointEvaluation], grid: &ParameterGrid) -> DominanceReport {
        let names = self.names();
        let mut dominant_counts: BTreeMap<ConstraintName, usize> =
            names.iter().map(|&n| (n, 0)).collect();
        let mut excluded_by = dominant_counts.clone();
        let mut viable = 0usize;
        let mut island: Option<IslandSummary> = None;

        for e in evals {
            match &e.outcome {
                DominanceResult::Dominant(name) => {
                    viable += 1;
                    *dominant_counts.entry(*name).or_default() += 1;
                    let p = &e.point;
                    island = Some(match island {
                        None => IslandSummary {
                            lambda_min_m: p.lambda_m,
                            lambda_max_m: p.lambda_m,
                            alpha_min: p.alpha,
                            alpha_max: p.alpha,
                        },
                        Some(i) => IslandSummary {
                            lambda_min_m: i.lambda_min_m.min(p.lambda_m),
                            lambda_max_m: i.lambda_max_m.max(p.lambda_m),
                            alpha_min: i.alpha_min.min(p.alpha),
                            alpha_max: i.alpha_max.max(p.alpha),
                        },
                    });
                }
                DominanceResult::Excluded { violated } => {
                    for name in violated {
                        *excluded_by.entry(*name).or_default() += 1;
                    }
                }
            }
        }

        let dominant_fraction = dominant_counts
            .iter()
            .map(|(&n, &c)| {
                let f = if viable == 0 {
                    0.0
                } else {
                    c as f64 / viable as f64
                };
                (n, f)
            })
            .collect();
        let mut ordering = names;
        ordering.sort_by(|a, b| dominant_counts[b].cmp(&dominant_counts[a]).then(a.cmp(b)));

        log::info!(
            "sweep: {} points, {} viable, {} excluded",
            evals.len(),
            viable,
            evals.len() - viable
        );

        DominanceReport {
            total_points: evals.len(),
            viable_points: viable,
            excluded_points: evals.len() - viable,
            dominant_fraction,
            dominant_counts,
            excluded_by,
            ordering,
            island,
            grid: *grid,
            epsilon_max: self.config.qrng_tilt.epsilon_max,
            custom_families: self.custom.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn point(alpha: f64, lambda: f64) -> ParameterPoint {
        ParameterPoint::yukawa(lambda, alpha, &PhysicalConstants::default())
    }

    #[test]
    fn constraint_slack_and_normalization() {
        let c = Constraint::new(ConstraintName::QrngTilt, 0.001, 0.004).unwrap();
        assert!((c.slack - 0.003).abs() < 1e-15);
        assert!((c.normalized_slack - 0.75).abs() < 1e-12);
        assert!(c.is_satisfied());
        assert!(Constraint::new(ConstraintName::QrngTilt, 0.1, 0.0).is_err());
        assert!(Constraint::new(ConstraintName::QrngTilt, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn names_sort_in_priority_order() {
        let mut v = vec![
            ConstraintName::QrngTilt,
            ConstraintName::AtlasMu,
            ConstraintName::FifthForce,
            ConstraintName::HiggsInv,
        ];
        v.sort();
        assert_eq!(v, ConstraintName::ALL.to_vec());
        assert_eq!(
            serde_json::to_string(&ConstraintName::QrngTilt).unwrap(),
            "\"QRNG_tilt\""
        );
        assert_eq!(
            "fifth_force".parse::<ConstraintName>().unwrap(),
            ConstraintName::FifthForce
        );
    }

    #[test]
    fn tie_goes_to_higher_priority() {
        let cs = vec![
            Constraint::new(ConstraintName::HiggsInv, 0.5, 1.0).unwrap(),
            Constraint::new(ConstraintName::FifthForce, 5.0, 10.0).unwrap(),
            Constraint::new(ConstraintName::QrngTilt, 0.0005, 0.001).unwrap(),
        ];
        assert_eq!(
            classify(&cs),
            DominanceResult::Dominant(ConstraintName::HiggsInv)
        );
    }

    #[test]
    fn normalized_not_raw_slack_decides() {
        // Raw slack of QRNG is tiny, but it is far from its own bound.
        let cs = vec![
            Constraint::new(ConstraintName::AtlasMu, 0.1, 0.135).unwrap(),
            Constraint::new(ConstraintName::QrngTilt, 1e-6, 1e-3).unwrap(),
        ];
        assert_eq!(
            classify(&cs),
            DominanceResult::Dominant(ConstraintName::AtlasMu)
        );
    }

    #[test]
    fn excluded_lists_every_violation() {
        let cs = vec![
            Constraint::new(ConstraintName::AtlasMu, 1.0, 0.135).unwrap(),
            Constraint::new(ConstraintName::HiggsInv, 0.0, 0.145).unwrap(),
            Constraint::new(ConstraintName::QrngTilt, 0.01, 0.002).unwrap(),
        ];
        assert_eq!(
            classify(&cs),
            DominanceResult::Excluded {
                violated: vec![ConstraintName::AtlasMu, ConstraintName::QrngTilt]
            }
        );
    }

    #[test]
    fn zero_slack_is_viable() {
        let c = Constraint::new(ConstraintName::FifthForce, 1e-6, 1e-6).unwrap();
        assert!(c.is_satisfied());
        assert_eq!(
            classify(&[c]),
            DominanceResult::Dominant(ConstraintName::FifthForce)
        );
    }

    #[test]
    fn default_families_at_a_point() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default()).unwrap();
        let eval = set.evaluate_point(&point(1e-9, 1e-3)).unwrap();
        let names: Vec<_> = eval.constraints.iter().map(|c| c.name).collect();
        assert_eq!(names, ConstraintName::ALL.to_vec());
        let atlas = eval.constraints[0];
        assert!((atlas.value - 1e-3).abs() < 1e-15);
        assert!((atlas.bound - 0.135).abs() < 1e-12);
        // m_phi = 197.3e-12 GeV < 62.5, so the invisible channel is open.
        assert!((eval.constraints[1].value - 1e-10).abs() < 1e-20);
        let qrng = eval.constraints[3];
        assert!((qrng.value - 1e-6).abs() < 1e-18);
        assert_eq!(qrng.bound, crate::config::DEFAULT_EPSILON_MAX);
        assert!(eval.is_viable());
    }

    #[test]
    fn heavy_mediator_closes_invisible_channel() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default()).unwrap();
        // λ = ħc / 100 GeV.
        let p = point(1e-9, 197.3e-15 / 100.0);
        let eval = set.evaluate_point(&p).unwrap();
        assert_eq!(eval.constraints[1].value, 0.0);
    }

    #[test]
    fn tilt_mapping_is_injectable() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default())
            .unwrap()
            .with_tilt_mapping(Box::new(|p: &ParameterPoint| 2.0 * p.alpha.sqrt()));
        let eval = set.evaluate_point(&point(1e-8, 1e-3)).unwrap();
        let qrng = eval.constraints[3];
        assert_eq!(qrng.name, ConstraintName::QrngTilt);
        assert!((qrng.value - 2e-4).abs() < 1e-15);
        assert_eq!(set.names().len(), 4);
    }

    #[test]
    fn envelope_interpolates_log_log_and_clamps() {
        let env = ExclusionEnvelope::from_points(vec![(1e-6, 1e-2), (1e-2, 1e-10)]).unwrap();
        let mid = env.alpha_max(1e-4);
        assert!((mid.log10() + 6.0).abs() < 1e-9);
        assert_eq!(env.alpha_max(1e-9), 1e-2);
        assert_eq!(env.alpha_max(1.0), 1e-10);
        assert_eq!(ExclusionEnvelope::flat(3e-7).alpha_max(42.0), 3e-7);
    }

    #[test]
    fn envelope_rejects_bad_points() {
        assert!(ExclusionEnvelope::from_points(vec![]).is_err());
        assert!(ExclusionEnvelope::from_points(vec![(1e-3, 1.0), (1e-3, 2.0)]).is_err());
        assert!(ExclusionEnvelope::from_points(vec![(1e-3, -1.0)]).is_err());
    }

    #[test]
    fn envelope_from_csv() {
        let env =
            ExclusionEnvelope::from_csv_str("alpha,lambda,note\n1e-8,1e-3,b\n1e-4,1e-5,a\n").unwrap();
        assert_eq!(env.points, vec![(1e-5, 1e-4), (1e-3, 1e-8)]);
        let err = ExclusionEnvelope::from_csv_str("lambda,alpha\n1e-3,abc\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("line 2"));
        assert!(ExclusionEnvelope::from_csv_str("lambda\n1e-3\n").is_err());
    }

    #[test]
    fn log_axis_endpoints() {
        let v = LogAxis::new(1e-6, 1e-1, 6).unwrap().values();
        assert_eq!(v.len(), 6);
        for (i, x) in v.iter().enumerate() {
            let expected = 10f64.powi(i as i32 - 6);
            assert!((x / expected - 1.0).abs() < 1e-12);
        }
        assert_eq!(LogAxis::new(5.0, 5.0, 1).unwrap().values(), vec![5.0]);
        assert!(LogAxis::new(0.0, 1.0, 3).is_err());
        assert!(LogAxis::new(1.0, 0.5, 3).is_err());
        assert!(LogAxis::new(1.0, 2.0, 0).is_err());
    }

    #[test]
    fn portal_models_map_theta_to_alpha() {
        let k = PhysicalConstants::default();
        assert!((PortalModel::Simple.alpha(1e-3, &k) - 1e-6).abs() < 1e-20);
        let sb = PortalModel::ScaleBreaking { mu_sb_gev: 12.5 };
        assert!((sb.alpha(1e-3, &k) - 1e-8).abs() < 1e-20);
        let g = PortalModel::Portal { g: 0.1 };
        assert!((g.alpha(1e-3, &k) - 1e-8).abs() < 1e-20);
        let p = ParameterPoint::portal(1.0, 1e-3, &PortalModel::Simple, &k);
        assert!((p.lambda_m - 197.3e-15).abs() < 1e-25);
    }

    #[test]
    fn sweep_accounts_for_every_point() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default()).unwrap();
        let grid = ParameterGrid::yukawa(
            LogAxis::new(1e-6, 1e-1, 12).unwrap(),
            LogAxis::new(1e-12, 1e-4, 15).unwrap(),
        );
        let report = set.sweep(&grid).unwrap();
        assert_eq!(report.total_points, 180);
        assert_eq!(report.viable_points + report.excluded_points, 180);
        let counted: usize = report.dominant_counts.values().sum();
        assert_eq!(counted, report.viable_points);
        let total: f64 = report.dominant_fraction.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(report.excluded_points > 0);
        assert!(report.island.is_some());
    }

    #[test]
    fn parallel_sweep_matches_sequential() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default().with_epsilon_max(1e-4))
            .unwrap();
        let grid = ParameterGrid::yukawa(
            LogAxis::new(1e-6, 1e-1, 17).unwrap(),
            LogAxis::new(1e-12, 1e-6, 13).unwrap(),
        );
        let seq = set.sweep(&grid).unwrap();
        let par = set.sweep_parallel(&grid, 4).unwrap();
        assert_eq!(seq, par);
    }

    #[test]
    fn summary_ignores_point_order() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default()).unwrap();
        let grid = ParameterGrid::yukawa(
            LogAxis::new(1e-5, 1e-2, 9).unwrap(),
            LogAxis::new(1e-10, 1e-5, 9).unwrap(),
        );
        let mut evals: Vec<_> = grid
            .points(&set.config().constants)
            .unwrap()
            .iter()
            .map(|p| set.evaluate_point(p).unwrap())
            .collect();
        let forward = set.summarize(&evals, &grid);
        evals.reverse();
        let backward = set.summarize(&evals, &grid);
        assert_eq!(forward, backward);
    }

    #[test]
    fn report_json_uses_constraint_labels() {
        let set = ConstraintSet::from_config(&ConstraintConfig::default()).unwrap();
        let grid = ParameterGrid::yukawa(
            LogAxis::new(1e-4, 1e-3, 2).unwrap(),
            LogAxis::new(1e-11, 1e-10, 2).unwrap(),
        );
        let json = set.sweep(&grid).unwrap().to_json().unwrap();
        assert!(json.contains("\"QRNG_tilt\""));
        let back: DominanceReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_points, 4);
    }
}
