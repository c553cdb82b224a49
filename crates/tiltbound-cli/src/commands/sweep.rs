use std::path::Path;

use tiltbound_core::{
    CalibError, CalibrationReport, ConstraintConfig, ConstraintSet,
    ExclusionEnvelope, LogAxis, ParameterGrid, PortalModel, Result,
};

pub struct SweepCommandConfig<'a> {
    pub calibration_path: Option<&'a str>,
    pub epsilon_max: Option<f64>,
    pub space: &'a str,
    pub model: &'a str,
    pub mu_sb: f64,
    pub g: f64,
    pub x_range: (Option<f64>, Option<f64>),
    pub nx: usize,
    pub y_range: (Option<f64>, Option<f64>),
    pub ny: usize,
    pub envelope_path: Option<&'a str>,
    pub theta_lab: Option<f64>,
    pub config_path: Option<&'a str>,
    pub threads: usize,
    pub output_path: Option<&'a str>,
}

/// Default axes: λ ∈ [1 µm, 10 cm], α ∈ [1e-12, 1e-6], and the matching
/// mediator masses for portal space.
const YUKAWA_X: (f64, f64) = (1e-6, 1e-1);
const YUKAWA_Y: (f64, f64) = (1e-12, 1e-6);
const PORTAL_X: (f64, f64) = (1e-12, 1e-6);
const PORTAL_Y: (f64, f64) = (1e-8, 1e-3);

pub fn run(cmd: SweepCommandConfig<'_>) -> Result<()> {
    let config = resolve_config(&cmd)?;
    let grid = build_grid(&cmd)?;

    let set = ConstraintSet::from_config(&config)?;
    let report = set.sweep_parallel(&grid, cmd.threads.max(1))?;

    eprintln!(
        "{} points: {} viable, {} excluded (epsilon_max = {:.3e})",
        report.total_points, report.viable_points, report.excluded_points, report.epsilon_max
    );
    for name in &report.ordering {
        eprintln!(
            "  {:<12} {:>6.2}%  ({} points)",
            name.as_str(),
            100.0 * report.fraction(*name),
            report.dominant_counts.get(name).copied().unwrap_or(0)
        );
    }
    super::write_output(cmd.output_path, &report.to_json()?)
}

/// Precedence for the tilt bound: --epsilon-max, then --calibration, then
/// the config file (or built-in default).
fn resolve_config(cmd: &SweepCommandConfig<'_>) -> Result<ConstraintConfig> {
    let mut config = match cmd.config_path {
        Some(p) => ConstraintConfig::load(Path::new(p))?,
        None => ConstraintConfig::default(),
    };
    if let Some(path) = cmd.calibration_path {
        let report = CalibrationReport::load(Path::new(path))?;
        let bound = report.tilt_bound()?;
        log::info!(
            "tilt bound {bound:.6e} from calibration {path} (ci [{:+.6}, {:+.6}])",
            report.ci.0,
            report.ci.1
        );
        config.qrng_tilt.epsilon_max = bound;
    }
    if let Some(eps) = cmd.epsilon_max {
        config.qrng_tilt.epsilon_max = eps;
    }
    if let Some(path) = cmd.envelope_path {
        config.fifth_force.envelope = ExclusionEnvelope::from_csv_file(Path::new(path))?;
    }
    if let Some(t) = cmd.theta_lab {
        config.fifth_force.theta_lab = t;
    }
    config.validate()?;
    Ok(config)
}

fn build_grid(cmd: &SweepCommandConfig<'_>) -> Result<ParameterGrid> {
    let (dx, dy) = match cmd.space {
        "portal" => (PORTAL_X, PORTAL_Y),
        _ => (YUKAWA_X, YUKAWA_Y),
    };
    let x = LogAxis::new(
        cmd.x_range.0.unwrap_or(dx.0),
        cmd.x_range.1.unwrap_or(dx.1),
        cmd.nx,
    )?;
    let y = LogAxis::new(
        cmd.y_range.0.unwrap_or(dy.0),
        cmd.y_range.1.unwrap_or(dy.1),
        cmd.ny,
    )?;
    match cmd.space {
        "yukawa" => Ok(ParameterGrid::yukawa(x, y)),
        "portal" => Ok(ParameterGrid::portal(portal_model(cmd)?, x, y)),
        other => Err(CalibError::Configuration(format!("unknown grid space '{other}'"))),
    }
}

fn portal_model(cmd: &SweepCommandConfig<'_>) -> Result<PortalModel> {
    match cmd.model {
        "simple" => Ok(PortalModel::Simple),
        "scale_breaking" => Ok(PortalModel::ScaleBreaking {
            mu_sb_gev: cmd.mu_sb,
        }),
        "portal" => Ok(PortalModel::Portal { g: cmd.g }),
        other => Err(CalibError::Configuration(format!(
            "unknown portal model '{other}'"
        ))),
    }
}
