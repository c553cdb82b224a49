use std::path::Path;

use tiltbound_core::config::bootstrap_samples_from_signed;
use tiltbound_core::controls::{biased_control, fair_control};
use tiltbound_core::{
    BoundMethod, CalibError, CalibrationConfig, ErrorKind, Result, SourceBits, calibrate_with,
};

pub struct CalibrateCommandConfig<'a> {
    pub files: &'a [String],
    pub controls: &'a [String],
    pub control_len: usize,
    pub prior: Option<f64>,
    pub bootstrap: Option<i64>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
    pub bound_method: Option<&'a str>,
    pub window: Option<usize>,
    pub config_path: Option<&'a str>,
    pub output_path: Option<&'a str>,
}

pub fn run(cmd: CalibrateCommandConfig<'_>) -> Result<()> {
    let config = resolve_config(&cmd)?;

    let (mut sources, skipped) = load_files(cmd.files)?;
    for spec in cmd.controls {
        sources.push(control_source(spec, cmd.control_len, config.seed)?);
    }
    if sources.is_empty() {
        return Err(skipped.into_iter().next().unwrap_or_else(|| {
            CalibError::Configuration(
                "nothing to calibrate: pass at least one file or --control".to_string(),
            )
        }));
    }

    let report = calibrate_with(&sources, &config, tiltbound_tests::diagnose)?;
    for s in &report.sources {
        for d in s.diagnostics.iter().filter(|d| !d.passed) {
            log::warn!(
                "{}: sanity test '{}' failed (p={})",
                s.source_id,
                d.name,
                d.p_value.map_or_else(|| "n/a".to_string(), |p| format!("{p:.4}"))
            );
        }
    }
    if report.lower_bound_is_bootstrap_edge_case {
        log::warn!("lower bound is a bootstrap edge case; see lower_bound_is_bootstrap_edge_case");
    }
    for w in tiltbound_tests::report_warnings(&report) {
        log::warn!("{}: {}", w.check, w.message);
    }

    eprintln!(
        "epsilon_max = {:+.6}  95% CI [{:+.6}, {:+.6}]  max {} bound {:.6}  ({} source(s), seed {})",
        report.epsilon_max,
        report.ci.0,
        report.ci.1,
        report.bound_method,
        report.max_source_bound,
        report.sources.len(),
        report.seed
    );
    if !skipped.is_empty() {
        eprintln!("skipped {} file(s); see warnings", skipped.len());
    }
    super::write_output(cmd.output_path, &report.to_json()?)
}

/// File values first, then flag overrides.
fn resolve_config(cmd: &CalibrateCommandConfig<'_>) -> Result<CalibrationConfig> {
    let mut config = match cmd.config_path {
        Some(p) => CalibrationConfig::load(Path::new(p))?,
        None => CalibrationConfig::default(),
    };
    if let Some(a) = cmd.prior {
        config.prior_concentration = a;
    }
    if let Some(b) = cmd.bootstrap {
        config.bootstrap_samples = bootstrap_samples_from_signed(b)?;
    }
    if let Some(s) = cmd.seed {
        config.seed = s;
    }
    if let Some(t) = cmd.threads {
        config.threads = t;
    }
    if let Some(m) = cmd.bound_method {
        config.bound_method = m.parse::<BoundMethod>()?;
    }
    if cmd.window.is_some() {
        config.window_size = cmd.window;
    }
    config.validate()?;
    Ok(config)
}

/// Validate each file and merge bits per `source_id` across files, keeping
/// first-seen order. A file that fails the data contract is skipped with a
/// warning and returned alongside the sources; I/O errors abort.
fn load_files(files: &[String]) -> Result<(Vec<SourceBits>, Vec<CalibError>)> {
    let mut sources: Vec<SourceBits> = Vec::new();
    let mut skipped = Vec::new();
    for file in files {
        let (dataset, provenance) = match super::read_dataset(file) {
            Ok(ok) => ok,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Schema | ErrorKind::RowRejected | ErrorKind::InsufficientData
                ) =>
            {
                log::warn!("skipping {file}: {e}");
                skipped.push(e);
                continue;
            }
            Err(e) => return Err(e),
        };
        for (source_id, bits) in dataset.bits_by_source() {
            match sources.iter_mut().find(|s| s.source_id == source_id) {
                Some(existing) => {
                    existing.bits.extend(bits);
                    existing.content_hashes.push(provenance.content_hash.clone());
                }
                None => sources.push(SourceBits {
                    source_id,
                    bits,
                    content_hashes: vec![provenance.content_hash.clone()],
                }),
            }
        }
    }
    Ok((sources, skipped))
}

/// `fair` or `biased:<p>`.
fn control_source(spec: &str, n: usize, seed: u64) -> Result<SourceBits> {
    let (source_id, bits) = match spec.split_once(':') {
        None if spec == "fair" => ("control_fair".to_string(), fair_control(n, seed)),
        Some(("biased", p)) => {
            let p: f64 = p.trim().parse().map_err(|_| {
                CalibError::Configuration(format!("cannot parse control probability '{p}'"))
            })?;
            (format!("control_biased_{p}"), biased_control(n, p, seed)?)
        }
        _ => {
            return Err(CalibError::Configuration(format!(
                "unknown control '{spec}' (expected fair or biased:<p>)"
            )));
        }
    };
    Ok(SourceBits {
        source_id,
        bits,
        content_hashes: Vec::new(),
    })
}
