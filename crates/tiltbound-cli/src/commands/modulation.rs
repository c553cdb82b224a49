use serde::Serialize;
use tiltbound_core::modulation::{SourceModulation, analyze_source};
use tiltbound_core::{CalibError, ErrorKind, Result};

#[derive(Debug, Serialize)]
struct ModulationSummary {
    block_sizes: Vec<usize>,
    sources: Vec<SourceModulation>,
    /// Sources too short for any block size.
    skipped_sources: Vec<String>,
}

/// Fit each source of `file` against its `s` column (when present) and check
/// block-indicator stability.
pub fn run(file: &str, block_sizes: &[usize], output_path: Option<&str>) -> Result<()> {
    let summary = analyze_file(file, block_sizes)?;
    for m in &summary.sources {
        let bs = &m.block_stability;
        eprintln!(
            "{}: n={} block beta range {:.4} ({})",
            m.source_id,
            m.n,
            bs.beta_range,
            if bs.stable { "stable" } else { "UNSTABLE" }
        );
        if let Some(fit) = &m.covariate_fit {
            eprintln!(
                "  covariate s: alpha={:+.6} beta={:+.6} loglik={:.3}",
                fit.alpha, fit.beta, fit.log_likelihood
            );
        }
    }
    super::write_output(output_path, &serde_json::to_string_pretty(&summary)?)
}

fn analyze_file(file: &str, block_sizes: &[usize]) -> Result<ModulationSummary> {
    if block_sizes.is_empty() || block_sizes.contains(&0) {
        return Err(CalibError::Configuration(format!(
            "block sizes must be positive, got {block_sizes:?}"
        )));
    }
    let (dataset, _) = super::read_dataset(file)?;
    let covariates = dataset.covariates_by_source();

    let mut sources = Vec::new();
    let mut skipped_sources = Vec::new();
    for ((source_id, bits), (_, covariate)) in dataset.bits_by_source().into_iter().zip(covariates)
    {
        match analyze_source(&source_id, &bits, covariate.as_deref(), block_sizes) {
            Ok(m) => sources.push(m),
            Err(e) if e.kind() == ErrorKind::InsufficientData => {
                log::warn!("{source_id}: {e}");
                skipped_sources.push(source_id);
            }
            Err(e) => return Err(e),
        }
    }
    if sources.is_empty() {
        return Err(CalibError::InsufficientData(format!(
            "{file}: no source long enough for block sizes {block_sizes:?}"
        )));
    }
    Ok(ModulationSummary {
        block_sizes: block_sizes.to_vec(),
        sources,
        skipped_sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiltbound_core::controls::{biased_control, control_csv, control_epoch};

    fn write_csv(dir: &std::path::Path, text: &str) -> String {
        let path = dir.join("run.csv");
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn covariate_column_is_fitted_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut text = String::from("timestamp,bit,source_id,s\n");
        for (i, s) in (0..4000).map(|i| (i, (i / 500) % 2)) {
            // Ones cluster where s = 1.
            let bit = u8::from((s == 1 && i % 10 < 7) || (s == 0 && i % 10 < 3));
            text.push_str(&format!(
                "2026-01-01T00:00:{:02}.{:03}Z,{bit},lfdr,{s}\n",
                i / 1000,
                i % 1000
            ));
        }
        let file = write_csv(dir.path(), &text);
        let summary = analyze_file(&file, &[500, 1000]).unwrap();
        let fit = summary.sources[0].covariate_fit.as_ref().unwrap();
        assert!((fit.beta - (0.7f64 / 0.3).ln()).abs() < 1e-6);
        assert_eq!(summary.sources[0].block_stability.fits.len(), 2);
    }

    #[test]
    fn short_sources_are_skipped_without_covariate_fit() {
        let dir = tempfile::tempdir().unwrap();
        let start = control_epoch().unwrap();
        let long = control_csv(&biased_control(4000, 0.5, 1).unwrap(), "long", start);
        let short = control_csv(&biased_control(300, 0.5, 2).unwrap(), "short", start);
        let text = format!("{long}{}", short.split_once('\n').unwrap().1);
        let file = write_csv(dir.path(), &text);

        let summary = analyze_file(&file, &[1000]).unwrap();
        assert_eq!(summary.sources.len(), 1);
        assert!(summary.sources[0].covariate_fit.is_none());
        assert_eq!(summary.skipped_sources, ["short"]);
    }

    #[test]
    fn zero_block_size_rejected() {
        let err = analyze_file("unused.csv", &[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
