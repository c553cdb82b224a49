use chrono::DateTime;

use tiltbound_core::controls::{biased_control, control_csv, control_epoch, fair_control};
use tiltbound_core::{CalibError, Result};

pub struct ControlCommandConfig<'a> {
    pub kind: &'a str,
    pub n: usize,
    pub p: f64,
    pub seed: u64,
    pub source_id: Option<&'a str>,
    pub start: Option<&'a str>,
    pub output_path: Option<&'a str>,
}

pub fn run(cmd: ControlCommandConfig<'_>) -> Result<()> {
    let bits = match cmd.kind {
        "fair" => fair_control(cmd.n, cmd.seed),
        "biased" => biased_control(cmd.n, cmd.p, cmd.seed)?,
        other => {
            return Err(CalibError::Configuration(format!(
                "unknown control kind '{other}'"
            )));
        }
    };
    let start = match cmd.start {
        Some(s) => DateTime::parse_from_rfc3339(s).map_err(|e| {
            CalibError::Configuration(format!("--start must be RFC 3339 with offset: {e}"))
        })?,
        None => control_epoch()?,
    };
    let default_id = format!("control_{}", cmd.kind);
    let source_id = cmd.source_id.unwrap_or(&default_id);

    let ones = bits.iter().filter(|&&b| b == 1).count();
    log::info!(
        "{} control: n={} ones={} epsilon={:+.6} seed={}",
        cmd.kind,
        bits.len(),
        ones,
        if bits.is_empty() { 0.0 } else { ones as f64 / bits.len() as f64 - 0.5 },
        cmd.seed
    );
    super::write_output(cmd.output_path, &control_csv(&bits, source_id, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_valid_control_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("biased.csv");
        let p = path.to_string_lossy().into_owned();
        run(ControlCommandConfig {
            kind: "biased",
            n: 1000,
            p: 0.6,
            seed: 3,
            source_id: None,
            start: Some("2026-05-01T10:00:00+02:00"),
            output_path: Some(&p),
        })
        .unwrap();
        let raw = std::fs::read(&path).unwrap();
        let (ds, prov) = tiltbound_core::validate("biased.csv", &raw).unwrap();
        assert_eq!(ds.len(), 1000);
        assert_eq!(prov.source_id_distribution["control_biased"], 1000);
        assert_eq!(ds.bits().iter().filter(|&&b| b == 1).count(), 600);
    }

    #[test]
    fn naive_start_rejected() {
        let err = run(ControlCommandConfig {
            kind: "fair",
            n: 10,
            p: 0.5,
            seed: 1,
            source_id: None,
            start: Some("2026-05-01T10:00:00"),
            output_path: None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), tiltbound_core::ErrorKind::Configuration);
    }
}
