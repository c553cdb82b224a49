pub mod calibrate;
pub mod control;
pub mod modulation;
pub mod regress;
pub mod sweep;
pub mod validate;

use std::path::Path;

use tiltbound_core::{
    CalibError, ErrorKind, ProvenanceRecord, Result, ValidatedDataset, validate,
};

/// 1 for contract/config/data errors, 2 for regression drift.
pub fn exit_code(err: &CalibError) -> i32 {
    match err.kind() {
        ErrorKind::RegressionDrift => 2,
        _ => 1,
    }
}

/// Write `text` to `path`, or to stdout when no path is given.
pub fn write_output(path: Option<&str>, text: &str) -> Result<()> {
    match path {
        Some(p) => {
            let p = Path::new(p);
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
            std::fs::write(p, text).map_err(|e| io_error(p, e))?;
            log::info!("wrote {}", p.display());
            Ok(())
        }
        None => {
            print!("{text}");
            if !text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
    }
}

/// Read `file` and validate it against the data contract. The input is only read.
pub fn read_dataset(file: &str) -> Result<(ValidatedDataset, ProvenanceRecord)> {
    let path = Path::new(file);
    let raw = std::fs::read(path).map_err(|e| io_error(path, e))?;
    let name = path
        .file_name()
        .map_or_else(|| file.to_string(), |n| n.to_string_lossy().into_owned());
    validate(&name, &raw)
}

pub fn io_error(path: &Path, source: std::io::Error) -> CalibError {
    CalibError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_exits_two() {
        let drift = CalibError::RegressionDrift {
            check: "dominance".into(),
            detail: "x".into(),
        };
        assert_eq!(exit_code(&drift), 2);
        assert_eq!(exit_code(&CalibError::Configuration("x".into())), 1);
    }

    #[test]
    fn write_output_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        write_output(path.to_str(), "{}").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");
    }
}
