//! # tiltbound-core
//!
//! **Reproducible bounds on QRNG bias, and where they bite.**
//!
//! `tiltbound-core` turns raw quantum-random bit logs into a calibrated bound
//! on the tilt `ε = p − 0.5`, then asks which physical constraint is closest
//! to being violated across a parameter grid.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tiltbound_core::{CalibrationConfig, SourceBits, calibrate, ingest};
//!
//! let raw = std::fs::read("anu_run1.csv").unwrap();
//! let (dataset, provenance) = ingest::validate("anu_run1.csv", &raw).unwrap();
//! println!("{} rows accepted, {} rejected", provenance.row_count, provenance.rows_rejected);
//!
//! let sources: Vec<SourceBits> = dataset
//!     .bits_by_source()
//!     .into_iter()
//!     .map(|(source_id, bits)| SourceBits {
//!         source_id,
//!         bits,
//!         content_hashes: vec![provenance.content_hash.clone()],
//!     })
//!     .collect();
//! let report = calibrate(&sources, &CalibrationConfig::default()).unwrap();
//! println!("epsilon_max = {:+.6}", report.epsilon_max);
//! ```
//!
//! ## Architecture
//!
//! Raw CSV → Validator → Estimator (per source) → Calibrator (pool) → Constraint sweep
//!
//! - [`ingest`]: data contract validation and provenance
//! - [`estimator`]: point estimate, Bayes factor, bootstrap interval
//! - [`calibrate`]: inverse-variance pooling and the calibration report
//! - [`constraints`]: normalized slack, dominance, grid sweeps
//! - [`controls`]: known-answer fair and biased sequences
//! - [`modulation`]: logistic fit of bits against a covariate, block stability
//!
//! Every randomized step takes an explicit seed from [`CalibrationConfig`].

pub mod calibrate;
pub mod config;
pub mod constraints;
pub mod controls;
pub mod error;
pub mod estimator;
pub mod ingest;
pub mod modulation;
pub mod stats;

pub use calibrate::{
    BoundMethod, CalibrationReport, Diagnostic, EnvironmentInfo, IntervalMethod, PooledEstimate,
    PoolingMethod, SourceBits, SourceBound, SourceInput, SourceReport, SourceWeight, calibrate,
    calibrate_with, pool, source_bound, variance_proxy,
};
pub use config::{
    CalibrationConfig, ColliderConfig, ConstraintConfig, FifthForceConfig, HiggsInvisibleConfig,
    PhysicalConstants, QrngTiltConfig,
};
pub use constraints::{
    Constraint, ConstraintFamily, ConstraintName, ConstraintSet, DominanceReport,
    DominanceResult, ExclusionEnvelope, GridSpace, IslandSummary, LinearTilt, LogAxis,
    ParameterGrid, ParameterPoint, PointEvaluation, PortalModel, TiltMapping,
};
pub use error::{CalibError, ErrorKind, RejectReason, Result, RowRejection};
pub use estimator::{BiasEstimate, Evidence, estimate};
pub use ingest::{ProvenanceRecord, TrialRecord, ValidatedDataset, ingest_file, validate};
pub use modulation::{
    BlockStability, ModulationFit, SourceModulation, block_stability, fit_logistic_modulation,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
