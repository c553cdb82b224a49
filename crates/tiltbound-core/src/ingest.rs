//! Data contract validator for QRNG bit logs.
//!
//! Input is UTF-8 comma-delimited text with a header row. Required columns are
//! `timestamp`, `bit` and `source_id`; `run_id`, `device_id`, `meta` and the
//! numeric covariate `s` are optional. The validator never mutates its input and never drops a row
//! silently: every refusal is logged and recorded, with its line number and
//! the rule it broke, in the [`ProvenanceRecord`].
//!
//! # Output artifacts
//!
//! [`ingest_file`] writes two files next to each other in the output directory:
//! - `<stem>_validated.csv`: accepted rows in normalized form
//! - `<stem>_provenance.json`: hash, counts, time range, rejections

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CalibError, RejectReason, Result, RowRejection};

pub const REQUIRED_COLUMNS: [&str; 3] = ["timestamp", "bit", "source_id"];
pub const OPTIONAL_COLUMNS: [&str; 4] = ["run_id", "device_id", "meta", "s"];
pub const MAX_SOURCE_ID_LEN: usize = 64;

/// Column order of the normalized CSV.
const VALIDATED_HEADER: &str = "timestamp,bit,source_id,run_id,device_id,meta,s";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One accepted binary observation. Only the validator constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    timestamp: DateTime<FixedOffset>,
    bit: u8,
    source_id: String,
    run_id: Option<String>,
    device_id: Option<String>,
    meta: Option<String>,
    covariate: Option<f64>,
}

impl TrialRecord {
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    /// Always 0 or 1.
    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    /// Value of the `s` column, when present and non-empty.
    pub fn covariate(&self) -> Option<f64> {
        self.covariate
    }
}

// ---------------------------------------------------------------------------
// Raw table
// ---------------------------------------------------------------------------

/// A data row as split from the input text, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line number in the source text (header is line 1).
    pub line: usize,
    pub fields: Vec<String>,
}

/// Header plus raw rows of a delimited text file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
    /// Whitespace-only lines after the header, which carry no record.
    pub blank_lines: usize,
}

impl RawTable {
    /// Split `text` into header and rows. Returns `None` when there is no
    /// header line. Quoted fields (`"a,b"`, `""` escape) are supported within
    /// a single line.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.lines().enumerate();
        let (_, header_line) = lines.next()?;
        if header_line.trim().is_empty() {
            return None;
        }
        let header = split_fields(header_line)
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        let mut blank_lines = 0;
        for (idx, line) in lines {
            if line.trim().is_empty() {
                blank_lines += 1;
                continue;
            }
            rows.push(RawRow {
                line: idx + 1,
                fields: split_fields(line),
            });
        }
        Some(Self {
            header,
            rows,
            blank_lines,
        })
    }
}

fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if cur.trim().is_empty() => {
                cur.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Write-once audit record of one ingestion. Contains no wall-clock field,
/// so identical input always yields an identical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub filename: String,
    pub hash_algorithm: String,
    /// Lower-case hex SHA-256 over the raw input bytes.
    pub content_hash: String,
    /// Non-blank data rows seen.
    pub rows_read: usize,
    /// Rows accepted.
    pub row_count: usize,
    pub rows_rejected: usize,
    pub time_range: Option<TimeRange>,
    pub source_id_distribution: BTreeMap<String, usize>,
    /// Human-readable line per rejection or file-level notice.
    pub warnings: Vec<String>,
    pub rejections: Vec<RowRejection>,
}

/// Accepted rows of one input file.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDataset {
    filename: String,
    records: Vec<TrialRecord>,
}

impl ValidatedDataset {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bits(&self) -> Vec<u8> {
        self.records.iter().map(|r| r.bit).collect()
    }

    fn group_by_source<T>(&self, value: impl Fn(&TrialRecord) -> T) -> Vec<(String, Vec<T>)> {
        let mut order: Vec<(String, Vec<T>)> = Vec::new();
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for r in &self.records {
            let slot = *index.entry(r.source_id.as_str()).or_insert_with(|| {
                order.push((r.source_id.clone(), Vec::new()));
                order.len() - 1
            });
            order[slot].1.push(value(r));
        }
        order
    }

    /// Bits grouped by `source_id`, in order of first appearance.
    pub fn bits_by_source(&self) -> Vec<(String, Vec<u8>)> {
        self.group_by_source(|r| r.bit)
    }

    /// Covariate series aligned with [`Self::bits_by_source`]. A source with
    /// no `s` value at all maps to `None`; otherwise missing values read as 0.
    pub fn covariates_by_source(&self) -> Vec<(String, Option<Vec<f64>>)> {
        self.group_by_source(|r| r.covariate)
            .into_iter()
            .map(|(id, values)| {
                let series = values
                    .iter()
                    .any(Option::is_some)
                    .then(|| values.iter().map(|v| v.unwrap_or(0.0)).collect());
                (id, series)
            })
            .collect()
    }

    /// Render accepted rows as normalized CSV.
    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(self.records.len() * 48 + VALIDATED_HEADER.len());
        out.push_str(VALIDATED_HEADER);
        out.push('\n');
        for r in &self.records {
            out.push_str(&r.timestamp.to_rfc3339());
            out.push(',');
            out.push(if r.bit == 1 { '1' } else { '0' });
            out.push(',');
            out.push_str(&csv_field(&r.source_id));
            for opt in [&r.run_id, &r.device_id, &r.meta] {
                out.push(',');
                if let Some(v) = opt {
                    out.push_str(&csv_field(v));
                }
            }
            out.push(',');
            if let Some(s) = r.covariate {
                out.push_str(&s.to_string());
            }
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Lower-case hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse an absolute timestamp. Strings that parse as a local date-time but
/// carry no offset are refused as ambiguous.
pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<FixedOffset>, RejectReason> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(RejectReason::EmptyTimestamp);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt);
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok());
    if naive {
        Err(RejectReason::AmbiguousTimestamp {
            value: s.to_string(),
        })
    } else {
        Err(RejectReason::UnparseableTimestamp {
            value: s.to_string(),
        })
    }
}

fn parse_bit(raw: &str) -> std::result::Result<u8, RejectReason> {
    match raw.trim() {
        "0" => Ok(0),
        "1" => Ok(1),
        other => Err(RejectReason::InvalidBit {
            value: other.to_string(),
        }),
    }
}

fn parse_source_id(raw: &str) -> std::result::Result<String, RejectReason> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(RejectReason::EmptySourceId);
    }
    let length = s.chars().count();
    if length > MAX_SOURCE_ID_LEN {
        return Err(RejectReason::SourceIdTooLong {
            length,
            max: MAX_SOURCE_ID_LEN,
        });
    }
    Ok(s.to_string())
}

fn parse_covariate(raw: Option<&String>) -> std::result::Result<Option<f64>, RejectReason> {
    let Some(s) = raw.map(|s| s.trim()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(RejectReason::InvalidCovariate {
            value: s.to_string(),
        }),
    }
}

fn optional_field(raw: Option<&String>) -> Option<String> {
    raw.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Column positions resolved from the header.
struct ColumnMap {
    timestamp: usize,
    bit: usize,
    source_id: usize,
    run_id: Option<usize>,
    device_id: Option<usize>,
    meta: Option<usize>,
    covariate: Option<usize>,
}

fn resolve_columns(filename: &str, header: &[String]) -> Result<(ColumnMap, Vec<String>)> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, name) in header.iter().enumerate() {
        if seen.insert(name.as_str(), i).is_some() {
            return Err(CalibError::Schema {
                file: filename.to_string(),
                detail: format!("duplicate column '{name}'"),
            });
        }
    }
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !seen.contains_key(c))
        .collect();
    if !missing.is_empty() {
        return Err(CalibError::Schema {
            file: filename.to_string(),
            detail: format!("missing required column(s): {}", missing.join(", ")),
        });
    }
    let notices = header
        .iter()
        .filter(|h| !REQUIRED_COLUMNS.contains(&h.as_str()) && !OPTIONAL_COLUMNS.contains(&h.as_str()))
        .map(|h| format!("ignoring unknown column '{h}'"))
        .collect();
    let map = ColumnMap {
        timestamp: seen["timestamp"],
        bit: seen["bit"],
        source_id: seen["source_id"],
        run_id: seen.get("run_id").copied(),
        device_id: seen.get("device_id").copied(),
        meta: seen.get("meta").copied(),
        covariate: seen.get("s").copied(),
    };
    Ok((map, notices))
}

fn validate_row(
    cols: &ColumnMap,
    width: usize,
    row: &RawRow,
) -> std::result::Result<TrialRecord, RejectReason> {
    if row.fields.len() != width {
        return Err(RejectReason::ColumnCount {
            expected: width,
            found: row.fields.len(),
        });
    }
    let f = &row.fields;
    let timestamp = parse_timestamp(&f[cols.timestamp])?;
    let bit = parse_bit(&f[cols.bit])?;
    let source_id = parse_source_id(&f[cols.source_id])?;
    let covariate = parse_covariate(cols.covariate.map(|i| &f[i]))?;
    Ok(TrialRecord {
        timestamp,
        bit,
        source_id,
        run_id: optional_field(cols.run_id.map(|i| &f[i])),
        device_id: optional_field(cols.device_id.map(|i| &f[i])),
        meta: optional_field(cols.meta.map(|i| &f[i])),
        covariate,
    })
}

/// Validate an already-split table. `content_hash` is recorded verbatim.
pub fn validate_table(
    filename: &str,
    content_hash: &str,
    table: &RawTable,
) -> Result<(ValidatedDataset, ProvenanceRecord)> {
    let (cols, mut warnings) = resolve_columns(filename, &table.header)?;
    for notice in &warnings {
        log::warn!("{filename}: {notice}");
    }
    let width = table.header.len();

    let mut records = Vec::with_capacity(table.rows.len());
    let mut rejections = Vec::new();
    let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
    let mut tmin: Option<DateTime<FixedOffset>> = None;
    let mut tmax: Option<DateTime<FixedOffset>> = None;

    for row in &table.rows {
        match validate_row(&cols, width, row) {
            Ok(rec) => {
                if tmin.is_none_or(|t| rec.timestamp < t) {
                    tmin = Some(rec.timestamp);
                }
                if tmax.is_none_or(|t| rec.timestamp > t) {
                    tmax = Some(rec.timestamp);
                }
                *distribution.entry(rec.source_id.clone()).or_default() += 1;
                records.push(rec);
            }
            Err(reason) => {
                let rejection = RowRejection {
                    line: row.line,
                    reason,
                };
                log::warn!("{filename}: rejected {rejection}");
                warnings.push(rejection.to_string());
                rejections.push(rejection);
            }
        }
    }

    if table.blank_lines > 0 {
        let notice = format!(
            "skipped {} blank line(s) carrying no record",
            table.blank_lines
        );
        log::warn!("{filename}: {notice}");
        warnings.push(notice);
    }

    let provenance = ProvenanceRecord {
        filename: filename.to_string(),
        hash_algorithm: "sha256".to_string(),
        content_hash: content_hash.to_string(),
        rows_read: table.rows.len(),
        row_count: records.len(),
        rows_rejected: rejections.len(),
        time_range: tmin.zip(tmax).map(|(s, e)| TimeRange {
            start: s.to_rfc3339(),
            end: e.to_rfc3339(),
        }),
        source_id_distribution: distribution,
        warnings,
        rejections,
    };

    if records.is_empty() {
        if provenance.rows_rejected > 0 {
            return Err(CalibError::RowRejected {
                provenance: Box::new(provenance),
            });
        }
        return Err(CalibError::InsufficientData(format!(
            "{filename}: header present but no data rows"
        )));
    }

    log::info!(
        "{filename}: accepted {}/{} rows ({} rejected)",
        provenance.row_count,
        provenance.rows_read,
        provenance.rows_rejected
    );

    Ok((
        ValidatedDataset {
            filename: filename.to_string(),
            records,
        },
        provenance,
    ))
}

/// Validate raw file bytes against the data contract.
pub fn validate(filename: &str, raw: &[u8]) -> Result<(ValidatedDataset, ProvenanceRecord)> {
    let content_hash = sha256_hex(raw);
    let text = std::str::from_utf8(raw).map_err(|e| CalibError::Schema {
        file: filename.to_string(),
        detail: format!("input is not valid UTF-8 ({e})"),
    })?;
    let table = RawTable::parse(text).ok_or_else(|| CalibError::Schema {
        file: filename.to_string(),
        detail: "no header row".to_string(),
    })?;
    validate_table(filename, &content_hash, &table)
}

/// Paths and contents produced by [`ingest_file`].
#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub validated_path: PathBuf,
    pub provenance_path: PathBuf,
    pub dataset: ValidatedDataset,
    pub provenance: ProvenanceRecord,
}

/// Validate a file on disk and persist the validated CSV plus provenance
/// JSON under `out_dir`. The input file is only read.
///
/// When every row is rejected the provenance is still written before the
/// `RowRejected` error is returned.
pub fn ingest_file(input: &Path, out_dir: &Path) -> Result<IngestOutput> {
    let raw = std::fs::read(input).map_err(|e| CalibError::io(input, e))?;
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());

    std::fs::create_dir_all(out_dir).map_err(|e| CalibError::io(out_dir, e))?;
    let validated_path = out_dir.join(format!("{stem}_validated.csv"));
    let provenance_path = out_dir.join(format!("{stem}_provenance.json"));
    if same_file(&validated_path, input) || same_file(&provenance_path, input) {
        return Err(CalibError::Configuration(format!(
            "output would overwrite raw input {}",
            input.display()
        )));
    }

    let (dataset, provenance) = match validate(&filename, &raw) {
        Ok(ok) => ok,
        Err(CalibError::RowRejected { provenance }) => {
            write_json(&provenance_path, &provenance)?;
            return Err(CalibError::RowRejected { provenance });
        }
        Err(e) => return Err(e),
    };

    std::fs::write(&validated_path, dataset.to_csv())
        .map_err(|e| CalibError::io(&validated_path, e))?;
    write_json(&provenance_path, &provenance)?;

    Ok(IngestOutput {
        validated_path,
        provenance_path,
        dataset,
        provenance,
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// Pretty-print `value` as JSON into `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    std::fs::write(path, json).map_err(|e| CalibError::io(path, e))
}
