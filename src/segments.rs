//! Phase/scenario annotation table and row partitioning.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub phase: i64,
    pub scenario: String,
    pub variant: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSegment {
    pub key: SegmentKey,
    pub start_ms: i64,
    pub end_ms: i64,
    pub validity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRows {
    pub key: SegmentKey,
    pub rows: Vec<usize>,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("annotation table not found at {0}")]
    MissingTable(PathBuf),
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to parse annotation field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

pub trait AnnotationSource: Send + Sync {
    fn load_segments(&self, subject: u32) -> Result<Vec<AnnotationSegment>, SegmentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvAnnotationSource {
    pub data_root: PathBuf,
    pub annotation_file: PathBuf,
}

impl CsvAnnotationSource {
    pub fn new(data_root: impl Into<PathBuf>, annotation_file: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            annotation_file: annotation_file.into(),
        }
    }

    pub fn path_for(&self, subject: u32) -> PathBuf {
        self.data_root
            .join(format!("drive_{subject}"))
            .join(&self.annotation_file)
    }
}

impl AnnotationSource for CsvAnnotationSource {
    fn load_segments(&self, subject: u32) -> Result<Vec<AnnotationSegment>, SegmentError> {
        let path = self.path_for(subject);
        if !path.is_file() {
            return Err(SegmentError::MissingTable(path));
        }
        read_annotation_table(&path)
    }
}

#[derive(Debug, Deserialize)]
struct AnnotationRecord {
    phase: String,
    scenario: String,
    variant: String,
    start: String,
    end: String,
    #[serde(default)]
    validity: Option<String>,
}

pub fn read_annotation_table(path: &Path) -> Result<Vec<AnnotationSegment>, SegmentError> {
    let csv_err = |source| SegmentError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let mut segments = Vec::new();
    for record in reader.deserialize::<AnnotationRecord>() {
        let record = record.map_err(csv_err)?;
        let validity = match record.validity.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_integral("validity", raw)?),
            _ => None,
        };
        segments.push(AnnotationSegment {
            key: SegmentKey {
                phase: parse_integral("phase", &record.phase)?,
                scenario: record.scenario,
                variant: parse_integral("variant", &record.variant)?,
            },
            start_ms: parse_instant_ms("start", &record.start)?,
            end_ms: parse_instant_ms("end", &record.end)?,
            validity,
        });
    }
    Ok(segments)
}

fn parse_integral(field: &'static str, raw: &str) -> Result<i64, SegmentError> {
    let err = || SegmentError::ParseField {
        field,
        value: raw.to_string(),
    };
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(v);
    }
    let v = raw.parse::<f64>().map_err(|_| err())?;
    if v.is_finite() && v.fract() == 0.0 {
        Ok(v as i64)
    } else {
        Err(err())
    }
}

// Millisecond epoch, RFC 3339, or `YYYY-MM-DD HH:MM:SS[.f]+HH:MM`.
pub fn parse_instant_ms(field: &'static str, raw: &str) -> Result<i64, SegmentError> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| SegmentError::ParseField {
            field,
            value: raw.to_string(),
        })
}

// A row covered by segments of two different keys lands in both groups.
pub fn partition_segments(
    timestamps: &[i64],
    segments: &[AnnotationSegment],
    selected_phases: &[i64],
) -> Vec<SegmentRows> {
    let mut groups: Vec<SegmentRows> = Vec::new();

    for segment in segments {
        if !selected_phases.contains(&segment.key.phase) {
            continue;
        }
        if segment.validity.is_some_and(|v| v != 1) {
            debug!(
                component = "segments",
                event = "segments.invalid_skipped",
                phase = segment.key.phase,
                scenario = %segment.key.scenario,
                variant = segment.key.variant
            );
            continue;
        }

        let lo = timestamps.partition_point(|t| *t < segment.start_ms);
        let hi = timestamps.partition_point(|t| *t <= segment.end_ms);
        if lo >= hi {
            warn!(
                component = "segments",
                event = "segments.empty_interval",
                phase = segment.key.phase,
                scenario = %segment.key.scenario,
                variant = segment.key.variant,
                start_ms = segment.start_ms,
                end_ms = segment.end_ms
            );
            continue;
        }

        match groups.iter_mut().find(|g| g.key == segment.key) {
            Some(group) => {
                group.rows.extend(lo..hi);
                group.rows.sort_unstable();
                group.rows.dedup();
            }
            None => groups.push(SegmentRows {
                key: segment.key.clone(),
                rows: (lo..hi).collect(),
            }),
        }
    }

    groups
}
