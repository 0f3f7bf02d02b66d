//! Aggregated tables and the CSV artifacts persisted per subject.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::{floor_to_second, WindowRow, PROPORTION_COLUMN};
use crate::config::AGGREGATION_SCHEMA_VERSION;
use crate::segments::SegmentKey;
use crate::series::{SignalColumn, SignalSeries, SignalValues};

pub const DATETIME_COLUMN: &str = "datetime";
pub const TIMESTAMP_COLUMN: &str = "timestamp_ms";
pub const GROUNDTRUTH_COLUMNS: [&str; 4] = [
    "groundtruth+phase+CAN+",
    "groundtruth+scenario+CAN+",
    "groundtruth+variant+CAN+",
    "groundtruth+id+CAN+",
];

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed table {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("failed to encode schema sidecar {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundTruth {
    pub phase: i64,
    pub scenario: String,
    pub variant: i64,
    pub subject_id: u32,
}

impl GroundTruth {
    pub fn new(key: &SegmentKey, subject_id: u32) -> Self {
        Self {
            phase: key.phase,
            scenario: key.scenario.clone(),
            variant: key.variant,
            subject_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub timestamp_ms: i64,
    pub groundtruth: GroundTruth,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedTable {
    pub columns: Vec<String>,
    pub rows: Vec<AggregatedRow>,
}

impl AggregatedTable {
    pub fn new(statistic_columns: Vec<String>) -> Self {
        let mut columns = Vec::with_capacity(statistic_columns.len() + 1);
        columns.push(PROPORTION_COLUMN.to_string());
        columns.extend(statistic_columns);
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.values.get(idx).copied().flatten()
    }

    pub fn append_windows(&mut self, groundtruth: &GroundTruth, windows: Vec<WindowRow>) {
        for window in windows {
            let mut values = Vec::with_capacity(window.values.len() + 1);
            values.push(Some(window.proportion_num_samples));
            values.extend(window.values);
            self.rows.push(AggregatedRow {
                timestamp_ms: window.start_ms,
                groundtruth: groundtruth.clone(),
                values,
            });
        }
    }

    pub fn finalize(&mut self) {
        self.rows.sort_by_key(|row| row.timestamp_ms);
        for row in &mut self.rows {
            row.timestamp_ms = floor_to_second(row.timestamp_ms);
        }
    }

    pub fn concat(tables: Vec<AggregatedTable>) -> AggregatedTable {
        let mut columns: Vec<String> = Vec::new();
        for table in &tables {
            for column in &table.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(tables.iter().map(AggregatedTable::len).sum());
        for table in tables {
            let mapping: Vec<usize> = table
                .columns
                .iter()
                .filter_map(|c| columns.iter().position(|u| u == c))
                .collect();
            for row in table.rows {
                let mut values = vec![None; columns.len()];
                for (value, target) in row.values.into_iter().zip(&mapping) {
                    values[*target] = value;
                }
                rows.push(AggregatedRow { values, ..row });
            }
        }

        AggregatedTable { columns, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(fingerprint: String, columns: Vec<String>) -> Self {
        Self {
            version: AGGREGATION_SCHEMA_VERSION,
            fingerprint,
            columns,
        }
    }
}

pub fn schema_path(table_path: &Path) -> PathBuf {
    let mut name = table_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".schema.json");
    table_path.with_file_name(name)
}

pub fn write_schema(table_path: &Path, schema: &TableSchema) -> Result<(), TableError> {
    let path = schema_path(table_path);
    let bytes = serde_json::to_vec_pretty(schema).map_err(|source| TableError::Schema {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &bytes)
}

pub fn read_schema(table_path: &Path) -> Result<Option<TableSchema>, TableError> {
    let path = schema_path(table_path);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read(&path).map_err(|source| TableError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| TableError::Schema { path, source })
}

pub fn check_cached_schema(table_path: &Path, expected_fingerprint: &str) {
    match read_schema(table_path) {
        Ok(Some(schema))
            if schema.version == AGGREGATION_SCHEMA_VERSION
                && schema.fingerprint == expected_fingerprint => {}
        Ok(Some(schema)) => warn!(
            component = "table",
            event = "table.schema.mismatch",
            path = %table_path.display(),
            expected = expected_fingerprint,
            actual = %schema.fingerprint,
            version = schema.version
        ),
        Ok(None) => debug!(
            component = "table",
            event = "table.schema.absent",
            path = %table_path.display()
        ),
        Err(err) => warn!(
            component = "table",
            event = "table.schema.unreadable",
            path = %table_path.display(),
            error = %err
        ),
    }
}

pub fn write_aggregated_table(
    path: &Path,
    table: &AggregatedTable,
    tz: Tz,
) -> Result<(), TableError> {
    let csv_err = |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<&str> = vec![DATETIME_COLUMN];
    header.extend(GROUNDTRUTH_COLUMNS);
    header.extend(table.columns.iter().map(String::as_str));
    writer.write_record(&header).map_err(csv_err)?;

    for row in &table.rows {
        let datetime = format_datetime(path, row.timestamp_ms, tz)?;
        let mut record = vec![
            datetime,
            row.groundtruth.phase.to_string(),
            row.groundtruth.scenario.clone(),
            row.groundtruth.variant.to_string(),
            row.groundtruth.subject_id.to_string(),
        ];
        record.extend(row.values.iter().map(|v| v.map(format_f64).unwrap_or_default()));
        writer.write_record(&record).map_err(csv_err)?;
    }

    let bytes = writer.into_inner().map_err(|err| TableError::Io {
        path: path.to_path_buf(),
        source: err.into_error(),
    })?;
    write_atomic(path, &bytes)
}

pub fn read_aggregated_table(path: &Path) -> Result<AggregatedTable, TableError> {
    let csv_err = |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let malformed = |message: String| TableError::Malformed {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;

    let header = reader.headers().map_err(csv_err)?.clone();
    let lead = 1 + GROUNDTRUTH_COLUMNS.len();
    let expected_lead = std::iter::once(DATETIME_COLUMN).chain(GROUNDTRUTH_COLUMNS);
    if header.len() < lead || !header.iter().zip(expected_lead).all(|(a, b)| a == b) {
        return Err(malformed("unexpected leading columns".to_string()));
    }
    let columns: Vec<String> = header.iter().skip(lead).map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let field = |i: usize| record.get(i).unwrap_or_default();
        let timestamp_ms = DateTime::parse_from_rfc3339(field(0))
            .map_err(|err| malformed(format!("datetime '{}': {err}", field(0))))?
            .timestamp_millis();
        let groundtruth = GroundTruth {
            phase: parse_field(field(1), "phase").map_err(malformed)?,
            scenario: field(2).to_string(),
            variant: parse_field(field(3), "variant").map_err(malformed)?,
            subject_id: parse_field(field(4), "subject id").map_err(malformed)?,
        };
        let mut values = Vec::with_capacity(columns.len());
        for i in lead..lead + columns.len() {
            let raw = field(i);
            values.push(if raw.is_empty() {
                None
            } else {
                Some(parse_field::<f64>(raw, "value").map_err(malformed)?)
            });
        }
        rows.push(AggregatedRow {
            timestamp_ms,
            groundtruth,
            values,
        });
    }

    Ok(AggregatedTable { columns, rows })
}

pub fn write_signal_series(path: &Path, series: &SignalSeries) -> Result<(), TableError> {
    let csv_err = |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec![TIMESTAMP_COLUMN.to_string()];
    header.extend(series.columns.iter().map(|c| c.name.clone()));
    writer.write_record(&header).map_err(csv_err)?;

    for (row, ts) in series.timestamps.iter().enumerate() {
        let mut record = Vec::with_capacity(series.columns.len() + 1);
        record.push(ts.to_string());
        for column in &series.columns {
            record.push(match &column.values {
                SignalValues::Numeric(values) => {
                    let v = values[row];
                    if v.is_nan() {
                        String::new()
                    } else {
                        format_f64(v)
                    }
                }
                SignalValues::Boolean(values) => values[row].to_string(),
            });
        }
        writer.write_record(&record).map_err(csv_err)?;
    }

    let bytes = writer.into_inner().map_err(|err| TableError::Io {
        path: path.to_path_buf(),
        source: err.into_error(),
    })?;
    write_atomic(path, &bytes)
}

pub fn read_signal_series(path: &Path) -> Result<SignalSeries, TableError> {
    let csv_err = |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let malformed = |message: String| TableError::Malformed {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;

    let header = reader.headers().map_err(csv_err)?.clone();
    if header.get(0) != Some(TIMESTAMP_COLUMN) {
        return Err(malformed(format!("first column must be {TIMESTAMP_COLUMN}")));
    }
    let names: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut timestamps = Vec::new();
    let mut raw_columns: Vec<Vec<String>> = vec![Vec::new(); names.len()];
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let ts = record.get(0).unwrap_or_default();
        timestamps.push(parse_field::<i64>(ts, TIMESTAMP_COLUMN).map_err(malformed)?);
        for (i, cells) in raw_columns.iter_mut().enumerate() {
            cells.push(record.get(i + 1).unwrap_or_default().to_string());
        }
    }

    let mut columns = Vec::with_capacity(names.len());
    for (name, cells) in names.into_iter().zip(raw_columns) {
        let is_boolean =
            !cells.is_empty() && cells.iter().all(|c| c == "true" || c == "false");
        let values = if is_boolean {
            SignalValues::Boolean(cells.iter().map(|c| c == "true").collect())
        } else {
            let mut values = Vec::with_capacity(cells.len());
            for cell in &cells {
                values.push(if cell.is_empty() {
                    f64::NAN
                } else {
                    parse_field::<f64>(cell, &name).map_err(malformed)?
                });
            }
            SignalValues::Numeric(values)
        };
        columns.push(SignalColumn { name, values });
    }

    Ok(SignalSeries {
        timestamps,
        columns,
    })
}

fn format_datetime(path: &Path, timestamp_ms: i64, tz: Tz) -> Result<String, TableError> {
    let utc = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| TableError::Malformed {
            path: path.to_path_buf(),
            message: format!("timestamp {timestamp_ms} out of range"),
        })?;
    Ok(utc.with_timezone(&tz).format(DATETIME_FORMAT).to_string())
}

fn format_f64(value: f64) -> String {
    value.to_string()
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, String> {
    raw.parse::<T>()
        .map_err(|_| format!("invalid {what} '{raw}'"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let io_err = |source| TableError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| TableError::Malformed {
            path: path.to_path_buf(),
            message: "output path has no file name".to_string(),
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }

    fs::rename(&tmp_path, path).map_err(io_err)
}
