//! Raw bus event loading, channel identity and duplicate resolution.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub timestamp_ms: i64,
    pub channel: String,
    pub value_double: Option<f64>,
    pub value_string: Option<String>,
}

pub trait TimestampCorrection: Send + Sync {
    fn correct(&self, timestamp_ms: i64) -> i64;
}

impl<F> TimestampCorrection for F
where
    F: Fn(i64) -> i64 + Send + Sync,
{
    fn correct(&self, timestamp_ms: i64) -> i64 {
        self(timestamp_ms)
    }
}

pub fn no_correction(timestamp_ms: i64) -> i64 {
    timestamp_ms
}

#[derive(Debug, Error)]
pub enum EventReadError {
    #[error("I/O error reading {path}: {source}")]
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
}

#[derive(Debug, Deserialize)]
struct RawEventRecord {
    #[serde(rename = "timestampMs")]
    timestamp_ms: i64,
    url: String,
    name: String,
    #[serde(rename = "valueDouble")]
    value_double: Option<f64>,
    #[serde(rename = "valueString")]
    value_string: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectEvents {
    pub events: Vec<RawEvent>,
    pub files_used: usize,
    pub files_skipped: usize,
}

pub fn channel_identity(url: &str, name: &str) -> String {
    if url == name {
        url.to_string()
    } else {
        format!("{url}-{name}")
    }
}

pub fn list_event_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, EventReadError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| EventReadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EventReadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path
            .file_name()
            .map(|name| name.to_string_lossy().ends_with(suffix))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn read_event_file(
    path: &Path,
    correction: &dyn TimestampCorrection,
) -> Result<Vec<RawEvent>, EventReadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| EventReadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let mut events = Vec::new();
    for record in reader.deserialize::<RawEventRecord>() {
        let record = record.map_err(|source| EventReadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        events.push(RawEvent {
            timestamp_ms: correction.correct(record.timestamp_ms),
            channel: channel_identity(&record.url, &record.name),
            value_double: record.value_double.filter(|v| !v.is_nan()),
            value_string: record.value_string.filter(|s| !s.is_empty()),
        });
    }
    Ok(events)
}

pub fn load_subject_events(
    subject: u32,
    files: &[PathBuf],
    correction: &dyn TimestampCorrection,
) -> SubjectEvents {
    let mut out = SubjectEvents::default();

    for path in files {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(
                    component = "events",
                    event = "events.file.unreadable",
                    subject,
                    path = %path.display(),
                    error = %err
                );
                out.files_skipped += 1;
                continue;
            }
        };
        if size == 0 {
            warn!(
                component = "events",
                event = "events.file.empty",
                subject,
                path = %path.display()
            );
            out.files_skipped += 1;
            continue;
        }

        match read_event_file(path, correction) {
            Ok(events) if events.is_empty() => {
                debug!(
                    component = "events",
                    event = "events.file.no_rows",
                    subject,
                    path = %path.display()
                );
                out.files_skipped += 1;
            }
            Ok(mut events) => {
                out.files_used += 1;
                out.events.append(&mut events);
            }
            Err(err) => {
                warn!(
                    component = "events",
                    event = "events.file.unreadable",
                    subject,
                    path = %path.display(),
                    error = %err
                );
                out.files_skipped += 1;
            }
        }
    }

    info!(
        component = "events",
        event = "events.load.finish",
        subject,
        files_used = out.files_used,
        files_skipped = out.files_skipped,
        events = out.events.len()
    );
    out
}

// Per (timestamp, channel) the first non-missing value of each field wins.
pub fn resolve_duplicates(mut events: Vec<RawEvent>) -> Vec<RawEvent> {
    events.sort_by_key(|event| event.timestamp_ms);

    let mut resolved: Vec<RawEvent> = Vec::with_capacity(events.len());
    let mut slot_by_channel: HashMap<String, usize> = HashMap::new();
    let mut current_ts = None;
    let mut merged = 0u64;

    for event in events {
        if current_ts != Some(event.timestamp_ms) {
            slot_by_channel.clear();
            current_ts = Some(event.timestamp_ms);
        }

        match slot_by_channel.get(&event.channel) {
            Some(&slot) => {
                let first = &mut resolved[slot];
                if first.value_double.is_none() {
                    first.value_double = event.value_double;
                }
                if first.value_string.is_none() {
                    first.value_string = event.value_string;
                }
                merged += 1;
            }
            None => {
                slot_by_channel.insert(event.channel.clone(), resolved.len());
                resolved.push(event);
            }
        }
    }

    if merged > 0 {
        debug!(
            component = "events",
            event = "events.duplicates.merged",
            merged,
            remaining = resolved.len()
        );
    }
    resolved
}
