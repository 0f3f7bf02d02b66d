//! Per-subject pipeline, artifact cache and the parallel batch driver.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono_tz::Tz;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregate::WindowAggregator;
use crate::config::{validate_config, AggregationConfig, ConfigError};
use crate::differential::build_feature_series;
use crate::events::{
    list_event_files, load_subject_events, no_correction, resolve_duplicates, EventReadError,
    TimestampCorrection,
};
use crate::fill::{fill_gaps, FillError};
use crate::observability::{log_run_start, log_subject_status};
use crate::resample::{resample_to_grid, ResampleError};
use crate::segments::{partition_segments, AnnotationSource, CsvAnnotationSource, SegmentError};
use crate::series::SignalSeries;
use crate::table::{
    check_cached_schema, read_aggregated_table, read_signal_series, write_aggregated_table,
    write_schema, write_signal_series, AggregatedTable, GroundTruth, TableError, TableSchema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    Cached,
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataReason {
    NoEventFiles,
    NoRows,
    MissingAnnotations,
    NoWindows,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectOutcome {
    Table {
        table: AggregatedTable,
        source: TableSource,
    },
    NoData {
        reason: NoDataReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Regularized {
    Series(SignalSeries),
    NoData(NoDataReason),
}

#[derive(Debug, Error)]
pub enum SubjectError {
    #[error(transparent)]
    Events(#[from] EventReadError),
    #[error(transparent)]
    Resample(#[from] ResampleError),
    #[error(transparent)]
    Fill(#[from] FillError),
    #[error(transparent)]
    Segments(#[from] SegmentError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("subject processing panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectStatus {
    Completed { source: TableSource, rows: usize },
    NoData(NoDataReason),
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectReport {
    pub subject: u32,
    pub status: SubjectStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Dataset {
        table: AggregatedTable,
        path: PathBuf,
        reports: Vec<SubjectReport>,
    },
    NoData {
        reports: Vec<SubjectReport>,
    },
}

impl BatchOutcome {
    pub fn reports(&self) -> &[SubjectReport] {
        match self {
            Self::Dataset { reports, .. } | Self::NoData { reports } => reports,
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to list subjects under {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Table(#[from] TableError),
}

pub struct SubjectProcessor {
    config: AggregationConfig,
    tz: Tz,
    correction: Arc<dyn TimestampCorrection>,
    annotations: Arc<dyn AnnotationSource>,
}

impl SubjectProcessor {
    pub fn new(config: AggregationConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        let tz = config.tz()?;
        let annotations = Arc::new(CsvAnnotationSource::new(
            config.data_root.clone(),
            config.annotation_file.clone(),
        ));
        Ok(Self {
            config,
            tz,
            correction: Arc::new(no_correction),
            annotations,
        })
    }

    pub fn with_correction(mut self, correction: impl TimestampCorrection + 'static) -> Self {
        self.correction = Arc::new(correction);
        self
    }

    pub fn with_annotation_source(mut self, source: impl AnnotationSource + 'static) -> Self {
        self.annotations = Arc::new(source);
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn process_subject(&self, subject: u32) -> Result<SubjectOutcome, SubjectError> {
        let cfg = &self.config;
        let aggregated_path = cfg.subject_aggregated_path(subject);

        if cfg.reuse_cached && aggregated_path.is_file() {
            check_cached_schema(&aggregated_path, &cfg.fingerprint());
            let table = read_aggregated_table(&aggregated_path)?;
            debug!(
                component = "subject",
                event = "subject.cache.table_hit",
                subject,
                path = %aggregated_path.display()
            );
            return Ok(SubjectOutcome::Table {
                table,
                source: TableSource::Cached,
            });
        }

        let series_path = cfg.subject_series_path(subject);
        let series = if cfg.reuse_cached && series_path.is_file() {
            debug!(
                component = "subject",
                event = "subject.cache.series_hit",
                subject,
                path = %series_path.display()
            );
            read_signal_series(&series_path)?
        } else {
            match self.regularize_subject(subject)? {
                Regularized::Series(series) => series,
                Regularized::NoData(reason) => return Ok(SubjectOutcome::NoData { reason }),
            }
        };
        if series.is_empty() {
            return Ok(SubjectOutcome::NoData {
                reason: NoDataReason::NoRows,
            });
        }

        let outcome = self.aggregate_subject(subject, &series)?;
        if let SubjectOutcome::Table { table, .. } = &outcome {
            write_aggregated_table(&aggregated_path, table, self.tz)?;
            write_schema(
                &aggregated_path,
                &TableSchema::new(cfg.fingerprint(), table.columns.clone()),
            )?;
        }
        Ok(outcome)
    }

    pub fn regularize_subject(&self, subject: u32) -> Result<Regularized, SubjectError> {
        let cfg = &self.config;
        let raw_dir = cfg.subject_dir(subject).join(&cfg.raw_events_dir);
        let files = list_event_files(&raw_dir, &cfg.raw_events_suffix)?;
        if files.is_empty() {
            return Ok(Regularized::NoData(NoDataReason::NoEventFiles));
        }

        let loaded = load_subject_events(subject, &files, self.correction.as_ref());
        if loaded.files_used == 0 {
            return Ok(Regularized::NoData(NoDataReason::NoEventFiles));
        }

        let events = resolve_duplicates(loaded.events);
        let grid = resample_to_grid(&events, cfg.step_ms())?;
        if grid.is_empty() {
            return Ok(Regularized::NoData(NoDataReason::NoRows));
        }

        let (series, report) = fill_gaps(&grid, &cfg.fill_limits, &cfg.important_channels)?;
        if series.is_empty() {
            return Ok(Regularized::NoData(NoDataReason::NoRows));
        }

        let path = cfg.subject_series_path(subject);
        write_signal_series(&path, &series)?;
        info!(
            component = "subject",
            event = "subject.series.written",
            subject,
            path = %path.display(),
            rows = series.len(),
            channels = series.columns.len(),
            warmup_rows_dropped = report.warmup_rows_dropped
        );
        Ok(Regularized::Series(series))
    }

    pub fn aggregate_subject(
        &self,
        subject: u32,
        series: &SignalSeries,
    ) -> Result<SubjectOutcome, SubjectError> {
        let cfg = &self.config;
        let segments = match self.annotations.load_segments(subject) {
            Ok(segments) => segments,
            Err(SegmentError::MissingTable(path)) => {
                debug!(
                    component = "subject",
                    event = "subject.annotations.missing",
                    subject,
                    path = %path.display()
                );
                return Ok(SubjectOutcome::NoData {
                    reason: NoDataReason::MissingAnnotations,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let features = build_feature_series(series, &cfg.channel_map, &cfg.derivative_chains);
        let groups = partition_segments(&features.timestamps, &segments, &cfg.selected_phases);
        let aggregator = WindowAggregator::from_config(cfg);

        let mut table = AggregatedTable::new(aggregator.columns(&features));
        for group in &groups {
            let windows = aggregator.aggregate(&features, &group.rows);
            table.append_windows(&GroundTruth::new(&group.key, subject), windows);
        }
        table.finalize();

        debug!(
            component = "subject",
            event = "subject.aggregated",
            subject,
            groups = groups.len(),
            rows = table.len()
        );
        if table.is_empty() {
            return Ok(SubjectOutcome::NoData {
                reason: NoDataReason::NoWindows,
            });
        }
        Ok(SubjectOutcome::Table {
            table,
            source: TableSource::Computed,
        })
    }

    pub fn run_subject(&self, subject: u32) -> (SubjectReport, Option<AggregatedTable>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.process_subject(subject)))
            .unwrap_or_else(|payload| Err(SubjectError::Panicked(panic_message(payload.as_ref()))));

        let (status, table) = match result {
            Ok(SubjectOutcome::Table { table, source }) => (
                SubjectStatus::Completed {
                    source,
                    rows: table.len(),
                },
                Some(table),
            ),
            Ok(SubjectOutcome::NoData { reason }) => (SubjectStatus::NoData(reason), None),
            Err(err) => (
                SubjectStatus::Failed {
                    message: error_chain(&err),
                },
                None,
            ),
        };

        let report = SubjectReport { subject, status };
        log_subject_status(&report);
        (report, table)
    }

    pub fn run_batch(&self) -> Result<BatchOutcome, BatchError> {
        let cfg = &self.config;
        let mut subjects = match &cfg.subjects {
            Some(subjects) => subjects.clone(),
            None => discover_subjects(&cfg.data_root)?,
        };
        subjects.sort_unstable();
        subjects.dedup();
        log_run_start(cfg);

        let workers = cfg.parallelism.min(subjects.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        let results: Vec<(SubjectReport, Option<AggregatedTable>)> =
            pool.install(|| subjects.par_iter().map(|s| self.run_subject(*s)).collect());

        let mut reports = Vec::with_capacity(results.len());
        let mut tables = Vec::new();
        for (report, table) in results {
            reports.push(report);
            tables.extend(table);
        }

        let failed = reports
            .iter()
            .filter(|r| matches!(r.status, SubjectStatus::Failed { .. }))
            .count();
        if tables.is_empty() {
            info!(
                component = "batch",
                event = "batch.finish",
                subjects = reports.len(),
                failed,
                outcome = "no_data"
            );
            return Ok(BatchOutcome::NoData { reports });
        }

        let mut table = AggregatedTable::concat(tables);
        table.finalize();
        let path = cfg.merged_aggregated_path();
        write_aggregated_table(&path, &table, self.tz)?;
        write_schema(
            &path,
            &TableSchema::new(cfg.fingerprint(), table.columns.clone()),
        )?;
        info!(
            component = "batch",
            event = "batch.finish",
            subjects = reports.len(),
            failed,
            rows = table.len(),
            path = %path.display(),
            outcome = "dataset"
        );

        Ok(BatchOutcome::Dataset {
            table,
            path,
            reports,
        })
    }
}

pub fn discover_subjects(data_root: &Path) -> Result<Vec<u32>, BatchError> {
    let discover_err = |source| BatchError::Discover {
        path: data_root.to_path_buf(),
        source,
    };
    let mut subjects = Vec::new();
    for entry in fs::read_dir(data_root).map_err(discover_err)? {
        let entry = entry.map_err(discover_err)?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("drive_"))
            .and_then(|id| id.parse::<u32>().ok())
        else {
            continue;
        };
        subjects.push(id);
    }
    subjects.sort_unstable();
    Ok(subjects)
}

// `{err}: {source}: ...`, skipping sources already rendered by their parent.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discovers_only_numbered_drive_directories() {
        let dir = tempdir().unwrap();
        for name in ["drive_12", "drive_3", "drive_x", "other"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("drive_9"), "not a directory").unwrap();

        assert_eq!(discover_subjects(dir.path()).unwrap(), vec![3, 12]);
    }

    #[test]
    fn missing_data_root_is_a_discovery_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            discover_subjects(&dir.path().join("absent")).unwrap_err(),
            BatchError::Discover { .. }
        ));
    }

    #[test]
    fn subject_without_raw_files_has_no_data() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("drive_5")).unwrap();
        let processor = SubjectProcessor::new(AggregationConfig {
            data_root: dir.path().to_path_buf(),
            ..AggregationConfig::default()
        })
        .unwrap();

        assert_eq!(
            processor.process_subject(5).unwrap(),
            SubjectOutcome::NoData {
                reason: NoDataReason::NoEventFiles
            }
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_processing() {
        let cfg = AggregationConfig {
            shift_sec: 0,
            ..AggregationConfig::default()
        };
        assert!(SubjectProcessor::new(cfg).is_err());
    }

    #[derive(Debug, Error)]
    #[error("decode failed")]
    struct Outer {
        #[source]
        source: Inner,
    }

    #[derive(Debug, Error)]
    #[error("bad byte at 12")]
    struct Inner;

    #[test]
    fn failure_message_walks_the_source_chain() {
        assert_eq!(
            error_chain(&Outer { source: Inner }),
            "decode failed: bad byte at 12"
        );

        let io = SubjectError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert_eq!(error_chain(&io), "I/O error: disk gone");
    }

    #[test]
    fn outlier_timestamp_fails_only_that_subject() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("drive_6").join("study_day").join("canlogger");
        fs::create_dir_all(&raw).unwrap();
        fs::write(
            raw.join("0001_can.csv"),
            "timestampMs,url,name,valueDouble,valueString\n\
             0,VehicleSpeed,VehicleSpeed,1,\n\
             1714550400000,VehicleSpeed,VehicleSpeed,2,\n",
        )
        .unwrap();
        let processor = SubjectProcessor::new(AggregationConfig {
            data_root: dir.path().to_path_buf(),
            ..AggregationConfig::default()
        })
        .unwrap();

        assert!(matches!(
            processor.process_subject(6).unwrap_err(),
            SubjectError::Resample(ResampleError::GridTooLarge { .. })
        ));
        let (report, table) = processor.run_subject(6);
        assert!(table.is_none());
        assert!(matches!(
            report.status,
            SubjectStatus::Failed { message } if message.contains("85727520001 cells")
        ));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
