use std::fs;
use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use canlog_features::{
    load_subject_events, log_run_start, numeric_statistics, partition_segments, AggregationConfig,
    AnnotationSegment, NumericStatistic, SegmentKey, SubjectProcessor, SubjectStatus,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

#[test]
fn empty_segment_is_logged_and_skipped() {
    let timestamps: Vec<i64> = (0..10).map(|i| i * 100).collect();
    let segment = AnnotationSegment {
        key: SegmentKey {
            phase: 1,
            scenario: "highway".to_string(),
            variant: 1,
        },
        start_ms: 50_000,
        end_ms: 60_000,
        validity: None,
    };

    let logs = capture_logs(Level::INFO, || {
        let groups = partition_segments(&timestamps, &[segment], &[1, 2, 3]);
        assert!(groups.is_empty());
    });

    assert!(logs.contains("\"event\":\"segments.empty_interval\""));
    assert!(logs.contains("\"scenario\":\"highway\""));
}

#[test]
fn numeric_instability_is_logged_with_channel_and_moments() {
    let logs = capture_logs(Level::INFO, || {
        let out = numeric_statistics(
            "vehicle+velocity+",
            &[-1e200, 1e200],
            &[NumericStatistic::Kurtosis],
        );
        assert_eq!(out, vec![Some(0.0)]);
    });

    assert!(logs.contains("\"event\":\"aggregate.numeric_instability\""));
    assert!(logs.contains("\"channel\":\"vehicle+velocity+\""));
    assert!(logs.contains("\"statistic\":\"kurtosis\""));
    assert!(logs.contains("\"std\":"));
}

#[test]
fn empty_raw_files_are_logged_and_skipped() {
    let temp = tempdir().expect("temp dir should be created");
    let path = temp.path().join("0001_can.csv");
    fs::write(&path, "").expect("empty file should be written");

    let logs = capture_logs(Level::INFO, || {
        let loaded = load_subject_events(5, &[path.clone()], &|ts: i64| ts);
        assert_eq!(loaded.files_skipped, 1);
    });

    assert!(logs.contains("\"event\":\"events.file.empty\""));
    assert!(logs.contains("\"event\":\"events.load.finish\""));
}

#[test]
fn failed_subject_emits_error_event() {
    let temp = tempdir().expect("temp dir should be created");
    let raw_dir = temp.path().join("drive_11").join("study_day").join("canlogger");
    fs::create_dir_all(&raw_dir).expect("raw dir should be created");
    fs::write(
        raw_dir.join("0001_can.csv"),
        "timestampMs,url,name,valueDouble,valueString\n1000,Mystery,Mystery,1,\n",
    )
    .expect("raw file should be written");
    let processor = SubjectProcessor::new(AggregationConfig {
        data_root: temp.path().to_path_buf(),
        ..AggregationConfig::default()
    })
    .expect("config should validate");

    let logs = capture_logs(Level::INFO, || {
        let (report, table) = processor.run_subject(11);
        assert!(matches!(report.status, SubjectStatus::Failed { .. }));
        assert!(table.is_none());
    });

    assert!(logs.contains("\"event\":\"subject.failed\""));
    assert!(logs.contains("Mystery"));
}

#[test]
fn run_start_helper_emits_baseline_event() {
    let logs = capture_logs(Level::INFO, || {
        log_run_start(&AggregationConfig::default());
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"frequency\":50"));
}
