use std::fs;
use std::path::{Path, PathBuf};

use canlog_features::{
    read_schema, AggregationConfig, AnnotationSegment, AnnotationSource, BatchOutcome,
    CsvAnnotationSource, NoDataReason, SegmentError, SubjectOutcome, SubjectProcessor,
    SubjectStatus, TableSource, PROPORTION_COLUMN,
};
use tempfile::tempdir;

const T0_MS: i64 = 1_714_550_400_000; // 2024-05-01T08:00:00Z

fn config(root: &Path, subjects: Vec<u32>) -> AggregationConfig {
    AggregationConfig {
        data_root: root.to_path_buf(),
        output_dir: root.join("aggregated"),
        frequency: 10,
        window_size_sec: 5,
        shift_sec: 5,
        subjects: Some(subjects),
        ..AggregationConfig::default()
    }
}

fn write_raw_channel(root: &Path, subject: u32, channel: &str) -> PathBuf {
    write_raw_channel_at(root, subject, channel, T0_MS)
}

// 10 s of a 10 Hz channel whose value is the sample index.
fn write_raw_channel_at(root: &Path, subject: u32, channel: &str, start_ms: i64) -> PathBuf {
    let dir = root
        .join(format!("drive_{subject}"))
        .join("study_day")
        .join("canlogger");
    fs::create_dir_all(&dir).expect("raw dir should be created");

    let mut body = String::from("timestampMs,url,name,valueDouble,valueString\n");
    for i in 0..100 {
        body.push_str(&format!("{},{channel},{channel},{i},\n", start_ms + i * 100));
    }
    let path = dir.join("0001_can.csv");
    fs::write(&path, body).expect("raw file should be written");
    path
}

fn write_annotations(root: &Path, subject: u32, body: &str) {
    let dir = root.join(format!("drive_{subject}")).join("study_day");
    fs::create_dir_all(&dir).expect("annotation dir should be created");
    fs::write(dir.join("phases.csv"), body).expect("annotations should be written");
}

fn first_five_seconds() -> String {
    format!(
        "phase,scenario,variant,start,end\n1,city,2,{},{}\n",
        T0_MS,
        T0_MS + 4_900
    )
}

#[test]
fn ten_hertz_speed_yields_single_full_window() {
    let temp = tempdir().expect("temp dir should be created");
    write_raw_channel(temp.path(), 7, "VehicleSpeed");
    write_annotations(temp.path(), 7, &first_five_seconds());

    let processor =
        SubjectProcessor::new(config(temp.path(), vec![7])).expect("config should validate");
    let outcome = processor.process_subject(7).expect("subject should process");

    let SubjectOutcome::Table { table, source } = outcome else {
        panic!("expected a computed table");
    };
    assert_eq!(source, TableSource::Computed);
    assert_eq!(table.len(), 1);

    let row = &table.rows[0];
    assert_eq!(row.timestamp_ms, T0_MS);
    assert_eq!(row.groundtruth.phase, 1);
    assert_eq!(row.groundtruth.scenario, "city");
    assert_eq!(row.groundtruth.variant, 2);
    assert_eq!(row.groundtruth.subject_id, 7);
    assert_eq!(table.value(0, PROPORTION_COLUMN), Some(1.0));
    assert_eq!(table.value(0, "vehicle+velocity++mean"), Some(24.5));
    assert_eq!(table.value(0, "vehicle+velocity++max"), Some(49.0));
    assert_eq!(table.value(0, "vehicle+acceleration++mean"), Some(9.8));

    let cfg = processor.config();
    let series = fs::read_to_string(cfg.subject_series_path(7)).expect("series should exist");
    assert!(series.starts_with("timestamp_ms,VehicleSpeed\n"));
    assert_eq!(series.lines().count(), 101);

    let aggregated_path = cfg.subject_aggregated_path(7);
    let text = fs::read_to_string(&aggregated_path).expect("table should exist");
    assert!(text.lines().nth(1).unwrap().starts_with("2024-05-01T10:00:00+02:00,1,city,2,7,1,"));
    let schema = read_schema(&aggregated_path)
        .expect("sidecar should parse")
        .expect("sidecar should exist");
    assert_eq!(schema.fingerprint, cfg.fingerprint());
    assert_eq!(schema.columns, table.columns);
}

#[test]
fn second_cached_run_reuses_table_without_rewriting() {
    let temp = tempdir().expect("temp dir should be created");
    write_raw_channel(temp.path(), 3, "VehicleSpeed");
    write_annotations(temp.path(), 3, &first_five_seconds());
    let cfg = AggregationConfig {
        reuse_cached: true,
        ..config(temp.path(), vec![3])
    };
    let processor = SubjectProcessor::new(cfg).expect("config should validate");
    let aggregated_path = processor.config().subject_aggregated_path(3);

    let first = processor.process_subject(3).expect("first run should succeed");
    let bytes_after_first = fs::read(&aggregated_path).expect("table should exist");
    let second = processor.process_subject(3).expect("second run should succeed");
    let bytes_after_second = fs::read(&aggregated_path).expect("table should exist");

    let (
        SubjectOutcome::Table {
            table: computed,
            source: TableSource::Computed,
        },
        SubjectOutcome::Table {
            table: cached,
            source: TableSource::Cached,
        },
    ) = (first, second)
    else {
        panic!("expected a computed then a cached table");
    };
    assert_eq!(computed, cached);
    assert_eq!(bytes_after_first, bytes_after_second);
}

#[test]
fn cached_series_replaces_raw_events() {
    let temp = tempdir().expect("temp dir should be created");
    let raw = write_raw_channel(temp.path(), 4, "VehicleSpeed");
    write_annotations(temp.path(), 4, &first_five_seconds());
    let cfg = AggregationConfig {
        reuse_cached: true,
        ..config(temp.path(), vec![4])
    };
    let processor = SubjectProcessor::new(cfg).expect("config should validate");

    let first = processor.process_subject(4).expect("first run should succeed");
    fs::remove_file(processor.config().subject_aggregated_path(4)).expect("table removable");
    fs::remove_file(raw).expect("raw file removable");
    let second = processor.process_subject(4).expect("second run should succeed");

    match (first, second) {
        (
            SubjectOutcome::Table { table: a, .. },
            SubjectOutcome::Table {
                table: b,
                source: TableSource::Computed,
            },
        ) => assert_eq!(a, b),
        other => panic!("unexpected outcomes {other:?}"),
    }
}

#[test]
fn missing_annotations_and_uncovered_segments_are_no_data() {
    let temp = tempdir().expect("temp dir should be created");
    write_raw_channel(temp.path(), 1, "VehicleSpeed");
    write_raw_channel(temp.path(), 2, "VehicleSpeed");
    write_annotations(
        temp.path(),
        2,
        &format!(
            "phase,scenario,variant,start,end\n1,city,1,{},{}\n",
            T0_MS + 600_000,
            T0_MS + 700_000
        ),
    );
    let processor =
        SubjectProcessor::new(config(temp.path(), vec![1, 2])).expect("config should validate");

    assert_eq!(
        processor.process_subject(1).expect("subject 1 should process"),
        SubjectOutcome::NoData {
            reason: NoDataReason::MissingAnnotations
        }
    );
    assert_eq!(
        processor.process_subject(2).expect("subject 2 should process"),
        SubjectOutcome::NoData {
            reason: NoDataReason::NoWindows
        }
    );
}

struct PanickingFor {
    subject: u32,
    inner: CsvAnnotationSource,
}

impl AnnotationSource for PanickingFor {
    fn load_segments(&self, subject: u32) -> Result<Vec<AnnotationSegment>, SegmentError> {
        if subject == self.subject {
            panic!("annotation backend crashed for subject {subject}");
        }
        self.inner.load_segments(subject)
    }
}

#[test]
fn batch_isolates_failing_subjects_and_merges_the_rest() {
    let temp = tempdir().expect("temp dir should be created");
    for subject in [1, 3] {
        write_raw_channel(temp.path(), subject, "VehicleSpeed");
        write_annotations(temp.path(), subject, &first_five_seconds());
    }
    fs::create_dir_all(temp.path().join("drive_2")).expect("empty subject dir");
    write_raw_channel(temp.path(), 4, "UnmappedChannel");
    write_annotations(temp.path(), 4, &first_five_seconds());

    let cfg = AggregationConfig {
        parallelism: 2,
        ..config(temp.path(), vec![4, 3, 2, 1])
    };
    let processor = SubjectProcessor::new(cfg)
        .expect("config should validate")
        .with_annotation_source(PanickingFor {
            subject: 3,
            inner: CsvAnnotationSource::new(temp.path(), "study_day/phases.csv"),
        });

    let outcome = processor.run_batch().expect("batch should complete");

    let BatchOutcome::Dataset {
        table,
        path,
        reports,
    } = outcome
    else {
        panic!("expected a merged dataset");
    };
    let subjects: Vec<u32> = reports.iter().map(|r| r.subject).collect();
    assert_eq!(subjects, vec![1, 2, 3, 4]);
    assert_eq!(
        reports[0].status,
        SubjectStatus::Completed {
            source: TableSource::Computed,
            rows: 1
        }
    );
    assert_eq!(reports[1].status, SubjectStatus::NoData(NoDataReason::NoEventFiles));
    assert!(matches!(
        &reports[2].status,
        SubjectStatus::Failed { message } if message.contains("panicked")
    ));
    assert!(matches!(
        &reports[3].status,
        SubjectStatus::Failed { message } if message.contains("UnmappedChannel")
    ));

    assert_eq!(table.len(), 1);
    assert_eq!(table.rows[0].groundtruth.subject_id, 1);
    assert_eq!(path, temp.path().join("aggregated").join("aggregated_005_freq-010.csv"));
    assert!(path.is_file());
}

#[test]
fn merged_dataset_is_time_ordered_across_subjects() {
    let temp = tempdir().expect("temp dir should be created");
    let later = T0_MS + 60_000;
    write_raw_channel_at(temp.path(), 1, "VehicleSpeed", later);
    write_annotations(
        temp.path(),
        1,
        &format!(
            "phase,scenario,variant,start,end\n1,city,1,{},{}\n",
            later,
            later + 9_900
        ),
    );
    write_raw_channel_at(temp.path(), 2, "VehicleSpeed", T0_MS);
    write_annotations(
        temp.path(),
        2,
        &format!(
            "phase,scenario,variant,start,end\n1,city,1,{},{}\n",
            T0_MS,
            T0_MS + 9_900
        ),
    );

    let processor =
        SubjectProcessor::new(config(temp.path(), vec![1, 2])).expect("config should validate");
    let outcome = processor.run_batch().expect("batch should complete");

    let BatchOutcome::Dataset { table, path, .. } = outcome else {
        panic!("expected a merged dataset");
    };
    let order: Vec<(i64, u32)> = table
        .rows
        .iter()
        .map(|r| (r.timestamp_ms - T0_MS, r.groundtruth.subject_id))
        .collect();
    assert_eq!(order, vec![(0, 2), (5_000, 2), (60_000, 1), (65_000, 1)]);

    let text = fs::read_to_string(path).expect("merged table should exist");
    let subjects: Vec<&str> = text
        .lines()
        .skip(1)
        .map(|line| line.split(',').nth(4).expect("subject column"))
        .collect();
    assert_eq!(subjects, vec!["2", "2", "1", "1"]);
}

#[test]
fn batch_without_any_table_is_no_data() {
    let temp = tempdir().expect("temp dir should be created");
    fs::create_dir_all(temp.path().join("drive_8")).expect("subject dir");
    fs::create_dir_all(temp.path().join("drive_9")).expect("subject dir");

    let cfg = AggregationConfig {
        subjects: None,
        ..config(temp.path(), Vec::new())
    };
    let processor = SubjectProcessor::new(cfg).expect("config should validate");

    let outcome = processor.run_batch().expect("batch should complete");

    let BatchOutcome::NoData { reports } = outcome else {
        panic!("expected no data");
    };
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| r.status == SubjectStatus::NoData(NoDataReason::NoEventFiles)));
    assert!(!processor.config().merged_aggregated_path().exists());
}
