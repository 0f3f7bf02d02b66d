//! CAN-bus logger feature extraction.
//!
//! Current implemented scope:
//! - raw event loading with duplicate resolution
//! - fixed-frequency resampling and bounded gap filling
//! - derivative chains and phase/scenario segmentation
//! - windowed statistics with a per-subject artifact cache
//! - parallel batch aggregation across subjects

mod aggregate;
mod config;
mod differential;
mod events;
mod fill;
mod observability;
mod resample;
mod segments;
mod series;
mod stats;
mod subject;
mod table;

pub use aggregate::{ceil_to_second, floor_to_second, WindowAggregator, WindowRow, PROPORTION_COLUMN};
pub use config::{
    config_from_env, load_config, validate_config, AggregationConfig, ChannelMapping, ConfigError,
    DerivativeChain, AGGREGATION_SCHEMA_VERSION, DEFAULT_TIMEZONE,
};
pub use differential::{build_feature_series, differentiate};
pub use events::{
    channel_identity, list_event_files, load_subject_events, no_correction, read_event_file,
    resolve_duplicates, EventReadError, RawEvent, SubjectEvents, TimestampCorrection,
};
pub use fill::{fill_gaps, limit_in_cells, FillError, FillReport};
pub use observability::{
    init_logging, log_run_start, log_subject_status, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use resample::{cell_start, resample_to_grid, ResampleError, MAX_GRID_CELLS};
pub use segments::{
    parse_instant_ms, partition_segments, read_annotation_table, AnnotationSegment,
    AnnotationSource, CsvAnnotationSource, SegmentError, SegmentKey, SegmentRows,
};
pub use series::{
    ChannelKind, GridCells, GridColumn, GridSeries, SignalColumn, SignalSeries, SignalValues,
};
pub use stats::{
    boolean_statistics, numeric_statistics, BooleanStatistic, NumericStatistic,
    MIN_STD_FOR_MOMENTS,
};
pub use subject::{
    discover_subjects, BatchError, BatchOutcome, NoDataReason, Regularized, SubjectError,
    SubjectOutcome, SubjectProcessor, SubjectReport, SubjectStatus, TableSource,
};
pub use table::{
    check_cached_schema, read_aggregated_table, read_schema, read_signal_series, schema_path,
    write_aggregated_table, write_schema, write_signal_series, AggregatedRow, AggregatedTable,
    GroundTruth, TableError, TableSchema, DATETIME_COLUMN, GROUNDTRUTH_COLUMNS, TIMESTAMP_COLUMN,
};
