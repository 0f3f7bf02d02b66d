//! Sliding-window statistics over the rows of one segment group.

use rayon::prelude::*;
use tracing::debug;

use crate::config::AggregationConfig;
use crate::series::{SignalSeries, SignalValues};
use crate::stats::{boolean_statistics, numeric_statistics, BooleanStatistic, NumericStatistic};

pub const PROPORTION_COLUMN: &str = "agg+proportion_num_samples+CAN+";

#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    pub start_ms: i64,
    pub proportion_num_samples: f64,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregator {
    pub window_ms: i64,
    pub shift_ms: i64,
    pub expected_samples: f64,
    pub numeric_statistics: Vec<NumericStatistic>,
    pub boolean_statistics: Vec<BooleanStatistic>,
    pub parallel: bool,
}

impl WindowAggregator {
    pub fn from_config(cfg: &AggregationConfig) -> Self {
        Self {
            window_ms: i64::from(cfg.window_size_sec) * 1_000,
            shift_ms: i64::from(cfg.shift_sec) * 1_000,
            expected_samples: f64::from(cfg.window_size_sec) * f64::from(cfg.frequency),
            numeric_statistics: cfg.numeric_statistics.clone(),
            boolean_statistics: cfg.boolean_statistics.clone(),
            parallel: cfg.parallel_windows,
        }
    }

    pub fn columns(&self, series: &SignalSeries) -> Vec<String> {
        let mut names = Vec::new();
        for column in &series.columns {
            match column.values {
                SignalValues::Numeric(_) => names.extend(
                    self.numeric_statistics
                        .iter()
                        .map(|stat| format!("{}+{}", column.name, stat.as_str())),
                ),
                SignalValues::Boolean(_) => names.extend(
                    self.boolean_statistics
                        .iter()
                        .map(|stat| format!("{}+{}", column.name, stat.as_str())),
                ),
            }
        }
        names
    }

    pub fn aggregate(&self, series: &SignalSeries, rows: &[usize]) -> Vec<WindowRow> {
        let (Some(&first), Some(&last)) = (rows.first(), rows.last()) else {
            return Vec::new();
        };
        let first_start = ceil_to_second(series.timestamps[first]);
        let last_start = floor_to_second(series.timestamps[last]);
        if first_start > last_start {
            return Vec::new();
        }

        let timestamps: Vec<i64> = rows.iter().map(|&i| series.timestamps[i]).collect();
        let starts: Vec<i64> = (0..)
            .map(|k| first_start + k * self.shift_ms)
            .take_while(|start| *start <= last_start)
            .collect();

        let evaluate = |start: &i64| {
            let lo = timestamps.partition_point(|t| *t < *start);
            let hi = timestamps.partition_point(|t| *t < *start + self.window_ms);
            self.window(series, *start, &rows[lo..hi])
        };
        let mut windows: Vec<WindowRow> = if self.parallel {
            starts.par_iter().filter_map(evaluate).collect()
        } else {
            starts.iter().filter_map(evaluate).collect()
        };
        windows.sort_by_key(|w| w.start_ms);

        debug!(
            component = "aggregate",
            event = "aggregate.segment.finish",
            rows = rows.len(),
            candidate_windows = starts.len(),
            windows = windows.len()
        );
        windows
    }

    fn window(&self, series: &SignalSeries, start_ms: i64, rows: &[usize]) -> Option<WindowRow> {
        let mut values = Vec::new();
        for column in &series.columns {
            match &column.values {
                SignalValues::Numeric(all) => {
                    let sample: Vec<f64> = rows.iter().map(|&i| all[i]).collect();
                    values.extend(numeric_statistics(
                        &column.name,
                        &sample,
                        &self.numeric_statistics,
                    ));
                }
                SignalValues::Boolean(all) => {
                    let sample: Vec<bool> = rows.iter().map(|&i| all[i]).collect();
                    values.extend(boolean_statistics(
                        &column.name,
                        &sample,
                        &self.boolean_statistics,
                    ));
                }
            }
        }

        if values.iter().all(Option::is_none) {
            return None;
        }
        Some(WindowRow {
            start_ms,
            proportion_num_samples: rows.len() as f64 / self.expected_samples,
            values,
        })
    }
}

pub fn floor_to_second(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(1_000) * 1_000
}

pub fn ceil_to_second(timestamp_ms: i64) -> i64 {
    let floor = floor_to_second(timestamp_ms);
    if floor == timestamp_ms {
        floor
    } else {
        floor + 1_000
    }
}
