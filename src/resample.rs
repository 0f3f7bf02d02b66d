//! Projection of resolved events onto a uniform-frequency grid.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::events::RawEvent;
use crate::series::{ChannelKind, GridCells, GridColumn, GridSeries};

// About 4.6 days at 50 Hz.
pub const MAX_GRID_CELLS: usize = 20_000_000;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("grid from {first_ms} to {last_ms} ms needs {cells} cells, limit is {limit}")]
    GridTooLarge {
        first_ms: i64,
        last_ms: i64,
        cells: u128,
        limit: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum EventValue {
    Number(f64),
    Text(String),
}

impl EventValue {
    fn from_event(event: &RawEvent) -> Option<Self> {
        match (&event.value_double, &event.value_string) {
            (Some(v), _) => Some(Self::Number(*v)),
            (None, Some(s)) => Some(Self::Text(s.clone())),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Coerced {
    Number(f64),
    Flag(bool),
}

// All-text channels of `true`/`false` (or `True`/`False`) are boolean;
// any other text must parse as a number.
fn coerce_channel(values: &[EventValue]) -> Option<(ChannelKind, Vec<Coerced>)> {
    let texts: Vec<&str> = values
        .iter()
        .filter_map(|v| match v {
            EventValue::Text(s) => Some(s.as_str()),
            EventValue::Number(_) => None,
        })
        .collect();

    if texts.len() == values.len() && !texts.is_empty() {
        for (true_token, false_token) in [("true", "false"), ("True", "False")] {
            if texts.iter().all(|t| *t == true_token || *t == false_token) {
                let flags = texts
                    .iter()
                    .map(|t| Coerced::Flag(*t == true_token))
                    .collect();
                return Some((ChannelKind::Boolean, flags));
            }
        }
    }

    let mut numbers = Vec::with_capacity(values.len());
    for value in values {
        match value {
            EventValue::Number(v) => numbers.push(Coerced::Number(*v)),
            EventValue::Text(s) => numbers.push(Coerced::Number(s.parse::<f64>().ok()?)),
        }
    }
    Some((ChannelKind::Numeric, numbers))
}

pub fn cell_start(timestamp_ms: i64, step_ms: i64) -> i64 {
    timestamp_ms.div_euclid(step_ms) * step_ms
}

// First value in a cell wins. Channels come out ordered by name.
pub fn resample_to_grid(events: &[RawEvent], step_ms: i64) -> Result<GridSeries, ResampleError> {
    let mut by_channel: BTreeMap<&str, (Vec<i64>, Vec<EventValue>)> = BTreeMap::new();
    for event in events {
        if let Some(value) = EventValue::from_event(event) {
            let entry = by_channel.entry(event.channel.as_str()).or_default();
            entry.0.push(event.timestamp_ms);
            entry.1.push(value);
        }
    }

    let bounds = by_channel
        .values()
        .flat_map(|(timestamps, _)| timestamps.iter().copied())
        .fold(None, |acc: Option<(i64, i64)>, ts| match acc {
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
            None => Some((ts, ts)),
        });
    let Some((first_ts, last_ts)) = bounds else {
        return Ok(GridSeries::empty(step_ms));
    };

    let origin = cell_start(first_ts, step_ms);
    let span = i128::from(cell_start(last_ts, step_ms)) - i128::from(origin);
    let cells = (span / i128::from(step_ms) + 1) as u128;
    if cells > MAX_GRID_CELLS as u128 {
        return Err(ResampleError::GridTooLarge {
            first_ms: first_ts,
            last_ms: last_ts,
            cells,
            limit: MAX_GRID_CELLS,
        });
    }
    let cell_count = cells as usize;
    let timestamps: Vec<i64> = (0..cell_count)
        .map(|i| origin + i as i64 * step_ms)
        .collect();

    let mut columns = Vec::with_capacity(by_channel.len());
    for (channel, (event_ts, values)) in by_channel {
        let Some((kind, coerced)) = coerce_channel(&values) else {
            warn!(
                component = "resample",
                event = "resample.channel.dropped",
                channel,
                reason = "non_numeric_text"
            );
            continue;
        };

        let cells = match kind {
            ChannelKind::Numeric => {
                let mut cells = vec![None; cell_count];
                for (ts, value) in event_ts.iter().zip(&coerced) {
                    let idx = ((cell_start(*ts, step_ms) - origin) / step_ms) as usize;
                    if let (None, Coerced::Number(v)) = (cells[idx], value) {
                        cells[idx] = Some(*v);
                    }
                }
                GridCells::Numeric(cells)
            }
            ChannelKind::Boolean => {
                let mut cells = vec![None; cell_count];
                for (ts, value) in event_ts.iter().zip(&coerced) {
                    let idx = ((cell_start(*ts, step_ms) - origin) / step_ms) as usize;
                    if let (None, Coerced::Flag(v)) = (cells[idx], value) {
                        cells[idx] = Some(*v);
                    }
                }
                GridCells::Boolean(cells)
            }
        };

        columns.push(GridColumn {
            name: channel.to_string(),
            cells,
        });
    }

    debug!(
        component = "resample",
        event = "resample.grid.built",
        step_ms,
        cells = cell_count,
        channels = columns.len()
    );

    Ok(GridSeries {
        step_ms,
        timestamps,
        columns,
    })
}
