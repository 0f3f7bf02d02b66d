//! Bounded forward-fill of grid cells.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::series::{GridCells, GridSeries, SignalColumn, SignalSeries, SignalValues};

#[derive(Debug, Error)]
pub enum FillError {
    #[error("channel '{0}' has no entry in the fill-limit table")]
    UnknownChannel(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    pub warmup_rows_dropped: usize,
    pub empty_rows_dropped: usize,
}

pub fn limit_in_cells(limit_ms: Option<u64>, step_ms: i64) -> Option<usize> {
    limit_ms.map(|ms| (ms / step_ms.max(1) as u64) as usize)
}

// Cells past the horizon take `default`; the mask marks observed or carried
// cells.
fn forward_fill<T: Copy>(
    cells: &[Option<T>],
    limit: Option<usize>,
    default: T,
) -> (Vec<T>, Vec<bool>) {
    let mut values = Vec::with_capacity(cells.len());
    let mut carried = Vec::with_capacity(cells.len());
    let mut last = None;
    let mut run = 0usize;

    for cell in cells {
        match cell {
            Some(v) => {
                last = Some(*v);
                run = 0;
                values.push(*v);
                carried.push(true);
            }
            None => {
                run += 1;
                match last {
                    Some(v) if limit.map_or(true, |l| run <= l) => {
                        values.push(v);
                        carried.push(true);
                    }
                    _ => {
                        values.push(default);
                        carried.push(false);
                    }
                }
            }
        }
    }

    (values, carried)
}

// Numeric gaps beyond the horizon become 0.0 and always keep their row.
// Boolean defaults do not count as data, so a row survives only if some
// channel is numeric or some boolean channel observed or carried a value.
pub fn fill_gaps(
    grid: &GridSeries,
    fill_limits: &BTreeMap<String, Option<u64>>,
    important_channels: &[String],
) -> Result<(SignalSeries, FillReport), FillError> {
    let mut limits = Vec::with_capacity(grid.columns.len());
    for column in &grid.columns {
        let limit = fill_limits
            .get(&column.name)
            .ok_or_else(|| FillError::UnknownChannel(column.name.clone()))?;
        limits.push(limit_in_cells(*limit, grid.step_ms));
    }

    let mut warmup = 0usize;
    for name in important_channels {
        match grid.column(name) {
            Some(column) => warmup = warmup.max(column.cells.leading_empty()),
            None => debug!(
                component = "fill",
                event = "fill.important_channel.absent",
                channel = %name
            ),
        }
    }
    let warmup = warmup.min(grid.len());

    let mut filled = Vec::with_capacity(grid.columns.len());
    let mut keep = vec![false; grid.len() - warmup];
    for (column, limit) in grid.columns.iter().zip(limits) {
        let (values, defined) = match &column.cells {
            GridCells::Numeric(cells) => {
                let (values, _) = forward_fill(&cells[warmup..], limit, 0.0);
                let defined = vec![true; values.len()];
                (SignalValues::Numeric(values), defined)
            }
            GridCells::Boolean(cells) => {
                let (values, carried) = forward_fill(&cells[warmup..], limit, false);
                (SignalValues::Boolean(values), carried)
            }
        };
        for (flag, defined) in keep.iter_mut().zip(defined) {
            *flag |= defined;
        }
        filled.push((column.name.clone(), values));
    }

    let kept_rows: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(i, keep)| keep.then_some(i))
        .collect();
    let report = FillReport {
        warmup_rows_dropped: warmup,
        empty_rows_dropped: keep.len() - kept_rows.len(),
    };

    let timestamps = kept_rows
        .iter()
        .map(|&i| grid.timestamps[warmup + i])
        .collect();
    let columns = filled
        .into_iter()
        .map(|(name, values)| SignalColumn {
            name,
            values: values.select(&kept_rows),
        })
        .collect();

    info!(
        component = "fill",
        event = "fill.finish",
        rows_in = grid.len(),
        rows_out = kept_rows.len(),
        warmup_rows_dropped = report.warmup_rows_dropped,
        empty_rows_dropped = report.empty_rows_dropped
    );

    Ok((SignalSeries { timestamps, columns }, report))
}
