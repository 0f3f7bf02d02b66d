//! Time-normalized derivatives and the feature frame built from them.

use tracing::{debug, warn};

use crate::config::{ChannelMapping, DerivativeChain};
use crate::series::{SignalColumn, SignalSeries, SignalValues};

// Time in seconds; the first element and non-finite results are 0.
pub fn differentiate(timestamps_ms: &[i64], values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() {
        return out;
    }
    out.push(0.0);
    for i in 1..values.len() {
        let dt = (timestamps_ms[i] - timestamps_ms[i - 1]) as f64 / 1_000.0;
        let d = (values[i] - values[i - 1]) / dt;
        out.push(if d.is_finite() { d } else { 0.0 });
    }
    out
}

pub fn build_feature_series(
    filled: &SignalSeries,
    channel_map: &[ChannelMapping],
    chains: &[DerivativeChain],
) -> SignalSeries {
    let mut columns: Vec<SignalColumn> = Vec::with_capacity(channel_map.len());
    for mapping in channel_map {
        match filled.column(&mapping.source) {
            Some(column) => columns.push(SignalColumn {
                name: mapping.feature.clone(),
                values: column.values.clone(),
            }),
            None => warn!(
                component = "differential",
                event = "features.channel.missing",
                channel = %mapping.source,
                feature = %mapping.feature
            ),
        }
    }

    let mut derived = Vec::new();
    for chain in chains {
        let Some(source) = columns.iter().find(|c| c.name == chain.source) else {
            warn!(
                component = "differential",
                event = "features.chain.skipped",
                source = %chain.source
            );
            continue;
        };

        let mut current = source.values.to_f64();
        for output in &chain.outputs {
            current = differentiate(&filled.timestamps, &current);
            derived.push(SignalColumn {
                name: output.clone(),
                values: SignalValues::Numeric(current.clone()),
            });
        }
    }
    columns.extend(derived);
    columns.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(
        component = "differential",
        event = "features.built",
        columns = columns.len(),
        rows = filled.len()
    );

    SignalSeries {
        timestamps: filled.timestamps.clone(),
        columns,
    }
}
