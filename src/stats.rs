//! Per-window channel statistics.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// Below this, skewness and kurtosis are reported as 0.
pub const MIN_STD_FOR_MOMENTS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericStatistic {
    Mean,
    Std,
    Min,
    Max,
    Median,
    Range,
    Power,
    Skewness,
    Kurtosis,
}

impl NumericStatistic {
    pub const ALL: [NumericStatistic; 9] = [
        Self::Mean,
        Self::Std,
        Self::Min,
        Self::Max,
        Self::Median,
        Self::Range,
        Self::Power,
        Self::Skewness,
        Self::Kurtosis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Range => "range",
            Self::Power => "power",
            Self::Skewness => "skewness",
            Self::Kurtosis => "kurtosis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanStatistic {
    ProportionTrue,
    Count,
    Transitions,
}

impl BooleanStatistic {
    pub const ALL: [BooleanStatistic; 3] = [Self::ProportionTrue, Self::Count, Self::Transitions];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProportionTrue => "proportion_true",
            Self::Count => "count",
            Self::Transitions => "transitions",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Moments {
    mean: f64,
    std: f64,
    m2: f64,
    m3: f64,
    m4: f64,
}

impl Moments {
    fn of(data: &[f64]) -> Self {
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        for v in data {
            let d = v - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
        }
        m2 /= n;
        m3 /= n;
        m4 /= n;
        Self {
            mean,
            std: m2.sqrt(),
            m2,
            m3,
            m4,
        }
    }
}

pub fn numeric_statistics(
    channel: &str,
    values: &[f64],
    stats: &[NumericStatistic],
) -> Vec<Option<f64>> {
    let data: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let dropped = values.len() - data.len();
    if dropped > 0 {
        debug!(
            component = "stats",
            event = "stats.missing_dropped",
            channel,
            dropped
        );
    }
    if data.is_empty() {
        return vec![None; stats.len()];
    }

    let moments = Moments::of(&data);
    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    stats
        .iter()
        .map(|stat| {
            let value = match stat {
                NumericStatistic::Mean => moments.mean,
                NumericStatistic::Std => moments.std,
                NumericStatistic::Min => min,
                NumericStatistic::Max => max,
                NumericStatistic::Median => median(&data),
                NumericStatistic::Range => max - min,
                NumericStatistic::Power => {
                    if data.iter().all(|v| *v == 0.0) {
                        0.0
                    } else {
                        data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64
                    }
                }
                NumericStatistic::Skewness | NumericStatistic::Kurtosis => {
                    higher_moment(channel, *stat, &moments)
                }
            };
            Some(value)
        })
        .collect()
}

fn higher_moment(channel: &str, stat: NumericStatistic, moments: &Moments) -> f64 {
    if moments.std < MIN_STD_FOR_MOMENTS {
        return 0.0;
    }
    let value = match stat {
        NumericStatistic::Skewness => moments.m3 / moments.m2.powf(1.5),
        _ => moments.m4 / (moments.m2 * moments.m2) - 3.0,
    };
    if value.is_finite() {
        value
    } else {
        warn!(
            component = "stats",
            event = "aggregate.numeric_instability",
            channel,
            statistic = stat.as_str(),
            mean = moments.mean,
            std = moments.std
        );
        0.0
    }
}

fn median(data: &[f64]) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn boolean_statistics(
    channel: &str,
    values: &[bool],
    stats: &[BooleanStatistic],
) -> Vec<Option<f64>> {
    if values.is_empty() {
        return vec![None; stats.len()];
    }

    let n = values.len() as f64;
    stats
        .iter()
        .map(|stat| {
            let value = match stat {
                BooleanStatistic::ProportionTrue => {
                    values.iter().filter(|v| **v).count() as f64 / n
                }
                BooleanStatistic::Count => n,
                BooleanStatistic::Transitions => {
                    values.windows(2).filter(|pair| pair[0] != pair[1]).count() as f64
                }
            };
            if value.is_finite() {
                Some(value)
            } else {
                warn!(
                    component = "stats",
                    event = "aggregate.boolean_statistic_failed",
                    channel,
                    statistic = stat.as_str(),
                    samples = values.len()
                );
                None
            }
        })
        .collect()
}
