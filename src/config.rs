//! Aggregation run configuration.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::observability::parse_bool;
use crate::stats::{BooleanStatistic, NumericStatistic};

pub const AGGREGATION_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_TIMEZONE: &str = "Europe/Zurich";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub source: String,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeChain {
    pub source: String,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub data_root: PathBuf,
    pub output_dir: PathBuf,
    pub raw_events_dir: PathBuf,
    pub raw_events_suffix: String,
    pub annotation_file: PathBuf,
    pub subject_output_dir: PathBuf,
    pub frequency: u32,
    pub window_size_sec: u32,
    pub shift_sec: u32,
    // None discovers every drive_<id> directory under data_root.
    pub subjects: Option<Vec<u32>>,
    pub selected_phases: Vec<i64>,
    pub reuse_cached: bool,
    pub parallelism: usize,
    pub parallel_windows: bool,
    pub timezone: String,
    // Milliseconds; None is unbounded.
    pub fill_limits: BTreeMap<String, Option<u64>>,
    pub important_channels: Vec<String>,
    pub channel_map: Vec<ChannelMapping>,
    pub derivative_chains: Vec<DerivativeChain>,
    pub numeric_statistics: Vec<NumericStatistic>,
    pub boolean_statistics: Vec<BooleanStatistic>,
}

const BUS_CHANNELS: [(&str, &str, u64); 8] = [
    ("VehicleSpeed", "vehicle+velocity+", 1_000),
    ("SteeringWheelAngle", "driver+steer+angle", 1_000),
    ("SteeringWheelAngularVelocity", "driver+steer+velocity", 1_000),
    ("BrakingPressure", "driver+brake+pressure", 1_000),
    ("PedalForce", "driver+gas+position", 1_000),
    ("LongitudinalAcceleration", "vehicle+long+acceleration", 500),
    ("LateralAcceleration", "vehicle+lat+acceleration", 500),
    ("YawVelocity", "vehicle+velocity+yaw", 500),
];

const IMPORTANT_CHANNELS: [&str; 7] = [
    "VehicleSpeed",
    "SteeringWheelAngle",
    "SteeringWheelAngularVelocity",
    "BrakingPressure",
    "PedalForce",
    "LongitudinalAcceleration",
    "LateralAcceleration",
];

const DERIVATIVE_CHAINS: [(&str, &[&str]); 7] = [
    ("vehicle+velocity+", &["vehicle+acceleration+", "vehicle+jerk+"]),
    (
        "driver+steer+velocity",
        &["driver+steer+acceleration", "driver+steer+jerk"],
    ),
    (
        "driver+brake+pressure",
        &[
            "driver+brake+velocity",
            "driver+brake+acceleration",
            "driver+brake+jerk",
        ],
    ),
    (
        "driver+gas+position",
        &[
            "driver+gas+velocity",
            "driver+gas+acceleration",
            "driver+gas+jerk",
        ],
    ),
    ("vehicle+lat+acceleration", &["vehicle+lat+jerk"]),
    ("vehicle+long+acceleration", &["vehicle+long+jerk"]),
    (
        "vehicle+velocity+yaw",
        &["vehicle+acceleration+yaw", "vehicle+jerk+yaw"],
    ),
];

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            output_dir: PathBuf::from("data/aggregated"),
            raw_events_dir: PathBuf::from("study_day/canlogger"),
            raw_events_suffix: "_can.csv".to_string(),
            annotation_file: PathBuf::from("study_day/phases.csv"),
            subject_output_dir: PathBuf::from("canlogger"),
            frequency: 50,
            window_size_sec: 5,
            shift_sec: 1,
            subjects: None,
            selected_phases: vec![1, 2, 3],
            reuse_cached: false,
            parallelism: 4,
            parallel_windows: false,
            timezone: DEFAULT_TIMEZONE.to_string(),
            fill_limits: BUS_CHANNELS
                .iter()
                .map(|(source, _, limit)| ((*source).to_string(), Some(*limit)))
                .collect(),
            important_channels: IMPORTANT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            channel_map: BUS_CHANNELS
                .iter()
                .map(|(source, feature, _)| ChannelMapping {
                    source: (*source).to_string(),
                    feature: (*feature).to_string(),
                })
                .collect(),
            derivative_chains: DERIVATIVE_CHAINS
                .iter()
                .map(|(source, outputs)| DerivativeChain {
                    source: (*source).to_string(),
                    outputs: outputs.iter().map(|o| o.to_string()).collect(),
                })
                .collect(),
            numeric_statistics: NumericStatistic::ALL.to_vec(),
            boolean_statistics: BooleanStatistic::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid aggregation config: {0}")]
    Invalid(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl AggregationConfig {
    pub fn step_ms(&self) -> i64 {
        1_000 / i64::from(self.frequency.max(1))
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn subject_dir(&self, subject: u32) -> PathBuf {
        self.data_root.join(format!("drive_{subject}"))
    }

    pub fn subject_output_dir(&self, subject: u32) -> PathBuf {
        self.subject_dir(subject).join(&self.subject_output_dir)
    }

    pub fn series_file_name(&self) -> String {
        format!("can-all_freq-{:03}.csv", self.frequency)
    }

    pub fn aggregated_file_name(&self) -> String {
        format!(
            "aggregated_{:03}_freq-{:03}.csv",
            self.window_size_sec, self.frequency
        )
    }

    pub fn subject_series_path(&self, subject: u32) -> PathBuf {
        self.subject_output_dir(subject)
            .join(self.series_file_name())
    }

    pub fn subject_aggregated_path(&self, subject: u32) -> PathBuf {
        self.subject_output_dir(subject)
            .join(self.aggregated_file_name())
    }

    pub fn merged_aggregated_path(&self) -> PathBuf {
        self.output_dir.join(self.aggregated_file_name())
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("version:{AGGREGATION_SCHEMA_VERSION};"));
        hasher.update(format!(
            "frequency:{};window:{};shift:{};",
            self.frequency, self.window_size_sec, self.shift_sec
        ));
        hasher.update("fill:");
        for (channel, limit) in &self.fill_limits {
            hasher.update(format!("{channel}={limit:?},"));
        }
        hasher.update(";important:");
        for channel in &self.important_channels {
            hasher.update(format!("{channel},"));
        }
        hasher.update(";map:");
        for mapping in &self.channel_map {
            hasher.update(format!("{}>{},", mapping.source, mapping.feature));
        }
        hasher.update(";chains:");
        for chain in &self.derivative_chains {
            hasher.update(format!("{}>{},", chain.source, chain.outputs.join(">")));
        }
        hasher.update(";numeric:");
        for stat in &self.numeric_statistics {
            hasher.update(format!("{},", stat.as_str()));
        }
        hasher.update(";boolean:");
        for stat in &self.boolean_statistics {
            hasher.update(format!("{},", stat.as_str()));
        }
        hex::encode(hasher.finalize())
    }
}

pub fn validate_config(cfg: &AggregationConfig) -> Result<(), ConfigError> {
    if cfg.frequency == 0 {
        return Err(ConfigError::Invalid("frequency must be > 0".to_string()));
    }
    if 1_000 % cfg.frequency != 0 {
        return Err(ConfigError::Invalid(format!(
            "frequency {} Hz does not divide 1000ms into a whole-millisecond grid step",
            cfg.frequency
        )));
    }
    if cfg.window_size_sec == 0 {
        return Err(ConfigError::Invalid(
            "window_size_sec must be > 0".to_string(),
        ));
    }
    if cfg.shift_sec == 0 {
        return Err(ConfigError::Invalid("shift_sec must be > 0".to_string()));
    }
    if cfg.parallelism == 0 {
        return Err(ConfigError::Invalid("parallelism must be > 0".to_string()));
    }
    for chain in &cfg.derivative_chains {
        if chain.outputs.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "derivative chain for '{}' has no outputs",
                chain.source
            )));
        }
    }
    cfg.tz()?;
    Ok(())
}

pub fn load_config(path: &Path) -> Result<AggregationConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn config_from_env() -> Result<AggregationConfig, ConfigError> {
    let mut config = match env::var("CANLOG_CONFIG") {
        Ok(path) if !path.trim().is_empty() => load_config(Path::new(path.trim()))?,
        _ => AggregationConfig::default(),
    };

    if let Ok(root) = env::var("CANLOG_DATA_ROOT") {
        if !root.trim().is_empty() {
            config.data_root = PathBuf::from(root.trim());
        }
    }

    if let Ok(dir) = env::var("CANLOG_OUTPUT_DIR") {
        if !dir.trim().is_empty() {
            config.output_dir = PathBuf::from(dir.trim());
        }
    }

    if let Ok(raw) = env::var("CANLOG_PARALLELISM") {
        if let Ok(parsed) = raw.trim().parse::<usize>() {
            config.parallelism = parsed;
        }
    }

    if let Ok(raw) = env::var("CANLOG_REUSE_CACHED") {
        if let Some(parsed) = parse_bool(&raw) {
            config.reuse_cached = parsed;
        }
    }

    if let Ok(raw) = env::var("CANLOG_SUBJECTS") {
        if let Some(parsed) = parse_subjects(&raw) {
            config.subjects = parsed;
        }
    }

    Ok(config)
}

fn parse_subjects(raw: &str) -> Option<Option<Vec<u32>>> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("auto") {
        return Some(None);
    }
    let ids: Result<Vec<u32>, _> = trimmed
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse::<u32>)
        .collect();
    match ids {
        Ok(ids) if !ids.is_empty() => Some(Some(ids)),
        _ => None,
    }
}
