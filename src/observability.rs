//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AggregationConfig;
use crate::subject::{SubjectReport, SubjectStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("CANLOG_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("CANLOG_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("CANLOG_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_run_start(cfg: &AggregationConfig) {
    info!(
        component = "batch",
        event = "run.start",
        data_root = %cfg.data_root.display(),
        output_dir = %cfg.output_dir.display(),
        frequency = cfg.frequency,
        window_size_sec = cfg.window_size_sec,
        shift_sec = cfg.shift_sec,
        parallelism = cfg.parallelism,
        reuse_cached = cfg.reuse_cached,
        subjects = ?cfg.subjects
    );
}

pub fn log_subject_status(report: &SubjectReport) {
    match &report.status {
        SubjectStatus::Completed { source, rows } => info!(
            component = "subject",
            event = "subject.completed",
            subject = report.subject,
            source = ?source,
            rows = *rows
        ),
        SubjectStatus::NoData(reason) => warn!(
            component = "subject",
            event = "subject.no_data",
            subject = report.subject,
            reason = ?reason
        ),
        SubjectStatus::Failed { message } => error!(
            component = "subject",
            event = "subject.failed",
            subject = report.subject,
            error = %message
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
