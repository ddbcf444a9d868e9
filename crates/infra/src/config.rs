//! Worker configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cron::{CronExpr, CronParseError};

const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("unknown strategy '{0}' (expected interval, cron or event)")]
    UnknownStrategy(String),

    #[error("{name}: {source}")]
    InvalidCron {
        name: &'static str,
        #[source]
        source: CronParseError,
    },
}

/// Which trigger drives the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Interval,
    Cron,
    Event,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Strategy::Interval),
            "cron" => Ok(Strategy::Cron),
            "event" => Ok(Strategy::Event),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Runtime settings for a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub worker_id: String,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub strategy: Strategy,
    pub poll_interval: Duration,
    pub cron: CronExpr,
    /// 0 = until the queue is empty.
    pub max_work_items: usize,
    pub retention: chrono::Duration,
    pub retention_sweep_interval: Duration,
    /// Raw `FORGEQUEUE_LOG_FORMAT` value (`json` or `pretty`).
    pub log_format: String,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or empty variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match var(name) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { name, value }),
            }
        };

        let cron_source = var("FORGEQUEUE_CRON").unwrap_or_else(|| "* * * * *".to_string());
        let cron = CronExpr::parse(&cron_source).map_err(|source| ConfigError::InvalidCron {
            name: "FORGEQUEUE_CRON",
            source,
        })?;

        let retention_days = number("FORGEQUEUE_RETENTION_DAYS", 30)?;

        Ok(Self {
            worker_id: var("FORGEQUEUE_WORKER_ID")
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7())),
            database_url: var("DATABASE_URL"),
            strategy: var("FORGEQUEUE_STRATEGY")
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
            poll_interval: Duration::from_secs(number("FORGEQUEUE_POLL_INTERVAL_SECS", 10)?),
            cron,
            max_work_items: usize::try_from(number("FORGEQUEUE_MAX_WORK_ITEMS", 0)?)
                .unwrap_or(usize::MAX),
            retention: chrono::Duration::days(retention_days.min(MAX_RETENTION_DAYS) as i64),
            retention_sweep_interval: Duration::from_secs(number("FORGEQUEUE_RETENTION_SWEEP_SECS", 3600)?),
            log_format: var("FORGEQUEUE_LOG_FORMAT").unwrap_or_else(|| "json".to_string()),
        })
    }
}
