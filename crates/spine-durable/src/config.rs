//! Typed process configuration loaded from `SPINE_*` environment variables.
//!
//! Grounded on the teacher workspace's env-var configuration convention
//! (`everruns-api/src/auth/config.rs`), translated to the `SPINE_` prefix
//! spec.md §6 names. `dotenvy::dotenv().ok()` is invoked first so a local
//! `.env` file populates the same variables in development.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::errors::{ErrorCategory, SpineError};

/// `SPINE_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn from_env_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "DEBUG" => Self::Debug,
            "WARNING" | "WARN" => Self::Warning,
            "ERROR" => Self::Error,
            _ => Self::Info,
        }
    }

    /// The `tracing_subscriber::EnvFilter` default directive for this level.
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// `SPINE_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl LogFormat {
    fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Console,
        }
    }
}

/// Scheduler-related process configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval_seconds: u64,
    pub instance_id: String,
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            instance_id: format!("instance-{}", uuid::Uuid::now_v7()),
            max_concurrency: 10,
        }
    }
}

/// Worker-loop process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            max_workers: 4,
        }
    }
}

/// Per-table retention windows, in days.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub executions_days: u32,
    pub dlq_days: u32,
    pub anomalies_days: u32,
    pub quality_days: u32,
    pub work_items_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            executions_days: 90,
            dlq_days: 30,
            anomalies_days: 30,
            quality_days: 30,
            work_items_days: 90,
        }
    }
}

/// Top-level process configuration, populated from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub database_url: String,
    pub data_dir: String,
    pub feature_flags: HashMap<String, String>,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from the process environment, loading a local
    /// `.env` file first if present. Returns a `Config` error if
    /// `SPINE_DATABASE_URL` is missing and no `SPINE_DATA_DIR` default can be
    /// derived.
    pub fn from_env() -> Result<Self, SpineError> {
        dotenvy::dotenv().ok();

        let log_level = env::var("SPINE_LOG_LEVEL")
            .map(|s| LogLevel::from_env_str(&s))
            .unwrap_or_default();
        let log_format = env::var("SPINE_LOG_FORMAT")
            .map(|s| LogFormat::from_env_str(&s))
            .unwrap_or_default();
        let data_dir = env::var("SPINE_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let database_url = env::var("SPINE_DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{data_dir}/spine.db"));

        let mut feature_flags = HashMap::new();
        for (key, value) in env::vars() {
            if let Some(flag) = key.strip_prefix("SPINE_FF_") {
                feature_flags.insert(flag.to_lowercase(), value);
            }
        }

        let scheduler = SchedulerConfig {
            interval_seconds: env_parse("SPINE_SCHEDULER_INTERVAL_SECONDS", 1),
            instance_id: env::var("SPINE_SCHEDULER_INSTANCE_ID")
                .unwrap_or_else(|_| SchedulerConfig::default().instance_id),
            max_concurrency: env_parse("SPINE_SCHEDULER_MAX_CONCURRENCY", 10),
        };

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(env_parse(
                "SPINE_WORKER_POLL_INTERVAL_MS",
                1000,
            )),
            batch_size: env_parse("SPINE_WORKER_BATCH_SIZE", 10),
            max_workers: env_parse("SPINE_WORKER_MAX_WORKERS", 4),
        };

        let retention = RetentionConfig {
            executions_days: env_parse("SPINE_RETENTION_EXECUTIONS_DAYS", 90),
            dlq_days: env_parse("SPINE_RETENTION_DLQ_DAYS", 30),
            anomalies_days: env_parse("SPINE_RETENTION_ANOMALIES_DAYS", 30),
            quality_days: env_parse("SPINE_RETENTION_QUALITY_DAYS", 30),
            work_items_days: env_parse("SPINE_RETENTION_WORK_ITEMS_DAYS", 90),
        };

        if database_url.is_empty() {
            return Err(SpineError::new(
                ErrorCategory::Config,
                "SPINE_DATABASE_URL resolved to an empty string",
            ));
        }

        Ok(Self {
            log_level,
            log_format,
            database_url,
            data_dir,
            feature_flags,
            scheduler,
            worker,
            retention,
        })
    }

    /// Whether a `SPINE_FF_*` feature flag is set and truthy.
    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags
            .get(flag)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
