use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_TIME_ZONE: &str = "UTC";
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WORKER_THREADS: usize = 16;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3_600;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// What to do with executions that were still running when the previous
/// process died.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanPolicy {
    /// Finish them as failed so their schedules become admissible again.
    #[default]
    MarkFailed,
    /// Keep them registered as running; an operator has to finish the rows.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone used for day/week/month interval arithmetic.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Maximum number of concurrently running executions.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    /// Captured task output beyond this many characters is truncated in the middle.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            tick_interval_secs: default_tick_interval(),
            worker_threads: default_worker_threads(),
            orphan_policy: OrphanPolicy::default(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl SchedulerConfig {
    /// Parse `time_zone` into a `chrono_tz::Tz`.
    pub fn zone(&self) -> Result<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|_| CadenceError::TimeZone(self.time_zone.clone()))
    }

    /// Pool capacity, never zero.
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Per-task wall-clock limit; 0 disables the limit.
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            timeout_secs: default_task_timeout(),
        }
    }
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}
fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_shell() -> String {
    "sh".to_string()
}
fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CADENCE_SCHEDULER__TIME_ZONE=Europe/Berlin`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(%path, zone = %config.scheduler.time_zone, "configuration loaded");
        Ok(config)
    }

    /// Reject values that parse but cannot drive the engine.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.zone()?;
        if self.scheduler.tick_interval_secs == 0 {
            return Err(CadenceError::Config(
                "scheduler.tick_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.runner.shell.trim().is_empty() {
            return Err(CadenceError::Config("runner.shell must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
