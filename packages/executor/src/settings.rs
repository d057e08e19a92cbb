// ABOUTME: Executor settings with defaults and environment overrides
// ABOUTME: Covers admission capacity, resource policy maxima, lifecycle intervals and alert thresholds

use cmdb_config::constants::*;
use cmdb_config::{env_nonzero, env_or, env_string};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::scripts::ScriptLanguage;

/// Shortest period any background loop ticks at.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(10);

/// Period for a `tokio::time::interval`, which panics on zero.
pub fn tick_period(period: Duration) -> Duration {
    period.max(MIN_TICK_PERIOD)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Process,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" | "local" => Ok(Self::Process),
            other => Err(format!("unknown runtime: {}", other)),
        }
    }
}

/// Container image per language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageImages {
    pub python: String,
    pub bash: String,
    pub node: String,
    pub powershell: String,
}

impl Default for LanguageImages {
    fn default() -> Self {
        Self {
            python: "python:3.11-slim".to_string(),
            bash: "bash:5.2".to_string(),
            node: "node:20-slim".to_string(),
            powershell: "mcr.microsoft.com/powershell:lts-debian-12".to_string(),
        }
    }
}

impl LanguageImages {
    pub fn for_language(&self, language: ScriptLanguage) -> &str {
        match language {
            ScriptLanguage::Python => &self.python,
            ScriptLanguage::Bash => &self.bash,
            ScriptLanguage::Node => &self.node,
            ScriptLanguage::PowerShell => &self.powershell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSettings {
    pub database_url: String,
    pub base_dir: PathBuf,
    pub runtime: RuntimeKind,
    pub images: LanguageImages,
    pub image_pull_timeout: Duration,

    // Admission control
    pub max_concurrent_executions: usize,

    // Resource policy maxima
    pub max_memory_mb: u64,
    pub max_cpu_cores: f64,
    pub max_disk_mb: u64,
    pub max_execution_time_secs: u64,
    pub default_timeout_secs: u64,
    pub max_processes: u64,
    pub default_max_retries: u32,

    // Lifecycle
    pub resource_poll_interval: Duration,
    pub resource_poll_timeout: Duration,
    pub reaper_interval: Duration,
    pub stale_execution_threshold: Duration,
    pub timeout_grace: Duration,
    pub log_buffer_bytes: usize,
    pub output_projection_bytes: usize,

    // Alerting
    pub alert_interval: Duration,
    pub long_running_threshold: Duration,
    pub failure_rate_threshold: f64,
    pub failure_rate_min_samples: i64,
}

fn default_base_dir() -> PathBuf {
    env_string(HOME)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".cmdb-executor")
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let base_dir = default_base_dir();
        Self {
            database_url: format!("sqlite://{}", base_dir.join("executions.db").display()),
            base_dir,
            runtime: RuntimeKind::Docker,
            images: LanguageImages::default(),
            image_pull_timeout: Duration::from_secs(600),
            max_concurrent_executions: 10,
            max_memory_mb: 4096,
            max_cpu_cores: 4.0,
            max_disk_mb: 10240,
            max_execution_time_secs: 3600,
            default_timeout_secs: 300,
            max_processes: 64,
            default_max_retries: 3,
            resource_poll_interval: Duration::from_secs(5),
            resource_poll_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(60),
            stale_execution_threshold: Duration::from_secs(4 * 3600),
            timeout_grace: Duration::from_secs(30),
            log_buffer_bytes: 10 * 1024 * 1024,
            output_projection_bytes: 64 * 1024,
            alert_interval: Duration::from_secs(300),
            long_running_threshold: Duration::from_secs(2 * 3600),
            failure_rate_threshold: 0.5,
            failure_rate_min_samples: 5,
        }
    }
}

impl ExecutorSettings {
    /// Defaults overridden by any `CMDB_*` environment variables that are set.
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |name: &str, default: Duration| {
            Duration::from_secs(env_or(name, default.as_secs()))
        };
        let period = |name: &str, default: Duration| {
            Duration::from_secs(env_nonzero(name, default.as_secs()))
        };

        let base_dir = env_string(CMDB_EXECUTOR_BASE_DIR)
            .map(PathBuf::from)
            .unwrap_or(d.base_dir);
        let database_url = env_string(CMDB_EXECUTOR_DATABASE_URL).unwrap_or_else(|| {
            format!("sqlite://{}", base_dir.join("executions.db").display())
        });

        let runtime = match env_string(CMDB_EXECUTOR_RUNTIME) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}; using {:?}", e, d.runtime);
                d.runtime
            }),
            None => d.runtime,
        };

        let images = LanguageImages {
            python: env_string(CMDB_EXECUTOR_IMAGE_PYTHON).unwrap_or(d.images.python),
            bash: env_string(CMDB_EXECUTOR_IMAGE_BASH).unwrap_or(d.images.bash),
            node: env_string(CMDB_EXECUTOR_IMAGE_NODE).unwrap_or(d.images.node),
            powershell: env_string(CMDB_EXECUTOR_IMAGE_POWERSHELL)
                .unwrap_or(d.images.powershell),
        };

        let stale_hours: u64 = env_or(
            CMDB_STALE_EXECUTION_HOURS,
            d.stale_execution_threshold.as_secs() / 3600,
        );
        let long_running_hours: u64 = env_or(
            CMDB_ALERT_LONG_RUNNING_HOURS,
            d.long_running_threshold.as_secs() / 3600,
        );

        Self {
            database_url,
            base_dir,
            runtime,
            images,
            image_pull_timeout: secs(CMDB_EXECUTOR_IMAGE_PULL_TIMEOUT_SECS, d.image_pull_timeout),
            max_concurrent_executions: env_or(
                CMDB_MAX_CONCURRENT_EXECUTIONS,
                d.max_concurrent_executions,
            ),
            max_memory_mb: env_or(CMDB_MAX_MEMORY_MB, d.max_memory_mb),
            max_cpu_cores: env_or(CMDB_MAX_CPU_CORES, d.max_cpu_cores),
            max_disk_mb: env_or(CMDB_MAX_DISK_MB, d.max_disk_mb),
            max_execution_time_secs: env_or(
                CMDB_MAX_EXECUTION_TIME_SECS,
                d.max_execution_time_secs,
            ),
            default_timeout_secs: env_or(CMDB_DEFAULT_TIMEOUT_SECS, d.default_timeout_secs),
            max_processes: env_or(CMDB_MAX_PROCESSES, d.max_processes),
            default_max_retries: env_or(CMDB_DEFAULT_MAX_RETRIES, d.default_max_retries),
            resource_poll_interval: period(CMDB_RESOURCE_POLL_INTERVAL_SECS, d.resource_poll_interval),
            resource_poll_timeout: secs(CMDB_RESOURCE_POLL_TIMEOUT_SECS, d.resource_poll_timeout),
            reaper_interval: period(CMDB_REAPER_INTERVAL_SECS, d.reaper_interval),
            stale_execution_threshold: Duration::from_secs(stale_hours * 3600),
            timeout_grace: secs(CMDB_TIMEOUT_GRACE_SECS, d.timeout_grace),
            log_buffer_bytes: env_or(CMDB_LOG_BUFFER_BYTES, d.log_buffer_bytes),
            output_projection_bytes: env_or(
                CMDB_OUTPUT_PROJECTION_BYTES,
                d.output_projection_bytes,
            ),
            alert_interval: period(CMDB_ALERT_INTERVAL_SECS, d.alert_interval),
            long_running_threshold: Duration::from_secs(long_running_hours * 3600),
            failure_rate_threshold: env_or(CMDB_ALERT_FAILURE_RATE, d.failure_rate_threshold),
            failure_rate_min_samples: env_or(
                CMDB_ALERT_FAILURE_MIN_SAMPLES,
                d.failure_rate_min_samples,
            ),
        }
    }

    /// Directory holding per-execution workspaces.
    pub fn executions_dir(&self) -> PathBuf {
        self.base_dir.join("executions")
    }

    /// Directory holding collected artifacts, kept after workspace cleanup.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }
}
