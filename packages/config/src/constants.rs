// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used by the executor

// Storage
pub const CMDB_EXECUTOR_DATABASE_URL: &str = "CMDB_EXECUTOR_DATABASE_URL";
pub const CMDB_EXECUTOR_BASE_DIR: &str = "CMDB_EXECUTOR_BASE_DIR";

// Runtime Selection
pub const CMDB_EXECUTOR_RUNTIME: &str = "CMDB_EXECUTOR_RUNTIME"; // "docker" or "process"
pub const CMDB_EXECUTOR_IMAGE_PULL_TIMEOUT_SECS: &str = "CMDB_EXECUTOR_IMAGE_PULL_TIMEOUT_SECS";
pub const CMDB_EXECUTOR_IMAGE_PYTHON: &str = "CMDB_EXECUTOR_IMAGE_PYTHON";
pub const CMDB_EXECUTOR_IMAGE_BASH: &str = "CMDB_EXECUTOR_IMAGE_BASH";
pub const CMDB_EXECUTOR_IMAGE_NODE: &str = "CMDB_EXECUTOR_IMAGE_NODE";
pub const CMDB_EXECUTOR_IMAGE_POWERSHELL: &str = "CMDB_EXECUTOR_IMAGE_POWERSHELL";

// Admission Control
pub const CMDB_MAX_CONCURRENT_EXECUTIONS: &str = "CMDB_MAX_CONCURRENT_EXECUTIONS";

// Resource Policy Maxima
pub const CMDB_MAX_MEMORY_MB: &str = "CMDB_MAX_MEMORY_MB";
pub const CMDB_MAX_CPU_CORES: &str = "CMDB_MAX_CPU_CORES";
pub const CMDB_MAX_DISK_MB: &str = "CMDB_MAX_DISK_MB";
pub const CMDB_MAX_EXECUTION_TIME_SECS: &str = "CMDB_MAX_EXECUTION_TIME_SECS";
pub const CMDB_DEFAULT_TIMEOUT_SECS: &str = "CMDB_DEFAULT_TIMEOUT_SECS";
pub const CMDB_MAX_PROCESSES: &str = "CMDB_MAX_PROCESSES";
pub const CMDB_DEFAULT_MAX_RETRIES: &str = "CMDB_DEFAULT_MAX_RETRIES";

// Lifecycle
pub const CMDB_RESOURCE_POLL_INTERVAL_SECS: &str = "CMDB_RESOURCE_POLL_INTERVAL_SECS";
pub const CMDB_RESOURCE_POLL_TIMEOUT_SECS: &str = "CMDB_RESOURCE_POLL_TIMEOUT_SECS";
pub const CMDB_REAPER_INTERVAL_SECS: &str = "CMDB_REAPER_INTERVAL_SECS";
pub const CMDB_STALE_EXECUTION_HOURS: &str = "CMDB_STALE_EXECUTION_HOURS";
pub const CMDB_TIMEOUT_GRACE_SECS: &str = "CMDB_TIMEOUT_GRACE_SECS";
pub const CMDB_LOG_BUFFER_BYTES: &str = "CMDB_LOG_BUFFER_BYTES";
pub const CMDB_OUTPUT_PROJECTION_BYTES: &str = "CMDB_OUTPUT_PROJECTION_BYTES";

// Alerting
pub const CMDB_ALERT_INTERVAL_SECS: &str = "CMDB_ALERT_INTERVAL_SECS";
pub const CMDB_ALERT_LONG_RUNNING_HOURS: &str = "CMDB_ALERT_LONG_RUNNING_HOURS";
pub const CMDB_ALERT_FAILURE_RATE: &str = "CMDB_ALERT_FAILURE_RATE";
pub const CMDB_ALERT_FAILURE_MIN_SAMPLES: &str = "CMDB_ALERT_FAILURE_MIN_SAMPLES";

// System Environment Variables
pub const HOME: &str = "HOME";
pub const RUST_LOG: &str = "RUST_LOG";
