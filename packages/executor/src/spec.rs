// ABOUTME: Pure translation of a script, its execution record and launch options into a sandbox spec
// ABOUTME: Resolves effective limits, filesystem view, security policy, environment and network policy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::scripts::Script;
use crate::security::parameter_env_name;
use crate::settings::ExecutorSettings;
use crate::storage::{ExecutionRecord, LaunchOptions};
use crate::workspace::{WorkspaceLayout, SANDBOX_LOGS, SANDBOX_OUTPUT, SANDBOX_WORKSPACE};

pub const SANDBOX_USER: &str = "65534:65534";
pub const LABEL_PREFIX: &str = "cmdb.executor";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    #[error("{resource} limit {requested} exceeds maximum {maximum}")]
    LimitExceeded {
        resource: &'static str,
        requested: String,
        maximum: String,
    },

    #[error("Invalid sandbox configuration: {0}")]
    Invalid(String),
}

/// Default limit tier picked from the script's estimated runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn from_estimate(estimated_secs: Option<u64>) -> Self {
        match estimated_secs {
            None => Self::Small,
            Some(secs) if secs <= 60 => Self::Small,
            Some(secs) if secs <= 600 => Self::Medium,
            Some(_) => Self::Large,
        }
    }

    /// (memory MB, cpu cores, disk MB)
    pub fn defaults(&self) -> (u64, f64, u64) {
        match self {
            Self::Small => (256, 0.5, 512),
            Self::Medium => (512, 1.0, 1024),
            Self::Large => (1024, 2.0, 2048),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub disk_mb: u64,
    pub pids_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: std::path::PathBuf,
    pub sandbox_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub drop_capabilities: Vec<String>,
    pub user: String,
    pub no_new_privileges: bool,
    pub read_only_root: bool,
    pub tmpfs: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            drop_capabilities: vec!["ALL".to_string()],
            user: SANDBOX_USER.to_string(),
            no_new_privileges: true,
            read_only_root: true,
            tmpfs: vec!["/tmp".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub execution_id: String,
    pub name: String,
    pub image: String,
    pub interpreter: Vec<String>,
    pub script_file: String,
    pub limits: ResourceLimits,
    pub timeout_seconds: u64,
    pub network_enabled: bool,
    pub layout: WorkspaceLayout,
    pub mounts: Vec<MountSpec>,
    pub security: SecurityPolicy,
    /// Parameters and limit hints. Mount path variables are added per runtime.
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl SandboxSpec {
    /// Full command line given where the workspace is visible to the process.
    pub fn command(&self, workspace_dir: &str) -> Vec<String> {
        let mut command = self.interpreter.clone();
        command.push(format!(
            "{}/{}",
            workspace_dir.trim_end_matches('/'),
            self.script_file
        ));
        command
    }

    /// Environment including the mount locations as seen by the process.
    pub fn env_with_paths(&self, workspace: &str, logs: &str, output: &str) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("SCRIPT_WORKSPACE".to_string(), workspace.to_string());
        env.insert("SCRIPT_LOG_DIR".to_string(), logs.to_string());
        env.insert("SCRIPT_OUTPUT_DIR".to_string(), output.to_string());
        env
    }
}

/// Label marking a sandbox as owned by this engine.
pub fn managed_label() -> String {
    format!("{}.managed", LABEL_PREFIX)
}

/// Label carrying the owning execution id.
pub fn execution_label() -> String {
    format!("{}.execution_id", LABEL_PREFIX)
}

fn check_max<T: PartialOrd + ToString>(
    resource: &'static str,
    requested: T,
    maximum: T,
) -> Result<T, SpecError> {
    if requested > maximum {
        Err(SpecError::LimitExceeded {
            resource,
            requested: requested.to_string(),
            maximum: maximum.to_string(),
        })
    } else {
        Ok(requested)
    }
}

/// Effective timeout: request, else script maximum, else the settings default.
/// Requests may not exceed the script maximum or the policy maximum.
pub fn resolve_timeout(
    script: &Script,
    options: &LaunchOptions,
    settings: &ExecutorSettings,
) -> Result<u64, SpecError> {
    let policy_max = settings.max_execution_time_secs;
    let timeout = match options.timeout_seconds {
        Some(0) => return Err(SpecError::Invalid("timeout must be positive".to_string())),
        Some(requested) => {
            if let Some(script_max) = script.max_execution_time_secs {
                check_max("timeout_seconds", requested, script_max)?;
            }
            check_max("timeout_seconds", requested, policy_max)?
        }
        None => script
            .max_execution_time_secs
            .unwrap_or(settings.default_timeout_secs)
            .min(policy_max),
    };
    Ok(timeout.max(1))
}

pub fn resolve_limits(
    script: &Script,
    options: &LaunchOptions,
    settings: &ExecutorSettings,
) -> Result<ResourceLimits, SpecError> {
    let (memory_default, cpu_default, disk_default) =
        SizeCategory::from_estimate(script.estimated_execution_secs).defaults();
    let requested = &options.limits;
    let defaults = &script.default_limits;

    let memory_mb = requested
        .memory_mb
        .or(defaults.memory_mb)
        .unwrap_or(memory_default);
    let cpu_cores = requested
        .cpu_cores
        .or(defaults.cpu_cores)
        .unwrap_or(cpu_default);
    let disk_mb = requested.disk_mb.or(defaults.disk_mb).unwrap_or(disk_default);

    if memory_mb == 0 || disk_mb == 0 || !(cpu_cores > 0.0) {
        return Err(SpecError::Invalid(
            "resource limits must be positive".to_string(),
        ));
    }

    Ok(ResourceLimits {
        memory_mb: check_max("memory_mb", memory_mb, settings.max_memory_mb)?,
        cpu_cores: check_max("cpu_cores", cpu_cores, settings.max_cpu_cores)?,
        disk_mb: check_max("disk_mb", disk_mb, settings.max_disk_mb)?,
        pids_limit: settings.max_processes,
    })
}

/// Build the launch specification for one execution. Performs no I/O.
pub fn build_spec(
    script: &Script,
    record: &ExecutionRecord,
    options: &LaunchOptions,
    settings: &ExecutorSettings,
) -> Result<SandboxSpec, SpecError> {
    if record.id.is_empty() {
        return Err(SpecError::Invalid("execution id is required".to_string()));
    }

    let limits = resolve_limits(script, options, settings)?;
    let timeout_seconds = resolve_timeout(script, options, settings)?;
    let layout = WorkspaceLayout::for_execution(settings, &record.id);

    let mounts = vec![
        MountSpec {
            host_path: layout.workspace_dir.clone(),
            sandbox_path: SANDBOX_WORKSPACE.to_string(),
            read_only: false,
        },
        MountSpec {
            host_path: layout.logs_dir.clone(),
            sandbox_path: SANDBOX_LOGS.to_string(),
            read_only: false,
        },
        MountSpec {
            host_path: layout.output_dir.clone(),
            sandbox_path: SANDBOX_OUTPUT.to_string(),
            read_only: false,
        },
    ];

    let mut env: BTreeMap<String, String> = record
        .parameters
        .iter()
        .map(|(key, value)| (parameter_env_name(key), value.clone()))
        .collect();
    env.insert("EXECUTION_ID".to_string(), record.id.clone());
    env.insert("SCRIPT_TIMEOUT".to_string(), timeout_seconds.to_string());
    env.insert(
        "SCRIPT_MEMORY_LIMIT_MB".to_string(),
        limits.memory_mb.to_string(),
    );
    env.insert("SCRIPT_CPU_LIMIT".to_string(), limits.cpu_cores.to_string());

    let labels = BTreeMap::from([
        (managed_label(), "true".to_string()),
        (execution_label(), record.id.clone()),
        (format!("{}.script_id", LABEL_PREFIX), script.id.clone()),
    ]);

    Ok(SandboxSpec {
        execution_id: record.id.clone(),
        name: format!("cmdb-exec-{}", record.id),
        image: settings.images.for_language(script.language).to_string(),
        interpreter: script
            .language
            .interpreter()
            .iter()
            .map(|s| s.to_string())
            .collect(),
        script_file: format!("script.{}", script.language.extension()),
        limits,
        timeout_seconds,
        network_enabled: options.network_enabled,
        layout,
        mounts,
        security: SecurityPolicy::default(),
        env,
        labels,
    })
}
