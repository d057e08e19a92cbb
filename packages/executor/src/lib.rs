// ABOUTME: Sandboxed script execution engine with persistent lifecycle tracking
// ABOUTME: Admits script runs, launches them in isolated sandboxes and records every outcome

pub mod alerts;
pub mod events;
pub mod launcher;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod scripts;
pub mod security;
pub mod settings;
pub mod spec;
pub mod storage;
pub mod supervisor;
pub mod workspace;

pub use alerts::{collect_metrics, Alert, AlertMonitor, AlertSink, ExecutionMetrics, TracingAlertSink};
pub use events::{EventHub, ExecutionEvent};
pub use registry::{RunningExecution, RuntimeRegistry};
pub use runtime::{DockerRuntime, ProcessRuntime, RuntimeError, SandboxRuntime};
pub use scheduler::{
    ExecutionLogs, ExecutionScheduler, ExecutorError, ReconcileReport, SubmitOptions,
};
pub use scripts::{InMemoryScriptRegistry, Script, ScriptLanguage, ScriptRegistry};
pub use settings::{ExecutorSettings, RuntimeKind};
pub use spec::{build_spec, SandboxSpec, SpecError};
pub use storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, ExecutionView, LaunchOptions, Priority,
    ResourceLimitOverrides, ResourceUsage, SqliteExecutionStore, StorageError,
};

use std::sync::Arc;

/// Runtime selected by `settings.runtime`.
pub fn runtime_from_settings(
    settings: &ExecutorSettings,
) -> Result<Arc<dyn SandboxRuntime>, RuntimeError> {
    Ok(match settings.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::with_pull_timeout(
            settings.image_pull_timeout,
        )?),
        RuntimeKind::Process => Arc::new(ProcessRuntime::new()),
    })
}
