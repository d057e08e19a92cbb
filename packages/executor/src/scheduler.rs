// ABOUTME: Front door of the engine: admission control, launch orchestration, cancel and retry
// ABOUTME: Also runs the reaper that enforces deadlines and reconciles orphans at startup

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventHub, ExecutionEvent};
use crate::launcher::SandboxLauncher;
use crate::monitor::ResourceMonitor;
use crate::registry::{ExpiryReason, RunningExecution, RuntimeRegistry};
use crate::runtime::{RuntimeError, SandboxRuntime};
use crate::scripts::{RegistryError, ScriptRegistry};
use crate::security::{sanitize_parameters, scan_content, verify_content_hash, SecurityError};
use crate::settings::{tick_period, ExecutorSettings};
use crate::spec::{build_spec, SandboxSpec, SpecError};
use crate::storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, ExecutionView, Finalization, LaunchOptions,
    Priority, ResourceUsage, StorageError,
};
use crate::supervisor::{commit_terminal, LogBuffer, Supervisor};
use crate::workspace::WorkspaceLayout;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Concurrency limit reached: {running} of {limit} executions in flight")]
    ResourceExhausted { running: usize, limit: usize },

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution {0} is not running")]
    NotRunning(String),

    #[error("Retry not allowed: {0}")]
    RetryNotAllowed(String),

    #[error("Script registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<SecurityError> for ExecutorError {
    fn from(err: SecurityError) -> Self {
        if err.is_parameter_error() {
            Self::Validation(err.to_string())
        } else {
            Self::SecurityViolation(err.to_string())
        }
    }
}

impl From<SpecError> for ExecutorError {
    fn from(err: SpecError) -> Self {
        match err {
            SpecError::LimitExceeded { .. } => Self::ResourceLimitExceeded(err.to_string()),
            SpecError::Invalid(message) => Self::Validation(message),
        }
    }
}

/// Caller options for one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub parameters: BTreeMap<String, String>,
    pub launch: LaunchOptions,
    /// Falls back to the script's setting, then the engine default.
    pub max_retries: Option<u32>,
    pub metadata: Option<JsonValue>,
}

fn new_execution_id() -> String {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

/// Position of a new record in a retry chain.
struct Lineage {
    execution_id: String,
    retry_count: u32,
    retry_reason: Option<String>,
    parent_execution_id: String,
}

/// Output of an execution: the live buffer while it runs, the stored copy after.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionLogs {
    pub execution_id: String,
    pub live: bool,
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconcileReport {
    /// Non-terminal records with no live handle, now KILLED.
    pub orphaned_executions: Vec<String>,
    /// Managed sandboxes removed because nothing owns them.
    pub removed_sandboxes: Vec<String>,
}

struct SchedulerInner {
    settings: ExecutorSettings,
    store: Arc<dyn ExecutionStore>,
    scripts: Arc<dyn ScriptRegistry>,
    runtime: Arc<dyn SandboxRuntime>,
    registry: Arc<RuntimeRegistry>,
    events: Arc<EventHub>,
    launcher: SandboxLauncher,
    supervisor: Supervisor,
    monitor: ResourceMonitor,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<SchedulerInner>,
}

impl ExecutionScheduler {
    pub fn new(
        settings: ExecutorSettings,
        store: Arc<dyn ExecutionStore>,
        scripts: Arc<dyn ScriptRegistry>,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Self {
        let events = Arc::new(EventHub::default());
        let registry = Arc::new(RuntimeRegistry::new(
            settings.max_concurrent_executions,
            settings.log_buffer_bytes,
        ));
        let launcher = SandboxLauncher::new(runtime.clone(), store.clone(), events.clone());
        let supervisor = Supervisor::new(
            store.clone(),
            runtime.clone(),
            registry.clone(),
            events.clone(),
        );
        let monitor = ResourceMonitor::new(
            runtime.clone(),
            store.clone(),
            events.clone(),
            settings.resource_poll_interval,
            settings.resource_poll_timeout,
        );

        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                store,
                scripts,
                runtime,
                registry,
                events,
                launcher,
                supervisor,
                monitor,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.inner.registry
    }

    /// Validate and admit a script run. Returns the new execution id; the
    /// sandbox is started in the background.
    #[instrument(skip(self, options))]
    pub async fn submit(
        &self,
        script_id: &str,
        executor_id: &str,
        options: SubmitOptions,
    ) -> Result<String> {
        let record = self.submit_record(script_id, executor_id, options, None).await?;
        Ok(record.id)
    }

    async fn submit_record(
        &self,
        script_id: &str,
        executor_id: &str,
        options: SubmitOptions,
        lineage: Option<Lineage>,
    ) -> Result<ExecutionRecord> {
        let inner = &self.inner;
        let capacity = inner.registry.capacity();

        // Cheap early rejection; the reservation below re-checks atomically.
        let running = inner.registry.len().await;
        if running >= capacity {
            return Err(ExecutorError::ResourceExhausted {
                running,
                limit: capacity,
            });
        }

        let script = inner
            .scripts
            .get_script(script_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("script {}", script_id)))?;
        if !script.is_active || !script.is_executable {
            return Err(ExecutorError::Validation(format!(
                "script {} is not active and executable",
                script_id
            )));
        }

        let parameters = sanitize_parameters(&options.parameters)?;
        scan_content(&script.content)?;
        verify_content_hash(&script)?;

        let max_retries = options
            .max_retries
            .or(script.max_retries)
            .unwrap_or(inner.settings.default_max_retries);
        let (id, retry_count, retry_reason, parent_execution_id) = match lineage {
            Some(lineage) => (
                lineage.execution_id,
                lineage.retry_count,
                lineage.retry_reason,
                Some(lineage.parent_execution_id),
            ),
            None => (new_execution_id(), 0, None, None),
        };

        let mut record = ExecutionRecord {
            id,
            script_id: script.id.clone(),
            script_name: script.name.clone(),
            language: script.language,
            executor_id: executor_id.to_string(),
            priority: options.priority,
            status: ExecutionStatus::Pending,
            parameters,
            options: options.launch,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            timeout_seconds: 0,
            sandbox_id: None,
            process_id: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            logs: None,
            error_message: None,
            resource_usage: ResourceUsage::default(),
            artifacts: Vec::new(),
            retry_count,
            max_retries,
            retry_reason,
            parent_execution_id,
            child_execution_ids: Vec::new(),
            metadata: options.metadata,
        };

        let spec = build_spec(&script, &record, &record.options, &inner.settings)?;
        record.timeout_seconds = spec.timeout_seconds;

        let buffer = inner
            .registry
            .reserve(&record.id, &record.script_id, spec.timeout_seconds)
            .await
            .map_err(|running| ExecutorError::ResourceExhausted {
                running,
                limit: capacity,
            })?;

        let record = match inner.store.create_execution(record).await {
            Ok(record) => record,
            Err(e) => {
                inner.registry.remove(&spec.execution_id).await;
                return Err(e.into());
            }
        };
        info!(
            "Admitted execution {} of script {} (timeout {}s)",
            record.id, record.script_id, record.timeout_seconds
        );

        let scheduler = self.clone();
        let content = script.content;
        tokio::spawn(async move {
            scheduler.run_execution(spec, content, buffer).await;
        });

        Ok(record)
    }

    /// Launch, attach and supervise one admitted execution.
    async fn run_execution(&self, spec: SandboxSpec, content: String, buffer: Arc<LogBuffer>) {
        let inner = &self.inner;
        let execution_id = spec.execution_id.clone();

        let launched = match inner.launcher.launch(&spec, &content).await {
            Ok(launched) => launched,
            Err(_) => {
                // The launcher already recorded the failure.
                inner.registry.remove(&execution_id).await;
                inner.events.close(&execution_id);
                return;
            }
        };

        let started_at = Utc::now();
        if !inner
            .registry
            .attach(&execution_id, &launched.sandbox_id, launched.pid, started_at)
            .await
        {
            info!(
                "Execution {} was terminated during launch; discarding sandbox {}",
                execution_id, launched.sandbox_id
            );
            if let Err(e) = inner.runtime.kill(&launched.sandbox_id).await {
                warn!("Failed to kill sandbox {}: {}", launched.sandbox_id, e);
            }
            if let Err(e) = inner.runtime.remove(&launched.sandbox_id).await {
                warn!("Failed to remove sandbox {}: {}", launched.sandbox_id, e);
            }
            if let Err(e) = spec.layout.cleanup().await {
                warn!("Failed to remove workspace for {}: {}", execution_id, e);
            }
            self.publish_finished(&execution_id).await;
            inner.events.close(&execution_id);
            return;
        }

        let monitor = inner.monitor.watch(&execution_id, &launched.sandbox_id);
        inner.registry.set_monitor(&execution_id, monitor).await;

        match inner
            .store
            .mark_running(&execution_id, &launched.sandbox_id, launched.pid, started_at)
            .await
        {
            Ok(true) => inner
                .events
                .publish(ExecutionEvent::status(&execution_id, ExecutionStatus::Running)),
            Ok(false) => debug!("Execution {} already terminal at start", execution_id),
            Err(e) => error!("Failed to mark {} running: {}", execution_id, e),
        }

        inner
            .supervisor
            .supervise(&execution_id, launched, spec.layout.clone(), buffer)
            .await;
    }

    async fn publish_finished(&self, execution_id: &str) {
        match self.inner.store.get_execution(execution_id).await {
            Ok(record) => self.inner.events.publish(ExecutionEvent::Finished {
                execution_id: record.id,
                status: record.status,
                exit_code: record.exit_code,
                error_message: record.error_message,
            }),
            Err(e) => warn!("Failed to reload {}: {}", execution_id, e),
        }
    }

    /// Cancel an in-flight execution. Unknown and finished ids both yield `NotRunning`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str, reason: &str) -> Result<()> {
        let message = if reason.is_empty() {
            "cancelled by user".to_string()
        } else {
            reason.to_string()
        };
        self.terminate(execution_id, ExecutionStatus::Cancelled, message)
            .await
    }

    /// Take ownership of a live handle, commit `status` and kill the sandbox.
    /// The supervisor still collects output when the sandbox exits.
    async fn terminate(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        message: String,
    ) -> Result<()> {
        let inner = &self.inner;
        let handle = inner
            .registry
            .remove(execution_id)
            .await
            .ok_or_else(|| ExecutorError::NotRunning(execution_id.to_string()))?;
        handle.stop_monitor();

        let outcome = Finalization {
            status,
            exit_code: None,
            error_message: Some(message),
            completed_at: Utc::now(),
        };
        let committed = commit_terminal(inner.store.as_ref(), execution_id, &outcome).await;

        if let Some(sandbox_id) = &handle.sandbox_id {
            if let Err(e) = inner.runtime.kill(sandbox_id).await {
                warn!("Failed to kill sandbox {} of {}: {}", sandbox_id, execution_id, e);
            }
        }

        if committed {
            info!("Execution {} terminated as {}", execution_id, status);
            inner
                .events
                .publish(ExecutionEvent::status(execution_id, status));
        }
        Ok(())
    }

    pub async fn list_running(&self) -> Vec<RunningExecution> {
        self.inner.registry.snapshot().await
    }

    pub async fn count_running(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.inner
            .store
            .get_execution(execution_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(id) => ExecutorError::NotFound(format!("execution {}", id)),
                other => other.into(),
            })
    }

    /// Record with captured output capped for display.
    pub async fn get_view(&self, execution_id: &str) -> Result<ExecutionView> {
        let record = self.get(execution_id).await?;
        Ok(ExecutionView::from_record(
            record,
            self.inner.settings.output_projection_bytes,
        ))
    }

    pub async fn logs(&self, execution_id: &str) -> Result<ExecutionLogs> {
        if let Some(buffer) = self.inner.registry.log_buffer(execution_id).await {
            let captured = buffer.snapshot();
            return Ok(ExecutionLogs {
                execution_id: execution_id.to_string(),
                live: true,
                stdout: captured.stdout,
                stderr: captured.stderr,
                logs: captured.logs,
            });
        }

        let record = self.get(execution_id).await?;
        Ok(ExecutionLogs {
            execution_id: record.id,
            live: false,
            stdout: record.stdout.unwrap_or_default(),
            stderr: record.stderr.unwrap_or_default(),
            logs: record.logs.unwrap_or_default(),
        })
    }

    /// Live events of an in-flight execution. The receiver closes once it finishes.
    pub async fn subscribe(
        &self,
        execution_id: &str,
    ) -> Result<broadcast::Receiver<ExecutionEvent>> {
        let receiver = self.inner.events.subscribe(execution_id);
        if self.inner.registry.contains(execution_id).await {
            Ok(receiver)
        } else {
            self.inner.events.close(execution_id);
            Err(ExecutorError::NotRunning(execution_id.to_string()))
        }
    }

    /// Start a new attempt of a failed execution through the normal submit path.
    #[instrument(skip(self, reason))]
    pub async fn create_retry(
        &self,
        execution_id: &str,
        reason: Option<String>,
    ) -> Result<ExecutionRecord> {
        let original = self.get(execution_id).await?;
        if !original.child_execution_ids.is_empty() {
            return Err(ExecutorError::RetryNotAllowed(format!(
                "execution {} has already been retried",
                original.id
            )));
        }
        if !original.can_retry() {
            return Err(ExecutorError::RetryNotAllowed(format!(
                "execution {} is {} with {} of {} retries used",
                original.id, original.status, original.retry_count, original.max_retries
            )));
        }

        // Claiming the slot first keeps concurrent retries of the same
        // execution from both being admitted.
        let retry_id = new_execution_id();
        if !self.inner.store.claim_retry(&original.id, &retry_id).await? {
            return Err(ExecutorError::RetryNotAllowed(format!(
                "execution {} has already been retried",
                original.id
            )));
        }

        let lineage = Lineage {
            execution_id: retry_id.clone(),
            retry_count: original.retry_count + 1,
            retry_reason: reason,
            parent_execution_id: original
                .parent_execution_id
                .clone()
                .unwrap_or_else(|| original.id.clone()),
        };
        let options = SubmitOptions {
            priority: original.priority,
            parameters: original.parameters.clone(),
            launch: original.options.clone(),
            max_retries: Some(original.max_retries),
            metadata: original.metadata.clone(),
        };

        let record = match self
            .submit_record(
                &original.script_id,
                &original.executor_id,
                options,
                Some(lineage),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                if let Err(release_err) =
                    self.inner.store.release_retry(&original.id, &retry_id).await
                {
                    error!(
                        "Failed to release retry slot of {}: {}",
                        original.id, release_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Created retry {} of {} (attempt {})",
            record.id, original.id, record.retry_count
        );
        Ok(record)
    }

    /// Settle state left behind by a previous process. Call once at startup,
    /// before accepting submissions.
    #[instrument(skip(self))]
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport> {
        let inner = &self.inner;
        let mut report = ReconcileReport::default();
        let mut handled_sandboxes = HashSet::new();

        for record in inner.store.list_active().await? {
            if inner.registry.contains(&record.id).await {
                continue;
            }

            let outcome = Finalization {
                status: ExecutionStatus::Killed,
                exit_code: None,
                error_message: Some("orphaned on restart".to_string()),
                completed_at: Utc::now(),
            };
            if commit_terminal(inner.store.as_ref(), &record.id, &outcome).await {
                warn!("Execution {} orphaned on restart; marked KILLED", record.id);
                self.publish_finished(&record.id).await;
            }

            if let Some(sandbox_id) = &record.sandbox_id {
                if let Err(e) = inner.runtime.kill(sandbox_id).await {
                    debug!("Kill of orphaned sandbox {} failed: {}", sandbox_id, e);
                }
                match inner.runtime.remove(sandbox_id).await {
                    Ok(()) => {
                        handled_sandboxes.insert(sandbox_id.clone());
                        report.removed_sandboxes.push(sandbox_id.clone());
                    }
                    Err(e) => warn!("Failed to remove orphaned sandbox {}: {}", sandbox_id, e),
                }
            }

            let layout = WorkspaceLayout::for_execution(&inner.settings, &record.id);
            if let Err(e) = layout.cleanup().await {
                warn!("Failed to remove workspace of {}: {}", record.id, e);
            }
            report.orphaned_executions.push(record.id);
        }

        let managed = match inner.runtime.list_managed().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!("Could not list managed sandboxes: {}", e);
                Vec::new()
            }
        };
        for sandbox in managed {
            if handled_sandboxes.contains(&sandbox.sandbox_id) {
                continue;
            }
            let owned = match &sandbox.execution_id {
                Some(id) => inner.registry.contains(id).await,
                None => false,
            };
            if owned {
                continue;
            }

            if sandbox.running {
                if let Err(e) = inner.runtime.kill(&sandbox.sandbox_id).await {
                    debug!("Kill of stray sandbox {} failed: {}", sandbox.sandbox_id, e);
                }
            }
            match inner.runtime.remove(&sandbox.sandbox_id).await {
                Ok(()) => {
                    info!("Removed stray sandbox {}", sandbox.sandbox_id);
                    report.removed_sandboxes.push(sandbox.sandbox_id);
                }
                Err(e) => warn!("Failed to remove stray sandbox {}: {}", sandbox.sandbox_id, e),
            }
        }

        info!(
            "Reconciliation: {} orphaned executions, {} sandboxes removed",
            report.orphaned_executions.len(),
            report.removed_sandboxes.len()
        );
        Ok(report)
    }

    /// Terminate everything past its deadline or the stale ceiling. Returns the ids handled.
    pub async fn reap_expired(&self) -> Vec<String> {
        let settings = &self.inner.settings;
        let expired = self
            .inner
            .registry
            .expired(
                Instant::now().into_std(),
                settings.timeout_grace,
                settings.stale_execution_threshold,
            )
            .await;

        let mut reaped = Vec::new();
        for (execution_id, reason) in expired {
            let (status, message) = match reason {
                ExpiryReason::DeadlineExceeded { timeout_seconds } => (
                    ExecutionStatus::Timeout,
                    format!("execution exceeded its {} s timeout", timeout_seconds),
                ),
                ExpiryReason::Stale => (
                    ExecutionStatus::Killed,
                    "stale execution cleanup".to_string(),
                ),
            };
            match self.terminate(&execution_id, status, message).await {
                Ok(()) => reaped.push(execution_id),
                // Finished between the scan and the removal.
                Err(ExecutorError::NotRunning(_)) => {}
                Err(e) => error!("Failed to reap {}: {}", execution_id, e),
            }
        }
        reaped
    }

    /// Run `reap_expired` every `reaper_interval` until `shutdown`.
    pub fn start_reaper(&self) {
        let scheduler = self.clone();
        let interval = self.inner.settings.reaper_interval;
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(tick_period(interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = scheduler.reap_expired().await;
                if !reaped.is_empty() {
                    info!("Reaper terminated {} executions", reaped.len());
                }
            }
        });
        self.track(task);
    }

    /// Keep a background task so `shutdown` can stop it.
    pub fn track(&self, task: JoinHandle<()>) {
        let mut background = match self.inner.background.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        background.push(task);
    }

    /// Stop background tasks. In-flight executions keep running.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.inner.background.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in &tasks {
            task.abort();
        }
        info!("Scheduler stopped {} background tasks", tasks.len());
    }
}
