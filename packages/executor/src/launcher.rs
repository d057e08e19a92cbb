// ABOUTME: Prepares an execution's workspace and starts its sandbox through the runtime
// ABOUTME: Launch failures are recorded as FAILED with exit code -1 and the workspace is removed

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::events::{EventHub, ExecutionEvent};
use crate::runtime::{LaunchedSandbox, RuntimeError, SandboxRuntime};
use crate::spec::SandboxSpec;
use crate::storage::{ExecutionStatus, ExecutionStore, Finalization};
use crate::supervisor::commit_terminal;

/// Exit code recorded when no sandbox could be started.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -1;

#[derive(Clone)]
pub struct SandboxLauncher {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventHub>,
}

impl SandboxLauncher {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn ExecutionStore>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            runtime,
            store,
            events,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    /// Write the script, move the record to QUEUED and start the sandbox.
    /// On error the record is already FAILED and the workspace removed.
    #[instrument(skip(self, spec, script_content), fields(execution_id = %spec.execution_id))]
    pub async fn launch(
        &self,
        spec: &SandboxSpec,
        script_content: &str,
    ) -> Result<LaunchedSandbox, RuntimeError> {
        let execution_id = spec.execution_id.as_str();

        let result = async {
            spec.layout
                .prepare(&spec.script_file, script_content)
                .await?;

            match self.store.mark_queued(execution_id).await {
                Ok(true) => self
                    .events
                    .publish(ExecutionEvent::status(execution_id, ExecutionStatus::Queued)),
                Ok(false) => warn!("Execution {} was not pending when queued", execution_id),
                Err(e) => warn!("Failed to mark {} queued: {}", execution_id, e),
            }

            self.runtime.launch(spec).await
        }
        .await;

        match result {
            Ok(launched) => {
                info!(
                    "Launched sandbox {} for execution {} via {}",
                    launched.sandbox_id,
                    execution_id,
                    self.runtime.name()
                );
                Ok(launched)
            }
            Err(e) => {
                error!("Failed to launch execution {}: {}", execution_id, e);
                self.record_failure(spec, &e).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, spec: &SandboxSpec, err: &RuntimeError) {
        let outcome = Finalization {
            status: ExecutionStatus::Failed,
            exit_code: Some(LAUNCH_FAILURE_EXIT_CODE),
            error_message: Some(format!("sandbox launch failed: {}", err)),
            completed_at: Utc::now(),
        };
        if commit_terminal(self.store.as_ref(), &spec.execution_id, &outcome).await {
            self.events.publish(ExecutionEvent::Finished {
                execution_id: spec.execution_id.clone(),
                status: ExecutionStatus::Failed,
                exit_code: outcome.exit_code,
                error_message: outcome.error_message.clone(),
            });
        }

        if let Err(e) = spec.layout.cleanup().await {
            warn!(
                "Failed to remove workspace for {}: {}",
                spec.execution_id, e
            );
        }
    }
}
