// ABOUTME: Observes a launched sandbox until exit and commits its terminal state
// ABOUTME: Buffers output, classifies the exit, collects artifacts and tears down the workspace

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventHub, ExecutionEvent};
use crate::registry::RuntimeRegistry;
use crate::runtime::{LaunchedSandbox, OutputChunk, SandboxExit, SandboxRuntime, StreamType};
use crate::storage::{ExecutionOutput, ExecutionStatus, ExecutionStore, Finalization};
use crate::workspace::WorkspaceLayout;

/// Exit code an in-sandbox wrapper uses to report that it hit its own timeout.
pub const COOPERATIVE_TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep reading output after the sandbox has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

#[derive(Default)]
struct Buffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    truncated: bool,
}

/// Live output of one execution, bounded per stream.
pub struct LogBuffer {
    inner: Mutex<Buffers>,
    max_bytes: usize,
}

/// Captured output rendered as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
    pub truncated: bool,
}

fn append_bounded(target: &mut Vec<u8>, data: &[u8], max_bytes: usize) -> bool {
    let room = max_bytes.saturating_sub(target.len());
    let take = room.min(data.len());
    target.extend_from_slice(&data[..take]);
    take < data.len()
}

impl LogBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Buffers::default()),
            max_bytes,
        }
    }

    pub fn append(&self, stream: StreamType, data: &[u8]) {
        let mut buffers = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let max = self.max_bytes;
        let mut cut = match stream {
            StreamType::Stdout => append_bounded(&mut buffers.stdout, data, max),
            StreamType::Stderr => append_bounded(&mut buffers.stderr, data, max),
        };
        cut |= append_bounded(&mut buffers.combined, data, max.saturating_mul(2));
        buffers.truncated |= cut;
    }

    pub fn snapshot(&self) -> CapturedOutput {
        let buffers = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let render = |bytes: &[u8]| {
            let mut text = String::from_utf8_lossy(bytes).into_owned();
            if buffers.truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            text
        };
        CapturedOutput {
            stdout: render(&buffers.stdout),
            stderr: render(&buffers.stderr),
            logs: render(&buffers.combined),
            truncated: buffers.truncated,
        }
    }
}

/// Human readable name of a signal number.
pub fn signal_name(signal: i32) -> &'static str {
    #[cfg(unix)]
    {
        if let Ok(sig) = nix::sys::signal::Signal::try_from(signal) {
            return sig.as_str();
        }
    }
    "UNKNOWN"
}

/// Map a sandbox exit onto a terminal status, exit code and error message.
pub fn classify_exit(exit: &SandboxExit) -> (ExecutionStatus, Option<i32>, Option<String>) {
    match exit {
        SandboxExit::Exited { code: 0 } => (ExecutionStatus::Completed, Some(0), None),
        SandboxExit::Exited {
            code: COOPERATIVE_TIMEOUT_EXIT_CODE,
        } => (
            ExecutionStatus::Timeout,
            Some(COOPERATIVE_TIMEOUT_EXIT_CODE),
            Some("script reported its own timeout (exit code 124)".to_string()),
        ),
        SandboxExit::Exited { code } => (
            ExecutionStatus::Failed,
            Some(*code),
            Some(format!("script exited with code {}", code)),
        ),
        SandboxExit::Signaled { signal } => (
            ExecutionStatus::Killed,
            None,
            Some(format!(
                "terminated by signal {} ({})",
                signal,
                signal_name(*signal)
            )),
        ),
        SandboxExit::OutOfMemory => (
            ExecutionStatus::Killed,
            None,
            Some("killed by out-of-memory".to_string()),
        ),
        SandboxExit::Lost { reason } => (
            ExecutionStatus::Failed,
            Some(-1),
            Some(format!("lost track of sandbox: {}", reason)),
        ),
    }
}

/// Commit a terminal state, retrying once on a store error.
pub(crate) async fn commit_terminal(
    store: &dyn ExecutionStore,
    execution_id: &str,
    outcome: &Finalization,
) -> bool {
    for attempt in 1..=2 {
        match store.finalize(execution_id, outcome).await {
            Ok(committed) => return committed,
            Err(e) => error!(
                "Failed to finalize {} as {} (attempt {}): {}",
                execution_id, outcome.status, attempt, e
            ),
        }
    }
    false
}

#[derive(Clone)]
pub struct Supervisor {
    store: Arc<dyn ExecutionStore>,
    runtime: Arc<dyn SandboxRuntime>,
    registry: Arc<RuntimeRegistry>,
    events: Arc<EventHub>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        runtime: Arc<dyn SandboxRuntime>,
        registry: Arc<RuntimeRegistry>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            store,
            runtime,
            registry,
            events,
        }
    }

    fn handle_chunk(&self, execution_id: &str, buffer: &LogBuffer, chunk: OutputChunk) {
        buffer.append(chunk.stream, &chunk.data);
        self.events.publish(ExecutionEvent::Output {
            execution_id: execution_id.to_string(),
            stream: chunk.stream,
            data: String::from_utf8_lossy(&chunk.data).into_owned(),
            at: chunk.timestamp,
        });
    }

    /// Follow the sandbox until it exits, then finalize the execution.
    #[instrument(skip(self, launched, layout, buffer), fields(sandbox_id = %launched.sandbox_id))]
    pub async fn supervise(
        &self,
        execution_id: &str,
        launched: LaunchedSandbox,
        layout: WorkspaceLayout,
        buffer: Arc<LogBuffer>,
    ) {
        let LaunchedSandbox {
            sandbox_id,
            mut output,
            mut exit,
            ..
        } = launched;

        let mut output_open = true;
        let exit = loop {
            tokio::select! {
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => self.handle_chunk(execution_id, &buffer, chunk),
                    None => output_open = false,
                },
                result = &mut exit => break result.unwrap_or_else(|_| SandboxExit::Lost {
                    reason: "runtime dropped the exit notification".to_string(),
                }),
            }
        };

        if output_open {
            let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
                while let Some(chunk) = output.recv().await {
                    self.handle_chunk(execution_id, &buffer, chunk);
                }
            })
            .await;
            if drained.is_err() {
                warn!("Output of {} still open after exit; giving up", execution_id);
            }
        }

        info!("Execution {} sandbox exited: {:?}", execution_id, exit);
        self.finish(execution_id, &sandbox_id, &exit, &layout, &buffer)
            .await;
    }

    async fn finish(
        &self,
        execution_id: &str,
        sandbox_id: &str,
        exit: &SandboxExit,
        layout: &WorkspaceLayout,
        buffer: &LogBuffer,
    ) {
        // Whoever removes the handle stops its monitor. Cancel and the reaper
        // may already have done both.
        if let Some(handle) = self.registry.remove(execution_id).await {
            handle.stop_monitor();
        }

        let artifacts = match layout.collect_artifacts().await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Artifact collection failed for {}: {}", execution_id, e);
                Vec::new()
            }
        };

        let captured = buffer.snapshot();
        let output = ExecutionOutput {
            stdout: captured.stdout,
            stderr: captured.stderr,
            logs: captured.logs,
            artifacts,
        };
        if let Err(e) = self.store.save_output(execution_id, &output).await {
            error!("Failed to save output for {}: {}", execution_id, e);
        }

        let (status, exit_code, error_message) = classify_exit(exit);
        let outcome = Finalization {
            status,
            exit_code,
            error_message,
            completed_at: Utc::now(),
        };
        if commit_terminal(self.store.as_ref(), execution_id, &outcome).await {
            info!("Execution {} finished as {}", execution_id, status);
        } else {
            debug!(
                "Execution {} already terminal; exit {:?} not recorded as status",
                execution_id, exit
            );
        }

        match self.store.get_execution(execution_id).await {
            Ok(record) => self.events.publish(ExecutionEvent::Finished {
                execution_id: execution_id.to_string(),
                status: record.status,
                exit_code: record.exit_code,
                error_message: record.error_message,
            }),
            Err(e) => warn!("Failed to reload {} after exit: {}", execution_id, e),
        }

        if let Err(e) = layout.cleanup().await {
            warn!("Failed to remove workspace for {}: {}", execution_id, e);
        }
        if let Err(e) = self.runtime.remove(sandbox_id).await {
            warn!("Failed to remove sandbox {}: {}", sandbox_id, e);
        }
        self.events.close(execution_id);
    }
}
