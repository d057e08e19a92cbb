// ABOUTME: Local process runtime that runs scripts as host child processes
// ABOUTME: Development backend without container isolation; uses nix signals and sysinfo stats

use super::{
    LaunchedSandbox, ManagedSandbox, OutputChunk, Result, RuntimeError, SandboxExit,
    SandboxRuntime, SandboxStats, StreamType,
};
use crate::spec::SandboxSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, System};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const READ_BUFFER_BYTES: usize = 8192;

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    execution_id: String,
    running: bool,
}

/// Runs each sandbox as a process group on the host.
pub struct ProcessRuntime {
    processes: Arc<Mutex<HashMap<String, TrackedProcess>>>,
    system: Arc<Mutex<System>>,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn tracked(&self, sandbox_id: &str) -> Option<TrackedProcess> {
        self.processes
            .lock()
            .ok()
            .and_then(|processes| processes.get(sandbox_id).cloned())
    }

    fn mark_stopped(processes: &Arc<Mutex<HashMap<String, TrackedProcess>>>, sandbox_id: &str) {
        if let Ok(mut processes) = processes.lock() {
            if let Some(process) = processes.get_mut(sandbox_id) {
                process.running = false;
            }
        }
    }

    fn pipe_output<R>(reader: Option<R>, stream: StreamType, tx: mpsc::UnboundedSender<OutputChunk>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(mut reader) = reader else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(OutputChunk::new(stream, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error reading {:?}: {}", stream, e);
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(unix)]
fn exit_from_status(status: std::process::ExitStatus) -> SandboxExit {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => SandboxExit::Exited { code },
        (None, Some(signal)) => SandboxExit::Signaled { signal },
        (None, None) => SandboxExit::Lost {
            reason: "process ended without exit code or signal".to_string(),
        },
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: std::process::ExitStatus) -> SandboxExit {
    match status.code() {
        Some(code) => SandboxExit::Exited { code },
        None => SandboxExit::Lost {
            reason: "process ended without exit code".to_string(),
        },
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn launch(&self, spec: &SandboxSpec) -> Result<LaunchedSandbox> {
        let layout = &spec.layout;
        let workspace = layout.workspace_dir.to_string_lossy().into_owned();
        let command = spec.command(&workspace);
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RuntimeError::Launch("empty command".to_string()))?;

        let env = spec.env_with_paths(
            &workspace,
            &layout.logs_dir.to_string_lossy(),
            &layout.output_dir.to_string_lossy(),
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&layout.workspace_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", &workspace);

        // Own process group so kill reaches anything the script forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Launch(format!("Failed to spawn {}: {}", program, e)))?;

        let pid = child.id();
        let sandbox_id = spec.name.clone();

        if let Ok(mut processes) = self.processes.lock() {
            processes.insert(
                sandbox_id.clone(),
                TrackedProcess {
                    pid: pid.unwrap_or(0),
                    execution_id: spec.execution_id.clone(),
                    running: true,
                },
            );
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self::pipe_output(child.stdout.take(), StreamType::Stdout, output_tx.clone());
        Self::pipe_output(child.stderr.take(), StreamType::Stderr, output_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let processes = self.processes.clone();
        let watched_id = sandbox_id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => SandboxExit::Lost {
                    reason: e.to_string(),
                },
            };
            debug!("Process {} exited: {:?}", watched_id, exit);
            Self::mark_stopped(&processes, &watched_id);
            let _ = exit_tx.send(exit);
        });

        info!(
            "Started process {} (pid {:?}) for execution {}",
            sandbox_id, pid, spec.execution_id
        );

        Ok(LaunchedSandbox {
            sandbox_id,
            pid,
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let Some(process) = self.tracked(sandbox_id) else {
            return Ok(());
        };
        if !process.running || process.pid == 0 {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(process.pid as i32), Signal::SIGKILL) {
                Ok(()) => info!("Sent SIGKILL to process group {}", process.pid),
                Err(Errno::ESRCH) => debug!("Process group {} already gone", process.pid),
                Err(e) => {
                    return Err(RuntimeError::Sandbox(format!(
                        "Failed to kill process group {}: {}",
                        process.pid, e
                    )))
                }
            }
        }

        Ok(())
    }

    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats> {
        let process = self
            .tracked(sandbox_id)
            .filter(|p| p.running && p.pid > 0)
            .ok_or_else(|| RuntimeError::NotFound(sandbox_id.to_string()))?;

        let mut system = self
            .system
            .lock()
            .map_err(|_| RuntimeError::Sandbox("process table lock poisoned".to_string()))?;
        let pid = SysPid::from_u32(process.pid);
        if !system.refresh_process_specifics(pid, ProcessRefreshKind::everything()) {
            return Err(RuntimeError::NotFound(sandbox_id.to_string()));
        }

        let info = system
            .process(pid)
            .ok_or_else(|| RuntimeError::NotFound(sandbox_id.to_string()))?;
        let disk = info.disk_usage();

        Ok(SandboxStats {
            memory_mb: Some(info.memory() as f64 / (1024.0 * 1024.0)),
            cpu_percent: Some(info.cpu_usage() as f64),
            disk_mb: Some(disk.total_written_bytes as f64 / (1024.0 * 1024.0)),
            network_rx_bytes: None,
            network_tx_bytes: None,
        })
    }

    async fn remove(&self, sandbox_id: &str) -> Result<()> {
        if let Ok(mut processes) = self.processes.lock() {
            processes.remove(sandbox_id);
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>> {
        let processes = self
            .processes
            .lock()
            .map_err(|_| RuntimeError::Sandbox("process table lock poisoned".to_string()))?;
        Ok(processes
            .iter()
            .map(|(sandbox_id, process)| ManagedSandbox {
                sandbox_id: sandbox_id.clone(),
                execution_id: Some(process.execution_id.clone()),
                running: process.running,
            })
            .collect())
    }
}
