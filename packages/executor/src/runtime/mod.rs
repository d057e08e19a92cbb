// ABOUTME: Sandbox runtime trait and the types exchanged with runtime backends
// ABOUTME: A runtime launches a spec, streams its output, reports exit, stats and managed sandboxes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::spec::SandboxSpec;
use crate::storage::ResourceUsage;

pub mod docker;
pub mod process;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Runtime not available: {0}")]
    NotAvailable(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: StreamType, data: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            data,
        }
    }
}

/// How a sandbox stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxExit {
    /// Normal process exit.
    Exited { code: i32 },
    /// Terminated by a signal.
    Signaled { signal: i32 },
    /// Killed by the kernel for exceeding its memory limit.
    OutOfMemory,
    /// The runtime lost track of the sandbox before an exit status was known.
    Lost { reason: String },
}

/// A started sandbox. Output closes when both streams end; `exit` fires once.
pub struct LaunchedSandbox {
    pub sandbox_id: String,
    pub pid: Option<u32>,
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    pub exit: oneshot::Receiver<SandboxExit>,
}

/// Instantaneous resource usage reported by a runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxStats {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub disk_mb: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
}

impl SandboxStats {
    pub fn into_usage(self, sampled_at: DateTime<Utc>) -> ResourceUsage {
        ResourceUsage {
            peak_memory_mb: self.memory_mb,
            peak_cpu_percent: self.cpu_percent,
            disk_mb: self.disk_mb,
            network_rx_bytes: self.network_rx_bytes,
            network_tx_bytes: self.network_tx_bytes,
            sampled_at: Some(sampled_at),
        }
    }
}

/// A sandbox carrying this engine's labels, as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedSandbox {
    pub sandbox_id: String,
    pub execution_id: Option<String>,
    pub running: bool,
}

/// Backend capable of running sandboxes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check if the runtime is reachable and usable
    async fn is_available(&self) -> Result<bool>;

    /// Start the sandbox described by `spec`. The workspace must already exist.
    async fn launch(&self, spec: &SandboxSpec) -> Result<LaunchedSandbox>;

    /// Forcefully terminate a sandbox. Killing one that already stopped is not an error.
    async fn kill(&self, sandbox_id: &str) -> Result<()>;

    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats>;

    /// Release whatever the runtime still holds for a stopped sandbox.
    async fn remove(&self, sandbox_id: &str) -> Result<()>;

    /// All sandboxes carrying this engine's managed label.
    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>>;
}
