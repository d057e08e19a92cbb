// ABOUTME: In-memory table of executions that currently hold a concurrency slot
// ABOUTME: Slots are reserved at admission, filled at launch and removed exactly once

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::monitor::MonitorHandle;
use crate::supervisor::LogBuffer;

/// Live bookkeeping for one admitted execution.
pub struct RuntimeHandle {
    pub execution_id: String,
    pub script_id: String,
    pub sandbox_id: Option<String>,
    pub pid: Option<u32>,
    pub reserved_at: Instant,
    pub started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    pub timeout_seconds: u64,
    pub log_buffer: Arc<LogBuffer>,
    monitor: Option<MonitorHandle>,
}

impl RuntimeHandle {
    pub fn stop_monitor(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
    }

    /// Instant after which the execution has overrun its timeout plus grace.
    pub fn deadline(&self, grace: Duration) -> Option<Instant> {
        self.started_instant
            .map(|start| start + Duration::from_secs(self.timeout_seconds) + grace)
    }
}

/// Serializable view of a registry entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunningExecution {
    pub execution_id: String,
    pub script_id: String,
    pub sandbox_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub timeout_seconds: u64,
}

/// Why the reaper is terminating an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Running past timeout plus grace.
    DeadlineExceeded { timeout_seconds: u64 },
    /// Held a slot longer than the stale ceiling.
    Stale,
}

pub struct RuntimeRegistry {
    handles: Mutex<HashMap<String, RuntimeHandle>>,
    capacity: usize,
    log_buffer_bytes: usize,
}

impl RuntimeRegistry {
    pub fn new(capacity: usize, log_buffer_bytes: usize) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            capacity,
            log_buffer_bytes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot if capacity allows. On rejection returns the in-flight count.
    pub async fn reserve(
        &self,
        execution_id: &str,
        script_id: &str,
        timeout_seconds: u64,
    ) -> Result<Arc<LogBuffer>, usize> {
        let mut handles = self.handles.lock().await;
        if handles.len() >= self.capacity {
            return Err(handles.len());
        }

        let log_buffer = Arc::new(LogBuffer::new(self.log_buffer_bytes));
        handles.insert(
            execution_id.to_string(),
            RuntimeHandle {
                execution_id: execution_id.to_string(),
                script_id: script_id.to_string(),
                sandbox_id: None,
                pid: None,
                reserved_at: Instant::now(),
                started_at: None,
                started_instant: None,
                timeout_seconds,
                log_buffer: log_buffer.clone(),
                monitor: None,
            },
        );
        Ok(log_buffer)
    }

    /// Record the launched sandbox. Returns false if the slot was released meanwhile.
    pub async fn attach(
        &self,
        execution_id: &str,
        sandbox_id: &str,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> bool {
        let mut handles = self.handles.lock().await;
        match handles.get_mut(execution_id) {
            Some(handle) => {
                handle.sandbox_id = Some(sandbox_id.to_string());
                handle.pid = pid;
                handle.started_at = Some(started_at);
                handle.started_instant = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Hand the poll task to the handle. If the handle is gone the monitor is stopped.
    pub async fn set_monitor(&self, execution_id: &str, monitor: MonitorHandle) -> bool {
        let mut handles = self.handles.lock().await;
        match handles.get_mut(execution_id) {
            Some(handle) => {
                handle.monitor = Some(monitor);
                true
            }
            None => {
                monitor.stop();
                false
            }
        }
    }

    /// Remove a handle. The caller that gets `Some` owns teardown.
    pub async fn remove(&self, execution_id: &str) -> Option<RuntimeHandle> {
        self.handles.lock().await.remove(execution_id)
    }

    pub async fn contains(&self, execution_id: &str) -> bool {
        self.handles.lock().await.contains_key(execution_id)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn log_buffer(&self, execution_id: &str) -> Option<Arc<LogBuffer>> {
        self.handles
            .lock()
            .await
            .get(execution_id)
            .map(|h| h.log_buffer.clone())
    }

    pub async fn snapshot(&self) -> Vec<RunningExecution> {
        let handles = self.handles.lock().await;
        let mut running: Vec<RunningExecution> = handles
            .values()
            .map(|h| RunningExecution {
                execution_id: h.execution_id.clone(),
                script_id: h.script_id.clone(),
                sandbox_id: h.sandbox_id.clone(),
                pid: h.pid,
                started_at: h.started_at,
                elapsed_secs: h.reserved_at.elapsed().as_secs(),
                timeout_seconds: h.timeout_seconds,
            })
            .collect();
        running.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        running
    }

    /// Executions the reaper should terminate at `now`.
    pub async fn expired(
        &self,
        now: Instant,
        grace: Duration,
        stale_after: Duration,
    ) -> Vec<(String, ExpiryReason)> {
        let handles = self.handles.lock().await;
        handles
            .values()
            .filter_map(|h| {
                if h.deadline(grace).is_some_and(|deadline| now >= deadline) {
                    Some((
                        h.execution_id.clone(),
                        ExpiryReason::DeadlineExceeded {
                            timeout_seconds: h.timeout_seconds,
                        },
                    ))
                } else if now.saturating_duration_since(h.reserved_at) >= stale_after {
                    Some((h.execution_id.clone(), ExpiryReason::Stale))
                } else {
                    None
                }
            })
            .collect()
    }
}
