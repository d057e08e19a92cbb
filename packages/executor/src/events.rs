// ABOUTME: Per-execution and global broadcast channels for lifecycle, output and usage events
// ABOUTME: Independent consumers subscribe without coupling to each other

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::runtime::StreamType;
use crate::storage::{ExecutionStatus, ResourceUsage};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StatusChanged {
        execution_id: String,
        status: ExecutionStatus,
        at: DateTime<Utc>,
    },
    Output {
        execution_id: String,
        stream: StreamType,
        data: String,
        at: DateTime<Utc>,
    },
    ResourceSample {
        execution_id: String,
        usage: ResourceUsage,
    },
    Finished {
        execution_id: String,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::StatusChanged { execution_id, .. }
            | Self::Output { execution_id, .. }
            | Self::ResourceSample { execution_id, .. }
            | Self::Finished { execution_id, .. } => execution_id,
        }
    }

    pub fn status(execution_id: &str, status: ExecutionStatus) -> Self {
        Self::StatusChanged {
            execution_id: execution_id.to_string(),
            status,
            at: Utc::now(),
        }
    }
}

/// Fan-out of execution events. Channels are created on first subscription
/// and dropped by `close`, which ends every receiver of that execution.
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ExecutionEvent>>>,
    global: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            channels: Mutex::new(HashMap::new()),
            global,
            capacity,
        }
    }

    pub fn subscribe(&self, execution_id: &str) -> broadcast::Receiver<ExecutionEvent> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Events for every execution.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.global.subscribe()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        let sender = match self.channels.lock() {
            Ok(channels) => channels.get(event.execution_id()).cloned(),
            Err(poisoned) => poisoned.into_inner().get(event.execution_id()).cloned(),
        };
        if let Some(sender) = sender {
            // No receivers is fine.
            let _ = sender.send(event.clone());
        }
        let _ = self.global.send(event);
    }

    pub fn close(&self, execution_id: &str) {
        let removed = match self.channels.lock() {
            Ok(mut channels) => channels.remove(execution_id),
            Err(poisoned) => poisoned.into_inner().remove(execution_id),
        };
        if removed.is_some() {
            debug!("Closed event channel for {}", execution_id);
        }
    }
}
