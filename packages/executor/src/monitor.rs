// ABOUTME: Best-effort resource polling for running sandboxes
// ABOUTME: Each execution gets one poll task whose samples are merged into the record as peaks

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::events::{EventHub, ExecutionEvent};
use crate::runtime::SandboxRuntime;
use crate::settings::tick_period;
use crate::storage::ExecutionStore;

/// Stops the poll task for one execution. Stopping more than once is harmless.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        // send_replace works even once the task has exited.
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow() || self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct ResourceMonitor {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventHub>,
    interval: Duration,
    timeout: Duration,
}

impl ResourceMonitor {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn ExecutionStore>,
        events: Arc<EventHub>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            store,
            events,
            interval,
            timeout,
        }
    }

    /// Start polling `sandbox_id` on behalf of `execution_id`.
    pub fn watch(&self, execution_id: &str, sandbox_id: &str) -> MonitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = self.clone();
        let execution_id = execution_id.to_string();
        let sandbox_id = sandbox_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(tick_period(monitor.interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; sample after one interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        monitor.sample_once(&execution_id, &sandbox_id).await;
                    }
                }
            }
            debug!("Resource monitor for {} stopped", execution_id);
        });

        MonitorHandle { stop_tx, task }
    }

    /// Take one sample and merge it. Failures are logged and swallowed.
    pub async fn sample_once(&self, execution_id: &str, sandbox_id: &str) {
        let stats = match time::timeout(self.timeout, self.runtime.stats(sandbox_id)).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                debug!("Stats query failed for {}: {}", execution_id, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Stats query for {} timed out after {:?}",
                    execution_id, self.timeout
                );
                return;
            }
        };

        let usage = stats.into_usage(Utc::now());
        if let Err(e) = self.store.merge_resource_usage(execution_id, &usage).await {
            warn!("Failed to record resource usage for {}: {}", execution_id, e);
            return;
        }

        self.events.publish(ExecutionEvent::ResourceSample {
            execution_id: execution_id.to_string(),
            usage,
        });
    }
}
