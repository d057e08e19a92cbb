// ABOUTME: Execution metrics aggregation and threshold alerts
// ABOUTME: Raises long-running and high-failure-rate alerts to pluggable sinks and a broadcast channel

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::settings::{tick_period, ExecutorSettings};
use crate::storage::{ExecutionStatus, ExecutionStore, StorageError};

/// Window used for failure-rate metrics.
pub const FAILURE_RATE_WINDOW: Duration = Duration::from_secs(3600);

/// How many failed execution ids an alert carries.
const FAILURE_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    LongRunningExecution {
        execution_id: String,
        script_id: String,
        script_name: String,
        started_at: DateTime<Utc>,
        running_secs: i64,
        threshold_secs: u64,
    },
    HighFailureRate {
        failures: i64,
        total: i64,
        rate: f64,
        threshold: f64,
        window_secs: u64,
        failed_execution_ids: Vec<String>,
        script_ids: Vec<String>,
    },
}

/// Consumer of alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert);
}

/// Writes alerts to the log at warn level.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: &Alert) {
        match alert {
            Alert::LongRunningExecution {
                execution_id,
                script_id,
                running_secs,
                threshold_secs,
                ..
            } => warn!(
                "ALERT long-running execution {} (script {}) running {}s, threshold {}s",
                execution_id, script_id, running_secs, threshold_secs
            ),
            Alert::HighFailureRate {
                failures,
                total,
                rate,
                threshold,
                ..
            } => warn!(
                "ALERT failure rate {:.0}% ({}/{}) in the last hour exceeds {:.0}%",
                rate * 100.0,
                failures,
                total,
                threshold * 100.0
            ),
        }
    }
}

/// Aggregated outcome counts over the failure-rate window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionMetrics {
    pub window_secs: u64,
    pub active: usize,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub killed: i64,
    pub cancelled: i64,
    pub failure_rate: f64,
}

pub async fn collect_metrics(
    store: &dyn ExecutionStore,
    now: DateTime<Utc>,
) -> Result<ExecutionMetrics, StorageError> {
    let window = chrono::Duration::from_std(FAILURE_RATE_WINDOW).unwrap_or_else(|_| chrono::Duration::hours(1));
    let counts = store.status_counts_since(now - window).await?;
    let active = store.list_active().await?.len();
    let total = counts.total();
    let failure_rate = if total > 0 {
        counts.failures() as f64 / total as f64
    } else {
        0.0
    };

    Ok(ExecutionMetrics {
        window_secs: FAILURE_RATE_WINDOW.as_secs(),
        active,
        total,
        completed: counts.get(ExecutionStatus::Completed),
        failed: counts.get(ExecutionStatus::Failed),
        timeout: counts.get(ExecutionStatus::Timeout),
        killed: counts.get(ExecutionStatus::Killed),
        cancelled: counts.get(ExecutionStatus::Cancelled),
        failure_rate,
    })
}

#[derive(Default)]
struct AlertState {
    long_running_reported: HashSet<String>,
    failure_rate_active: bool,
}

pub struct AlertMonitor {
    store: Arc<dyn ExecutionStore>,
    sinks: Vec<Arc<dyn AlertSink>>,
    alerts_tx: broadcast::Sender<Alert>,
    long_running_threshold: Duration,
    failure_rate_threshold: f64,
    failure_rate_min_samples: i64,
    state: Mutex<AlertState>,
}

impl AlertMonitor {
    pub fn new(store: Arc<dyn ExecutionStore>, settings: &ExecutorSettings) -> Self {
        let (alerts_tx, _) = broadcast::channel(64);
        Self {
            store,
            sinks: vec![Arc::new(TracingAlertSink)],
            alerts_tx,
            long_running_threshold: settings.long_running_threshold,
            failure_rate_threshold: settings.failure_rate_threshold,
            failure_rate_min_samples: settings.failure_rate_min_samples,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts_tx.subscribe()
    }

    /// Check thresholds once. Each long-running execution is reported once;
    /// the failure-rate alert fires when the rate crosses the threshold.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, StorageError> {
        let mut alerts = Vec::new();
        let mut state = self.state.lock().await;

        let active = self.store.list_active().await?;
        let threshold_secs = self.long_running_threshold.as_secs();
        let active_ids: HashSet<String> = active.iter().map(|r| r.id.clone()).collect();
        state
            .long_running_reported
            .retain(|id| active_ids.contains(id));

        for record in &active {
            if record.status != ExecutionStatus::Running {
                continue;
            }
            let Some(started_at) = record.started_at else {
                continue;
            };
            let running_secs = (now - started_at).num_seconds();
            if running_secs >= threshold_secs as i64
                && state.long_running_reported.insert(record.id.clone())
            {
                alerts.push(Alert::LongRunningExecution {
                    execution_id: record.id.clone(),
                    script_id: record.script_id.clone(),
                    script_name: record.script_name.clone(),
                    started_at,
                    running_secs,
                    threshold_secs,
                });
            }
        }

        let window = chrono::Duration::from_std(FAILURE_RATE_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let since = now - window;
        let counts = self.store.status_counts_since(since).await?;
        let total = counts.total();
        let failures = counts.failures();
        let rate = if total > 0 {
            failures as f64 / total as f64
        } else {
            0.0
        };
        let breached = total >= self.failure_rate_min_samples && rate > self.failure_rate_threshold;

        if breached && !state.failure_rate_active {
            let recent = self.store.list_recent(500, None).await?;
            let failed: Vec<_> = recent
                .iter()
                .filter(|r| r.status.is_failure())
                .filter(|r| r.completed_at.is_some_and(|at| at >= since))
                .take(FAILURE_SAMPLE_LIMIT)
                .collect();
            let mut script_ids: Vec<String> = failed.iter().map(|r| r.script_id.clone()).collect();
            script_ids.sort();
            script_ids.dedup();

            alerts.push(Alert::HighFailureRate {
                failures,
                total,
                rate,
                threshold: self.failure_rate_threshold,
                window_secs: FAILURE_RATE_WINDOW.as_secs(),
                failed_execution_ids: failed.iter().map(|r| r.id.clone()).collect(),
                script_ids,
            });
        } else if !breached && state.failure_rate_active {
            info!("Failure rate back under threshold ({:.2})", rate);
        }
        state.failure_rate_active = breached;
        drop(state);

        for alert in &alerts {
            for sink in &self.sinks {
                sink.emit(alert).await;
            }
            let _ = self.alerts_tx.send(alert.clone());
        }

        Ok(alerts)
    }

    /// Evaluate on a fixed interval until the returned task is aborted.
    pub fn start(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Alert monitor started (interval {:?})", interval);
            let mut ticker = time::interval(tick_period(interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.evaluate(Utc::now()).await {
                    Ok(alerts) => debug!("Alert evaluation raised {} alerts", alerts.len()),
                    Err(e) => error!("Alert evaluation failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::sample_record;
    use crate::storage::{Finalization, SqliteExecutionStore};

    async fn finished(store: &SqliteExecutionStore, status: ExecutionStatus) -> String {
        let record = store.create_execution(sample_record("script-a")).await.unwrap();
        store
            .finalize(
                &record.id,
                &Finalization {
                    status,
                    exit_code: None,
                    error_message: None,
                    completed_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        record.id
    }

    #[tokio::test]
    async fn test_failure_rate_alert_fires_once() {
        let store = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
        for _ in 0..4 {
            finished(&store, ExecutionStatus::Failed).await;
        }
        finished(&store, ExecutionStatus::Timeout).await;
        finished(&store, ExecutionStatus::Completed).await;
        finished(&store, ExecutionStatus::Cancelled).await;

        let monitor = AlertMonitor::new(store.clone(), &ExecutorSettings::default());
        let mut rx = monitor.subscribe();

        let alerts = monitor.evaluate(Utc::now()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        match &alerts[0] {
            Alert::HighFailureRate {
                failures,
                total,
                failed_execution_ids,
                script_ids,
                ..
            } => {
                assert_eq!(*failures, 5);
                assert_eq!(*total, 7);
                assert_eq!(failed_execution_ids.len(), 5);
                assert_eq!(script_ids, &vec!["script-a".to_string()]);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert!(rx.try_recv().is_ok());

        // Still breached: no repeat.
        assert!(monitor.evaluate(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_rate_needs_min_samples() {
        let store = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
        for _ in 0..3 {
            finished(&store, ExecutionStatus::Failed).await;
        }
        let monitor = AlertMonitor::new(store.clone(), &ExecutorSettings::default());
        assert!(monitor.evaluate(Utc::now()).await.unwrap().is_empty());

        let metrics = collect_metrics(store.as_ref(), Utc::now()).await.unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.failure_rate, 1.0);
    }

    #[tokio::test]
    async fn test_started_monitor_publishes_alerts() {
        let store = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
        for _ in 0..5 {
            finished(&store, ExecutionStatus::Killed).await;
        }

        let monitor = Arc::new(AlertMonitor::new(store.clone(), &ExecutorSettings::default()));
        let mut rx = monitor.subscribe();
        let task = monitor.clone().start(Duration::from_millis(20));

        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(alert, Alert::HighFailureRate { failures: 5, total: 5, .. }));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_long_running_alert() {
        let store = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
        let record = store.create_execution(sample_record("script-b")).await.unwrap();
        let started = Utc::now() - chrono::Duration::hours(3);
        store
            .mark_running(&record.id, "sbx-1", None, started)
            .await
            .unwrap();

        let monitor = AlertMonitor::new(store.clone(), &ExecutorSettings::default());
        let alerts = monitor.evaluate(Utc::now()).await.unwrap();
        assert!(matches!(
            &alerts[..],
            [Alert::LongRunningExecution { execution_id, .. }] if execution_id == &record.id
        ));
        assert!(monitor.evaluate(Utc::now()).await.unwrap().is_empty());
    }
}
