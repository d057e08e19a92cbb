// ABOUTME: Integration tests for the scheduler's submit, supervise, cancel and reap paths
// ABOUTME: Runs against the scriptable mock runtime and in-memory SQLite

mod common;

use cmdb_executor::monitor::ResourceMonitor;
use cmdb_executor::runtime::{SandboxExit, SandboxStats};
use cmdb_executor::{
    ExecutionEvent, ExecutionStatus, ExecutionStore, ExecutorError, LaunchOptions,
    ResourceLimitOverrides, SubmitOptions,
};
use common::{harness, harness_with, wait_for, wait_for_idle, wait_for_terminal, MockBehavior};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::Duration;

fn params(pairs: &[(&str, &str)]) -> SubmitOptions {
    SubmitOptions {
        parameters: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_successful_execution_is_completed_with_output() {
    let h = harness().await;
    h.script("inventory", MockBehavior::exits(0).with_stdout("hosts: 3\n"))
        .await;

    let id = h
        .scheduler
        .submit("inventory", "netops", params(&[("site", "ams1")]))
        .await
        .unwrap();
    assert!(id.starts_with("exec_"));

    let record = wait_for_terminal(&h.store, &id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.stdout.as_deref(), Some("hosts: 3\n"));
    assert_eq!(record.logs.as_deref(), Some("hosts: 3\n"));
    assert_eq!(record.sandbox_id.as_deref(), Some(format!("mock-{}", id).as_str()));
    assert!(record.queued_at.is_some());
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.duration_ms.is_some());
    assert_eq!(record.parameters.get("site").map(String::as_str), Some("ams1"));

    // Sandbox removal is the last teardown step.
    for _ in 0..100 {
        if h.runtime.was_removed(&format!("mock-{}", id)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.runtime.was_removed(&format!("mock-{}", id)));
    assert_eq!(h.scheduler.count_running().await, 0);
    assert!(!h.dir.path().join("executions").join(&id).exists());
}

#[tokio::test]
async fn test_nonzero_exit_is_failed_with_stderr() {
    let h = harness().await;
    h.script(
        "backup",
        MockBehavior::exits(2).with_stderr("connection refused\n"),
    )
    .await;

    let id = h
        .scheduler
        .submit("backup", "netops", SubmitOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&h.store, &id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(2));
    assert_eq!(record.stderr.as_deref(), Some("connection refused\n"));
    assert!(record.can_retry());
}

#[tokio::test]
async fn test_exit_classification_for_timeout_and_oom() {
    let h = harness().await;
    h.script("slow", MockBehavior::exits(124)).await;
    h.script(
        "hungry",
        MockBehavior {
            exit: Some(SandboxExit::OutOfMemory),
            ..Default::default()
        },
    )
    .await;

    let slow = h
        .scheduler
        .submit("slow", "netops", SubmitOptions::default())
        .await
        .unwrap();
    let hungry = h
        .scheduler
        .submit("hungry", "netops", SubmitOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&h.store, &slow).await;
    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert_eq!(record.exit_code, Some(124));

    let record = wait_for_terminal(&h.store, &hungry).await;
    assert_eq!(record.status, ExecutionStatus::Killed);
    assert_eq!(record.error_message.as_deref(), Some("killed by out-of-memory"));
}

#[tokio::test]
async fn test_admission_control_caps_in_flight_executions() {
    let h = harness_with(|s| s.max_concurrent_executions = 2).await;
    h.script("hold", MockBehavior::hangs()).await;

    let first = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    let _second = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();

    let err = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::ResourceExhausted {
            running: 2,
            limit: 2
        }
    ));
    assert_eq!(h.scheduler.count_running().await, 2);
    assert_eq!(h.store.list_active().await.unwrap().len(), 2);

    // A freed slot admits the next submission.
    h.scheduler.cancel(&first, "make room").await.unwrap();
    assert!(h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_submissions_never_oversubscribe() {
    let h = harness_with(|s| s.max_concurrent_executions = 3).await;
    h.script("hold", MockBehavior::hangs()).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let scheduler = h.scheduler.clone();
        tasks.push(tokio::spawn(async move {
            scheduler
                .submit("hold", "netops", SubmitOptions::default())
                .await
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(ExecutorError::ResourceExhausted { .. }) => {}
            Err(other) => panic!("unexpected error {}", other),
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(h.scheduler.count_running().await, 3);
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let h = harness().await;
    h.script("hold", MockBehavior::hangs().with_stdout("started\n"))
        .await;

    let id = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    wait_for(&h.store, &id, |r| r.status == ExecutionStatus::Running).await;

    h.scheduler.cancel(&id, "operator request").await.unwrap();

    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.error_message.as_deref(), Some("operator request"));
    assert!(record.completed_at.is_some());
    assert!(h.runtime.killed(&format!("mock-{}", id)));

    // Second cancel finds nothing to cancel.
    let err = h.scheduler.cancel(&id, "again").await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotRunning(_)));

    // The exit handler saves output without touching the terminal fields.
    let record = wait_for(&h.store, &id, |r| r.stdout.is_some()).await;
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.error_message.as_deref(), Some("operator request"));
    assert_eq!(record.exit_code, None);
    assert_eq!(record.stdout.as_deref(), Some("started\n"));
    assert_eq!(h.scheduler.count_running().await, 0);
}

#[tokio::test]
async fn test_cancel_unknown_or_finished_is_not_running() {
    let h = harness().await;
    h.script("quick", MockBehavior::exits(0)).await;

    let err = h.scheduler.cancel("exec_missing", "").await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotRunning(_)));

    let id = h
        .scheduler
        .submit("quick", "netops", SubmitOptions::default())
        .await
        .unwrap();
    let before = wait_for_terminal(&h.store, &id).await;
    wait_for_idle(&h.scheduler).await;

    let err = h.scheduler.cancel(&id, "too late").await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotRunning(_)));

    let after = h.store.get_execution(&id).await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(after.error_message, before.error_message);
}

#[tokio::test]
async fn test_cancel_during_launch_discards_sandbox() {
    let h = harness().await;
    h.script("hold", MockBehavior::hangs()).await;

    let id = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    // The launch task has not run yet on this single-threaded runtime.
    h.scheduler.cancel(&id, "changed my mind").await.unwrap();

    let record = wait_for_terminal(&h.store, &id).await;
    assert_eq!(record.status, ExecutionStatus::Cancelled);

    for _ in 0..100 {
        if h.runtime.was_removed(&format!("mock-{}", id)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.runtime.killed(&format!("mock-{}", id)));
    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.started_at, None);
}

#[tokio::test]
async fn test_launch_failure_is_recorded_as_failed() {
    let h = harness().await;
    h.script(
        "broken",
        MockBehavior {
            fail_launch: true,
            ..Default::default()
        },
    )
    .await;

    let id = h
        .scheduler
        .submit("broken", "netops", SubmitOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&h.store, &id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(-1));
    assert!(record
        .error_message
        .unwrap()
        .starts_with("sandbox launch failed"));

    wait_for_idle(&h.scheduler).await;
    assert!(!h.dir.path().join("executions").join(&id).exists());
}

#[tokio::test]
async fn test_preflight_rejections_create_no_record() {
    let h = harness().await;
    h.script("valid", MockBehavior::exits(0)).await;

    let mut inactive = common::bash_script("inactive", "echo hi\n");
    inactive.is_active = false;
    h.scripts.register(inactive).await;

    let dangerous = common::bash_script("dangerous", "rm -rf / --no-preserve-root\n");
    h.scripts.register(dangerous).await;

    let mut tampered = common::bash_script("tampered", "echo hi\n");
    tampered.content.push_str("echo changed\n");
    h.scripts.register(tampered).await;

    let err = h
        .scheduler
        .submit("missing", "netops", SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::NotFound(_)));

    let err = h
        .scheduler
        .submit("inactive", "netops", SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));

    let err = h
        .scheduler
        .submit("valid", "netops", params(&[("1host", "a")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));

    let err = h
        .scheduler
        .submit("valid", "netops", params(&[("host", "a; reboot")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));

    let err = h
        .scheduler
        .submit("valid", "netops", params(&[("host", "a"), ("HOST", "b")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation(_)));

    let err = h
        .scheduler
        .submit("dangerous", "netops", SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::SecurityViolation(_)));

    let err = h
        .scheduler
        .submit("tampered", "netops", SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::SecurityViolation(_)));

    let too_big = SubmitOptions {
        launch: LaunchOptions {
            limits: ResourceLimitOverrides {
                memory_mb: Some(1_000_000),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let err = h
        .scheduler
        .submit("valid", "netops", too_big)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::ResourceLimitExceeded(_)));

    assert!(h.store.list_recent(10, None).await.unwrap().is_empty());
    assert_eq!(h.scheduler.count_running().await, 0);
    assert_eq!(
        h.runtime
            .launches
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_resource_samples_keep_peaks() {
    let h = harness().await;
    h.script(
        "busy",
        MockBehavior {
            stats: vec![
                SandboxStats {
                    memory_mb: Some(100.0),
                    cpu_percent: Some(50.0),
                    ..Default::default()
                },
                SandboxStats {
                    memory_mb: Some(60.0),
                    cpu_percent: Some(90.0),
                    network_rx_bytes: Some(512),
                    ..Default::default()
                },
                SandboxStats {
                    memory_mb: Some(70.0),
                    ..Default::default()
                },
            ],
            ..MockBehavior::hangs()
        },
    )
    .await;

    let id = h
        .scheduler
        .submit("busy", "netops", SubmitOptions::default())
        .await
        .unwrap();

    let record = wait_for(&h.store, &id, |r| {
        r.resource_usage.peak_cpu_percent == Some(90.0)
    })
    .await;
    assert_eq!(record.resource_usage.peak_memory_mb, Some(100.0));
    assert_eq!(record.resource_usage.network_rx_bytes, Some(512));

    // Later, lower samples never lower the peaks.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.resource_usage.peak_memory_mb, Some(100.0));
    assert_eq!(record.resource_usage.peak_cpu_percent, Some(90.0));

    h.scheduler.cancel(&id, "done").await.unwrap();
}

#[tokio::test]
async fn test_reaper_times_out_overdue_executions() {
    let h = harness_with(|s| s.timeout_grace = Duration::ZERO).await;
    h.script("hold", MockBehavior::hangs()).await;

    let options = SubmitOptions {
        launch: LaunchOptions {
            timeout_seconds: Some(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let id = h.scheduler.submit("hold", "netops", options).await.unwrap();
    wait_for(&h.store, &id, |r| r.status == ExecutionStatus::Running).await;

    assert!(h.scheduler.reap_expired().await.is_empty());
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(h.scheduler.reap_expired().await, vec![id.clone()]);
    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert_eq!(
        record.error_message.as_deref(),
        Some("execution exceeded its 1 s timeout")
    );
    assert!(h.runtime.killed(&format!("mock-{}", id)));
}

#[tokio::test]
async fn test_reaper_kills_stale_executions() {
    let h = harness_with(|s| s.stale_execution_threshold = Duration::from_millis(50)).await;
    h.script("hold", MockBehavior::hangs()).await;

    let id = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    wait_for(&h.store, &id, |r| r.status == ExecutionStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.scheduler.reap_expired().await, vec![id.clone()]);
    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Killed);
    assert_eq!(record.error_message.as_deref(), Some("stale execution cleanup"));
}

#[tokio::test]
async fn test_background_reaper_survives_zero_interval() {
    let h = harness_with(|s| {
        s.reaper_interval = Duration::ZERO;
        s.stale_execution_threshold = Duration::from_millis(50);
    })
    .await;
    h.script("hold", MockBehavior::hangs()).await;

    let id = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    wait_for(&h.store, &id, |r| r.status == ExecutionStatus::Running).await;

    h.scheduler.start_reaper();
    let record = wait_for(&h.store, &id, |r| r.status.is_terminal()).await;
    assert_eq!(record.status, ExecutionStatus::Killed);
    assert_eq!(record.error_message.as_deref(), Some("stale execution cleanup"));
    h.scheduler.shutdown();
}

#[tokio::test]
async fn test_subscribe_receives_finish_and_then_closes() {
    let h = harness().await;
    h.script(
        "report",
        MockBehavior::exits(0)
            .with_stdout("line one\n")
            .with_delay(Duration::from_millis(100)),
    )
    .await;

    let id = h
        .scheduler
        .submit("report", "netops", SubmitOptions::default())
        .await
        .unwrap();
    let mut rx = h.scheduler.subscribe(&id).await.unwrap();

    let mut saw_output = false;
    let mut finished = None;
    while let Ok(event) = rx.recv().await {
        match event {
            ExecutionEvent::Output { data, .. } => saw_output |= data.contains("line one"),
            ExecutionEvent::Finished { status, .. } => finished = Some(status),
            _ => {}
        }
    }
    assert!(saw_output);
    assert_eq!(finished, Some(ExecutionStatus::Completed));

    let err = h.scheduler.subscribe(&id).await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotRunning(_)));
}

#[tokio::test]
async fn test_logs_are_live_while_running_and_stored_after() {
    let h = harness().await;
    h.script("hold", MockBehavior::hangs().with_stdout("progress 50%\n"))
        .await;

    let id = h
        .scheduler
        .submit("hold", "netops", SubmitOptions::default())
        .await
        .unwrap();
    wait_for(&h.store, &id, |r| r.status == ExecutionStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logs = h.scheduler.logs(&id).await.unwrap();
    assert!(logs.live);
    assert_eq!(logs.stdout, "progress 50%\n");

    h.scheduler.cancel(&id, "").await.unwrap();
    wait_for(&h.store, &id, |r| r.stdout.is_some()).await;

    let logs = h.scheduler.logs(&id).await.unwrap();
    assert!(!logs.live);
    assert_eq!(logs.stdout, "progress 50%\n");

    let record = h.store.get_execution(&id).await.unwrap();
    assert_eq!(record.error_message.as_deref(), Some("cancelled by user"));
}

#[tokio::test]
async fn test_view_caps_output() {
    let h = harness_with(|s| s.output_projection_bytes = 4).await;
    h.script("chatty", MockBehavior::exits(0).with_stdout("abcdefgh"))
        .await;

    let id = h
        .scheduler
        .submit("chatty", "netops", SubmitOptions::default())
        .await
        .unwrap();
    wait_for_terminal(&h.store, &id).await;
    wait_for(&h.store, &id, |r| r.stdout.is_some()).await;

    let view = h.scheduler.get_view(&id).await.unwrap();
    assert!(view.truncated);
    assert!(!view.can_retry);
    assert_eq!(view.record.stdout.as_deref(), Some("abcd"));

    let err = h.scheduler.get("exec_missing").await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotFound(_)));
}

#[tokio::test]
async fn test_monitor_stop_is_idempotent() {
    let h = harness().await;
    let monitor = ResourceMonitor::new(
        h.runtime.clone(),
        h.store.clone(),
        h.scheduler.events().clone(),
        Duration::from_millis(20),
        Duration::from_millis(200),
    );

    let handle = monitor.watch("exec_detached", "mock-exec_detached");
    assert!(!handle.is_stopped());
    handle.stop();
    handle.stop();
    assert!(handle.is_stopped());
}
