// ABOUTME: Handlers for cmdb-exec subcommands
// ABOUTME: Builds the store, runtime and scheduler from settings and renders results as tables or JSON

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use cmdb_executor::runtime::StreamType;
use cmdb_executor::{
    collect_metrics, runtime_from_settings, AlertMonitor, ExecutionEvent, ExecutionRecord,
    ExecutionScheduler, ExecutionStatus, ExecutionStore, ExecutionView, ExecutorError,
    ExecutorSettings, LaunchOptions, ResourceLimitOverrides, ScriptLanguage, SqliteExecutionStore,
    SubmitOptions,
};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::scripts::FileScriptRegistry;

/// Exit code reported when an execution was cancelled from the terminal.
const CANCELLED_EXIT_CODE: i32 = 130;

pub struct Context {
    pub settings: ExecutorSettings,
    pub json: bool,
}

impl Context {
    pub fn new(runtime: Option<&str>, json: bool) -> Result<Self> {
        let mut settings = ExecutorSettings::from_env();
        if let Some(raw) = runtime {
            settings.runtime = raw.parse().map_err(|e: String| anyhow!(e))?;
        }
        Ok(Self { settings, json })
    }

    async fn store(&self) -> Result<Arc<SqliteExecutionStore>> {
        tokio::fs::create_dir_all(&self.settings.base_dir)
            .await
            .with_context(|| {
                format!("cannot create {}", self.settings.base_dir.display())
            })?;
        let store = SqliteExecutionStore::connect(&self.settings.database_url)
            .await
            .with_context(|| format!("cannot open {}", self.settings.database_url))?;
        Ok(Arc::new(store))
    }

    async fn scheduler(&self, scripts: FileScriptRegistry) -> Result<ExecutionScheduler> {
        let store = self.store().await?;
        let runtime = runtime_from_settings(&self.settings)?;
        if !runtime.is_available().await? {
            bail!(
                "{} runtime is not available; try --runtime process",
                runtime.name()
            );
        }

        let scheduler =
            ExecutionScheduler::new(self.settings.clone(), store, Arc::new(scripts), runtime);
        scheduler.start_reaper();

        // Alerts surface in the log while this invocation supervises a run.
        let alerts = Arc::new(AlertMonitor::new(scheduler.store().clone(), &self.settings));
        scheduler.track(alerts.start(self.settings.alert_interval));
        Ok(scheduler)
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

pub struct RunArgs {
    pub script: PathBuf,
    pub params: Vec<String>,
    pub language: Option<String>,
    pub timeout: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_mb: Option<u64>,
    pub network: bool,
    pub max_retries: Option<u32>,
    pub executor: String,
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("parameter '{}' is not KEY=VALUE", pair))
        })
        .collect()
}

pub async fn run(ctx: &Context, args: RunArgs) -> Result<i32> {
    let language = args
        .language
        .as_deref()
        .map(str::parse::<ScriptLanguage>)
        .transpose()
        .map_err(|e| anyhow!(e))?;
    let script_id = FileScriptRegistry::script_id(&args.script)
        .with_context(|| format!("cannot open {}", args.script.display()))?;
    let parameters = parse_params(&args.params)?;

    let registry = FileScriptRegistry::new()
        .with_language(language)
        .with_max_retries(args.max_retries);
    let scheduler = ctx.scheduler(registry).await?;

    let options = SubmitOptions {
        parameters,
        launch: LaunchOptions {
            limits: ResourceLimitOverrides {
                memory_mb: args.memory_mb,
                cpu_cores: args.cpu_cores,
                disk_mb: args.disk_mb,
            },
            timeout_seconds: args.timeout,
            network_enabled: args.network,
        },
        max_retries: args.max_retries,
        ..Default::default()
    };
    let execution_id = scheduler.submit(&script_id, &args.executor, options).await?;
    follow(ctx, &scheduler, &execution_id).await
}

pub async fn retry(ctx: &Context, execution_id: &str, reason: Option<String>) -> Result<i32> {
    let store = ctx.store().await?;
    let original = store.get_execution(execution_id).await?;

    let registry = FileScriptRegistry::new().with_language(Some(original.language));
    let scheduler = ctx.scheduler(registry).await?;
    let record = scheduler.create_retry(execution_id, reason).await?;
    if !ctx.json {
        eprintln!(
            "{} attempt {} of {} (root {})",
            "Retrying".cyan().bold(),
            record.retry_count,
            record.max_retries,
            record.parent_execution_id.as_deref().unwrap_or(execution_id)
        );
    }
    follow(ctx, &scheduler, &record.id).await
}

/// Stream an execution until it finishes. Ctrl-C cancels it.
async fn follow(ctx: &Context, scheduler: &ExecutionScheduler, execution_id: &str) -> Result<i32> {
    if !ctx.json {
        eprintln!("{} {}", "Started".green().bold(), execution_id);
    }

    let streamed = match scheduler.subscribe(execution_id).await {
        Ok(mut events) => {
            let mut cancel_sent = false;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ExecutionEvent::Output { stream, data, .. }) => {
                            if !ctx.json {
                                match stream {
                                    StreamType::Stdout => {
                                        print!("{}", data);
                                        let _ = std::io::stdout().flush();
                                    }
                                    StreamType::Stderr => eprint!("{}", data),
                                }
                            }
                        }
                        Ok(ExecutionEvent::StatusChanged { status, .. }) => {
                            debug!("{} is now {}", execution_id, status);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Output display fell behind; skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                        cancel_sent = true;
                        eprintln!("{}", "Cancelling...".yellow());
                        match scheduler.cancel(execution_id, "cancelled from terminal").await {
                            Ok(()) | Err(ExecutorError::NotRunning(_)) => {}
                            Err(e) => warn!("Cancel failed: {}", e),
                        }
                    }
                }
            }
            true
        }
        Err(ExecutorError::NotRunning(_)) => false,
        Err(e) => return Err(e.into()),
    };

    let record = wait_until_terminal(scheduler, execution_id).await?;
    scheduler.shutdown();

    if ctx.json {
        ctx.print_json(&ExecutionView::from_record(
            record.clone(),
            ctx.settings.output_projection_bytes,
        ))?;
    } else {
        if !streamed {
            print!("{}", record.stdout.as_deref().unwrap_or_default());
            eprint!("{}", record.stderr.as_deref().unwrap_or_default());
        }
        print_summary(&record);
    }
    Ok(exit_code_for(&record))
}

async fn wait_until_terminal(
    scheduler: &ExecutionScheduler,
    execution_id: &str,
) -> Result<ExecutionRecord> {
    for _ in 0..100 {
        let record = scheduler.get(execution_id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("execution {} did not reach a terminal state", execution_id)
}

fn exit_code_for(record: &ExecutionRecord) -> i32 {
    match record.status {
        ExecutionStatus::Completed => 0,
        ExecutionStatus::Cancelled => CANCELLED_EXIT_CODE,
        _ => match record.exit_code {
            Some(code) if code > 0 => code,
            _ => 1,
        },
    }
}

fn colored_status(status: ExecutionStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => text.green(),
        ExecutionStatus::Failed | ExecutionStatus::Killed => text.red(),
        ExecutionStatus::Timeout => text.magenta(),
        ExecutionStatus::Cancelled => text.yellow(),
        _ => text.cyan(),
    }
}

fn format_duration(record: &ExecutionRecord) -> String {
    match record.duration_ms {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{}ms", ms),
        None => "-".to_string(),
    }
}

fn print_summary(record: &ExecutionRecord) {
    eprintln!();
    eprintln!(
        "{} {} in {} (exit code {})",
        colored_status(record.status).bold(),
        record.id,
        format_duration(record),
        record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    if let Some(message) = &record.error_message {
        eprintln!("{} {}", "Reason:".dimmed(), message);
    }
    if !record.artifacts.is_empty() {
        eprintln!("{} {}", "Artifacts:".dimmed(), record.artifacts.len());
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub async fn status(ctx: &Context, execution_id: &str) -> Result<i32> {
    let store = ctx.store().await?;
    let record = store.get_execution(execution_id).await?;
    let view = ExecutionView::from_record(record, ctx.settings.output_projection_bytes);
    if ctx.json {
        ctx.print_json(&view)?;
        return Ok(0);
    }

    let record = &view.record;
    let optional = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    let mut table = new_table();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID".to_string(), record.id.clone()]);
    table.add_row(vec!["Script".to_string(), record.script_name.clone()]);
    table.add_row(vec!["Language".to_string(), record.language.to_string()]);
    table.add_row(vec!["Status".to_string(), record.status.to_string()]);
    table.add_row(vec![
        "Exit code".to_string(),
        optional(record.exit_code.map(|c| c.to_string())),
    ]);
    table.add_row(vec!["Created".to_string(), record.created_at.to_rfc3339()]);
    table.add_row(vec![
        "Started".to_string(),
        optional(record.started_at.map(|t| t.to_rfc3339())),
    ]);
    table.add_row(vec![
        "Completed".to_string(),
        optional(record.completed_at.map(|t| t.to_rfc3339())),
    ]);
    table.add_row(vec!["Duration".to_string(), format_duration(record)]);
    table.add_row(vec![
        "Timeout".to_string(),
        format!("{}s", record.timeout_seconds),
    ]);
    table.add_row(vec![
        "Peak memory".to_string(),
        optional(
            record
                .resource_usage
                .peak_memory_mb
                .map(|m| format!("{:.1} MB", m)),
        ),
    ]);
    table.add_row(vec![
        "Peak CPU".to_string(),
        optional(
            record
                .resource_usage
                .peak_cpu_percent
                .map(|c| format!("{:.1}%", c)),
        ),
    ]);
    table.add_row(vec![
        "Retries".to_string(),
        format!("{} of {}", record.retry_count, record.max_retries),
    ]);
    table.add_row(vec![
        "Parent".to_string(),
        optional(record.parent_execution_id.clone()),
    ]);
    if !record.child_execution_ids.is_empty() {
        table.add_row(vec![
            "Retries created".to_string(),
            record.child_execution_ids.join(", "),
        ]);
    }
    table.add_row(vec!["Error".to_string(), optional(record.error_message.clone())]);
    println!("{}", table);

    if view.can_retry {
        println!("{}", format!("Retry with: cmdb-exec retry {}", record.id).dimmed());
    }
    Ok(0)
}

pub async fn logs(ctx: &Context, execution_id: &str, stdout: bool, stderr: bool) -> Result<i32> {
    let store = ctx.store().await?;
    let record = store.get_execution(execution_id).await?;

    if ctx.json {
        ctx.print_json(&serde_json::json!({
            "execution_id": record.id,
            "stdout": record.stdout,
            "stderr": record.stderr,
            "logs": record.logs,
        }))?;
        return Ok(0);
    }

    if record.logs.is_none() && !record.is_terminal() {
        eprintln!(
            "{}",
            "Execution is still running; output is stored when it finishes".yellow()
        );
    }
    let text = if stdout {
        record.stdout
    } else if stderr {
        record.stderr
    } else {
        record.logs
    };
    print!("{}", text.unwrap_or_default());
    Ok(0)
}

pub async fn list(ctx: &Context, limit: i64, status: Option<&str>, active: bool) -> Result<i32> {
    let store = ctx.store().await?;
    let records = if active {
        store.list_active().await?
    } else {
        let status = status
            .map(|s| ExecutionStatus::from_str(&s.to_ascii_lowercase()))
            .transpose()?;
        store.list_recent(limit, status).await?
    };

    if ctx.json {
        ctx.print_json(&records)?;
        return Ok(0);
    }
    if records.is_empty() {
        println!("{}", "No executions found".yellow());
        return Ok(0);
    }

    let mut table = new_table();
    table.set_header(vec!["ID", "Script", "Status", "Exit", "Created", "Duration", "Retry"]);
    for record in &records {
        table.add_row(vec![
            record.id.clone(),
            record.script_name.clone(),
            record.status.to_string(),
            record
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            format_duration(record),
            format!("{}/{}", record.retry_count, record.max_retries),
        ]);
    }
    println!("{}", table);
    Ok(0)
}

pub async fn reconcile(ctx: &Context) -> Result<i32> {
    let scheduler = ctx.scheduler(FileScriptRegistry::new()).await?;
    let report = scheduler.reconcile_orphans().await?;
    scheduler.shutdown();

    if ctx.json {
        ctx.print_json(&report)?;
        return Ok(0);
    }
    println!(
        "{} {} orphaned executions marked KILLED, {} sandboxes removed",
        "Reconciled:".green().bold(),
        report.orphaned_executions.len(),
        report.removed_sandboxes.len()
    );
    for id in &report.orphaned_executions {
        println!("  {} {}", "killed".red(), id);
    }
    for id in &report.removed_sandboxes {
        println!("  {} {}", "removed".dimmed(), id);
    }
    Ok(0)
}

pub async fn metrics(ctx: &Context) -> Result<i32> {
    let store = ctx.store().await?;
    let now = Utc::now();
    let metrics = collect_metrics(store.as_ref(), now).await?;
    let alerts = AlertMonitor::new(store.clone(), &ctx.settings)
        .evaluate(now)
        .await?;

    if ctx.json {
        ctx.print_json(&serde_json::json!({ "metrics": metrics, "alerts": alerts }))?;
        return Ok(0);
    }

    let mut table = new_table();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Active".to_string(), metrics.active.to_string()]);
    table.add_row(vec![
        "Finished (last hour)".to_string(),
        metrics.total.to_string(),
    ]);
    table.add_row(vec!["Completed".to_string(), metrics.completed.to_string()]);
    table.add_row(vec!["Failed".to_string(), metrics.failed.to_string()]);
    table.add_row(vec!["Timed out".to_string(), metrics.timeout.to_string()]);
    table.add_row(vec!["Killed".to_string(), metrics.killed.to_string()]);
    table.add_row(vec!["Cancelled".to_string(), metrics.cancelled.to_string()]);
    table.add_row(vec![
        "Failure rate".to_string(),
        format!("{:.1}%", metrics.failure_rate * 100.0),
    ]);
    println!("{}", table);

    if alerts.is_empty() {
        println!("{}", "No alerts".green());
    } else {
        for alert in &alerts {
            println!("{} {}", "ALERT".red().bold(), serde_json::to_string(alert)?);
        }
    }
    Ok(0)
}
