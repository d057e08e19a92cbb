// ABOUTME: Execution record model and its durable store backed by SQLite
// ABOUTME: Conditional updates keep the execution state machine single-writer

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::scripts::ScriptLanguage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Execution not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Killed,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 5] = [
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
        Self::Killed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            "killed" => Ok(Self::Killed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Unsuccessful outcomes that are eligible for a retry.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Killed)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Queued => !matches!(next, Self::Pending | Self::Queued),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// States that may legally precede `next`.
    fn predecessors(next: ExecutionStatus) -> Vec<ExecutionStatus> {
        [Self::Pending, Self::Queued, Self::Running]
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(StorageError::InvalidValue {
                column: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Observed resource consumption. Every field holds the highest value seen so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub peak_memory_mb: Option<f64>,
    pub peak_cpu_percent: Option<f64>,
    pub disk_mb: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl ResourceUsage {
    /// Fold a new sample in. Missing fields never erase known values and peaks never decrease.
    pub fn merge(&mut self, sample: &ResourceUsage) {
        fn max_f(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, None) => x,
                (None, y) => y,
            }
        }
        fn max_u(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, None) => x,
                (None, y) => y,
            }
        }

        self.peak_memory_mb = max_f(self.peak_memory_mb, sample.peak_memory_mb);
        self.peak_cpu_percent = max_f(self.peak_cpu_percent, sample.peak_cpu_percent);
        self.disk_mb = max_f(self.disk_mb, sample.disk_mb);
        self.network_rx_bytes = max_u(self.network_rx_bytes, sample.network_rx_bytes);
        self.network_tx_bytes = max_u(self.network_tx_bytes, sample.network_tx_bytes);
        if sample.sampled_at.is_some() {
            self.sampled_at = sample.sampled_at;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peak_memory_mb.is_none()
            && self.peak_cpu_percent.is_none()
            && self.disk_mb.is_none()
            && self.network_rx_bytes.is_none()
            && self.network_tx_bytes.is_none()
    }
}

/// Per-request overrides of the resolved resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimitOverrides {
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_mb: Option<u64>,
}

/// Launch options persisted with the record so a retry can replay them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LaunchOptions {
    #[serde(default)]
    pub limits: ResourceLimitOverrides,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub network_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub script_id: String,
    pub script_name: String,
    pub language: ScriptLanguage,
    pub executor_id: String,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub parameters: BTreeMap<String, String>,
    pub options: LaunchOptions,

    // Lifecycle
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub timeout_seconds: u64,

    // Sandbox
    pub sandbox_id: Option<String>,
    pub process_id: Option<u32>,

    // Outcome
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub logs: Option<String>,
    pub error_message: Option<String>,
    pub resource_usage: ResourceUsage,
    pub artifacts: Vec<String>,

    // Retry chain
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_reason: Option<String>,
    pub parent_execution_id: Option<String>,
    pub child_execution_ids: Vec<String>,

    pub metadata: Option<JsonValue>,
}

impl ExecutionRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.status.is_terminal()
            && self.status.is_failure()
            && self.retry_count < self.max_retries
            && self.child_execution_ids.is_empty()
    }

    /// Wall time between start and completion, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Caller-facing projection of a record with captured output size-capped.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub truncated: bool,
    pub can_retry: bool,
}

impl ExecutionView {
    pub fn from_record(mut record: ExecutionRecord, max_output_bytes: usize) -> Self {
        let mut truncated = false;
        for field in [&mut record.stdout, &mut record.stderr, &mut record.logs] {
            if let Some(text) = field.as_mut() {
                if text.len() > max_output_bytes {
                    let keep = truncate_utf8(text, max_output_bytes).len();
                    text.truncate(keep);
                    truncated = true;
                }
            }
        }
        let can_retry = record.can_retry();
        Self {
            record,
            truncated,
            can_retry,
        }
    }
}

/// Terminal outcome committed by the supervisor, the scheduler or the reaper.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Captured output saved once a sandbox has exited.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
    pub artifacts: Vec<String>,
}

/// Terminal outcomes grouped by status over a time window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusCounts {
    pub counts: BTreeMap<String, i64>,
}

impl StatusCounts {
    pub fn get(&self, status: ExecutionStatus) -> i64 {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }

    pub fn failures(&self) -> i64 {
        ExecutionStatus::TERMINAL
            .iter()
            .filter(|s| s.is_failure())
            .map(|s| self.get(*s))
            .sum()
    }
}

/// Durable source of truth for execution history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord>;

    async fn get_execution(&self, id: &str) -> Result<ExecutionRecord>;

    /// PENDING -> QUEUED. Returns false when the record already moved on.
    async fn mark_queued(&self, id: &str) -> Result<bool>;

    /// PENDING/QUEUED -> RUNNING, persisting the sandbox identity.
    async fn mark_running(
        &self,
        id: &str,
        sandbox_id: &str,
        process_id: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Commit a terminal state. Returns false if the record was already terminal.
    async fn finalize(&self, id: &str, outcome: &Finalization) -> Result<bool>;

    async fn save_output(&self, id: &str, output: &ExecutionOutput) -> Result<()>;

    async fn merge_resource_usage(&self, id: &str, sample: &ResourceUsage) -> Result<()>;

    /// Link `child_id` as the single retry of `parent_id`. Returns false when the
    /// parent already has a retry, so each chain position holds one record.
    async fn claim_retry(&self, parent_id: &str, child_id: &str) -> Result<bool>;

    /// Undo a claim whose retry record was never created.
    async fn release_retry(&self, parent_id: &str, child_id: &str) -> Result<()>;

    /// Records that have not reached a terminal state.
    async fn list_active(&self) -> Result<Vec<ExecutionRecord>>;

    async fn list_recent(
        &self,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Terminal outcomes completed at or after `since`.
    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<StatusCounts>;
}

pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| StorageError::InvalidValue { column, value: s })
        })
        .transpose()
}

const SELECT_COLUMNS: &str = r#"
    id, script_id, script_name, language, executor_id, priority, status,
    parameters, options, created_at, queued_at, started_at, completed_at,
    duration_ms, timeout_seconds, sandbox_id, process_id, exit_code,
    stdout, stderr, logs, error_message, artifacts,
    peak_memory_mb, peak_cpu_percent, disk_mb, network_rx_bytes, network_tx_bytes,
    usage_sampled_at, retry_count, max_retries, retry_reason,
    parent_execution_id, child_execution_ids, metadata
"#;

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database. The connection is pinned so the
    /// schema survives for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_execution(&self, row: &SqliteRow) -> Result<ExecutionRecord> {
        let language: String = row.try_get("language")?;
        let parameters: String = row.try_get("parameters")?;
        let options: String = row.try_get("options")?;
        let artifacts: String = row.try_get("artifacts")?;
        let children: String = row.try_get("child_execution_ids")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(ExecutionRecord {
            id: row.try_get("id")?,
            script_id: row.try_get("script_id")?,
            script_name: row.try_get("script_name")?,
            language: ScriptLanguage::from_str(&language).map_err(|_| {
                StorageError::InvalidValue {
                    column: "language",
                    value: language.clone(),
                }
            })?,
            executor_id: row.try_get("executor_id")?,
            priority: Priority::from_str(&row.try_get::<String, _>("priority")?)?,
            status: ExecutionStatus::from_str(&row.try_get::<String, _>("status")?)?,
            parameters: serde_json::from_str(&parameters)?,
            options: serde_json::from_str(&options)?,
            created_at: parse_ts("created_at", Some(created_at))?.unwrap_or_else(Utc::now),
            queued_at: parse_ts("queued_at", row.try_get("queued_at")?)?,
            started_at: parse_ts("started_at", row.try_get("started_at")?)?,
            completed_at: parse_ts("completed_at", row.try_get("completed_at")?)?,
            duration_ms: row.try_get("duration_ms")?,
            timeout_seconds: row.try_get::<i64, _>("timeout_seconds")?.max(0) as u64,
            sandbox_id: row.try_get("sandbox_id")?,
            process_id: row
                .try_get::<Option<i64>, _>("process_id")?
                .map(|p| p as u32),
            exit_code: row.try_get("exit_code")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            logs: row.try_get("logs")?,
            error_message: row.try_get("error_message")?,
            resource_usage: ResourceUsage {
                peak_memory_mb: row.try_get("peak_memory_mb")?,
                peak_cpu_percent: row.try_get("peak_cpu_percent")?,
                disk_mb: row.try_get("disk_mb")?,
                network_rx_bytes: row
                    .try_get::<Option<i64>, _>("network_rx_bytes")?
                    .map(|b| b.max(0) as u64),
                network_tx_bytes: row
                    .try_get::<Option<i64>, _>("network_tx_bytes")?
                    .map(|b| b.max(0) as u64),
                sampled_at: parse_ts("usage_sampled_at", row.try_get("usage_sampled_at")?)?,
            },
            artifacts: serde_json::from_str(&artifacts)?,
            retry_count: row.try_get::<i64, _>("retry_count")?.max(0) as u32,
            max_retries: row.try_get::<i64, _>("max_retries")?.max(0) as u32,
            retry_reason: row.try_get("retry_reason")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            child_execution_ids: serde_json::from_str(&children)?,
            metadata: row
                .try_get::<Option<String>, _>("metadata")?
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    async fn current_state(&self, id: &str) -> Result<(ExecutionStatus, Option<String>)> {
        let row = sqlx::query("SELECT status, started_at FROM script_executions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let status = ExecutionStatus::from_str(&row.try_get::<String, _>("status")?)?;
        Ok((status, row.try_get("started_at")?))
    }
}

fn status_list(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self, mut record: ExecutionRecord) -> Result<ExecutionRecord> {
        if record.id.is_empty() {
            record.id = format!("exec_{}", uuid::Uuid::new_v4().simple());
        }

        sqlx::query(
            r#"
            INSERT INTO script_executions (
                id, script_id, script_name, language, executor_id, priority, status,
                parameters, options, created_at, queued_at, timeout_seconds,
                retry_count, max_retries, retry_reason, parent_execution_id,
                child_execution_ids, artifacts, metadata
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16,
                ?17, ?18, ?19
            )
            "#,
        )
        .bind(&record.id)
        .bind(&record.script_id)
        .bind(&record.script_name)
        .bind(record.language.as_str())
        .bind(&record.executor_id)
        .bind(record.priority.as_str())
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.parameters)?)
        .bind(serde_json::to_string(&record.options)?)
        .bind(format_ts(&record.created_at))
        .bind(record.queued_at.as_ref().map(format_ts))
        .bind(record.timeout_seconds as i64)
        .bind(record.retry_count as i64)
        .bind(record.max_retries as i64)
        .bind(&record.retry_reason)
        .bind(&record.parent_execution_id)
        .bind(serde_json::to_string(&record.child_execution_ids)?)
        .bind(serde_json::to_string(&record.artifacts)?)
        .bind(
            record
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;

        debug!("Created execution record {}", record.id);
        Ok(record)
    }

    async fn get_execution(&self, id: &str) -> Result<ExecutionRecord> {
        let query = format!("SELECT {} FROM script_executions WHERE id = ?1", SELECT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_execution(&row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn mark_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE script_executions SET status = 'queued', queued_at = ?1 WHERE id = ?2 AND status = 'pending'",
        )
        .bind(format_ts(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(
        &self,
        id: &str,
        sandbox_id: &str,
        process_id: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE script_executions
             SET status = 'running', sandbox_id = ?1, process_id = ?2, started_at = ?3
             WHERE id = ?4 AND status IN ({})",
            status_list(&ExecutionStatus::predecessors(ExecutionStatus::Running))
        );
        let result = sqlx::query(&query)
            .bind(sandbox_id)
            .bind(process_id.map(|p| p as i64))
            .bind(format_ts(&started_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize(&self, id: &str, outcome: &Finalization) -> Result<bool> {
        if !outcome.status.is_terminal() {
            return Err(StorageError::InvalidStatus(format!(
                "{} is not a terminal status",
                outcome.status.as_str()
            )));
        }

        let query = format!(
            "UPDATE script_executions
             SET status = ?1, exit_code = COALESCE(?2, exit_code), error_message = ?3,
                 completed_at = ?4, duration_ms = ?5
             WHERE id = ?6 AND started_at IS ?7 AND status NOT IN ({})",
            status_list(&ExecutionStatus::TERMINAL)
        );

        // A concurrent RUNNING transition changes started_at underneath us;
        // re-read and retry so duration always matches the committed start time.
        for _ in 0..3 {
            let (status, started_raw) = self.current_state(id).await?;
            if status.is_terminal() {
                return Ok(false);
            }
            let started = parse_ts("started_at", started_raw.clone())?;
            let duration_ms = started.map(|s| (outcome.completed_at - s).num_milliseconds().max(0));

            let result = sqlx::query(&query)
                .bind(outcome.status.as_str())
                .bind(outcome.exit_code)
                .bind(&outcome.error_message)
                .bind(format_ts(&outcome.completed_at))
                .bind(duration_ms)
                .bind(id)
                .bind(started_raw)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 1 {
                debug!("Execution {} finalized as {}", id, outcome.status);
                return Ok(true);
            }
        }

        let (status, _) = self.current_state(id).await?;
        if status.is_terminal() {
            Ok(false)
        } else {
            Err(StorageError::InvalidStatus(format!(
                "execution {} kept changing while being finalized",
                id
            )))
        }
    }

    async fn save_output(&self, id: &str, output: &ExecutionOutput) -> Result<()> {
        let result = sqlx::query(
            "UPDATE script_executions SET stdout = ?1, stderr = ?2, logs = ?3, artifacts = ?4 WHERE id = ?5",
        )
        .bind(&output.stdout)
        .bind(&output.stderr)
        .bind(&output.logs)
        .bind(serde_json::to_string(&output.artifacts)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn merge_resource_usage(&self, id: &str, sample: &ResourceUsage) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE script_executions SET
                peak_memory_mb = CASE WHEN ?1 IS NULL THEN peak_memory_mb
                                      ELSE MAX(COALESCE(peak_memory_mb, ?1), ?1) END,
                peak_cpu_percent = CASE WHEN ?2 IS NULL THEN peak_cpu_percent
                                        ELSE MAX(COALESCE(peak_cpu_percent, ?2), ?2) END,
                disk_mb = CASE WHEN ?3 IS NULL THEN disk_mb
                               ELSE MAX(COALESCE(disk_mb, ?3), ?3) END,
                network_rx_bytes = CASE WHEN ?4 IS NULL THEN network_rx_bytes
                                        ELSE MAX(COALESCE(network_rx_bytes, ?4), ?4) END,
                network_tx_bytes = CASE WHEN ?5 IS NULL THEN network_tx_bytes
                                        ELSE MAX(COALESCE(network_tx_bytes, ?5), ?5) END,
                usage_sampled_at = COALESCE(?6, usage_sampled_at)
            WHERE id = ?7
            "#,
        )
        .bind(sample.peak_memory_mb)
        .bind(sample.peak_cpu_percent)
        .bind(sample.disk_mb)
        .bind(sample.network_rx_bytes.map(|b| b as i64))
        .bind(sample.network_tx_bytes.map(|b| b as i64))
        .bind(sample.sampled_at.as_ref().map(format_ts))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_retry(&self, parent_id: &str, child_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE script_executions SET child_execution_ids = ?1
            WHERE id = ?2 AND child_execution_ids = ?3
            "#,
        )
        .bind(serde_json::to_string(&[child_id])?)
        .bind(parent_id)
        .bind(serde_json::to_string(&Vec::<String>::new())?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing parent from one that was already retried.
            self.get_execution(parent_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn release_retry(&self, parent_id: &str, child_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE script_executions SET child_execution_ids = ?1
            WHERE id = ?2 AND child_execution_ids = ?3
            "#,
        )
        .bind(serde_json::to_string(&Vec::<String>::new())?)
        .bind(parent_id)
        .bind(serde_json::to_string(&[child_id])?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ExecutionRecord>> {
        let query = format!(
            "SELECT {} FROM script_executions WHERE status NOT IN ({}) ORDER BY created_at ASC",
            SELECT_COLUMNS,
            status_list(&ExecutionStatus::TERMINAL)
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_execution(row)).collect()
    }

    async fn list_recent(
        &self,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {} FROM script_executions WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                    SELECT_COLUMNS
                );
                sqlx::query(&query)
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM script_executions ORDER BY created_at DESC LIMIT ?1",
                    SELECT_COLUMNS
                );
                sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(|row| self.row_to_execution(row)).collect()
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM script_executions
             WHERE completed_at IS NOT NULL AND completed_at >= ?1
             GROUP BY status",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.counts.insert(status, total);
        }
        Ok(counts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_record(script_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: String::new(),
            script_id: script_id.to_string(),
            script_name: "ping-check".to_string(),
            language: ScriptLanguage::Bash,
            executor_id: "netops".to_string(),
            priority: Priority::Normal,
            status: ExecutionStatus::Pending,
            parameters: BTreeMap::from([("hosts".to_string(), "10.0.0.1".to_string())]),
            options: LaunchOptions::default(),
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            timeout_seconds: 300,
            sandbox_id: None,
            process_id: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            logs: None,
            error_message: None,
            resource_usage: ResourceUsage::default(),
            artifacts: vec![],
            retry_count: 0,
            max_retries: 3,
            retry_reason: None,
            parent_execution_id: None,
            child_execution_ids: vec![],
            metadata: None,
        }
    }

    fn finished(status: ExecutionStatus, exit_code: Option<i32>) -> Finalization {
        Finalization {
            status,
            exit_code,
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Pending));
        assert!(Running.can_transition_to(Killed));
        assert!(!Running.can_transition_to(Queued));
        for terminal in ExecutionStatus::TERMINAL {
            for next in [Pending, Queued, Running, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Timeout.is_failure());
        assert!(!Cancelled.is_failure());
        assert!(!Completed.is_failure());
    }

    #[test]
    fn test_resource_usage_merge_keeps_peaks() {
        let mut usage = ResourceUsage {
            peak_memory_mb: Some(128.0),
            peak_cpu_percent: Some(80.0),
            network_rx_bytes: Some(2048),
            ..Default::default()
        };

        usage.merge(&ResourceUsage {
            peak_memory_mb: Some(64.0),
            peak_cpu_percent: Some(95.5),
            disk_mb: Some(3.0),
            ..Default::default()
        });

        assert_eq!(usage.peak_memory_mb, Some(128.0));
        assert_eq!(usage.peak_cpu_percent, Some(95.5));
        assert_eq!(usage.disk_mb, Some(3.0));
        assert_eq!(usage.network_rx_bytes, Some(2048));
    }

    #[test]
    fn test_view_truncates_on_char_boundary() {
        let mut record = sample_record("script-1");
        record.status = ExecutionStatus::Failed;
        record.stdout = Some("héllo wörld".to_string());
        record.stderr = Some("ok".to_string());

        let view = ExecutionView::from_record(record, 2);
        assert!(view.truncated);
        assert!(view.can_retry);
        assert_eq!(view.record.stdout.as_deref(), Some("h"));
        assert_eq!(view.record.stderr.as_deref(), Some("ok"));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["can_retry"], true);
    }

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let created = store.create_execution(sample_record("script-1")).await.unwrap();
        assert!(created.id.starts_with("exec_"));

        let fetched = store.get_execution(&created.id).await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Pending);
        assert_eq!(fetched.language, ScriptLanguage::Bash);
        assert_eq!(fetched.parameters.get("hosts").map(String::as_str), Some("10.0.0.1"));
        assert!(fetched.duration_ms.is_none());

        let missing = store.get_execution("exec_missing").await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_and_duration() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let created = store.create_execution(sample_record("script-1")).await.unwrap();

        assert!(store.mark_queued(&created.id).await.unwrap());
        assert!(!store.mark_queued(&created.id).await.unwrap());

        let started = Utc::now() - chrono::Duration::seconds(2);
        assert!(store
            .mark_running(&created.id, "sbx-1", Some(4242), started)
            .await
            .unwrap());

        assert!(store
            .finalize(&created.id, &finished(ExecutionStatus::Completed, Some(0)))
            .await
            .unwrap());

        let record = store.get_execution(&created.id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.sandbox_id.as_deref(), Some("sbx-1"));
        assert_eq!(record.process_id, Some(4242));
        assert!(record.duration_ms.unwrap() >= 2000);
    }

    #[tokio::test]
    async fn test_terminal_state_is_committed_once() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let created = store.create_execution(sample_record("script-1")).await.unwrap();

        let mut cancelled = finished(ExecutionStatus::Cancelled, None);
        cancelled.error_message = Some("user requested".to_string());
        assert!(store.finalize(&created.id, &cancelled).await.unwrap());

        let first = store.get_execution(&created.id).await.unwrap();
        assert!(!store
            .finalize(&created.id, &finished(ExecutionStatus::Failed, Some(1)))
            .await
            .unwrap());
        assert!(!store
            .mark_running(&created.id, "sbx-late", None, Utc::now())
            .await
            .unwrap());

        let second = store.get_execution(&created.id).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Cancelled);
        assert_eq!(second.exit_code, None);
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.error_message.as_deref(), Some("user requested"));
        assert!(second.duration_ms.is_none());
    }

    #[tokio::test]
    async fn test_finalize_rejects_non_terminal_status() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let created = store.create_execution(sample_record("script-1")).await.unwrap();
        let result = store
            .finalize(&created.id, &finished(ExecutionStatus::Running, None))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidStatus(_))));
    }

    #[tokio::test]
    async fn test_merge_resource_usage_never_decreases() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let created = store.create_execution(sample_record("script-1")).await.unwrap();

        store
            .merge_resource_usage(
                &created.id,
                &ResourceUsage {
                    peak_memory_mb: Some(200.0),
                    peak_cpu_percent: Some(40.0),
                    network_tx_bytes: Some(10),
                    sampled_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .merge_resource_usage(
                &created.id,
                &ResourceUsage {
                    peak_memory_mb: Some(150.0),
                    peak_cpu_percent: Some(75.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let usage = store.get_execution(&created.id).await.unwrap().resource_usage;
        assert_eq!(usage.peak_memory_mb, Some(200.0));
        assert_eq!(usage.peak_cpu_percent, Some(75.0));
        assert_eq!(usage.network_tx_bytes, Some(10));
        assert!(usage.sampled_at.is_some());
        assert!(usage.disk_mb.is_none());
    }

    #[tokio::test]
    async fn test_children_and_counts() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let parent = store.create_execution(sample_record("script-1")).await.unwrap();
        let child = store.create_execution(sample_record("script-1")).await.unwrap();

        assert!(store.claim_retry(&parent.id, &child.id).await.unwrap());
        assert!(!store.claim_retry(&parent.id, "exec_other").await.unwrap());
        let parent = store.get_execution(&parent.id).await.unwrap();
        assert_eq!(parent.child_execution_ids, vec![child.id.clone()]);
        assert!(!parent.can_retry());

        // Releasing someone else's claim is a no-op.
        store.release_retry(&parent.id, "exec_other").await.unwrap();
        let reloaded = store.get_execution(&parent.id).await.unwrap();
        assert_eq!(reloaded.child_execution_ids, vec![child.id.clone()]);

        assert!(matches!(
            store.claim_retry("exec_missing", &child.id).await,
            Err(StorageError::NotFound(_))
        ));

        store
            .finalize(&parent.id, &finished(ExecutionStatus::Failed, Some(1)))
            .await
            .unwrap();
        store
            .finalize(&child.id, &finished(ExecutionStatus::Completed, Some(0)))
            .await
            .unwrap();

        let counts = store
            .status_counts_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.failures(), 1);
        assert_eq!(counts.get(ExecutionStatus::Completed), 1);

        assert!(store.list_active().await.unwrap().is_empty());
        let failed = store
            .list_recent(10, Some(ExecutionStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }
}
