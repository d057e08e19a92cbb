// ABOUTME: Shared fixtures for executor integration tests
// ABOUTME: A scriptable in-memory sandbox runtime plus a scheduler harness over in-memory SQLite

#![allow(dead_code)]

use async_trait::async_trait;
use cmdb_executor::runtime::{
    LaunchedSandbox, ManagedSandbox, OutputChunk, RuntimeError, SandboxExit, SandboxRuntime,
    SandboxStats, StreamType,
};
use cmdb_executor::spec::{SandboxSpec, LABEL_PREFIX};
use cmdb_executor::{
    ExecutionRecord, ExecutionScheduler, ExecutionStore, ExecutorSettings,
    InMemoryScriptRegistry, Script, ScriptLanguage, SqliteExecutionStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

/// What a mock sandbox does for a given script.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `None` keeps the sandbox running until it is killed.
    pub exit: Option<SandboxExit>,
    pub delay: Duration,
    pub fail_launch: bool,
    /// Returned by successive stats calls; the last one repeats.
    pub stats: Vec<SandboxStats>,
}

impl MockBehavior {
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(SandboxExit::Exited { code }),
            ..Default::default()
        }
    }

    pub fn hangs() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, line: &str) -> Self {
        self.stdout.push(line.to_string());
        self
    }

    pub fn with_stderr(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct MockSandbox {
    execution_id: String,
    running: bool,
    kill_tx: Option<oneshot::Sender<()>>,
    stats: VecDeque<SandboxStats>,
    last_stats: SandboxStats,
}

#[derive(Default)]
pub struct MockRuntime {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    sandboxes: Arc<Mutex<HashMap<String, MockSandbox>>>,
    strays: Mutex<Vec<ManagedSandbox>>,
    pub launches: AtomicUsize,
    pub kills: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn set_behavior(&self, script_id: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(script_id.to_string(), behavior);
    }

    /// A managed sandbox the engine does not know about.
    pub fn add_stray(&self, sandbox_id: &str, execution_id: Option<&str>) {
        self.strays.lock().unwrap().push(ManagedSandbox {
            sandbox_id: sandbox_id.to_string(),
            execution_id: execution_id.map(str::to_string),
            running: true,
        });
    }

    pub fn killed(&self, sandbox_id: &str) -> bool {
        self.kills.lock().unwrap().iter().any(|id| id == sandbox_id)
    }

    pub fn was_removed(&self, sandbox_id: &str) -> bool {
        self.removed.lock().unwrap().iter().any(|id| id == sandbox_id)
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn launch(&self, spec: &SandboxSpec) -> Result<LaunchedSandbox, RuntimeError> {
        let script_id = spec
            .labels
            .get(&format!("{}.script_id", LABEL_PREFIX))
            .cloned()
            .unwrap_or_default();
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&script_id)
            .cloned()
            .unwrap_or_else(|| MockBehavior::exits(0));

        if behavior.fail_launch {
            return Err(RuntimeError::Launch("mock image unavailable".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let sandbox_id = format!("mock-{}", spec.execution_id);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.sandboxes.lock().unwrap().insert(
            sandbox_id.clone(),
            MockSandbox {
                execution_id: spec.execution_id.clone(),
                running: true,
                kill_tx: Some(kill_tx),
                stats: behavior.stats.iter().cloned().collect(),
                last_stats: SandboxStats::default(),
            },
        );

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let sandboxes = self.sandboxes.clone();
        let watched_id = sandbox_id.clone();

        tokio::spawn(async move {
            for line in &behavior.stdout {
                let _ = output_tx.send(OutputChunk::new(StreamType::Stdout, line.as_bytes().to_vec()));
            }
            for line in &behavior.stderr {
                let _ = output_tx.send(OutputChunk::new(StreamType::Stderr, line.as_bytes().to_vec()));
            }

            let exit = match behavior.exit {
                Some(exit) => tokio::select! {
                    _ = tokio::time::sleep(behavior.delay) => exit,
                    _ = kill_rx => SandboxExit::Signaled { signal: 9 },
                },
                None => {
                    let _ = kill_rx.await;
                    SandboxExit::Signaled { signal: 9 }
                }
            };

            drop(output_tx);
            if let Some(sandbox) = sandboxes.lock().unwrap().get_mut(&watched_id) {
                sandbox.running = false;
            }
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedSandbox {
            sandbox_id,
            pid: Some(4242),
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        self.kills.lock().unwrap().push(sandbox_id.to_string());
        if let Some(sandbox) = self.sandboxes.lock().unwrap().get_mut(sandbox_id) {
            if let Some(kill_tx) = sandbox.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
        Ok(())
    }

    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats, RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| RuntimeError::NotFound(sandbox_id.to_string()))?;
        if let Some(next) = sandbox.stats.pop_front() {
            sandbox.last_stats = next;
        }
        Ok(sandbox.last_stats.clone())
    }

    async fn remove(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        self.removed.lock().unwrap().push(sandbox_id.to_string());
        self.sandboxes.lock().unwrap().remove(sandbox_id);
        self.strays
            .lock()
            .unwrap()
            .retain(|stray| stray.sandbox_id != sandbox_id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>, RuntimeError> {
        let mut managed: Vec<ManagedSandbox> = self
            .sandboxes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, sandbox)| ManagedSandbox {
                sandbox_id: id.clone(),
                execution_id: Some(sandbox.execution_id.clone()),
                running: sandbox.running,
            })
            .collect();
        managed.extend(self.strays.lock().unwrap().iter().cloned());
        Ok(managed)
    }
}

pub struct Harness {
    pub scheduler: ExecutionScheduler,
    pub store: Arc<SqliteExecutionStore>,
    pub scripts: Arc<InMemoryScriptRegistry>,
    pub runtime: Arc<MockRuntime>,
    pub dir: TempDir,
}

pub fn test_settings(dir: &TempDir) -> ExecutorSettings {
    ExecutorSettings {
        base_dir: dir.path().to_path_buf(),
        resource_poll_interval: Duration::from_millis(20),
        resource_poll_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

pub async fn harness_with(configure: impl FnOnce(&mut ExecutorSettings)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut settings = test_settings(&dir);
    configure(&mut settings);

    let store = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
    let scripts = Arc::new(InMemoryScriptRegistry::new());
    let runtime = Arc::new(MockRuntime::default());
    let scheduler = ExecutionScheduler::new(
        settings,
        store.clone(),
        scripts.clone(),
        runtime.clone(),
    );

    Harness {
        scheduler,
        store,
        scripts,
        runtime,
        dir,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

impl Harness {
    /// Register a bash script whose sandbox behaves as described.
    pub async fn script(&self, script_id: &str, behavior: MockBehavior) -> Script {
        let script = bash_script(script_id, "echo checking\n");
        self.scripts.register(script.clone()).await;
        self.runtime.set_behavior(script_id, behavior);
        script
    }
}

pub fn bash_script(script_id: &str, content: &str) -> Script {
    Script::new(script_id, format!("{} script", script_id), ScriptLanguage::Bash, content)
}

/// Poll the store until the execution is terminal.
pub async fn wait_for_terminal(store: &SqliteExecutionStore, id: &str) -> ExecutionRecord {
    for _ in 0..500 {
        let record = store.get_execution(id).await.unwrap();
        if record.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {} never reached a terminal state", id);
}

/// Poll until `check` holds for the stored record.
pub async fn wait_for(
    store: &SqliteExecutionStore,
    id: &str,
    check: impl Fn(&ExecutionRecord) -> bool,
) -> ExecutionRecord {
    for _ in 0..500 {
        let record = store.get_execution(id).await.unwrap();
        if check(&record) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {} never reached the expected state", id);
}

/// Poll until the scheduler holds no slots.
pub async fn wait_for_idle(scheduler: &ExecutionScheduler) {
    for _ in 0..500 {
        if scheduler.count_running().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scheduler never drained");
}
