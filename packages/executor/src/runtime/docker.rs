// ABOUTME: Docker runtime backend for isolated script containers
// ABOUTME: Uses bollard to create hardened containers, follow their logs, wait, kill and sample stats

use super::{
    LaunchedSandbox, ManagedSandbox, OutputChunk, Result, RuntimeError, SandboxExit,
    SandboxRuntime, SandboxStats, StreamType,
};
use crate::spec::{execution_label, managed_label, SandboxSpec};
use crate::workspace::{SANDBOX_LOGS, SANDBOX_OUTPUT, SANDBOX_WORKSPACE};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
        WaitContainerOptions,
    },
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct DockerRuntime {
    client: Docker,
    /// Cache of successfully pulled images to avoid redundant pulls
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

impl DockerRuntime {
    /// Connect with local defaults and a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
        }
    }

    /// Convert a sandbox spec into a hardened bollard container config
    fn to_bollard_config(&self, spec: &SandboxSpec) -> Config<String> {
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.sandbox_path,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = spec
            .env_with_paths(SANDBOX_WORKSPACE, SANDBOX_LOGS, SANDBOX_OUTPUT)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let tmpfs: HashMap<String, String> = spec
            .security
            .tmpfs
            .iter()
            .map(|path| (path.clone(), "rw,noexec,nosuid,size=64m".to_string()))
            .collect();

        let memory_bytes = (spec.limits.memory_mb * 1024 * 1024) as i64;

        let host_config = bollard::models::HostConfig {
            binds: Some(binds),
            memory: Some(memory_bytes),
            // Equal to memory so the container gets no swap.
            memory_swap: Some(memory_bytes),
            nano_cpus: Some((spec.limits.cpu_cores * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.pids_limit as i64),
            cap_drop: Some(spec.security.drop_capabilities.clone()),
            security_opt: spec
                .security
                .no_new_privileges
                .then(|| vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(spec.security.read_only_root),
            tmpfs: Some(tmpfs),
            network_mode: (!spec.network_enabled).then(|| "none".to_string()),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command(SANDBOX_WORKSPACE)),
            env: Some(env),
            user: Some(spec.security.user.clone()),
            working_dir: Some(SANDBOX_WORKSPACE.to_string()),
            labels: Some(labels),
            network_disabled: Some(!spec.network_enabled),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(RuntimeError::Image(e.to_string())),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }
        if self.image_exists(image).await? {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), chrono::Utc::now());
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(RuntimeError::Image(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(RuntimeError::Image(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    /// Forward container logs to the supervisor until the container stops.
    fn follow_logs(&self, container_id: &str) -> mpsc::UnboundedReceiver<OutputChunk> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        };
        let logs = self.client.logs(container_id, Some(options));
        let (tx, rx) = mpsc::unbounded_channel();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(logs);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(log) => {
                        let (stream_type, data) = match log {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => {
                                (StreamType::Stdout, message.to_vec())
                            }
                            _ => continue,
                        };
                        if tx.send(OutputChunk::new(stream_type, data)).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Error streaming logs for {}: {}", container_id, e);
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Resolve the exit of a container once `wait` returns.
    async fn classify_exit(client: &Docker, container_id: &str, code: i64) -> SandboxExit {
        let oom_killed = match client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Failed to inspect container {} after exit: {}", container_id, e);
                false
            }
        };

        if oom_killed {
            SandboxExit::OutOfMemory
        } else if code > 128 && code <= 128 + 64 {
            SandboxExit::Signaled {
                signal: (code - 128) as i32,
            }
        } else {
            SandboxExit::Exited { code: code as i32 }
        }
    }

    fn watch_exit(&self, container_id: &str) -> oneshot::Receiver<SandboxExit> {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let mut wait = client.wait_container(
                &container_id,
                None::<WaitContainerOptions<String>>,
            );
            let exit = match wait.next().await {
                Some(Ok(response)) => {
                    Self::classify_exit(&client, &container_id, response.status_code).await
                }
                // Non-zero exits surface as an error carrying the status code.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Self::classify_exit(&client, &container_id, code).await
                }
                Some(Err(e)) => SandboxExit::Lost {
                    reason: e.to_string(),
                },
                None => SandboxExit::Lost {
                    reason: "wait stream ended without a status".to_string(),
                },
            };
            debug!("Container {} exited: {:?}", container_id, exit);
            let _ = tx.send(exit);
        });

        rx
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn launch(&self, spec: &SandboxSpec) -> Result<LaunchedSandbox> {
        info!("Creating container: {}", spec.name);

        if !self.is_available().await? {
            return Err(RuntimeError::NotAvailable(
                "Docker daemon not responding".to_string(),
            ));
        }
        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| RuntimeError::Launch(e.to_string()))?;

        debug!("Created container: {}", container.id);

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove(&container.id).await;
            return Err(RuntimeError::Launch(e.to_string()));
        }

        let pid = match self.client.inspect_container(&container.id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|s| s.pid)
                .filter(|pid| *pid > 0)
                .map(|pid| pid as u32),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", container.id, e);
                None
            }
        };

        let output = self.follow_logs(&container.id);
        let exit = self.watch_exit(&container.id);

        info!(
            "Started container {} for execution {}",
            container.id, spec.execution_id
        );

        Ok(LaunchedSandbox {
            sandbox_id: container.id,
            pid,
            output,
            exit,
        })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        info!("Killing container: {}", sandbox_id);

        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.client.kill_container(sandbox_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: gone, 409: not running
            Err(e) if is_status(&e, 404) || is_status(&e, 409) => {
                debug!("Container {} already stopped: {}", sandbox_id, e);
                Ok(())
            }
            Err(e) => Err(RuntimeError::Sandbox(e.to_string())),
        }
    }

    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stats_stream = self.client.stats(sandbox_id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => {
                let cpu_delta = stats
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
                let system_delta = stats
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

                let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
                    Some(
                        (cpu_delta as f64 / system_delta as f64)
                            * 100.0
                            * stats.cpu_stats.online_cpus.unwrap_or(1) as f64,
                    )
                } else {
                    None
                };

                let memory_mb = stats
                    .memory_stats
                    .usage
                    .map(|bytes| bytes as f64 / BYTES_PER_MB);

                let (network_rx_bytes, network_tx_bytes) = match stats.networks {
                    Some(networks) => (
                        Some(networks.values().map(|n| n.rx_bytes).sum()),
                        Some(networks.values().map(|n| n.tx_bytes).sum()),
                    ),
                    None => (None, None),
                };

                let disk_mb = stats
                    .blkio_stats
                    .io_service_bytes_recursive
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| e.op.eq_ignore_ascii_case("write"))
                            .map(|e| e.value)
                            .sum::<u64>() as f64
                            / BYTES_PER_MB
                    });

                Ok(SandboxStats {
                    memory_mb,
                    cpu_percent,
                    disk_mb,
                    network_rx_bytes,
                    network_tx_bytes,
                })
            }
            Some(Err(e)) if is_status(&e, 404) => Err(RuntimeError::NotFound(sandbox_id.to_string())),
            Some(Err(e)) => Err(RuntimeError::Sandbox(e.to_string())),
            None => Err(RuntimeError::Sandbox(
                "Failed to get container stats".to_string(),
            )),
        }
    }

    async fn remove(&self, sandbox_id: &str) -> Result<()> {
        debug!("Removing container: {}", sandbox_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(sandbox_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::Sandbox(e.to_string())),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", managed_label())],
        )]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Sandbox(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let sandbox_id = container.id?;
                let execution_id = container
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(&execution_label()).cloned());
                let running = container
                    .state
                    .map(|s| s.eq_ignore_ascii_case("running"))
                    .unwrap_or(false);
                Some(ManagedSandbox {
                    sandbox_id,
                    execution_id,
                    running,
                })
            })
            .collect())
    }
}
