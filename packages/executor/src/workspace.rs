// ABOUTME: Per-execution filesystem layout under the executor base directory
// ABOUTME: Creates workspace/logs/output directories, collects artifacts and removes the tree

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::settings::ExecutorSettings;

/// Paths as seen from inside a sandbox.
pub const SANDBOX_WORKSPACE: &str = "/workspace";
pub const SANDBOX_LOGS: &str = "/logs";
pub const SANDBOX_OUTPUT: &str = "/output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceLayout {
    /// `<base>/executions/<id>`, removed on cleanup.
    pub root: PathBuf,
    pub workspace_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub output_dir: PathBuf,
    /// `<base>/artifacts/<id>`, survives cleanup.
    pub artifacts_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn for_execution(settings: &ExecutorSettings, execution_id: &str) -> Self {
        let root = settings.executions_dir().join(execution_id);
        Self {
            workspace_dir: root.join("workspace"),
            logs_dir: root.join("logs"),
            output_dir: root.join("output"),
            artifacts_dir: settings.artifacts_dir().join(execution_id),
            root,
        }
    }

    /// Create the directory tree and write the script. Returns the host path of the script.
    pub async fn prepare(&self, script_file: &str, content: &str) -> io::Result<PathBuf> {
        for dir in [&self.workspace_dir, &self.logs_dir, &self.output_dir] {
            fs::create_dir_all(dir).await?;
        }

        // The sandbox user is unprivileged and must be able to write results.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&self.logs_dir, &self.output_dir] {
                fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
            }
            fs::set_permissions(&self.workspace_dir, std::fs::Permissions::from_mode(0o755))
                .await?;
        }

        let script_path = self.workspace_dir.join(script_file);
        fs::write(&script_path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        debug!("Prepared workspace at {}", self.root.display());
        Ok(script_path)
    }

    /// Copy everything the script left in its output and log directories to the
    /// artifact store. Symlinks are skipped.
    pub async fn collect_artifacts(&self) -> io::Result<Vec<String>> {
        let mut collected = Vec::new();
        for (source, label) in [(&self.output_dir, "output"), (&self.logs_dir, "logs")] {
            if fs::metadata(source).await.is_err() {
                continue;
            }
            let target = self.artifacts_dir.join(label);
            copy_tree(source, &target, &mut collected).await?;
        }
        collected.sort();
        Ok(collected)
    }

    /// Remove the per-execution tree. Missing directories are not an error.
    pub async fn cleanup(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!("Removed workspace {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn copy_tree(source: &Path, target: &Path, collected: &mut Vec<String>) -> io::Result<()> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((from_dir, to_dir)) = pending.pop() {
        let mut entries = fs::read_dir(&from_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());

            if file_type.is_symlink() {
                warn!("Skipping symlink in artifacts: {}", from.display());
            } else if file_type.is_dir() {
                pending.push((from, to));
            } else if file_type.is_file() {
                fs::create_dir_all(&to_dir).await?;
                fs::copy(&from, &to).await?;
                collected.push(to.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}
