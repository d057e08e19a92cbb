// ABOUTME: Script metadata consumed by the executor and the registry seam it is read through
// ABOUTME: Includes an in-memory registry used by the CLI and tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::security::content_hash;
use crate::storage::ResourceLimitOverrides;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Script registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Python,
    Bash,
    Node,
    PowerShell,
}

impl ScriptLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Bash => "bash",
            Self::Node => "node",
            Self::PowerShell => "powershell",
        }
    }

    /// File extension used when the script is written into the workspace.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Bash => "sh",
            Self::Node => "js",
            Self::PowerShell => "ps1",
        }
    }

    /// Interpreter invocation; the script path is appended as the final argument.
    pub fn interpreter(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["python3", "-u"],
            Self::Bash => &["bash"],
            Self::Node => &["node"],
            Self::PowerShell => &["pwsh", "-NoLogo", "-NonInteractive", "-File"],
        }
    }

    /// Guess the language from a file name.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "sh" | "bash" => Some(Self::Bash),
            "js" | "mjs" => Some(Self::Node),
            "ps1" => Some(Self::PowerShell),
            _ => None,
        }
    }
}

impl FromStr for ScriptLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "python3" => Ok(Self::Python),
            "bash" | "shell" | "sh" => Ok(Self::Bash),
            "node" | "javascript" | "nodejs" => Ok(Self::Node),
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            other => Err(format!("unsupported script language: {}", other)),
        }
    }
}

impl std::fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a stored script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub language: ScriptLanguage,
    pub content: String,
    /// Hex sha-256 of `content` as recorded when the script was uploaded.
    pub content_hash: String,
    pub is_active: bool,
    pub is_executable: bool,
    pub default_limits: ResourceLimitOverrides,
    pub max_execution_time_secs: Option<u64>,
    pub estimated_execution_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Script {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        language: ScriptLanguage,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            name: name.into(),
            language,
            content_hash: content_hash(&content),
            content,
            is_active: true,
            is_executable: true,
            default_limits: ResourceLimitOverrides::default(),
            max_execution_time_secs: None,
            estimated_execution_secs: None,
            max_retries: None,
        }
    }

    pub fn with_max_execution_time(mut self, secs: u64) -> Self {
        self.max_execution_time_secs = Some(secs);
        self
    }

    pub fn with_estimated_execution_time(mut self, secs: u64) -> Self {
        self.estimated_execution_secs = Some(secs);
        self
    }

    pub fn with_default_limits(mut self, limits: ResourceLimitOverrides) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Source of script metadata.
#[async_trait]
pub trait ScriptRegistry: Send + Sync {
    async fn get_script(&self, script_id: &str) -> Result<Option<Script>, RegistryError>;
}

#[derive(Default)]
pub struct InMemoryScriptRegistry {
    scripts: RwLock<HashMap<String, Script>>,
}

impl InMemoryScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, script: Script) {
        let mut scripts = self.scripts.write().await;
        scripts.insert(script.id.clone(), script);
    }

    pub async fn remove(&self, script_id: &str) -> Option<Script> {
        self.scripts.write().await.remove(script_id)
    }
}

#[async_trait]
impl ScriptRegistry for InMemoryScriptRegistry {
    async fn get_script(&self, script_id: &str) -> Result<Option<Script>, RegistryError> {
        Ok(self.scripts.read().await.get(script_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("Python".parse::<ScriptLanguage>(), Ok(ScriptLanguage::Python));
        assert_eq!("pwsh".parse::<ScriptLanguage>(), Ok(ScriptLanguage::PowerShell));
        assert!("cobol".parse::<ScriptLanguage>().is_err());
        assert_eq!(
            ScriptLanguage::from_path(std::path::Path::new("checks/ping.sh")),
            Some(ScriptLanguage::Bash)
        );
        assert_eq!(ScriptLanguage::Node.extension(), "js");
    }

    #[tokio::test]
    async fn test_in_memory_registry() {
        let registry = InMemoryScriptRegistry::new();
        registry
            .register(Script::new("s1", "hello", ScriptLanguage::Bash, "echo hello"))
            .await;

        let script = registry.get_script("s1").await.unwrap().unwrap();
        assert_eq!(script.content_hash, content_hash("echo hello"));
        assert!(registry.get_script("missing").await.unwrap().is_none());

        registry.remove("s1").await;
        assert!(registry.get_script("s1").await.unwrap().is_none());
    }
}
