// ABOUTME: Script registry backed by files on the local disk
// ABOUTME: The script id is the canonical path; content is read fresh on every lookup

use async_trait::async_trait;
use cmdb_executor::scripts::RegistryError;
use cmdb_executor::{Script, ScriptLanguage, ScriptRegistry};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves script ids as file paths so retries from a later invocation
/// still find their script.
#[derive(Debug, Default, Clone)]
pub struct FileScriptRegistry {
    language_override: Option<ScriptLanguage>,
    max_retries: Option<u32>,
}

impl FileScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: Option<ScriptLanguage>) -> Self {
        self.language_override = language;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Canonical id for a script path given on the command line.
    pub fn script_id(path: &Path) -> std::io::Result<String> {
        Ok(std::fs::canonicalize(path)?.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ScriptRegistry for FileScriptRegistry {
    async fn get_script(&self, script_id: &str) -> Result<Option<Script>, RegistryError> {
        let path = PathBuf::from(script_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RegistryError::Unavailable(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let Some(language) = self
            .language_override
            .or_else(|| ScriptLanguage::from_path(&path))
        else {
            return Err(RegistryError::Unavailable(format!(
                "cannot infer the language of {}; pass --language",
                path.display()
            )));
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| script_id.to_string());
        debug!("Loaded {} script {} ({} bytes)", language, name, content.len());

        let mut script = Script::new(script_id, name, language, content);
        script.max_retries = self.max_retries;
        Ok(Some(script))
    }
}
