// ABOUTME: Pre-flight security checks run before any sandbox is allocated
// ABOUTME: Parameter sanitization, static content deny-list and content hash verification

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::error;

use crate::scripts::Script;

pub const MAX_PARAMETER_NAME_LEN: usize = 64;
pub const MAX_PARAMETER_VALUE_BYTES: usize = 4096;

/// Characters that could break out of variable substitution in a shell.
const SHELL_METACHARACTERS: &[char] = &['`', '$', ';', '|', '&', '<', '>', '\\'];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("Invalid parameter name '{0}': must match [A-Za-z_][A-Za-z0-9_]{{0,63}}")]
    InvalidParameterName(String),

    #[error("Parameters '{first}' and '{second}' both map to {env_name}")]
    ConflictingParameters {
        first: String,
        second: String,
        env_name: String,
    },

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameterValue { name: String, reason: String },

    #[error("Script content failed safety check: {0}")]
    UnsafeContent(String),

    #[error("Content hash mismatch for script {0}")]
    HashMismatch(String),
}

impl SecurityError {
    /// Parameter problems are caller input errors rather than policy violations.
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameterName(_)
                | Self::InvalidParameterValue { .. }
                | Self::ConflictingParameters { .. }
        )
    }
}

static DENY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r#"(?m)\brm\s+(-{1,2}[A-Za-z-]+\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(-{1,2}[A-Za-z-]+\s+)*/(\*|\s|$|["'])"#,
            "recursive delete of the root filesystem",
        ),
        (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
        (r"/dev/(tcp|udp)/", "raw network redirection"),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem formatting"),
        (
            r"\bdd\b[^\n]*\bof=/dev/(sd|hd|nvme|xvd|vd)",
            "raw block device write",
        ),
        (r">\s*/dev/(sd|hd|nvme|xvd|vd)[a-z0-9]", "raw block device write"),
        (
            r"\b(curl|wget)\b[^\n]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
            "piping a download into a shell",
        ),
        (r"(?m)\bchmod\s+(-R\s+)?[0-7]?777\s+/(\s|$)", "world-writable root"),
    ]
    .into_iter()
    .filter_map(|(pattern, description)| match Regex::new(pattern) {
        Ok(regex) => Some((regex, description)),
        Err(e) => {
            error!("Invalid content deny pattern {}: {}", pattern, e);
            None
        }
    })
    .collect()
});

/// Validate a parameter name against `[A-Za-z_][A-Za-z0-9_]{0,63}`.
pub fn validate_parameter_name(name: &str) -> Result<(), SecurityError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= MAX_PARAMETER_NAME_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(SecurityError::InvalidParameterName(name.to_string()))
    }
}

pub fn validate_parameter_value(name: &str, value: &str) -> Result<(), SecurityError> {
    let invalid = |reason: String| SecurityError::InvalidParameterValue {
        name: name.to_string(),
        reason,
    };

    if value.len() > MAX_PARAMETER_VALUE_BYTES {
        return Err(invalid(format!(
            "exceeds {} bytes",
            MAX_PARAMETER_VALUE_BYTES
        )));
    }
    if let Some(c) = value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(invalid(format!("contains shell metacharacter '{}'", c)));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(invalid("contains control characters".to_string()));
    }
    Ok(())
}

/// Validate every caller-supplied parameter. Returns the accepted set unchanged.
pub fn sanitize_parameters(
    parameters: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, SecurityError> {
    let mut env_names: HashMap<String, &str> = HashMap::new();
    for (name, value) in parameters {
        validate_parameter_name(name)?;
        validate_parameter_value(name, value)?;

        // Env names are case-folded; two keys must not land on the same variable.
        if let Some(first) = env_names.insert(parameter_env_name(name), name) {
            return Err(SecurityError::ConflictingParameters {
                first: first.to_string(),
                second: name.clone(),
                env_name: parameter_env_name(name),
            });
        }
    }
    Ok(parameters.clone())
}

/// Environment variable name a parameter is exposed under inside the sandbox.
pub fn parameter_env_name(name: &str) -> String {
    format!("PARAM_{}", name.to_ascii_uppercase())
}

/// Reject content matching a known-destructive pattern.
pub fn scan_content(content: &str) -> Result<(), SecurityError> {
    for (regex, description) in DENY_PATTERNS.iter() {
        if let Some(m) = regex.find(content) {
            let line = content[..m.start()].matches('\n').count() + 1;
            return Err(SecurityError::UnsafeContent(format!(
                "{} (line {})",
                description, line
            )));
        }
    }
    Ok(())
}

/// Hex encoded sha-256 of the script body.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Confirm the content has not changed since its hash was recorded.
pub fn verify_content_hash(script: &Script) -> Result<(), SecurityError> {
    if content_hash(&script.content).eq_ignore_ascii_case(script.content_hash.trim()) {
        Ok(())
    } else {
        Err(SecurityError::HashMismatch(script.id.clone()))
    }
}
