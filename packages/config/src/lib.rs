// ABOUTME: Shared configuration helpers for the CMDB script executor
// ABOUTME: Environment variable names plus typed readers with logged fallbacks

pub mod constants;

use std::str::FromStr;
use tracing::warn;

/// Read and parse an environment variable, falling back to `default` when the
/// variable is unset or malformed. Malformed values are logged.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("Ignoring invalid flag for {}: {:?}", name, other);
                default
            }
        },
        Err(_) => default,
    }
}

/// Like [`env_or`], but zero also falls back to `default`. For periods that
/// must be positive.
pub fn env_nonzero(name: &str, default: u64) -> u64 {
    match env_or(name, default) {
        0 => {
            warn!("Ignoring zero value for {}; using {}", name, default);
            default
        }
        value => value,
    }
}

/// Read an optional string, treating empty values as unset.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
