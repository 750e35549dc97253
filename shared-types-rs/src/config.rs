// shared-types-rs/src/config.rs
//
// Environment configuration helpers shared by every component crate.
// Each component builds its own typed Config via from_env() using these
// readers; invalid values fall back to defaults with a logged warning.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Read a string variable with a default.
pub fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read an optional string variable.
pub fn env_opt_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read a parseable variable with a default, warning on parse failure.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T
where
    T: std::fmt::Display + Copy,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!("invalid value in {}, using default {}", name, default);
            default
        }),
        Err(_) => default,
    }
}

/// Read a boolean variable ("1", "true", "yes" are truthy).
pub fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Read a comma-separated list, trimming entries and dropping empties.
pub fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Read a path variable with a default.
pub fn env_path(name: &str, default: &str) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Read a millisecond duration with a default.
pub fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(name, default_ms))
}

/// Read a second duration with a default.
pub fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

/// Operational switch that skips optional diagnostics, warming and
/// background probes across components.
pub fn light_mode() -> bool {
    env_bool("LIGHT_MODE", false)
}
