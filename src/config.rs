//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::guard::deflection::DEFAULT_CONTEXT_MEMORY_LIMIT;
use crate::guard::urgent::DEFAULT_URGENT_FOLLOWUP_WINDOW_MS;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// libSQL database file, or `:memory:`.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub http_port: u16,
    /// Upper bound on any single storage call.
    pub storage_timeout: Duration,
    /// How often expired conversation states are purged. `None` disables the sweep.
    pub sweep_interval: Option<Duration>,
    /// How long after a direct urgent forward follow-ups still ride along.
    pub urgent_followup_window_ms: i64,
    /// Context lines kept per conversation state.
    pub context_memory_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/call-guard.db"),
            http_port: 8080,
            storage_timeout: Duration::from_millis(2000),
            sweep_interval: Some(Duration::from_secs(300)), // 5 minutes
            urgent_followup_window_ms: DEFAULT_URGENT_FOLLOWUP_WINDOW_MS,
            context_memory_limit: DEFAULT_CONTEXT_MEMORY_LIMIT,
        }
    }
}

impl GuardConfig {
    /// Build config from `CALL_GUARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup. Unparseable values fall back to
    /// the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let db_path = lookup("CALL_GUARD_DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let http_port: u16 = parse_or(&lookup, "CALL_GUARD_HTTP_PORT", defaults.http_port);

        let storage_timeout_ms: u64 = parse_or(
            &lookup,
            "CALL_GUARD_STORAGE_TIMEOUT_MS",
            defaults.storage_timeout.as_millis() as u64,
        );

        let sweep_secs: u64 = parse_or(&lookup, "CALL_GUARD_SWEEP_INTERVAL_SECS", 300);

        let urgent_followup_window_ms: i64 = parse_or(
            &lookup,
            "CALL_GUARD_URGENT_WINDOW_MS",
            defaults.urgent_followup_window_ms,
        );

        let context_memory_limit: usize = parse_or(
            &lookup,
            "CALL_GUARD_CONTEXT_MEMORY_LIMIT",
            defaults.context_memory_limit,
        );

        Self {
            db_path,
            http_port,
            storage_timeout: Duration::from_millis(storage_timeout_ms),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            urgent_followup_window_ms,
            context_memory_limit,
        }
    }

    /// Reject values that parse but make no sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CALL_GUARD_STORAGE_TIMEOUT_MS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.urgent_followup_window_ms < 0 {
            return Err(ConfigError::InvalidValue {
                key: "CALL_GUARD_URGENT_WINDOW_MS".into(),
                message: "must not be negative".into(),
            });
        }
        if self.context_memory_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CALL_GUARD_CONTEXT_MEMORY_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Whether the database lives in memory only.
    pub fn is_memory_db(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Unparseable config value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = GuardConfig::from_lookup(lookup(&[]));
        assert_eq!(config.db_path, PathBuf::from("./data/call-guard.db"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.storage_timeout, Duration::from_millis(2000));
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.urgent_followup_window_ms, 45_000);
        assert_eq!(config.context_memory_limit, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides() {
        let config = GuardConfig::from_lookup(lookup(&[
            ("CALL_GUARD_DB_PATH", ":memory:"),
            ("CALL_GUARD_HTTP_PORT", "9090"),
            ("CALL_GUARD_STORAGE_TIMEOUT_MS", "500"),
            ("CALL_GUARD_SWEEP_INTERVAL_SECS", "0"),
            ("CALL_GUARD_URGENT_WINDOW_MS", "30000"),
            ("CALL_GUARD_CONTEXT_MEMORY_LIMIT", "10"),
        ]));
        assert!(config.is_memory_db());
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.storage_timeout, Duration::from_millis(500));
        assert_eq!(config.sweep_interval, None);
        assert_eq!(config.urgent_followup_window_ms, 30_000);
        assert_eq!(config.context_memory_limit, 10);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = GuardConfig::from_lookup(lookup(&[
            ("CALL_GUARD_HTTP_PORT", "eighty"),
            ("CALL_GUARD_STORAGE_TIMEOUT_MS", "-5"),
        ]));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.storage_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let config = GuardConfig {
            storage_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CALL_GUARD_STORAGE_TIMEOUT_MS"));
    }
}
