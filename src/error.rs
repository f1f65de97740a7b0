//! Error types for call-guard.

use std::time::Duration;

/// Top-level error type for the guard service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Guard error: {0}")]
    Guard(#[from] GuardError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the rule engine and deflection manager to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Backing storage failed or timed out. The dispatcher decides whether to
    /// retry or skip the action; the engine never falls back on its own.
    #[error("Storage unavailable during {operation}: {reason}")]
    StorageUnavailable { operation: String, reason: String },

    #[error("Rule {rule_id} is not usable: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

impl GuardError {
    /// Wrap a storage error for the named operation.
    pub fn storage(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }

    /// A storage call that did not answer within `timeout`.
    pub fn timed_out(operation: &str, timeout: Duration) -> Self {
        Self::StorageUnavailable {
            operation: operation.to_string(),
            reason: format!("timed out after {}ms", timeout.as_millis()),
        }
    }

    /// True when the dispatcher should treat the failure as "storage down".
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

impl From<DatabaseError> for GuardError {
    fn from(err: DatabaseError) -> Self {
        Self::StorageUnavailable {
            operation: "database".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for call-guard.
pub type Result<T> = std::result::Result<T, Error>;
