//! Error types for counter stores and limiter configuration.
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`CounterStore`](crate::store::CounterStore).
///
/// Every variant is recoverable: the failover store absorbs them and the limiter fails open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing medium could not be reached or returned an error.
    #[error("{backend} store unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },
    /// The operation did not finish within its deadline.
    #[error("{operation} timed out after {elapsed:?} (limit: {limit:?})")]
    Timeout { operation: &'static str, elapsed: Duration, limit: Duration },
    /// The store answered with a value that cannot be right (e.g. a negative count).
    #[error("invariant violated for key {key}: {detail}")]
    InvariantViolation { key: String, detail: String },
}

impl StoreError {
    /// Shorthand for an `Unavailable` error.
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable { backend, reason: reason.into() }
    }

    /// Shorthand for an `InvariantViolation` error.
    pub fn invariant(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvariantViolation { key: key.into(), detail: detail.into() }
    }

    /// Check if this error is due to a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the store returned an impossible value
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// Startup-time configuration failure. Never produced on the admission path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown tier '{0}'")]
    UnknownTier(String),
    #[error("tier '{0}' is configured more than once")]
    DuplicateTier(String),
    #[error("tier '{tier}': max_requests must be > 0 (got {provided})")]
    InvalidQuota { tier: String, provided: u64 },
    #[error("tier '{tier}': window duration must be > 0")]
    InvalidWindow { tier: String },
    #[error("tier '{tier}' is missing '{field}'")]
    IncompleteTier { tier: String, field: &'static str },
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: u32 },
    #[error("probe_interval must be > 0 (got {0:?})")]
    InvalidProbeInterval(Duration),
    #[error("{name} must be non-zero and finite (got {value:?})")]
    InvalidTimeout { name: &'static str, value: Duration },
    #[error("unknown store backend '{0}' (expected \"distributed\" or \"memory\")")]
    UnknownBackend(String),
    #[error("invalid value for '{key}': '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("store.url is required when store.backend is \"distributed\"")]
    MissingUrl,
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}
