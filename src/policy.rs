//! Quota classes.

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Key prefix used when a policy does not name one.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// One quota class: at most `max_requests` per `window` for each identity.
///
/// Immutable once built; construct through [`TierPolicy::new`] so the quota and window are
/// checked at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTierPolicy")]
pub struct TierPolicy {
    name: String,
    window: Duration,
    max_requests: u64,
    key_prefix: String,
}

impl TierPolicy {
    /// Errors if `max_requests` == 0 or `window` == 0.
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max_requests: u64,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if max_requests == 0 {
            return Err(ConfigError::InvalidQuota { tier: name, provided: max_requests });
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow { tier: name });
        }
        Ok(Self { name, window, max_requests, key_prefix: DEFAULT_KEY_PREFIX.to_string() })
    }

    /// Override the counter key prefix (e.g. to namespace several deployments in one store).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// General API traffic: 100 requests per 15 minutes.
    pub fn general() -> Self {
        Self::preset("general", Duration::from_secs(15 * 60), 100)
    }

    /// Administrative traffic: 50 requests per 15 minutes.
    pub fn admin() -> Self {
        Self::preset("admin", Duration::from_secs(15 * 60), 50)
    }

    /// Expensive AI-backed traffic: 50 requests per hour.
    pub fn ai() -> Self {
        Self::preset("ai", Duration::from_secs(60 * 60), 50)
    }

    fn preset(name: &str, window: Duration, max_requests: u64) -> Self {
        Self {
            name: name.to_string(),
            window,
            max_requests,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTierPolicy {
    name: String,
    duration_ms: u64,
    max_requests: u64,
    key_prefix: Option<String>,
}

impl TryFrom<RawTierPolicy> for TierPolicy {
    type Error = ConfigError;

    fn try_from(raw: RawTierPolicy) -> Result<Self, Self::Error> {
        let policy = TierPolicy::new(raw.name, Duration::from_millis(raw.duration_ms), raw.max_requests)?;
        Ok(match raw.key_prefix {
            Some(prefix) => policy.with_key_prefix(prefix),
            None => policy,
        })
    }
}
