//! Limiter configuration.
//!
//! Three sources, all validated the same way:
//! - [`LimiterConfig::from_properties`]: dotted keys such as `store.backend`,
//!   `breaker.failureThreshold`, `window.ai.maxRequests`.
//! - [`LimiterConfig::from_env`]: the same keys as `QUOTAGATE_` environment variables, with `__`
//!   standing in for `.` (`QUOTAGATE_WINDOW__AI__DURATIONMS=3600000`).
//! - [`LimiterConfig::from_json_str`]: a camelCase JSON document.
//!
//! Anything invalid is a [`ConfigError`] at startup; nothing here runs per request.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::policy::{TierPolicy, DEFAULT_KEY_PREFIX};
use crate::rate_limit::RateLimiter;
use crate::store::InMemoryCounterStore;
use crate::timeout::TimeoutPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Prefix for environment variables read by [`LimiterConfig::from_env`].
pub const ENV_PREFIX: &str = "QUOTAGATE_";

const DEFAULT_CONNECTION_TIMEOUT_MILLIS: u64 = 250;
const DEFAULT_OPERATION_TIMEOUT_MILLIS: u64 = 50;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Which counting backend to attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared store as primary, in-memory store as fallback.
    Distributed,
    /// In-memory only; no network calls at all.
    Memory,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distributed" => Ok(Backend::Distributed),
            "memory" => Ok(Backend::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Connection URL of the shared store; required for [`Backend::Distributed`].
    pub url: Option<String>,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    pub key_prefix: String,
    /// `None` derives the interval from the shortest tier window.
    pub sweep_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: None,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MILLIS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MILLIS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            sweep_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
        }
    }
}

/// Everything needed to assemble a limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    pub store: StoreConfig,
    pub breaker: BreakerSettings,
    tiers: Vec<TierPolicy>,
}

impl Default for LimiterConfig {
    /// In-memory backend with the `general`, `admin` and `ai` tiers.
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            breaker: BreakerSettings::default(),
            tiers: vec![TierPolicy::general(), TierPolicy::admin(), TierPolicy::ai()],
        }
    }
}

/// A `window.<tier>.*` entry being assembled from separate keys.
#[derive(Debug, Clone)]
struct PartialTier {
    name: String,
    window: Option<Duration>,
    max_requests: Option<u64>,
}

impl PartialTier {
    fn from_policy(policy: &TierPolicy) -> Self {
        Self {
            name: policy.name().to_string(),
            window: Some(policy.window()),
            max_requests: Some(policy.max_requests()),
        }
    }

    fn finish(self) -> Result<TierPolicy, ConfigError> {
        let window = self
            .window
            .ok_or_else(|| ConfigError::IncompleteTier { tier: self.name.clone(), field: "durationMs" })?;
        let max_requests = self
            .max_requests
            .ok_or_else(|| ConfigError::IncompleteTier { tier: self.name.clone(), field: "maxRequests" })?;
        TierPolicy::new(self.name, window, max_requests)
    }
}

fn parse_number<N: FromStr>(key: &str, value: &str) -> Result<N, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

impl LimiterConfig {
    /// Build from `(key, value)` pairs using the dotted key names. Field segments are
    /// case-insensitive; tier names are kept as written. Unknown keys are ignored.
    pub fn from_properties<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = LimiterConfig::default();
        let mut tiers: Vec<PartialTier> = config.tiers.iter().map(PartialTier::from_policy).collect();

        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref();
            let segments: Vec<&str> = key.split('.').collect();
            let lowered: Vec<String> = segments.iter().map(|s| s.to_ascii_lowercase()).collect();
            let lowered: Vec<&str> = lowered.iter().map(String::as_str).collect();

            match lowered.as_slice() {
                ["store", "backend"] => config.store.backend = value.parse()?,
                ["store", "url"] => config.store.url = Some(value.trim().to_string()),
                ["store", "keyprefix"] => config.store.key_prefix = value.to_string(),
                ["store", "connectiontimeout" | "connectiontimeoutms"] => {
                    config.store.connection_timeout = parse_millis(key, value)?
                }
                ["store", "operationtimeout" | "operationtimeoutms"] => {
                    config.store.operation_timeout = parse_millis(key, value)?
                }
                ["store", "sweepinterval" | "sweepintervalms"] => {
                    config.store.sweep_interval = Some(parse_millis(key, value)?)
                }
                ["breaker", "failurethreshold"] => {
                    config.breaker.failure_threshold = parse_number(key, value)?
                }
                ["breaker", "probeinterval" | "probeintervalms"] => {
                    config.breaker.probe_interval = parse_millis(key, value)?
                }
                ["window", _, field @ ("durationms" | "maxrequests")] => {
                    let name = segments[1];
                    let idx = match tiers.iter().position(|t| t.name == name) {
                        Some(idx) => idx,
                        None => {
                            tiers.push(PartialTier { name: name.to_string(), window: None, max_requests: None });
                            tiers.len() - 1
                        }
                    };
                    if *field == "durationms" {
                        tiers[idx].window = Some(parse_millis(key, value)?);
                    } else {
                        tiers[idx].max_requests = Some(parse_number(key, value)?);
                    }
                }
                _ => tracing::debug!(key, "ignoring unrecognized limiter config key"),
            }
        }

        config.tiers = tiers.into_iter().map(PartialTier::finish).collect::<Result<_, _>>()?;
        config.validate()?;
        Ok(config)
    }

    /// Read `QUOTAGATE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list.
    pub fn from_env_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let pairs = vars.into_iter().filter_map(|(name, value)| {
            let rest = name.strip_prefix(ENV_PREFIX)?;
            Some((rest.to_ascii_lowercase().replace("__", "."), value))
        });
        Self::from_properties(pairs)
    }

    /// Parse a JSON document, e.g.
    /// `{"store":{"backend":"distributed","url":"redis://cache/"},"tiers":[{"name":"ai","durationMs":3600000,"maxRequests":50}]}`.
    /// Omitted sections keep their defaults; a `tiers` array replaces the default tiers.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let mut config = LimiterConfig::default();

        if let Some(backend) = raw.store.backend {
            config.store.backend = backend;
        }
        if raw.store.url.is_some() {
            config.store.url = raw.store.url;
        }
        if let Some(prefix) = raw.store.key_prefix {
            config.store.key_prefix = prefix;
        }
        if let Some(ms) = raw.store.connection_timeout_ms {
            config.store.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.store.operation_timeout_ms {
            config.store.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.store.sweep_interval_ms {
            config.store.sweep_interval = Some(Duration::from_millis(ms));
        }
        if let Some(threshold) = raw.breaker.failure_threshold {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = raw.breaker.probe_interval_ms {
            config.breaker.probe_interval = Duration::from_millis(ms);
        }
        if let Some(tiers) = raw.tiers {
            config.tiers = tiers;
        }

        config.validate()?;
        Ok(config)
    }

    /// Replace the tier list.
    pub fn with_tiers(mut self, tiers: impl IntoIterator<Item = TierPolicy>) -> Self {
        self.tiers = tiers.into_iter().collect();
        self
    }

    /// Run every startup check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        TimeoutPolicy::new(self.store.connection_timeout).map_err(|_| ConfigError::InvalidTimeout {
            name: "store.connectionTimeout",
            value: self.store.connection_timeout,
        })?;
        TimeoutPolicy::new(self.store.operation_timeout).map_err(|_| ConfigError::InvalidTimeout {
            name: "store.operationTimeout",
            value: self.store.operation_timeout,
        })?;
        if self.store.sweep_interval == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidTimeout {
                name: "store.sweepInterval",
                value: Duration::ZERO,
            });
        }
        self.breaker_config()?;
        if self.store.backend == Backend::Distributed
            && self.store.url.as_deref().map(str::trim).unwrap_or_default().is_empty()
        {
            return Err(ConfigError::MissingUrl);
        }
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.name()) {
                return Err(ConfigError::DuplicateTier(tier.name().to_string()));
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfig::new(self.breaker.failure_threshold, self.breaker.probe_interval)
    }

    /// Tier policies with the store's key prefix applied.
    pub fn tier_policies(&self) -> Vec<TierPolicy> {
        self.tiers.iter().cloned().map(|t| t.with_key_prefix(self.store.key_prefix.clone())).collect()
    }

    /// Explicit sweep interval, or a quarter of the shortest window (at least one second).
    pub fn sweep_interval(&self) -> Duration {
        if let Some(interval) = self.store.sweep_interval {
            return interval;
        }
        self.tiers
            .iter()
            .map(|t| t.window() / 4)
            .min()
            .unwrap_or(MIN_SWEEP_INTERVAL)
            .max(MIN_SWEEP_INTERVAL)
    }

    /// In-memory store with its sweeper running. Call from inside a tokio runtime.
    pub fn memory_store(&self) -> InMemoryCounterStore {
        InMemoryCounterStore::new().with_sweeper(self.sweep_interval())
    }

    /// A single-process limiter over the in-memory store, ignoring `store.backend`.
    pub fn build_local(&self) -> Result<RateLimiter<InMemoryCounterStore>, ConfigError> {
        self.validate()?;
        RateLimiter::builder(self.memory_store()).tiers(self.tier_policies()).build()
    }
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawConfig {
    store: RawStore,
    breaker: RawBreaker,
    tiers: Option<Vec<TierPolicy>>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawStore {
    backend: Option<Backend>,
    url: Option<String>,
    key_prefix: Option<String>,
    connection_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawBreaker {
    failure_threshold: Option<u32>,
    probe_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier<'a>(config: &'a LimiterConfig, name: &str) -> &'a TierPolicy {
        config.tiers.iter().find(|t| t.name() == name).expect("tier present")
    }

    #[test]
    fn defaults_are_valid() {
        let config = LimiterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.backend, Backend::Memory);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.tier_policies().len(), 3);
    }

    #[test]
    fn properties_override_and_extend_tiers() {
        let config = LimiterConfig::from_properties([
            ("store.backend", "distributed"),
            ("store.url", "redis://127.0.0.1/"),
            ("store.operationTimeout", "20"),
            ("breaker.failureThreshold", "5"),
            ("breaker.probeInterval", "10000"),
            ("window.ai.maxRequests", "10"),
            ("window.reports.durationMs", "60000"),
            ("window.reports.maxRequests", "5"),
            ("unrelated.key", "whatever"),
        ])
        .unwrap();

        assert_eq!(config.store.backend, Backend::Distributed);
        assert_eq!(config.store.operation_timeout, Duration::from_millis(20));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.probe_interval, Duration::from_secs(10));
        assert_eq!(tier(&config, "ai").max_requests(), 10);
        assert_eq!(tier(&config, "ai").window(), Duration::from_secs(3600));
        assert_eq!(tier(&config, "reports").max_requests(), 5);
    }

    #[test]
    fn new_tier_needs_both_fields() {
        let err = LimiterConfig::from_properties([("window.reports.maxRequests", "5")]).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteTier { field: "durationMs", .. }));
    }

    #[test]
    fn zero_quota_fails_fast() {
        let err = LimiterConfig::from_properties([("window.general.maxRequests", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidQuota { .. }));
    }

    #[test]
    fn garbage_numbers_are_reported_with_their_key() {
        let err = LimiterConfig::from_properties([("breaker.failureThreshold", "lots")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "breaker.failureThreshold");
                assert_eq!(value, "lots");
            }
            e => panic!("expected InvalidValue, got {:?}", e),
        }
    }

    #[test]
    fn distributed_backend_requires_a_url() {
        let err = LimiterConfig::from_properties([("store.backend", "distributed")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUrl));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = LimiterConfig::from_properties([("store.backend", "etcd")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(b) if b == "etcd"));
    }

    #[test]
    fn zero_breaker_threshold_is_rejected() {
        let err = LimiterConfig::from_properties([("breaker.failureThreshold", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFailureThreshold { provided: 0 }));
    }

    #[test]
    fn env_vars_map_onto_dotted_keys() {
        let config = LimiterConfig::from_env_vars(vec![
            ("QUOTAGATE_STORE__BACKEND".to_string(), "memory".to_string()),
            ("QUOTAGATE_WINDOW__GENERAL__MAXREQUESTS".to_string(), "250".to_string()),
            ("QUOTAGATE_BREAKER__PROBEINTERVALMS".to_string(), "5000".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
        .unwrap();
        assert_eq!(tier(&config, "general").max_requests(), 250);
        assert_eq!(config.breaker.probe_interval, Duration::from_secs(5));
    }

    #[test]
    fn json_replaces_tiers_and_keeps_other_defaults() {
        let config = LimiterConfig::from_json_str(
            r#"{
                "store": { "backend": "distributed", "url": "redis://cache:6379/", "keyPrefix": "app:" },
                "breaker": { "failureThreshold": 4 },
                "tiers": [ { "name": "ai", "durationMs": 3600000, "maxRequests": 50 } ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.breaker.failure_threshold, 4);
        assert_eq!(config.breaker.probe_interval, Duration::from_secs(30));
        let policies = config.tier_policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].key_prefix(), "app:");
    }

    #[test]
    fn json_rejects_duplicate_tiers() {
        let err = LimiterConfig::from_json_str(
            r#"{ "tiers": [
                { "name": "ai", "durationMs": 1000, "maxRequests": 1 },
                { "name": "ai", "durationMs": 2000, "maxRequests": 2 }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTier(_)));
    }

    #[test]
    fn sweep_interval_tracks_the_shortest_window() {
        let config = LimiterConfig::default();
        assert_eq!(config.sweep_interval(), Duration::from_secs(225));

        let tiny = LimiterConfig::default()
            .with_tiers([TierPolicy::new("burst", Duration::from_millis(400), 3).unwrap()]);
        assert_eq!(tiny.sweep_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn build_local_produces_a_working_limiter() {
        let limiter = LimiterConfig::default().build_local().unwrap();
        let ai = limiter.tier("ai").unwrap();
        assert_eq!(limiter.admit("u1", &ai).await.remaining, 49);
        limiter.store().shutdown();
    }
}
