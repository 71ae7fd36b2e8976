//! Convenient re-exports for common quotagate types.
pub use crate::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    config::LimiterConfig,
    error::{ConfigError, StoreError},
    policy::TierPolicy,
    rate_limit::{AdmissionError, AdmissionLayer, Decision, RateLimiter, Tier},
    store::{CounterStore, FailoverCounterStore, InMemoryCounterStore},
    telemetry::{LogSink, NullSink},
};
