#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Tiered fixed-window admission control for async Rust services.
//!
//! ## Features
//!
//! - **Tier policies**: named quotas such as "100 requests per 15 minutes", resolved at startup
//! - **Pluggable counting** behind the [`CounterStore`] trait
//! - **In-memory store** with background sweeping of expired windows
//! - **Failover store** that counts in a shared backend and falls back to local memory
//!   through a circuit breaker
//! - **Fail-open admission**: a broken store never turns into rejected traffic
//! - **Tower middleware** via [`AdmissionLayer`]
//!
//! The shared Redis backend lives in the `quotagate-redis` crate.
//!
//! ## Quick Start
//!
//! ```rust
//! use quotagate::{InMemoryCounterStore, RateLimiter, TierPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::builder(InMemoryCounterStore::new())
//!         .tiers([TierPolicy::general(), TierPolicy::ai()])
//!         .build()
//!         .expect("tier names are unique");
//!     let ai = limiter.tier("ai").expect("ai tier is configured");
//!
//!     let decision = limiter.admit("user-42", &ai).await;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.remaining, 49);
//! }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Backend, BreakerSettings, LimiterConfig, StoreConfig};
pub use error::{ConfigError, StoreError};
pub use policy::TierPolicy;
pub use rate_limit::{
    AdmissionError, AdmissionLayer, AdmissionService, Decision, RateLimiter, RateLimiterBuilder,
    RejectionBody, Tier,
};
pub use store::{
    CounterKey, CounterStore, FailoverCounterStore, InMemoryCounterStore, WindowCount,
};
pub use telemetry::{AdmissionTally, LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use timeout::TimeoutPolicy;
