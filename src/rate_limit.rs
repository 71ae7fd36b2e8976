//! Fixed-window admission control.
//!
//! - [`RateLimiter`]: applies a [`TierPolicy`] to a [`CounterStore`] and returns a [`Decision`].
//! - [`Tier`]: a tier handle resolved once at startup, so a typo in a tier name fails the boot,
//!   not a request.
//! - [`AdmissionLayer`]: tower middleware that asks the limiter before calling the inner service.
//!
//! # Architecture
//!
//! - **Middleware** only knows how to extract an identity and whom to ask.
//! - **Limiter** does the quota arithmetic and never fails: store errors become a fail-open
//!   admission.
//! - **Storage** (`store` module) owns the counters and their atomicity.

use crate::error::{ConfigError, StoreError};
use crate::policy::TierPolicy;
use crate::store::{CounterKey, CounterStore, WindowCount};
use crate::telemetry::{emit_best_effort, AdmissionEvent, LimiterEvent, NullSink, TelemetrySink};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionService};

/// Message returned to rejected callers.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// The decision returned by a rate limiter. Computed per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window. Useful for `X-RateLimit-Remaining` headers.
    pub remaining: u64,
    /// How long to wait before retrying; zero when allowed. Useful for `Retry-After` headers.
    pub retry_after: Duration,
    /// Counter value after this request.
    pub current_count: u64,
    /// The tier's quota. Useful for `X-RateLimit-Limit` headers.
    pub limit: u64,
}

impl Decision {
    fn from_count(policy: &TierPolicy, got: WindowCount) -> Self {
        let limit = policy.max_requests();
        let allowed = got.count <= limit;
        Self {
            allowed,
            remaining: limit.saturating_sub(got.count),
            retry_after: if allowed { Duration::ZERO } else { got.ttl_remaining },
            current_count: got.count,
            limit,
        }
    }

    fn fail_open(policy: &TierPolicy) -> Self {
        let limit = policy.max_requests();
        Self { allowed: true, remaining: limit, retry_after: Duration::ZERO, current_count: 0, limit }
    }

    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// `retry_after` rounded up to whole seconds; at least 1 for a rejection.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded.max(1)
    }

    /// Response headers for any outcome; `Retry-After` only on rejection.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }

    /// JSON body for a `429`; `None` when the request was allowed.
    pub fn rejection_body(&self) -> Option<RejectionBody> {
        (!self.allowed).then(|| RejectionBody {
            success: false,
            message: REJECTION_MESSAGE.to_string(),
            retry_after: self.retry_after_secs(),
        })
    }
}

/// Body sent with a `429 Too Many Requests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
    /// Seconds.
    pub retry_after: u64,
}

/// Handle to a configured tier. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier(Arc<TierPolicy>);

impl Tier {
    pub fn policy(&self) -> &TierPolicy {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    fn key(&self, identity: &str) -> CounterKey {
        CounterKey::derive(self.0.key_prefix(), self.0.name(), identity)
    }
}

/// Collects tiers for a [`RateLimiter`]; [`build`](RateLimiterBuilder::build) validates them.
#[derive(Debug)]
pub struct RateLimiterBuilder<S> {
    store: S,
    tiers: Vec<TierPolicy>,
}

impl<S> RateLimiterBuilder<S>
where
    S: CounterStore,
{
    pub fn tier(mut self, policy: TierPolicy) -> Self {
        self.tiers.push(policy);
        self
    }

    pub fn tiers(mut self, policies: impl IntoIterator<Item = TierPolicy>) -> Self {
        self.tiers.extend(policies);
        self
    }

    /// Errors on duplicate tier names.
    pub fn build(self) -> Result<RateLimiter<S>, ConfigError> {
        let mut tiers = HashMap::with_capacity(self.tiers.len());
        for policy in self.tiers {
            let name = policy.name().to_string();
            if tiers.insert(name.clone(), Tier(Arc::new(policy))).is_some() {
                return Err(ConfigError::DuplicateTier(name));
            }
        }
        Ok(RateLimiter { store: Arc::new(self.store), tiers: Arc::new(tiers), sink: NullSink })
    }
}

/// Orchestrates tier policies against a counter store.
///
/// Clones share the store and the tier table.
pub struct RateLimiter<S, T = NullSink> {
    store: Arc<S>,
    tiers: Arc<HashMap<String, Tier>>,
    sink: T,
}

impl<S> RateLimiter<S>
where
    S: CounterStore,
{
    pub fn builder(store: S) -> RateLimiterBuilder<S> {
        RateLimiterBuilder { store, tiers: Vec::new() }
    }
}

impl<S, T> RateLimiter<S, T> {
    /// Attach a telemetry sink for admission events.
    pub fn with_sink<U>(self, sink: U) -> RateLimiter<S, U>
    where
        U: TelemetrySink,
    {
        RateLimiter { store: self.store, tiers: self.tiers, sink }
    }

    /// Resolve a tier by name. Call at startup; unknown names are a configuration error.
    pub fn tier(&self, name: &str) -> Result<Tier, ConfigError> {
        self.tiers.get(name).cloned().ok_or_else(|| ConfigError::UnknownTier(name.to_string()))
    }

    /// All configured tiers, in no particular order.
    pub fn tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, T> RateLimiter<S, T>
where
    S: CounterStore,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Count one request from `identity` against `tier` and decide whether it may proceed.
    ///
    /// Never fails. If the store cannot produce a count the request is admitted
    /// (fail-open) and a warning is logged.
    pub async fn admit(&self, identity: &str, tier: &Tier) -> Decision {
        let policy = tier.policy();
        let key = tier.key(identity);

        let (decision, event) = match self.store.increment_and_get(&key, policy.window()).await {
            Ok(got) if got.count > 0 => {
                let decision = Decision::from_count(policy, got);
                let event = if decision.allowed {
                    AdmissionEvent::Allowed {
                        tier: policy.name().to_string(),
                        count: decision.current_count,
                        remaining: decision.remaining,
                    }
                } else {
                    AdmissionEvent::Rejected {
                        tier: policy.name().to_string(),
                        count: decision.current_count,
                        retry_after: decision.retry_after,
                    }
                };
                (decision, event)
            }
            Ok(_) => {
                tracing::error!(
                    tier = policy.name(),
                    backend = self.store.backend(),
                    "store returned count 0 after increment; admitting"
                );
                (Decision::fail_open(policy), AdmissionEvent::FailOpen { tier: policy.name().to_string() })
            }
            Err(error) => {
                tracing::warn!(
                    tier = policy.name(),
                    backend = self.store.backend(),
                    error = %error,
                    "counter store failed; admitting"
                );
                (Decision::fail_open(policy), AdmissionEvent::FailOpen { tier: policy.name().to_string() })
            }
        };

        emit_best_effort(self.sink.clone(), LimiterEvent::Admission(event)).await;
        decision
    }

    /// [`admit`](Self::admit) by tier name, for callers that only know the name at runtime.
    /// An unknown name is reported without touching the store.
    pub async fn admit_named(&self, identity: &str, tier: &str) -> Result<Decision, ConfigError> {
        let tier = self.tier(tier)?;
        Ok(self.admit(identity, &tier).await)
    }

    /// Current window for `identity` without counting a request. Diagnostics only.
    pub async fn peek(&self, identity: &str, tier: &Tier) -> Result<Option<WindowCount>, StoreError> {
        self.store.peek(&tier.key(identity)).await
    }

    /// Drop `identity`'s window for `tier`. Administrative tooling only.
    pub async fn reset(&self, identity: &str, tier: &Tier) -> Result<(), StoreError> {
        let key = tier.key(identity);
        tracing::info!(key = %key, "resetting rate limit window");
        self.store.reset(&key).await
    }
}

impl<S, T: Clone> Clone for RateLimiter<S, T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), tiers: self.tiers.clone(), sink: self.sink.clone() }
    }
}

impl<S: std::fmt::Debug, T> std::fmt::Debug for RateLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tiers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RateLimiter").field("store", &self.store).field("tiers", &names).finish()
    }
}
