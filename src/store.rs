//! Window counter storage.
//!
//! - [`CounterStore`]: atomic increment-and-read of a fixed-window counter.
//! - [`InMemoryCounterStore`](memory::InMemoryCounterStore): process-local map with TTL sweeping.
//! - [`FailoverCounterStore`](failover::FailoverCounterStore): a shared store as primary, the
//!   in-memory store as secondary, and a circuit breaker choosing between them.
//!
//! The distributed implementation lives in the `quotagate-redis` crate.

use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod failover;
pub mod memory;

pub use failover::FailoverCounterStore;
pub use memory::InMemoryCounterStore;

/// Identifies one (tier, identity) pair's current window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey(String);

impl CounterKey {
    /// `key_prefix || tier || ":" || identity`. The separator keeps `("ai", "x")` and
    /// `("a", "ix")` apart.
    pub fn derive(key_prefix: &str, tier: &str, identity: &str) -> Self {
        let mut key = String::with_capacity(key_prefix.len() + tier.len() + identity.len() + 1);
        key.push_str(key_prefix);
        key.push_str(tier);
        key.push(':');
        key.push_str(identity);
        Self(key)
    }

    /// Wrap an already-built key, e.g. one read back from a backend.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Counter value for the current window and the time left before it resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl_remaining: Duration,
}

impl WindowCount {
    pub fn new(count: u64, ttl_remaining: Duration) -> Self {
        Self { count, ttl_remaining }
    }
}

/// Abstract storage for fixed-window counters.
///
/// Implementations must make [`increment_and_get`](CounterStore::increment_and_get) a single
/// atomic step per key: two callers racing on an empty window must end up with counts 1 and 2,
/// never 1 and 1.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`.
    ///
    /// If no entry exists, or the previous window has expired, the counter restarts at 1 with a
    /// TTL of `window`. Otherwise the count goes up by one and the entry keeps its original TTL,
    /// which is returned unchanged.
    async fn increment_and_get(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<WindowCount, StoreError>;

    /// Read the live window without mutating it. `None` means no live window. Diagnostics only.
    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError>;

    /// Delete the window for `key`. Administrative tooling only.
    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Short backend name for logs and events.
    fn backend(&self) -> &'static str;
}

#[async_trait]
impl<T> CounterStore for Arc<T>
where
    T: CounterStore + ?Sized,
{
    async fn increment_and_get(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        (**self).increment_and_get(key, window).await
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError> {
        (**self).peek(key).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        (**self).reset(key).await
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_separate_tier_and_identity() {
        let a = CounterKey::derive("ratelimit:", "ai", "x");
        let b = CounterKey::derive("ratelimit:", "a", "ix");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "ratelimit:ai:x");
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(
            CounterKey::derive("p:", "general", "10.0.0.1"),
            CounterKey::derive("p:", "general", "10.0.0.1")
        );
        assert_eq!(CounterKey::derive("", "admin", "u7").to_string(), "admin:u7");
    }
}
