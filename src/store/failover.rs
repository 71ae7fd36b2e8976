use super::{CounterKey, CounterStore, InMemoryCounterStore, WindowCount};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ProbeGuard, Route};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::telemetry::{emit_best_effort, BreakerEvent, LimiterEvent, NullSink, StoreEvent, TelemetrySink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Shared store as primary, process-local store as secondary.
///
/// # Behavior
/// - **Closed**: calls the primary. A failure bumps the failure streak and the call is answered
///   by the secondary; the streak reaching `failure_threshold` opens the breaker.
/// - **Open**: the secondary answers everything until `probe_interval` has passed.
/// - **HalfOpen**: exactly one call goes to the primary. Success closes the breaker, failure
///   reopens it and restarts the interval.
///
/// Errors from the primary never reach the caller; the worst case is a per-process count while
/// the primary is down. Breaker state is per process and never shared.
pub struct FailoverCounterStore<P, T = NullSink> {
    primary: Option<P>,
    secondary: InMemoryCounterStore,
    breaker: CircuitBreaker,
    sink: T,
}

impl<P> FailoverCounterStore<P, NullSink>
where
    P: CounterStore,
{
    pub fn new(primary: P, secondary: InMemoryCounterStore, config: CircuitBreakerConfig) -> Self {
        Self { primary: Some(primary), secondary, breaker: CircuitBreaker::new(config), sink: NullSink }
    }

    /// No distributed store at all (`store.backend = "memory"`); the breaker is never consulted.
    pub fn memory_only(secondary: InMemoryCounterStore) -> Self {
        Self {
            primary: None,
            secondary,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            sink: NullSink,
        }
    }
}

impl<P, T> FailoverCounterStore<P, T> {
    /// Attach a telemetry sink for breaker transitions and fallbacks.
    pub fn with_sink<U>(self, sink: U) -> FailoverCounterStore<P, U>
    where
        U: TelemetrySink,
    {
        FailoverCounterStore {
            primary: self.primary,
            secondary: self.secondary,
            breaker: self.breaker,
            sink,
        }
    }

    /// Override the breaker clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.breaker.set_clock(Arc::new(clock));
        self
    }

    /// Start with the breaker Open, e.g. when the primary was unreachable at startup.
    pub fn start_open(self) -> Self {
        if self.primary.is_some() {
            self.breaker.force_open();
        }
        self
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.breaker.config()
    }

    /// True when a distributed store is configured.
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn primary(&self) -> Option<&P> {
        self.primary.as_ref()
    }

    pub fn secondary(&self) -> &InMemoryCounterStore {
        &self.secondary
    }

    /// Stop the secondary's sweeper. The primary connection is released on drop.
    pub fn shutdown(&self) {
        self.secondary.shutdown();
    }
}

impl<P, T> FailoverCounterStore<P, T>
where
    P: CounterStore,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn emit_transition(&self, transition: Option<BreakerEvent>) {
        if let Some(event) = transition {
            self.emit(LimiterEvent::Breaker(event)).await;
        }
    }

    async fn fall_back(&self, key: &CounterKey, window: Duration) -> Result<WindowCount, StoreError> {
        self.emit(LimiterEvent::Store(StoreEvent::Fallback { backend: self.secondary.backend() }))
            .await;
        self.secondary.increment_and_get(key, window).await
    }
}

/// A count of zero after an increment can only come from a broken store.
fn check_invariants(key: &CounterKey, got: WindowCount) -> Result<WindowCount, StoreError> {
    if got.count == 0 {
        return Err(StoreError::invariant(key.as_str(), "count 0 after increment"));
    }
    Ok(got)
}

#[async_trait]
impl<P, T> CounterStore for FailoverCounterStore<P, T>
where
    P: CounterStore,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn increment_and_get(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let Some(primary) = &self.primary else {
            return self.secondary.increment_and_get(key, window).await;
        };

        let (route, transition) = self.breaker.route();
        // Armed before the first await: a future dropped while emitting HalfOpen must
        // still hand the probe slot back.
        let mut guard = ProbeGuard::new(&self.breaker, route);
        self.emit_transition(transition).await;

        if route == Route::Secondary {
            tracing::debug!(key = %key, "breaker open; counting locally");
            return self.fall_back(key, window).await;
        }

        let result = primary.increment_and_get(key, window).await;
        guard.disarm();

        match result.and_then(|got| check_invariants(key, got)) {
            Ok(got) => {
                let transition = self.breaker.on_success(route);
                self.emit_transition(transition).await;
                Ok(got)
            }
            Err(error) => {
                if error.is_invariant_violation() {
                    tracing::error!(key = %key, error = %error, "primary store returned an impossible count");
                } else {
                    tracing::warn!(
                        backend = primary.backend(),
                        error = %error,
                        "primary store failed; falling back to local counts"
                    );
                }
                let transition = self.breaker.on_failure(route);
                self.emit(LimiterEvent::Store(StoreEvent::PrimaryError { error })).await;
                self.emit_transition(transition).await;
                self.fall_back(key, window).await
            }
        }
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError> {
        if let Some(primary) = &self.primary {
            if self.breaker.state() == CircuitState::Closed {
                match primary.peek(key).await {
                    Ok(found) => return Ok(found),
                    Err(error) => {
                        tracing::debug!(error = %error, "primary peek failed; reading local counts")
                    }
                }
            }
        }
        self.secondary.peek(key).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.secondary.reset(key).await?;
        if let Some(primary) = &self.primary {
            primary.reset(key).await?;
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "failover"
    }
}

impl<P, T> std::fmt::Debug for FailoverCounterStore<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCounterStore")
            .field("has_primary", &self.primary.is_some())
            .field("breaker", &self.breaker.state())
            .field("secondary", &self.secondary)
            .finish_non_exhaustive()
    }
}
