//! Circuit breaker deciding whether the failover store calls its primary.
//!
//! Unlike a request-rejecting breaker, an open breaker here never fails the caller: it only
//! routes the call to the local store. All breaker fields sit behind one mutex, so a transition
//! and the failure count it was based on are always observed together.

use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::telemetry::BreakerEvent;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go to the primary store.
    Closed,
    /// Calls go to the secondary store until the probe interval elapses.
    Open,
    /// One probe call is routed to the primary; everything else stays on the secondary.
    HalfOpen,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    probe_interval: Duration,
}

impl CircuitBreakerConfig {
    /// Errors if `failure_threshold` == 0 or `probe_interval` == 0.
    pub fn new(failure_threshold: u32, probe_interval: Duration) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: failure_threshold });
        }
        if probe_interval == Duration::ZERO {
            return Err(ConfigError::InvalidProbeInterval(probe_interval));
        }
        Ok(Self { failure_threshold, probe_interval })
    }

    /// Consecutive primary failures before opening.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time spent Open before the next probe.
    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, probe_interval: Duration::from_secs(30) }
    }
}

/// Where a single call should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Breaker closed: normal primary call.
    Primary,
    /// The one half-open call allowed to test the primary.
    Probe,
    /// Breaker open (or a probe already in flight): secondary only.
    Secondary,
}

#[derive(Debug)]
struct BreakerState {
    mode: CircuitState,
    consecutive_failures: u32,
    last_probe_at_millis: u64,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                mode: CircuitState::Closed,
                consecutive_failures: 0,
                last_probe_at_millis: 0,
                probe_in_flight: false,
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Only valid before the breaker is shared.
    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.lock().mode
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Start Open, e.g. when the primary could not be reached at startup. The first probe
    /// happens after one `probe_interval`.
    pub(crate) fn force_open(&self) {
        let mut state = self.lock();
        state.mode = CircuitState::Open;
        state.last_probe_at_millis = self.clock.now_millis();
        state.probe_in_flight = false;
        tracing::warn!("Circuit breaker → open (forced)");
    }

    /// Pick a route for one call, moving Open → HalfOpen once the probe interval has passed.
    pub(crate) fn route(&self) -> (Route, Option<BreakerEvent>) {
        let mut state = self.lock();
        match state.mode {
            CircuitState::Closed => (Route::Primary, None),
            CircuitState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(state.last_probe_at_millis);
                if u128::from(elapsed) >= self.config.probe_interval.as_millis() {
                    state.mode = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!("Circuit breaker → half-open");
                    (Route::Probe, Some(BreakerEvent::HalfOpen))
                } else {
                    (Route::Secondary, None)
                }
            }
            CircuitState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                (Route::Probe, None)
            }
            CircuitState::HalfOpen => (Route::Secondary, None),
        }
    }

    pub(crate) fn on_success(&self, route: Route) -> Option<BreakerEvent> {
        let mut state = self.lock();
        match route {
            Route::Primary => {
                // A slow success must not undo an Open decided by later failures.
                if state.mode == CircuitState::Closed {
                    state.consecutive_failures = 0;
                }
                None
            }
            Route::Probe => {
                state.mode = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.probe_in_flight = false;
                tracing::info!("Circuit breaker → closed");
                Some(BreakerEvent::Closed)
            }
            Route::Secondary => None,
        }
    }

    pub(crate) fn on_failure(&self, route: Route) -> Option<BreakerEvent> {
        let mut state = self.lock();
        match route {
            Route::Primary => {
                if state.mode != CircuitState::Closed {
                    return None;
                }
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let failures = state.consecutive_failures;
                if failures >= self.config.failure_threshold {
                    state.mode = CircuitState::Open;
                    state.last_probe_at_millis = self.clock.now_millis();
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    Some(BreakerEvent::Opened { failure_count: failures })
                } else {
                    None
                }
            }
            Route::Probe => {
                state.mode = CircuitState::Open;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_probe_at_millis = self.clock.now_millis();
                state.probe_in_flight = false;
                tracing::warn!(
                    failures = state.consecutive_failures,
                    "Circuit breaker: probe failed → open"
                );
                Some(BreakerEvent::ProbeFailed)
            }
            Route::Secondary => None,
        }
    }

    /// The probing call was dropped before it finished. Reopen without touching
    /// `last_probe_at`, so the very next call probes again.
    fn abandon_probe(&self) {
        let mut state = self.lock();
        if state.mode == CircuitState::HalfOpen && state.probe_in_flight {
            state.mode = CircuitState::Open;
            state.probe_in_flight = false;
            tracing::debug!("Circuit breaker: probe abandoned → open");
        }
    }
}

/// Releases the half-open probe slot if the probing future is dropped mid-flight.
pub(crate) struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    pub(crate) fn new(breaker: &'a CircuitBreaker, route: Route) -> Self {
        Self { breaker, armed: route == Route::Probe }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}
