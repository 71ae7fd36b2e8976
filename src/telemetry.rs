//! Telemetry for admission decisions, breaker transitions and store fallbacks.
//!
//! The limiter emits [`LimiterEvent`]s but does not own their storage. Events flow through
//! `TelemetrySink` implementations which can log, aggregate, or forward them elsewhere.
//!
//! # Event Types
//!
//! - **Admission**: `Allowed`, `Rejected`, `FailOpen`
//! - **Breaker**: `Opened`, `HalfOpen`, `Closed`, `ProbeFailed`
//! - **Store**: `Fallback`, `PrimaryError`
//!
//! # Telemetry Sinks
//!
//! A sink is a `tower::Service<LimiterEvent>`, so sinks compose with ordinary tower
//! combinators.
//!
//! ```rust
//! use quotagate::telemetry::{AdmissionEvent, LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = LimiterEvent::Admission(AdmissionEvent::FailOpen { tier: "ai".into() });
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use crate::error::StoreError;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Receives every [`LimiterEvent`] the limiter and the failover store produce.
///
/// Sinks are called inline on the admission path, so a sink that waits delays the request
/// that produced the event.
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Delivers one event, waiting for the sink to be ready. A sink failure loses the event and
/// never changes the decision being reported.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the limiter and its stores.
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// Per-request admission outcome
    Admission(AdmissionEvent),
    /// Failover breaker transitions
    Breaker(BreakerEvent),
    /// Counting backend incidents
    Store(StoreEvent),
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The request fit inside its tier's quota.
    Allowed {
        tier: String,
        count: u64,
        remaining: u64,
    },
    /// The quota for the current window is spent.
    Rejected {
        tier: String,
        count: u64,
        retry_after: Duration,
    },
    /// The store could not produce a count; the request was admitted anyway.
    FailOpen { tier: String },
}

/// Transitions of the failover circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Consecutive primary failures reached the threshold; traffic moves to the local store.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: u32,
    },
    /// The probe interval elapsed and one call is being routed to the primary.
    HalfOpen,
    /// The probe succeeded; the primary is in use again.
    Closed,
    /// The probe failed; the breaker is open again.
    ProbeFailed,
}

/// Incidents on the counting backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A primary call failed and was answered by the local store.
    PrimaryError { error: StoreError },
    /// A call was answered by the local store without trying the primary.
    Fallback { backend: &'static str },
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admission(event) => write!(f, "Admission::{}", event),
            LimiterEvent::Breaker(event) => write!(f, "Breaker::{}", event),
            LimiterEvent::Store(event) => write!(f, "Store::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Allowed { tier, count, remaining } => {
                write!(f, "Allowed(tier={}, count={}, remaining={})", tier, count, remaining)
            }
            AdmissionEvent::Rejected { tier, count, retry_after } => {
                write!(f, "Rejected(tier={}, count={}, retry_after={:?})", tier, count, retry_after)
            }
            AdmissionEvent::FailOpen { tier } => write!(f, "FailOpen(tier={})", tier),
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened { failure_count } => write!(f, "Opened(failures={})", failure_count),
            BreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            BreakerEvent::Closed => write!(f, "Closed"),
            BreakerEvent::ProbeFailed => write!(f, "ProbeFailed"),
        }
    }
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEvent::PrimaryError { error } => write!(f, "PrimaryError({})", error),
            StoreEvent::Fallback { backend } => write!(f, "Fallback(backend={})", backend),
        }
    }
}

/// Discards every event. The default sink for the limiter and the failover store.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event as a structured `tracing` record under the `quotagate` target.
///
/// Levels follow operator impact: admitted requests and local fallbacks are DEBUG,
/// rejections and a recovering breaker are INFO, anything that means the primary store
/// is misbehaving (or that a request skipped its quota) is WARN.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn record(event: &LimiterEvent) {
        match event {
            LimiterEvent::Admission(AdmissionEvent::Allowed { tier, count, remaining }) => {
                tracing::debug!(target: "quotagate", tier = %tier, count, remaining, "request admitted");
            }
            LimiterEvent::Admission(AdmissionEvent::Rejected { tier, count, retry_after }) => {
                tracing::info!(
                    target: "quotagate",
                    tier = %tier,
                    count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rejected"
                );
            }
            LimiterEvent::Admission(AdmissionEvent::FailOpen { tier }) => {
                tracing::warn!(target: "quotagate", tier = %tier, "no count available, admitted without quota");
            }
            LimiterEvent::Breaker(BreakerEvent::Opened { failure_count }) => {
                tracing::warn!(target: "quotagate", failure_count, "primary store breaker opened");
            }
            LimiterEvent::Breaker(BreakerEvent::HalfOpen) => {
                tracing::info!(target: "quotagate", "retrying primary store");
            }
            LimiterEvent::Breaker(BreakerEvent::Closed) => {
                tracing::info!(target: "quotagate", "primary store restored");
            }
            LimiterEvent::Breaker(BreakerEvent::ProbeFailed) => {
                tracing::warn!(target: "quotagate", "primary store still failing, breaker reopened");
            }
            LimiterEvent::Store(StoreEvent::PrimaryError { error }) => {
                tracing::warn!(target: "quotagate", error = %error, timeout = error.is_timeout(), "primary store call failed");
            }
            LimiterEvent::Store(StoreEvent::Fallback { backend }) => {
                tracing::debug!(target: "quotagate", backend, "counted locally");
            }
        }
    }
}

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        Self::record(&event);
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Running totals of admission outcomes seen by a [`MemorySink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionTally {
    pub allowed: u64,
    pub rejected: u64,
    pub fail_open: u64,
}

impl AdmissionTally {
    /// Every admission decision observed, whatever its outcome.
    pub fn total(&self) -> u64 {
        self.allowed + self.rejected + self.fail_open
    }
}

#[derive(Debug, Default)]
struct Recorded {
    log: VecDeque<LimiterEvent>,
    tally: AdmissionTally,
    rejected_by_tier: HashMap<String, u64>,
    fallbacks: u64,
    primary_errors: u64,
}

/// Keeps limiter events in memory for tests and debugging.
///
/// The event log is bounded; once `capacity` is reached the oldest event is dropped. The
/// admission tally and the fallback counters cover every event ever received, so they stay
/// exact after the log has wrapped.
#[derive(Clone, Debug)]
pub struct MemorySink {
    recorded: Arc<Mutex<Recorded>>,
    capacity: usize,
}

impl MemorySink {
    /// A sink that keeps the last 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { recorded: Arc::new(Mutex::new(Recorded::default())), capacity: capacity.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The retained events, oldest first.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().log.iter().cloned().collect()
    }

    /// Retained breaker transitions, in order.
    pub fn breaker_events(&self) -> Vec<BreakerEvent> {
        self.lock()
            .log
            .iter()
            .filter_map(|e| match e {
                LimiterEvent::Breaker(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    pub fn tally(&self) -> AdmissionTally {
        self.lock().tally
    }

    /// Rejections recorded for one tier.
    pub fn rejections_for(&self, tier: &str) -> u64 {
        self.lock().rejected_by_tier.get(tier).copied().unwrap_or(0)
    }

    /// Calls answered by the local store, whether the primary was skipped or failed.
    pub fn fallbacks(&self) -> u64 {
        self.lock().fallbacks
    }

    pub fn primary_errors(&self) -> u64 {
        self.lock().primary_errors
    }

    /// Forgets the log and resets every counter.
    pub fn clear(&self) {
        *self.lock() = Recorded::default();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut recorded = self.lock();
        match &event {
            LimiterEvent::Admission(AdmissionEvent::Allowed { .. }) => recorded.tally.allowed += 1,
            LimiterEvent::Admission(AdmissionEvent::Rejected { tier, .. }) => {
                recorded.tally.rejected += 1;
                *recorded.rejected_by_tier.entry(tier.clone()).or_default() += 1;
            }
            LimiterEvent::Admission(AdmissionEvent::FailOpen { .. }) => recorded.tally.fail_open += 1,
            LimiterEvent::Store(StoreEvent::PrimaryError { .. }) => recorded.primary_errors += 1,
            LimiterEvent::Store(StoreEvent::Fallback { .. }) => recorded.fallbacks += 1,
            LimiterEvent::Breaker(_) => {}
        }
        if recorded.log.len() >= self.capacity {
            recorded.log.pop_front();
        }
        recorded.log.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
