#![allow(dead_code)]

use async_trait::async_trait;
use quotagate::telemetry::{BreakerEvent, LimiterEvent, TelemetrySink};
use quotagate::{CounterKey, CounterStore, InMemoryCounterStore, StoreError, WindowCount};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_service::Service;

/// A primary store that can be switched off. Counts in memory while healthy.
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemoryCounterStore,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn healthy() -> Self {
        Self { inner: InMemoryCounterStore::new(), down: AtomicBool::new(false), calls: AtomicUsize::new(0) }
    }

    pub fn down() -> Self {
        let store = Self::healthy();
        store.set_down(true);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of increments attempted against this store.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("flaky", "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment_and_get(&self, key: &CounterKey, window: Duration) -> Result<WindowCount, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.increment_and_get(key, window).await
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError> {
        self.check()?;
        self.inner.peek(key).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.check()?;
        self.inner.reset(key).await
    }

    fn backend(&self) -> &'static str {
        "flaky"
    }
}

/// A sink that suspends the first time it sees a HalfOpen transition. Every other event
/// goes through immediately.
#[derive(Debug, Clone, Default)]
pub struct StallOnHalfOpen {
    stalled: Arc<AtomicBool>,
}

impl Service<LimiterEvent> for StallOnHalfOpen {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let stall = matches!(event, LimiterEvent::Breaker(BreakerEvent::HalfOpen))
            && !self.stalled.swap(true, Ordering::SeqCst);
        Box::pin(async move {
            if stall {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        })
    }
}

impl TelemetrySink for StallOnHalfOpen {
    type SinkError = Infallible;
}
