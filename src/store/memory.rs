use super::{CounterKey, CounterStore, WindowCount};
use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at_millis: u64,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at_millis > now
    }
}

#[derive(Debug)]
struct Shared {
    entries: Mutex<HashMap<CounterKey, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<CounterKey, Entry>> {
        // Entries are plain integers; a panic mid-update cannot leave one half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[derive(Debug)]
struct Sweeper {
    task: JoinHandle<()>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Process-local window counters behind a single mutex.
///
/// Clones share the same map. A background sweeper (see [`with_sweeper`](Self::with_sweeper))
/// evicts expired windows under the same lock that increments take, so a sweep can never drop
/// a window that an increment just renewed. The sweeper stops on [`shutdown`](Self::shutdown)
/// or when the last clone is dropped.
///
/// Never returns [`StoreError`].
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    shared: Arc<Shared>,
    sweeper: Option<Arc<Sweeper>>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Build a store that reads time from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            shared: Arc::new(Shared { entries: Mutex::new(HashMap::new()), clock: Arc::new(clock) }),
            sweeper: None,
        }
    }

    /// Start a background task that evicts expired windows every `every`.
    ///
    /// Needs a tokio runtime; outside one the store keeps working and only [`sweep`](Self::sweep)
    /// reclaims memory.
    pub fn with_sweeper(mut self, every: Duration) -> Self {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("no tokio runtime; in-memory counter sweeper not started");
                return self;
            }
        };
        let every = every.max(Duration::from_millis(1));
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let evicted = shared.sweep();
                if evicted > 0 {
                    tracing::trace!(evicted, "swept expired rate limit windows");
                }
            }
        });

        self.sweeper = Some(Arc::new(Sweeper { task }));
        self
    }

    /// Remove every expired window now. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the background sweeper, if any. Counters stay usable.
    pub fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.task.abort();
        }
    }

    /// Entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let now = self.shared.clock.now_millis();
        let mut entries = self.shared.lock();

        if let Some(entry) = entries.get_mut(key) {
            if entry.is_live(now) {
                entry.count = entry.count.saturating_add(1);
                let ttl = Duration::from_millis(entry.expires_at_millis - now);
                return Ok(WindowCount::new(entry.count, ttl));
            }
        }

        let window_ms = window_millis(window);
        entries.insert(
            key.clone(),
            Entry { count: 1, expires_at_millis: now.saturating_add(window_ms) },
        );
        Ok(WindowCount::new(1, Duration::from_millis(window_ms)))
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError> {
        let now = self.shared.clock.now_millis();
        let entries = self.shared.lock();
        Ok(entries.get(key).filter(|e| e.is_live(now)).map(|e| {
            WindowCount::new(e.count, Duration::from_millis(e.expires_at_millis - now))
        }))
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.shared.lock().remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
