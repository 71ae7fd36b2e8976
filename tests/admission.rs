mod common;

use common::test_helpers::{FlakyStore, StallOnHalfOpen};
use futures::future::join_all;
use quotagate::telemetry::BreakerEvent;
use quotagate::{
    CircuitBreakerConfig, CircuitState, Decision, FailoverCounterStore, InMemoryCounterStore,
    ManualClock, MemorySink, RateLimiter, TierPolicy,
};
use std::sync::Arc;
use std::time::Duration;

fn tier(name: &str, window_secs: u64, max: u64) -> TierPolicy {
    TierPolicy::new(name, Duration::from_secs(window_secs), max).unwrap()
}

#[tokio::test]
async fn admits_quota_then_rejects_with_retry_after() {
    let limiter = RateLimiter::builder(InMemoryCounterStore::new())
        .tier(tier("admin", 60, 5))
        .build()
        .unwrap();
    let admin = limiter.tier("admin").unwrap();

    for expected_remaining in (0..5).rev() {
        let d = limiter.admit("10.0.0.7", &admin).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, expected_remaining);
    }

    let rejected = limiter.admit("10.0.0.7", &admin).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.current_count, 6);
    assert!(rejected.retry_after > Duration::ZERO);
    assert!(rejected.retry_after <= Duration::from_secs(60));
}

#[tokio::test]
async fn window_restarts_once_it_expires() {
    let clock = ManualClock::new();
    let limiter = RateLimiter::builder(InMemoryCounterStore::with_clock(clock.clone()))
        .tier(tier("general", 900, 2))
        .build()
        .unwrap();
    let general = limiter.tier("general").unwrap();

    limiter.admit("u1", &general).await;
    limiter.admit("u1", &general).await;
    clock.advance(Duration::from_secs(300));
    let denied = limiter.admit("u1", &general).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(600), "window keeps its original deadline");

    clock.advance(Duration::from_secs(600));
    let fresh = limiter.admit("u1", &general).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.current_count, 1);
    assert_eq!(fresh.remaining, 1);
}

#[tokio::test]
async fn identical_setups_decide_identically() {
    async fn run() -> Vec<Decision> {
        let clock = ManualClock::new();
        let limiter = RateLimiter::builder(InMemoryCounterStore::with_clock(clock.clone()))
            .tier(tier("ai", 3600, 3))
            .build()
            .unwrap();
        let ai = limiter.tier("ai").unwrap();
        let mut out = Vec::new();
        for identity in ["a", "b", "a", "a", "a", "b"] {
            out.push(limiter.admit(identity, &ai).await);
            clock.advance(Duration::from_secs(1));
        }
        out
    }

    assert_eq!(run().await, run().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_the_quota() {
    let limiter = RateLimiter::builder(InMemoryCounterStore::new())
        .tier(tier("general", 900, 50))
        .build()
        .unwrap();
    let general = limiter.tier("general").unwrap();

    let tasks = (0..200).map(|_| {
        let limiter = limiter.clone();
        let general = general.clone();
        tokio::spawn(async move { limiter.admit("shared-ip", &general).await })
    });
    let decisions: Vec<Decision> = join_all(tasks).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 50);
    let mut counts: Vec<u64> = decisions.iter().map(|d| d.current_count).collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=200).collect::<Vec<_>>(), "no increment lost");
}

#[tokio::test]
async fn ai_tier_counts_identities_independently() {
    let clock = ManualClock::new();
    let limiter = RateLimiter::builder(InMemoryCounterStore::with_clock(clock.clone()))
        .tier(TierPolicy::ai())
        .build()
        .unwrap();
    let ai = limiter.tier("ai").unwrap();

    for _ in 0..50 {
        assert!(limiter.admit("u1", &ai).await.allowed);
    }
    clock.advance(Duration::from_millis(400));
    let denied = limiter.admit("u1", &ai).await;
    assert!(!denied.allowed);
    assert!(denied.retry_after <= Duration::from_secs(3600));
    assert!(denied.retry_after >= Duration::from_secs(3599), "got {:?}", denied.retry_after);
    assert_eq!(denied.retry_after_secs(), 3600);

    let other = limiter.admit("u2", &ai).await;
    assert!(other.allowed);
    assert_eq!(other.remaining, 49);
}

#[tokio::test]
async fn failing_primary_trips_the_breaker_after_threshold() {
    let primary = Arc::new(FlakyStore::down());
    let sink = MemorySink::new();
    let config = CircuitBreakerConfig::new(3, Duration::from_secs(30)).unwrap();
    let store = FailoverCounterStore::new(primary.clone(), InMemoryCounterStore::new(), config)
        .with_sink(sink.clone());
    let limiter = RateLimiter::builder(store).tier(TierPolicy::general()).build().unwrap();
    let general = limiter.tier("general").unwrap();

    let mut remaining = Vec::new();
    for call in 1..=5 {
        let d = limiter.admit("10.1.1.1", &general).await;
        assert!(d.allowed, "call {} must be admitted", call);
        remaining.push(d.remaining);
        if call <= 3 {
            assert_eq!(primary.calls(), call, "call {} still tries the primary", call);
        }
    }

    assert_eq!(primary.calls(), 3, "calls 4 and 5 skip the primary");
    assert_eq!(remaining, vec![99, 98, 97, 96, 95]);
    assert_eq!(limiter.store().breaker_state(), CircuitState::Open);
    assert!(sink.breaker_events().contains(&BreakerEvent::Opened { failure_count: 3 }));
    assert_eq!(sink.primary_errors(), 3);
    assert_eq!(sink.fallbacks(), 5, "every call was counted locally");
}

#[tokio::test]
async fn probe_restores_a_recovered_primary() {
    let clock = ManualClock::new();
    let primary = Arc::new(FlakyStore::down());
    let config = CircuitBreakerConfig::new(2, Duration::from_secs(10)).unwrap();
    let store = FailoverCounterStore::new(primary.clone(), InMemoryCounterStore::new(), config)
        .with_clock(clock.clone());
    let limiter = RateLimiter::builder(store).tier(tier("general", 900, 100)).build().unwrap();
    let general = limiter.tier("general").unwrap();

    limiter.admit("u1", &general).await;
    limiter.admit("u1", &general).await;
    assert_eq!(limiter.store().breaker_state(), CircuitState::Open);

    primary.set_down(false);
    clock.advance(Duration::from_secs(5));
    limiter.admit("u1", &general).await;
    assert_eq!(primary.calls(), 2, "no probe before the interval");

    clock.advance(Duration::from_secs(5));
    let probed = limiter.admit("u1", &general).await;
    assert!(probed.allowed);
    assert_eq!(primary.calls(), 3, "exactly one probe");
    assert_eq!(limiter.store().breaker_state(), CircuitState::Closed);
    assert_eq!(probed.current_count, 1, "the primary keeps its own counts");

    limiter.admit("u1", &general).await;
    assert_eq!(primary.calls(), 4);
}

#[tokio::test]
async fn failed_probe_reopens_and_waits_another_interval() {
    let clock = ManualClock::new();
    let primary = Arc::new(FlakyStore::down());
    let config = CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let store = FailoverCounterStore::new(primary.clone(), InMemoryCounterStore::new(), config)
        .with_clock(clock.clone());
    let limiter = RateLimiter::builder(store).tier(tier("general", 900, 100)).build().unwrap();
    let general = limiter.tier("general").unwrap();

    limiter.admit("u1", &general).await;
    clock.advance(Duration::from_secs(10));
    assert!(limiter.admit("u1", &general).await.allowed);
    assert_eq!(primary.calls(), 2);
    assert_eq!(limiter.store().breaker_state(), CircuitState::Open);

    limiter.admit("u1", &general).await;
    assert_eq!(primary.calls(), 2, "interval restarts after a failed probe");
}

#[tokio::test(start_paused = true)]
async fn admission_dropped_while_reporting_half_open_frees_the_trial_slot() {
    let clock = ManualClock::new();
    let primary = Arc::new(FlakyStore::down());
    let config = CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let store = FailoverCounterStore::new(primary.clone(), InMemoryCounterStore::new(), config)
        .with_clock(clock.clone())
        .with_sink(StallOnHalfOpen::default());
    let limiter = RateLimiter::builder(store).tier(tier("general", 900, 100)).build().unwrap();
    let general = limiter.tier("general").unwrap();

    limiter.admit("u1", &general).await;
    assert_eq!(limiter.store().breaker_state(), CircuitState::Open);

    primary.set_down(false);
    clock.advance(Duration::from_secs(10));
    let abandoned = tokio::time::timeout(Duration::from_millis(10), limiter.admit("u1", &general)).await;
    assert!(abandoned.is_err(), "the sink holds the admission past its deadline");
    assert_eq!(primary.calls(), 1);
    assert_eq!(limiter.store().breaker_state(), CircuitState::Open, "slot handed back");

    assert!(limiter.admit("u1", &general).await.allowed);
    assert_eq!(primary.calls(), 2, "next caller retries the primary at once");
    assert_eq!(limiter.store().breaker_state(), CircuitState::Closed);
}
