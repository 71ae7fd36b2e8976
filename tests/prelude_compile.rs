//! Compile-time prelude coverage test.
use quotagate::prelude::*;
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, ServiceExt};
use tower_layer::Layer;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let store: FailoverCounterStore<InMemoryCounterStore> =
        FailoverCounterStore::memory_only(InMemoryCounterStore::new());
    let limiter = RateLimiter::builder(store)
        .tier(TierPolicy::new("api", Duration::from_secs(1), 1).expect("valid tier"))
        .build()
        .expect("valid limiter")
        .with_sink(LogSink);
    let tier: Tier = limiter.tier("api").expect("tier exists");

    let svc = AdmissionLayer::new(limiter, tier, |_req: &()| "caller".to_string())
        .layer(service_fn(|_req: ()| async { Ok::<_, Infallible>(()) }));
    svc.clone().oneshot(()).await.expect("first call admitted");
    let err: AdmissionError<Infallible> = svc.oneshot(()).await.expect_err("second call rejected");
    let decision: &Decision = err.decision().expect("rejection carries a decision");
    assert!(!decision.is_allowed());
}
