use crate::rate_limit::{Decision, RateLimiter, Tier};
use crate::store::CounterStore;
use crate::telemetry::TelemetrySink;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`AdmissionService`].
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The tier's quota is spent; the decision carries `retry_after` and header values.
    Rejected(Decision),
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(decision) => write!(
                f,
                "rate limit exceeded ({} of {}), retry after {:?}",
                decision.current_count, decision.limit, decision.retry_after
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is a rate limit rejection
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The rejecting decision, if any.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(d) => Some(d),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

/// A layer that admits each request against one tier before it reaches the inner service.
///
/// `identify` maps a request to the caller identity (an address, a user id); how that is
/// resolved is up to the caller.
pub struct AdmissionLayer<S, T, F> {
    limiter: RateLimiter<S, T>,
    tier: Tier,
    identify: Arc<F>,
}

impl<S, T, F> AdmissionLayer<S, T, F> {
    pub fn new(limiter: RateLimiter<S, T>, tier: Tier, identify: F) -> Self {
        Self { limiter, tier, identify: Arc::new(identify) }
    }
}

impl<S, T: Clone, F> Clone for AdmissionLayer<S, T, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), tier: self.tier.clone(), identify: self.identify.clone() }
    }
}

impl<Svc, S, T: Clone, F> Layer<Svc> for AdmissionLayer<S, T, F> {
    type Service = AdmissionService<Svc, S, T, F>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            tier: self.tier.clone(),
            identify: self.identify.clone(),
        }
    }
}

/// Middleware service that enforces one tier's quota.
pub struct AdmissionService<Svc, S, T, F> {
    inner: Svc,
    limiter: RateLimiter<S, T>,
    tier: Tier,
    identify: Arc<F>,
}

impl<Svc: Clone, S, T: Clone, F> Clone for AdmissionService<Svc, S, T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            tier: self.tier.clone(),
            identify: self.identify.clone(),
        }
    }
}

impl<Svc, S, T, F, Req> Service<Req> for AdmissionService<Svc, S, T, F>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + 'static,
    S: CounterStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = AdmissionError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let tier = self.tier.clone();
        let identity = (self.identify)(&req);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let decision = limiter.admit(&identity, &tier).await;
            if !decision.allowed {
                tracing::debug!(tier = tier.name(), retry_after = ?decision.retry_after, "request rejected");
                return Err(AdmissionError::Rejected(decision));
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}
