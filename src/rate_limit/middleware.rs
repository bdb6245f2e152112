use crate::error::LimitError;
use crate::rate_limit::{Quota, RateLimitResult, RateLimiter};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Errors produced by [`RateLimitService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError<E> {
    /// The window is full; the inner service was not called.
    Limited {
        /// Value for `Retry-After`.
        reset_seconds: u64,
        limit: u32,
    },
    /// The key extractor produced an unusable identifier.
    Invalid(LimitError),
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ThrottleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited { reset_seconds, limit } => write!(
                f,
                "too many requests (limit {}), retry after {}s",
                limit, reset_seconds
            ),
            Self::Invalid(e) => write!(f, "rate limit misconfigured: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ThrottleError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Invalid(e) => Some(e),
            Self::Limited { .. } => None,
        }
    }
}

impl<E> ThrottleError<E> {
    /// True when the request was turned away by the limiter (HTTP 429).
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Seconds to advertise in `Retry-After`, if limited.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Limited { reset_seconds, .. } => Some(*reset_seconds),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that enforces one quota per request using a [`RateLimiter`].
///
/// `key` turns a request into an identifier, e.g. `"search:" + client address`.
pub struct RateLimitLayer<L, K> {
    limiter: Arc<L>,
    key: Arc<K>,
    quota: Quota,
}

impl<L, K> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), key: self.key.clone(), quota: self.quota }
    }
}

impl<L, K> fmt::Debug for RateLimitLayer<L, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("quota", &self.quota).finish()
    }
}

impl<L, K> RateLimitLayer<L, K> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L, quota: Quota, key: K) -> Self {
        Self::shared(Arc::new(limiter), quota, key)
    }

    /// Share one limiter between several layers (one per route).
    pub fn shared(limiter: Arc<L>, quota: Quota, key: K) -> Self {
        Self { limiter, key: Arc::new(key), quota }
    }
}

impl<S, L, K> Layer<S> for RateLimitLayer<L, K>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            quota: self.quota,
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L, K> {
    inner: S,
    limiter: Arc<L>,
    key: Arc<K>,
    quota: Quota,
}

impl<S: Clone, L, K> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            quota: self.quota,
        }
    }
}

impl<S, L, K, Req> Service<Req> for RateLimitService<S, L, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let quota = self.quota;
        let identifier = (self.key)(&req);
        // Take the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision: RateLimitResult = limiter
                .check_quota(&identifier, quota)
                .await
                .map_err(ThrottleError::Invalid)?;
            if !decision.allowed {
                return Err(ThrottleError::Limited {
                    reset_seconds: decision.reset_seconds,
                    limit: quota.limit(),
                });
            }
            inner.call(req).await.map_err(ThrottleError::Inner)
        })
    }
}
