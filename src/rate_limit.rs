//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: the core trait (`check(identifier, limit, window_ms)`).
//! - [`SlidingWindowLimiter`]: the sliding-window log implementation over a [`WindowStore`].
//! - [`RateLimitLayer`]: Tower middleware that enforces a quota per request.
//! - [`RateLimitResult`]: the answer handed back to callers.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It only knows how to derive an
//!   identifier and ask a `RateLimiter`.
//! - **Logic**: `SlidingWindowLimiter` validates arguments, computes `remaining` and
//!   `reset_seconds`, and applies the fail-open policy.
//! - **Storage**: `WindowStore` (in `store` module) performs the atomic prune/count/append, either
//!   in memory or in a shared backend (see the `gems-ratelimit-redis` crate).

use crate::error::LimitError;
use std::time::Duration;

pub mod middleware;
pub mod sliding_window;
pub mod store;
pub use middleware::{RateLimitLayer, RateLimitService, ThrottleError};
pub use sliding_window::SlidingWindowLimiter;
pub use store::{Admission, InMemoryWindowStore, WindowSnapshot, WindowStore, WindowUsage};

/// A validated `(limit, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    limit: u32,
    window_ms: u64,
}

impl Quota {
    /// Build a quota of `limit` actions per trailing `window_ms`. Both must be positive.
    pub fn new(limit: u32, window_ms: u64) -> Result<Self, LimitError> {
        if limit == 0 {
            return Err(LimitError::ZeroLimit);
        }
        if window_ms == 0 {
            return Err(LimitError::ZeroWindow);
        }
        Ok(Self { limit, window_ms })
    }

    /// Convenience for `Duration`-based call sites. Sub-millisecond windows are rejected.
    pub fn per(limit: u32, window: Duration) -> Result<Self, LimitError> {
        Self::new(limit, u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// `ceil(window_ms / 1000)`, the reset estimate used on the accept path.
    pub fn window_seconds(&self) -> u64 {
        ceil_seconds(self.window_ms)
    }
}

/// Round milliseconds up to whole seconds so callers never under-wait.
pub(crate) fn ceil_seconds(ms: u64) -> u64 {
    ms / 1000 + u64::from(ms % 1000 != 0)
}

/// How a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Enforcement {
    /// The store answered; the result reflects the real window.
    Enforced,
    /// No store is configured; every check is admitted.
    PassThrough,
    /// The store failed or timed out; the check was admitted anyway.
    FailedOpen,
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RateLimitResult {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Actions left in the current window after this one.
    pub remaining: u32,
    /// Seconds until the caller should try again (rejections) or until the window resets.
    pub reset_seconds: u64,
    /// Whether the store actually took part in the decision.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub enforcement: Enforcement,
}

impl RateLimitResult {
    pub(crate) fn admitted(remaining: u32, reset_seconds: u64) -> Self {
        Self { allowed: true, remaining, reset_seconds, enforcement: Enforcement::Enforced }
    }

    pub(crate) fn rejected(reset_seconds: u64) -> Self {
        Self { allowed: false, remaining: 0, reset_seconds, enforcement: Enforcement::Enforced }
    }

    /// Result used when no store is configured.
    pub fn pass_through(quota: Quota) -> Self {
        Self {
            allowed: true,
            remaining: quota.limit() - 1,
            reset_seconds: quota.window_seconds(),
            enforcement: Enforcement::PassThrough,
        }
    }

    /// Result used when the store could not be reached.
    pub fn fail_open() -> Self {
        Self { allowed: true, remaining: 1, reset_seconds: 0, enforcement: Enforcement::FailedOpen }
    }

    /// True when the store did not take part (pass-through or fail-open).
    pub fn is_degraded(&self) -> bool {
        self.enforcement != Enforcement::Enforced
    }

    /// `Retry-After` value for rejected results.
    pub fn retry_after(&self) -> Option<Duration> {
        (!self.allowed).then(|| Duration::from_secs(self.reset_seconds))
    }

    /// Response headers advertising the quota. `Retry-After` is only present on rejection.
    pub fn headers(&self, limit: u32) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_seconds.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.reset_seconds.to_string()));
        }
        headers
    }
}

/// Core interface for rate limiting logic.
///
/// Implementations must never fail because of their backing store; only argument errors
/// surface as `Err`.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `identifier` may perform one more action under `limit` per `window_ms`.
    async fn check(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RateLimitResult, LimitError>;

    /// Same as [`RateLimiter::check`] with a pre-validated quota.
    async fn check_quota(
        &self,
        identifier: &str,
        quota: Quota,
    ) -> Result<RateLimitResult, LimitError> {
        self.check(identifier, quota.limit(), quota.window_ms()).await
    }
}
