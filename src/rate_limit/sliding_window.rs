//! Sliding Window Rate Limiter
//!
//! Keeps a log of action timestamps per identifier in a shared [`WindowStore`] and admits a new
//! action only while fewer than `limit` entries fall inside the trailing window.
//!
//! Reset semantics:
//! - rejected: seconds until the oldest live entry leaves the window, rounded up and clamped to
//!   `1..=ceil(window_ms / 1000)`;
//! - admitted: `ceil(window_ms / 1000)`, a fixed estimate that is not recomputed from the
//!   oldest entry.
//!
//! Failure semantics: store errors and timeouts never reach the caller. They are logged,
//! reported to the telemetry sink, and turned into [`RateLimitResult::fail_open`]. A limiter
//! built without a store admits everything ([`RateLimitResult::pass_through`]).

use super::store::{Admission, WindowSnapshot, WindowStore, WindowUsage};
use super::{ceil_seconds, Quota, RateLimitResult, RateLimiter};
use crate::call_policy::CallPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::{Route, RouteTable};
use crate::error::{LimitError, StoreFailure};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix put in front of every store key unless overridden.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Sliding-window limiter over a shared store.
pub struct SlidingWindowLimiter<S, T = NullSink> {
    store: Option<Arc<S>>,
    clock: Arc<dyn Clock>,
    policy: CallPolicy,
    key_prefix: String,
    sink: T,
}

impl<S, T: std::fmt::Debug> std::fmt::Debug for SlidingWindowLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("configured", &self.store.is_some())
            .field("clock", &self.clock)
            .field("policy", &self.policy)
            .field("key_prefix", &self.key_prefix)
            .field("sink", &self.sink)
            .finish()
    }
}

impl<S> SlidingWindowLimiter<S, NullSink>
where
    S: WindowStore + 'static,
{
    /// Create a limiter backed by `store`.
    pub fn new(store: S) -> Self {
        Self::from_optional(Some(store))
    }

    /// Create a limiter with no store: every check is admitted.
    pub fn pass_through() -> Self {
        Self::from_optional(None)
    }

    /// `None` selects pass-through mode. Handy when the store URL is optional configuration.
    pub fn from_optional(store: Option<S>) -> Self {
        Self {
            store: store.map(Arc::new),
            clock: Arc::new(SystemClock),
            policy: CallPolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            sink: NullSink,
        }
    }
}

impl<S, T> SlidingWindowLimiter<S, T>
where
    S: WindowStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Replace the clock (tests use [`crate::clock::ManualClock`]).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the timeout/retry rules for store calls.
    pub fn with_call_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Namespace for store keys (`"<prefix>:<identifier>"`).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Send decision events to `sink`.
    pub fn with_sink<T2>(self, sink: T2) -> SlidingWindowLimiter<S, T2>
    where
        T2: TelemetrySink,
    {
        SlidingWindowLimiter {
            store: self.store,
            clock: self.clock,
            policy: self.policy,
            key_prefix: self.key_prefix,
            sink,
        }
    }

    /// Whether a store is configured.
    pub fn is_enforcing(&self) -> bool {
        self.store.is_some()
    }

    fn store_key(&self, identifier: &str) -> String {
        if self.key_prefix.is_empty() {
            identifier.to_string()
        } else {
            format!("{}:{}", self.key_prefix, identifier)
        }
    }

    fn validate(identifier: &str, limit: u32, window_ms: u64) -> Result<Quota, LimitError> {
        if identifier.is_empty() {
            return Err(LimitError::EmptyIdentifier);
        }
        Quota::new(limit, window_ms)
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn fail_open(
        &self,
        identifier: &str,
        failure: StoreFailure<S::Error>,
    ) -> RateLimitResult {
        warn!(
            identifier = %identifier,
            error = %failure,
            attempts = failure.attempts(),
            "rate limit store unavailable, failing open"
        );
        self.emit(LimiterEvent::FailedOpen {
            identifier: identifier.to_string(),
            kind: failure.kind(),
            error: failure.to_string(),
        })
        .await;
        RateLimitResult::fail_open()
    }

    /// Decide whether `identifier` may act once more under `limit` actions per `window_ms`.
    ///
    /// Returns `Err` only for an empty identifier or a zero limit/window; the store is not
    /// touched in that case.
    pub async fn check(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RateLimitResult, LimitError> {
        let quota = Self::validate(identifier, limit, window_ms)?;

        let Some(store) = &self.store else {
            self.emit(LimiterEvent::PassThrough { identifier: identifier.to_string() }).await;
            return Ok(RateLimitResult::pass_through(quota));
        };

        let now_ms = self.clock.now_millis();
        let admission = Admission {
            now_ms,
            window_ms,
            limit,
            // A retry reuses this member, so a write that landed before a lost reply is
            // neither counted twice nor turned into a rejection.
            member: format!("{}-{:016x}", now_ms, rand::random::<u64>()),
        };
        let key = self.store_key(identifier);

        let snapshot = match self.policy.execute(|| store.record(&key, &admission)).await {
            Ok(snapshot) => snapshot,
            Err(failure) => return Ok(self.fail_open(identifier, failure).await),
        };

        let result = evaluate(quota, now_ms, snapshot);
        if result.allowed {
            debug!(
                identifier = %identifier,
                remaining = result.remaining,
                limit,
                "rate limit admitted"
            );
            self.emit(LimiterEvent::Admitted {
                identifier: identifier.to_string(),
                limit,
                remaining: result.remaining,
            })
            .await;
        } else {
            debug!(
                identifier = %identifier,
                reset_seconds = result.reset_seconds,
                limit,
                "rate limit exceeded"
            );
            self.emit(LimiterEvent::Rejected {
                identifier: identifier.to_string(),
                limit,
                reset_seconds: result.reset_seconds,
            })
            .await;
        }
        Ok(result)
    }

    /// [`Self::check`] with a route's identifier and limits taken from `table`.
    pub async fn check_route(
        &self,
        route: Route,
        subject: &str,
        table: &RouteTable,
    ) -> Result<RateLimitResult, LimitError> {
        let limit = table.get(route);
        self.check(&route.identifier(subject), limit.actions, limit.window_ms).await
    }

    /// What the next `check` would see, without recording anything.
    ///
    /// `allowed` says whether one more action fits. Store failures fail open and
    /// pass-through mode reports a full quota, exactly like `check`.
    pub async fn status(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RateLimitResult, LimitError> {
        let quota = Self::validate(identifier, limit, window_ms)?;
        let Some(store) = &self.store else {
            let mut result = RateLimitResult::pass_through(quota);
            result.remaining = quota.limit();
            return Ok(result);
        };

        let now_ms = self.clock.now_millis();
        let key = self.store_key(identifier);
        match self.policy.execute(|| store.inspect(&key, now_ms, window_ms)).await {
            Ok(usage) => Ok(evaluate_usage(quota, now_ms, usage)),
            Err(failure) => {
                warn!(identifier = %identifier, error = %failure, "rate limit status unavailable");
                Ok(RateLimitResult::fail_open())
            }
        }
    }

    /// Forget `identifier`'s window, e.g. after a successful login. Store errors are logged
    /// and swallowed.
    pub async fn reset(&self, identifier: &str) -> Result<(), LimitError> {
        if identifier.is_empty() {
            return Err(LimitError::EmptyIdentifier);
        }
        let Some(store) = &self.store else {
            return Ok(());
        };
        let key = self.store_key(identifier);
        match self.policy.execute(|| store.clear(&key)).await {
            Ok(()) => debug!(identifier = %identifier, "rate limit window cleared"),
            Err(failure) => {
                warn!(
                    identifier = %identifier,
                    error = %failure,
                    "failed to clear rate limit window"
                )
            }
        }
        Ok(())
    }
}

/// Seconds until the oldest live entry leaves the window, rounded up, in `1..=ceil(window)`.
fn reset_after_oldest(quota: Quota, now_ms: u64, oldest_ms: Option<u64>) -> u64 {
    let window_seconds = quota.window_seconds();
    let Some(oldest_ms) = oldest_ms else {
        return window_seconds;
    };
    let frees_at = oldest_ms.saturating_add(quota.window_ms());
    ceil_seconds(frees_at.saturating_sub(now_ms)).clamp(1, window_seconds.max(1))
}

fn evaluate(quota: Quota, now_ms: u64, snapshot: WindowSnapshot) -> RateLimitResult {
    if snapshot.admitted {
        let remaining = quota.limit().saturating_sub(snapshot.prior_count).saturating_sub(1);
        RateLimitResult::admitted(remaining, quota.window_seconds())
    } else {
        RateLimitResult::rejected(reset_after_oldest(quota, now_ms, snapshot.oldest_ms))
    }
}

fn evaluate_usage(quota: Quota, now_ms: u64, usage: WindowUsage) -> RateLimitResult {
    if usage.count >= quota.limit() {
        RateLimitResult::rejected(reset_after_oldest(quota, now_ms, usage.oldest_ms))
    } else {
        RateLimitResult::admitted(quota.limit() - usage.count, quota.window_seconds())
    }
}

#[async_trait]
impl<S, T> RateLimiter for SlidingWindowLimiter<S, T>
where
    S: WindowStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn check(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RateLimitResult, LimitError> {
        SlidingWindowLimiter::check(self, identifier, limit, window_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryWindowStore;
    use crate::rate_limit::Enforcement;
    use crate::telemetry::MemorySink;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    fn limiter() -> (SlidingWindowLimiter<InMemoryWindowStore>, ManualClock) {
        let clock = ManualClock::new(T0);
        (SlidingWindowLimiter::new(InMemoryWindowStore::new()).with_clock(clock.clone()), clock)
    }

    #[test]
    fn reset_after_oldest_bounds() {
        let q = Quota::new(1, 60_000).unwrap();
        assert_eq!(reset_after_oldest(q, T0, Some(T0)), 60);
        assert_eq!(reset_after_oldest(q, T0 + 59_001, Some(T0)), 1);
        // oldest exactly at window start: never reports zero
        assert_eq!(reset_after_oldest(q, T0 + 60_000, Some(T0)), 1);
        // entry from a host whose clock runs ahead
        assert_eq!(reset_after_oldest(q, T0, Some(T0 + 5_000)), 60);
        assert_eq!(reset_after_oldest(q, T0, None), 60);
        let short = Quota::new(1, 1).unwrap();
        assert_eq!(reset_after_oldest(short, T0, Some(T0)), 1);
    }

    #[test]
    fn evaluate_admitted_counts_down() {
        let q = Quota::new(3, 60_000).unwrap();
        let snap =
            |prior_count| WindowSnapshot { admitted: true, prior_count, oldest_ms: Some(T0) };
        assert_eq!(evaluate(q, T0, snap(0)).remaining, 2);
        assert_eq!(evaluate(q, T0, snap(2)).remaining, 0);
        assert_eq!(evaluate(q, T0, snap(2)).reset_seconds, 60);
    }

    #[tokio::test]
    async fn rejects_after_limit_with_reset_from_oldest() {
        let (limiter, clock) = limiter();
        for _ in 0..3 {
            assert!(limiter.check("ip", 3, 10_000).await.unwrap().allowed);
            clock.advance(Duration::from_millis(1_000));
        }
        // oldest at T0, now T0 + 3s: frees at T0 + 10s -> 7s
        let denied = limiter.check("ip", 3, 10_000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_seconds, 7);
        assert_eq!(denied.enforcement, Enforcement::Enforced);
    }

    #[tokio::test]
    async fn status_does_not_consume() {
        let (limiter, _clock) = limiter();
        limiter.check("ip", 2, 1_000).await.unwrap();
        let before = limiter.status("ip", 2, 1_000).await.unwrap();
        let again = limiter.status("ip", 2, 1_000).await.unwrap();
        assert_eq!(before, again);
        assert!(before.allowed);
        assert_eq!(before.remaining, 1);

        limiter.check("ip", 2, 1_000).await.unwrap();
        let full = limiter.status("ip", 2, 1_000).await.unwrap();
        assert!(!full.allowed);
        assert_eq!(full.reset_seconds, 1);
    }

    #[tokio::test]
    async fn reset_clears_window() {
        let (limiter, _clock) = limiter();
        limiter.check("login:ip", 1, 60_000).await.unwrap();
        assert!(!limiter.check("login:ip", 1, 60_000).await.unwrap().allowed);
        limiter.reset("login:ip").await.unwrap();
        assert!(limiter.check("login:ip", 1, 60_000).await.unwrap().allowed);
        assert_eq!(limiter.reset("").await.unwrap_err(), LimitError::EmptyIdentifier);
    }

    #[tokio::test]
    async fn keys_are_prefixed() {
        let store = InMemoryWindowStore::new();
        let limiter = SlidingWindowLimiter::new(store.clone())
            .with_clock(ManualClock::new(T0))
            .with_key_prefix("gems");
        limiter.check("vote:u1", 1, 1_000).await.unwrap();
        let usage = store.inspect("gems:vote:u1", T0, 1_000).await.unwrap();
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn emits_events_for_each_decision() {
        let sink = MemorySink::new();
        let limiter = SlidingWindowLimiter::new(InMemoryWindowStore::new())
            .with_clock(ManualClock::new(T0))
            .with_sink(sink.clone());
        limiter.check("comment:u1", 1, 600_000).await.unwrap();
        limiter.check("comment:u1", 1, 600_000).await.unwrap();

        let outcomes: Vec<_> = sink.events().iter().map(|e| e.outcome()).collect();
        assert_eq!(outcomes, vec!["admitted", "rejected"]);
        assert_eq!(sink.events()[1].category(), "comment");
    }

    #[tokio::test]
    async fn pass_through_status_reports_full_quota() {
        let limiter = SlidingWindowLimiter::<InMemoryWindowStore>::pass_through();
        assert!(!limiter.is_enforcing());
        let status = limiter.status("ip", 4, 2_500).await.unwrap();
        assert_eq!((status.allowed, status.remaining, status.reset_seconds), (true, 4, 3));
        limiter.reset("ip").await.unwrap();
    }
}
