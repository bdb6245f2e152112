//! Convenient re-exports for common limiter types.
pub use crate::{
    call_policy::CallPolicy,
    clock::{Clock, SystemClock},
    config::{LimiterConfig, Route, RouteLimit, RouteTable},
    error::LimitError,
    rate_limit::{
        Admission, Enforcement, InMemoryWindowStore, Quota, RateLimitLayer, RateLimitResult,
        RateLimiter, SlidingWindowLimiter, ThrottleError, WindowSnapshot, WindowStore,
        WindowUsage,
    },
    telemetry::{LimiterEvent, LogSink, TelemetrySink},
};
